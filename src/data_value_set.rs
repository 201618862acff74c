//! Builds the DHIS2 `dataValueSets` payload from a record.

use std::collections::HashMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::record::{is_context_field, Record};

/// Data element ids starting with this are placeholders for elements not yet created in DHIS2.
pub const PLACEHOLDER_PREFIX: &str = "xxx";

const MONTHS: [&str; 12] = [
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

/// Form field name to DHIS2 data element id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataElementMapping(HashMap<String, String>);

impl DataElementMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn insert(&mut self, field: impl Into<String>, data_element: impl Into<String>) {
        self.0.insert(field.into(), data_element.into());
    }

    /// Data element for `field`, skipping placeholders.
    pub fn data_element(&self, field: &str) -> Option<&str> {
        self.0
            .get(field)
            .map(String::as_str)
            .filter(|id| !id.is_empty() && !id.starts_with(PLACEHOLDER_PREFIX))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataValue {
    pub data_element: String,
    pub value: String,
}

/// Payload for `POST /api/dataValueSets`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataValueSet {
    pub data_set: String,
    pub complete_date: NaiveDate,
    pub period: String,
    pub org_unit: String,
    pub data_values: Vec<DataValue>,
}

impl DataValueSet {
    /// Builds the payload for `record`, already resolved to `org_unit`.
    ///
    /// Context fields and unmapped fields are skipped. `Yes`/`No` become `1`/`0`, zeros are
    /// kept, empty values are dropped. A record that yields no values at all is rejected.
    pub fn from_record(
        record: &Record,
        org_unit: &str,
        mapping: &DataElementMapping,
        data_set: &str,
        complete_date: NaiveDate,
    ) -> Result<Self> {
        let period = period_code(record.year(), record.month())?;

        let data_values: Vec<DataValue> = record
            .fields()
            .filter(|(name, _)| !is_context_field(name))
            .filter_map(|(name, value)| {
                let data_element = mapping.data_element(name)?;
                let value = to_dhis2_value(value)?;
                Some(DataValue {
                    data_element: data_element.to_string(),
                    value,
                })
            })
            .collect();

        if data_values.is_empty() {
            return Err(CoreError::Validation("No data values to submit".into()));
        }

        Ok(Self {
            data_set: data_set.to_string(),
            complete_date,
            period,
            org_unit: org_unit.to_string(),
            data_values,
        })
    }
}

/// Six-digit `YYYYMM` period code.
///
/// `month` is an English month name (any case) or a number from 1 to 12.
pub fn period_code(year: &str, month: &str) -> Result<String> {
    let year = year.trim();
    if year.len() != 4 || !year.chars().all(|c| c.is_ascii_digit()) {
        return Err(CoreError::Validation(format!("Invalid year: '{year}'")));
    }

    let month = month_number(month)
        .ok_or_else(|| CoreError::Validation(format!("Invalid month: '{}'", month.trim())))?;

    Ok(format!("{year}{month:02}"))
}

fn month_number(month: &str) -> Option<u32> {
    let month = month.trim();
    if let Ok(number) = month.parse::<u32>() {
        return (1..=12).contains(&number).then_some(number);
    }

    let lowered = month.to_lowercase();
    MONTHS
        .iter()
        .position(|name| *name == lowered)
        .map(|i| i as u32 + 1)
}

fn to_dhis2_value(value: &str) -> Option<String> {
    match value {
        "" => None,
        "Yes" => Some("1".to_string()),
        "No" => Some("0".to_string()),
        other => Some(other.to_string()),
    }
}
