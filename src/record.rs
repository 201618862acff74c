//! Data model for one completed data-entry submission.
//!
//! A [`Record`] is what the host produces when a user finishes the form. It carries a small set
//! of mandatory, strongly typed reporting fields plus an open map of form-specific indicator
//! fields whose presence depends on the [`FormType`].

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{CoreError, Result};

/// Keys that belong to the reporting context rather than to the indicator payload.
///
/// `healthFacilityName` is not a field of [`Record`] itself but some form versions send it as a
/// display copy of `healthFacility`, so it is treated as context as well.
pub const CONTEXT_FIELDS: [&str; 9] = [
    "timestamp",
    "formType",
    "year",
    "month",
    "region",
    "district",
    "chiefdom",
    "healthFacility",
    "healthFacilityName",
];

/// Which register a submission was filled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormType {
    /// Under-five register (0-59 months).
    UnderFive,
    /// General register (5+ years).
    General,
}

impl FormType {
    pub fn label(&self) -> &'static str {
        match self {
            FormType::UnderFive => "Under Five Register",
            FormType::General => "General Form",
        }
    }
}

/// Where and when a submission reports for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportingContext {
    pub year: String,
    pub month: String,
    pub region: String,
    pub district: String,
    pub chiefdom: String,
    pub health_facility: String,
}

/// One completed submission.
///
/// # Structure
///
/// - **timestamp**: creation instant, assigned by [`Record::new`] and never changed afterwards
/// - **form_type**: which register the indicator fields come from
/// - **year / month / region / district / chiefdom / health_facility**: reporting context
/// - **fields**: form-specific indicator values, in the order they were added
///
/// # Wire format
///
/// A record travels as one flat JSON object. The mandatory keys use the camelCase names the
/// collection endpoint expects, and indicator fields sit next to them:
///
/// ```rust
/// use health_sync_core::record::{FormType, Record, ReportingContext};
///
/// let context = ReportingContext {
///     year: "2025".into(),
///     month: "March".into(),
///     region: "Western Area".into(),
///     district: "Western Area Urban".into(),
///     chiefdom: "Freetown".into(),
///     health_facility: "Freetown CHC".into(),
/// };
///
/// let record = Record::new(FormType::UnderFive, context)
///     .with_field("fever_suspected_malaria", "12")
///     .with_field("rdt_positive", "0");
///
/// let json = serde_json::to_value(&record)?;
/// assert_eq!(json["formType"], "under_five");
/// assert_eq!(json["healthFacility"], "Freetown CHC");
/// assert_eq!(json["rdt_positive"], "0");
/// # Ok::<(), serde_json::Error>(())
/// ```
///
/// # Field values
///
/// Every value is a string. When a record is decoded from JSON, numbers and booleans are
/// converted to their string form, so `"year": 2025` reads as `"2025"`. Null indicator values
/// are dropped; a null reporting field is an error. Nested arrays or objects are
/// rejected, since neither the spreadsheet backend nor DHIS2 can take them.
///
/// # Immutability
///
/// Once built, a record is only read. The queue stores it as-is and a retry resends the exact
/// same value, timestamp included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    #[serde(serialize_with = "serialize_timestamp", deserialize_with = "deserialize_timestamp")]
    timestamp: DateTime<Utc>,
    form_type: FormType,
    #[serde(deserialize_with = "deserialize_scalar")]
    year: String,
    #[serde(deserialize_with = "deserialize_scalar")]
    month: String,
    #[serde(deserialize_with = "deserialize_scalar")]
    region: String,
    #[serde(deserialize_with = "deserialize_scalar")]
    district: String,
    #[serde(deserialize_with = "deserialize_scalar")]
    chiefdom: String,
    #[serde(deserialize_with = "deserialize_scalar")]
    health_facility: String,
    #[serde(flatten, deserialize_with = "deserialize_scalar_fields")]
    fields: Map<String, Value>,
}

impl Record {
    /// Creates a record stamped with the current instant.
    pub fn new(form_type: FormType, context: ReportingContext) -> Self {
        Self::with_timestamp(Utc::now(), form_type, context)
    }

    /// Creates a record with an explicit creation instant.
    ///
    /// The instant is truncated to milliseconds, the precision it is stored and sent with.
    pub fn with_timestamp(
        timestamp: DateTime<Utc>,
        form_type: FormType,
        context: ReportingContext,
    ) -> Self {
        Self {
            timestamp: timestamp.trunc_subsecs(3),
            form_type,
            year: context.year,
            month: context.month,
            region: context.region,
            district: context.district,
            chiefdom: context.chiefdom,
            health_facility: context.health_facility,
            fields: Map::new(),
        }
    }

    /// Adds an indicator field. Mandatory keys cannot be overridden this way and are ignored.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        if !is_context_field(&name) {
            self.fields.insert(name, Value::String(value.into()));
        }
        self
    }

    /// Parses a record from the host's JSON representation.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn form_type(&self) -> FormType {
        self.form_type
    }

    pub fn year(&self) -> &str {
        &self.year
    }

    pub fn month(&self) -> &str {
        &self.month
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn district(&self) -> &str {
        &self.district
    }

    pub fn chiefdom(&self) -> &str {
        &self.chiefdom
    }

    pub fn health_facility(&self) -> &str {
        &self.health_facility
    }

    /// Looks up an indicator field.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// Indicator fields in insertion order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .filter_map(|(name, value)| value.as_str().map(|v| (name.as_str(), v)))
    }

    /// Checks that every mandatory reporting field is filled in.
    ///
    /// A failure here is permanent: the record is rejected and never queued.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("year", &self.year),
            ("month", &self.month),
            ("region", &self.region),
            ("district", &self.district),
            ("chiefdom", &self.chiefdom),
            ("healthFacility", &self.health_facility),
        ];

        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Validation(format!(
                "Missing required field(s): {}",
                missing.join(", ")
            )))
        }
    }
}

/// Whether `name` is one of the reporting-context keys.
pub fn is_context_field(name: &str) -> bool {
    CONTEXT_FIELDS.contains(&name)
}

// Same shape as JavaScript's `toISOString`, which the spreadsheet backend already stores.
fn serialize_timestamp<S>(timestamp: &DateTime<Utc>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&timestamp.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(DateTime::<Utc>::deserialize(deserializer)?.trunc_subsecs(3))
}

fn scalar_to_string(value: Value) -> std::result::Result<Option<String>, &'static str> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Bool(b) => Ok(Some(b.to_string())),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Array(_) => Err("an array"),
        Value::Object(_) => Err("an object"),
    }
}

fn deserialize_scalar<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match scalar_to_string(Value::deserialize(deserializer)?) {
        Ok(Some(value)) => Ok(value),
        Ok(None) => Err(serde::de::Error::custom("reporting field cannot be null")),
        Err(kind) => Err(serde::de::Error::custom(format!(
            "reporting field must be a scalar value, got {kind}"
        ))),
    }
}

fn deserialize_scalar_fields<'de, D>(deserializer: D) -> std::result::Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Map::<String, Value>::deserialize(deserializer)?;
    let mut fields = Map::new();

    for (name, value) in raw {
        if is_context_field(&name) {
            continue;
        }
        let value = match scalar_to_string(value) {
            Ok(Some(value)) => value,
            Ok(None) => continue,
            Err(kind) => {
                return Err(serde::de::Error::custom(format!(
                    "field '{name}' must be a scalar value, got {kind}"
                )));
            }
        };
        fields.insert(name, Value::String(value));
    }

    Ok(fields)
}
