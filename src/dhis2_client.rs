//! DHIS2 Web API client.
//!
//! Talks to `<server>/api/...` with basic auth, or through a relay proxy when one is configured
//! (the proxy receives the target URL and the encoded credentials as query parameters).

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{debug, info};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Dhis2Config;
use crate::data_value_set::DataValueSet;
use crate::error::{CoreError, Result};
use crate::facility_resolver::{OrgUnit, OrgUnitSource};
use crate::submission_sink::read_error_body;

const ORG_UNITS_ENDPOINT: &str =
    "organisationUnits.json?fields=id,displayName,name,shortName,code&paging=false";
const SYSTEM_INFO_ENDPOINT: &str = "system/info.json";
const DATA_VALUE_SETS_ENDPOINT: &str = "dataValueSets";

/// Subset of `system/info` used as a connection check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportCount {
    #[serde(default)]
    pub imported: u32,
    #[serde(default)]
    pub updated: u32,
    #[serde(default)]
    pub ignored: u32,
    #[serde(default)]
    pub deleted: u32,
}

/// Import summary returned by `dataValueSets`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub import_count: ImportCount,
}

impl ImportSummary {
    /// DHIS2 took the values, possibly with warnings.
    pub fn is_accepted(&self) -> bool {
        matches!(self.status.as_str(), "SUCCESS" | "OK" | "WARNING")
    }

    /// Newer servers wrap the summary in a `{"httpStatus": .., "response": {..}}` envelope.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(mut map) if matches!(map.get("response"), Some(Value::Object(_))) => {
                let inner = map.remove("response").unwrap_or(Value::Null);
                Ok(serde_json::from_value(inner)?)
            }
            other => Ok(serde_json::from_value(other)?),
        }
    }
}

/// Push side of the DHIS2 integration.
#[async_trait]
pub trait Dhis2Gateway: Send + Sync {
    async fn push_data_value_set(&self, payload: &DataValueSet) -> Result<ImportSummary>;

    async fn system_info(&self) -> Result<SystemInfo>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrgUnitsResponse {
    #[serde(default)]
    organisation_units: Vec<OrgUnit>,
}

pub struct Dhis2Client {
    client: Client,
    config: Dhis2Config,
}

impl Dhis2Client {
    pub fn new(config: Dhis2Config, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, config })
    }

    /// Full API URL for `endpoint`.
    pub fn api_url(&self, endpoint: &str) -> String {
        format!(
            "{}/api/{}",
            self.config.server_url.trim_end_matches('/'),
            endpoint
        )
    }

    /// URL the request is actually sent to, which differs from [`api_url`](Self::api_url) when
    /// a proxy is configured.
    pub fn request_url(&self, endpoint: &str) -> String {
        let target = self.api_url(endpoint);
        match self.proxy_url() {
            Some(proxy) => format!(
                "{}?url={}&auth={}",
                proxy,
                urlencoding::encode(&target),
                self.encoded_credentials()
            ),
            None => target,
        }
    }

    fn proxy_url(&self) -> Option<&str> {
        self.config
            .proxy_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
    }

    fn encoded_credentials(&self) -> String {
        BASE64.encode(format!("{}:{}", self.config.username, self.config.password))
    }

    fn request(&self, method: Method, endpoint: &str) -> RequestBuilder {
        let url = self.request_url(endpoint);
        let builder = self.client.request(method, url);
        if self.proxy_url().is_some() {
            builder
        } else {
            builder.basic_auth(&self.config.username, Some(&self.config.password))
        }
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(CoreError::Remote {
            status: status.as_u16(),
            body: read_error_body(response).await,
        })
    }
}

#[async_trait]
impl OrgUnitSource for Dhis2Client {
    async fn fetch_org_units(&self) -> Result<Vec<OrgUnit>> {
        let response = self.request(Method::GET, ORG_UNITS_ENDPOINT).send().await?;
        let response = Self::check(response).await?;
        let body: OrgUnitsResponse = response.json().await?;
        debug!("Fetched {} org units", body.organisation_units.len());
        Ok(body.organisation_units)
    }
}

#[async_trait]
impl Dhis2Gateway for Dhis2Client {
    async fn push_data_value_set(&self, payload: &DataValueSet) -> Result<ImportSummary> {
        debug!(
            "Pushing {} data values for {} period {}",
            payload.data_values.len(),
            payload.org_unit,
            payload.period
        );

        let response = self
            .request(Method::POST, DATA_VALUE_SETS_ENDPOINT)
            .json(payload)
            .send()
            .await?;
        let response = Self::check(response).await?;
        let body: Value = response.json().await?;
        ImportSummary::from_value(body)
    }

    async fn system_info(&self) -> Result<SystemInfo> {
        let response = self.request(Method::GET, SYSTEM_INFO_ENDPOINT).send().await?;
        let response = Self::check(response).await?;
        let info: SystemInfo = response.json().await?;
        info!(
            "DHIS2 connected: version {}",
            info.version.as_deref().unwrap_or("unknown")
        );
        Ok(info)
    }
}
