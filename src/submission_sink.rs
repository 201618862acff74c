//! HTTP delivery to the collection endpoint (the spreadsheet web app).

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::{Client, Response};

use crate::error::{CoreError, Result};
use crate::record::Record;
use crate::submission_queue::DeliverySink;

/// POSTs each record as a JSON object. Any 2xx status counts as delivered; the body is ignored.
pub struct HttpSubmissionSink {
    client: Client,
    url: String,
}

impl HttpSubmissionSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

/// Body of an error response. A body that cannot be read is logged and treated as empty.
pub(crate) async fn read_error_body(response: Response) -> String {
    let status = response.status();
    match response.text().await {
        Ok(body) => body,
        Err(e) => {
            debug!("Could not read body of {status} response: {e}");
            String::new()
        }
    }
}

#[async_trait]
impl DeliverySink for HttpSubmissionSink {
    async fn deliver(&self, record: &Record) -> Result<()> {
        let response = self.client.post(&self.url).json(record).send().await?;
        let status = response.status();

        if !status.is_success() {
            return Err(CoreError::Remote {
                status: status.as_u16(),
                body: read_error_body(response).await,
            });
        }

        debug!("Submission for {} accepted ({status})", record.health_facility());
        Ok(())
    }
}
