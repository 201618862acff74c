//! Composition root: the queue, resolver and DHIS2 gateway wired together.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use log::{info, warn};
use serde::Serialize;

use crate::config::CoreConfig;
use crate::data_value_set::{DataElementMapping, DataValueSet};
use crate::dhis2_client::{Dhis2Client, Dhis2Gateway, ImportSummary, SystemInfo};
use crate::error::{CoreError, Result};
use crate::facility_resolver::FacilityResolver;
use crate::queue_store::LmdbQueueStore;
use crate::record::Record;
use crate::submission_queue::{EnqueueReport, FlushReport, SubmissionQueue};
use crate::submission_sink::HttpSubmissionSink;

/// What happened to a submitted record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// Sent straight to the collection endpoint.
    Delivered,
    /// Saved locally, either because the client is offline or because direct delivery failed.
    Queued(EnqueueReport),
    /// Appended behind an existing backlog, which was then flushed.
    Synced {
        queued: EnqueueReport,
        flush: FlushReport,
    },
}

impl SubmitOutcome {
    /// The record reached the collection endpoint rather than only the local queue.
    pub fn is_delivered(&self) -> bool {
        match self {
            SubmitOutcome::Delivered => true,
            SubmitOutcome::Queued(_) => false,
            SubmitOutcome::Synced { flush, .. } => !flush.skipped && flush.remaining == 0,
        }
    }
}

/// Result of a DHIS2 push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dhis2PushReport {
    pub facility: String,
    pub org_unit: String,
    pub period: String,
    pub values_count: usize,
    pub accepted: bool,
    pub summary: ImportSummary,
}

/// Result of [`Collector::submit_and_push`].
///
/// `success` holds only when the record was delivered to the collection endpoint and DHIS2
/// accepted the push. A queued record is still safe; it is just not counted as submitted yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CombinedSubmitReport {
    pub submission: SubmitOutcome,
    pub dhis2: Option<Dhis2PushReport>,
    pub dhis2_error: Option<String>,
    pub success: bool,
}

pub struct Collector {
    queue: SubmissionQueue,
    resolver: FacilityResolver,
    gateway: Arc<dyn Dhis2Gateway>,
    mapping: DataElementMapping,
    data_set_id: String,
}

impl Collector {
    pub fn new(
        queue: SubmissionQueue,
        resolver: FacilityResolver,
        gateway: Arc<dyn Dhis2Gateway>,
        mapping: DataElementMapping,
        data_set_id: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            resolver,
            gateway,
            mapping,
            data_set_id: data_set_id.into(),
        }
    }

    /// Wires the production stack: LMDB storage, HTTP sink and the DHIS2 client.
    pub fn from_config(config: &CoreConfig) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(LmdbQueueStore::open(&config.storage_path)?);
        let sink = Arc::new(HttpSubmissionSink::new(
            config.submission_url.clone(),
            config.delivery_timeout(),
        )?);
        let dhis2 = Arc::new(Dhis2Client::new(config.dhis2.clone(), config.registry_timeout())?);

        let queue = SubmissionQueue::open(store, sink, config.delivery_timeout(), config.start_online);
        let resolver = FacilityResolver::new(dhis2.clone(), config.registry_timeout());

        Ok(Self::new(
            queue,
            resolver,
            dhis2,
            config.data_elements.clone(),
            config.dhis2.data_set_id.clone(),
        ))
    }

    /// Submits a record to the collection endpoint, queueing it when that is not possible.
    ///
    /// Only validation failures are errors; a record that fails validation is never queued.
    pub async fn submit(&self, record: Record) -> Result<SubmitOutcome> {
        record.validate()?;

        if !self.queue.is_online() {
            info!(
                "Offline - saving {} submission for {} locally",
                record.form_type().label(),
                record.health_facility()
            );
            return Ok(SubmitOutcome::Queued(self.queue.enqueue(record)));
        }

        if self.queue.pending_count() > 0 {
            let queued = self.queue.enqueue(record);
            let flush = self.queue.flush().await;
            return Ok(SubmitOutcome::Synced { queued, flush });
        }

        match self.queue.deliver(&record).await {
            Ok(()) => {
                info!(
                    "{} submission for {} delivered",
                    record.form_type().label(),
                    record.health_facility()
                );
                Ok(SubmitOutcome::Delivered)
            }
            Err(e) => {
                warn!("Failed to submit, saved offline: {e}");
                Ok(SubmitOutcome::Queued(self.queue.enqueue(record)))
            }
        }
    }

    pub async fn flush(&self) -> FlushReport {
        self.queue.flush().await
    }

    /// Flushes a backlog left over from a previous session, if the client starts online.
    pub async fn startup_sync(&self) -> Option<FlushReport> {
        if self.queue.is_online() && self.queue.pending_count() > 0 {
            Some(self.queue.flush().await)
        } else {
            None
        }
    }

    pub async fn connectivity_restored(&self) -> Option<FlushReport> {
        self.queue.on_connectivity_restored().await
    }

    pub fn connectivity_lost(&self) {
        self.queue.on_connectivity_lost();
    }

    pub fn pending_count(&self) -> usize {
        self.queue.pending_count()
    }

    pub fn is_online(&self) -> bool {
        self.queue.is_online()
    }

    pub fn is_durable(&self) -> bool {
        self.queue.is_durable()
    }

    pub async fn resolve_facility(&self, facility_name: &str) -> Option<String> {
        self.resolver.resolve(facility_name).await
    }

    /// Pushes `record` to DHIS2 with today's date as the completion date.
    pub async fn push_to_dhis2(&self, record: &Record) -> Result<Dhis2PushReport> {
        self.push_to_dhis2_on(record, Utc::now().date_naive()).await
    }

    /// Pushes `record` to DHIS2.
    ///
    /// Fails with [`CoreError::FacilityNotRegistered`] when the facility cannot be resolved; that
    /// is not worth retrying until the registry or the facility name changes.
    pub async fn push_to_dhis2_on(
        &self,
        record: &Record,
        complete_date: NaiveDate,
    ) -> Result<Dhis2PushReport> {
        record.validate()?;

        let facility = record.health_facility();
        let org_unit = self
            .resolver
            .resolve(facility)
            .await
            .ok_or_else(|| CoreError::FacilityNotRegistered(facility.to_string()))?;

        let payload = DataValueSet::from_record(
            record,
            &org_unit,
            &self.mapping,
            &self.data_set_id,
            complete_date,
        )?;

        let summary = self.gateway.push_data_value_set(&payload).await?;
        let accepted = summary.is_accepted();
        if accepted {
            info!(
                "Pushed {} values to DHIS2 for {} ({})",
                payload.data_values.len(),
                facility,
                payload.period
            );
        } else {
            warn!("DHIS2 submission for {facility} had issues: status {}", summary.status);
        }

        Ok(Dhis2PushReport {
            facility: facility.to_string(),
            org_unit,
            period: payload.period,
            values_count: payload.data_values.len(),
            accepted,
            summary,
        })
    }

    /// Submits `record` to the collection endpoint, then pushes it to DHIS2.
    ///
    /// The push is attempted whatever happened to the submission. Only a validation failure is
    /// an error; a failed push is reported in the returned value.
    pub async fn submit_and_push(&self, record: Record) -> Result<CombinedSubmitReport> {
        let submission = self.submit(record.clone()).await?;

        let (dhis2, dhis2_error) = match self.push_to_dhis2(&record).await {
            Ok(report) => (Some(report), None),
            Err(e) => {
                warn!("DHIS2 push for {} failed: {e}", record.health_facility());
                (None, Some(e.to_string()))
            }
        };

        let success = submission.is_delivered() && dhis2.as_ref().is_some_and(|r| r.accepted);
        if success {
            info!("Successfully submitted {} to both systems", record.health_facility());
        }

        Ok(CombinedSubmitReport {
            submission,
            dhis2,
            dhis2_error,
            success,
        })
    }

    pub async fn test_connection(&self) -> Result<SystemInfo> {
        self.gateway.system_info().await
    }

    pub fn queue(&self) -> &SubmissionQueue {
        &self.queue
    }

    pub fn resolver(&self) -> &FacilityResolver {
        &self.resolver
    }
}
