use crate::backend::{bounded, AuditSink};
use crate::types::AuditRecord;
use std::sync::Arc;
use std::time::Duration;

/// Appends audit rows. Failures are logged and swallowed; backfill is not
/// this writer's job.
#[derive(Clone)]
pub struct EventLogWriter {
    sink: Arc<dyn AuditSink>,
    timeout: Duration,
}

impl EventLogWriter {
    pub fn new(sink: Arc<dyn AuditSink>, timeout: Duration) -> Self {
        Self { sink, timeout }
    }

    pub async fn append(&self, record: AuditRecord) {
        match bounded(self.timeout, self.sink.append_event(&record)).await {
            Ok(()) => tracing::info!(
                event_type = %record.event_type,
                person = %record.person_name,
                image = record.image_path.as_deref().unwrap_or("-"),
                "event logged"
            ),
            Err(e) => tracing::error!(
                event_type = %record.event_type,
                person = %record.person_name,
                error = %e,
                "failed to write audit row"
            ),
        }
    }
}
