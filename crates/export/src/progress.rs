//! Structured progress events emitted by workers.
//!
//! Rendering is an external concern; the export core only calls into this
//! sink. The `simple` mode logs through tracing, `none` swallows everything.

use std::sync::Arc;

use tracing::info;

use kubexporter_config::Progress;
use kubexporter_core::GroupResource;

pub trait ProgressSink: Send + Sync {
    fn kind_started(&self, _worker: usize, _group_kind: &str) {}
    fn page_fetched(&self, _worker: usize, _group_kind: &str, _items: usize) {}
    fn instance_written(&self, _worker: usize, _group_kind: &str) {}
    fn kind_finished(&self, _worker: usize, _res: &GroupResource) {}
}

/// Swallows all events.
pub struct NoopProgress;

impl ProgressSink for NoopProgress {}

/// Logs one line per kind plus page fetches at debug level.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn page_fetched(&self, worker: usize, group_kind: &str, items: usize) {
        tracing::debug!(worker, kind = %group_kind, items, "page fetched");
    }

    fn kind_finished(&self, worker: usize, res: &GroupResource) {
        match &res.error {
            Some(err) => info!(
                worker,
                kind = %res.group_kind(),
                error = %err,
                "kind failed"
            ),
            None => info!(
                worker,
                kind = %res.group_kind(),
                instances = res.instances,
                exported = res.exported_instances,
                "kind exported"
            ),
        }
    }
}

pub fn sink_for(progress: Progress) -> Arc<dyn ProgressSink> {
    match progress {
        Progress::Simple => Arc::new(LogProgress),
        Progress::None => Arc::new(NoopProgress),
    }
}
