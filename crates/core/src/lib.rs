//! kubexporter core types – resource identity, run metrics, shared tree helpers

#![forbid(unsafe_code)]

use std::time::Duration;

use serde::{Deserialize, Serialize};

mod fields;
mod stats;
pub mod tree;

pub use fields::{FieldPath, FieldValue, KindFields};
pub use stats::Stats;

/// Error taxonomy for cluster list/get calls. Workers classify these into
/// the per-kind error strings shown in the summary report.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("Not Found")]
    NotFound,
    #[error("Not Allowed")]
    NotAllowed,
    #[error("{0}")]
    Other(String),
}

/// One discoverable resource kind plus its run-scoped metrics.
///
/// Identity fields are immutable after discovery; the metrics are mutated
/// exclusively by the worker that owns the kind and read by the orchestrator
/// for reporting once the dispatcher has drained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupResource {
    pub api_group: String,
    pub api_version: String,
    pub kind: String,
    pub namespaced: bool,

    #[serde(default)]
    pub instances: u64,
    #[serde(default)]
    pub exported_instances: u64,
    #[serde(default)]
    pub pages: u64,
    #[serde(default)]
    pub exported_bytes: u64,
    #[serde(default)]
    pub query_duration: Duration,
    #[serde(default)]
    pub export_duration: Duration,
    #[serde(default)]
    pub error: Option<String>,
}

impl GroupResource {
    pub fn new(api_group: &str, api_version: &str, kind: &str, namespaced: bool) -> Self {
        Self {
            api_group: api_group.to_string(),
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespaced,
            instances: 0,
            exported_instances: 0,
            pages: 0,
            exported_bytes: 0,
            query_duration: Duration::ZERO,
            export_duration: Duration::ZERO,
            error: None,
        }
    }

    /// Kind identity used for all per-kind field maps: `group.Kind`, or the
    /// bare kind for the core group.
    pub fn group_kind(&self) -> String {
        if self.api_group.is_empty() {
            self.kind.clone()
        } else {
            format!("{}.{}", self.api_group, self.kind)
        }
    }

    /// `group/version`, or the bare version for the core group.
    pub fn group_version(&self) -> String {
        if self.api_group.is_empty() {
            self.api_version.clone()
        } else {
            format!("{}/{}", self.api_group, self.api_version)
        }
    }

    pub fn report_row(&self, with_size: bool, with_pages: bool, with_error: bool) -> Vec<String> {
        let mut row = vec![
            self.api_group.clone(),
            self.api_version.clone(),
            self.kind.clone(),
            self.namespaced.to_string(),
            self.instances.to_string(),
            self.exported_instances.to_string(),
        ];
        if with_size {
            row.push(format_bytes(self.exported_bytes));
        }
        row.push(format!("{:?}", self.query_duration));
        row.push(format!("{:?}", self.export_duration));
        if with_pages {
            row.push(self.pages.to_string());
        }
        if with_error {
            row.push(self.error.clone().unwrap_or_default());
        }
        row
    }
}

/// Sort kinds by (group, kind) ascending for deterministic processing order.
pub fn sort_resources(resources: &mut [GroupResource]) {
    resources.sort_by(|a, b| {
        a.api_group
            .cmp(&b.api_group)
            .then_with(|| a.kind.cmp(&b.kind))
    });
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}
