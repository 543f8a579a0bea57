//! kubexporter export pipeline – orchestrator, worker pool, archive and
//! upload.

#![forbid(unsafe_code)]

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{info, warn};

use kubexporter_cluster::ClusterApi;
use kubexporter_config::ExportConfig;
use kubexporter_core::{GroupResource, Stats};

pub mod archive;
pub mod pool;
pub mod progress;
pub mod render;
pub mod upload;
mod worker;

pub use progress::{LogProgress, NoopProgress, ProgressSink};

pub struct Exporter {
    config: Arc<ExportConfig>,
    api: Arc<dyn ClusterApi>,
}

impl Exporter {
    /// Validate the config and build the exporter. The validated config is
    /// read-only from here on and shared by all workers.
    pub fn new(mut config: ExportConfig, api: Arc<dyn ClusterApi>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            api,
        })
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    /// Run the full export: discovery, filtering, dispatch, summary,
    /// archive, retention pruning and upload. The shutdown flag stops new
    /// cluster calls while letting in-flight pages finish.
    pub async fn export(&self, shutdown: Arc<AtomicBool>) -> Result<Stats> {
        let started = Instant::now();

        if self.config.clear_target {
            self.purge_target()?;
        }

        let mut resources = self.api.discover().await.context("discovering kinds")?;
        resources.retain(|r| self.keep(r));
        kubexporter_core::sort_resources(&mut resources);
        info!(
            kinds = resources.len(),
            worker = self.config.worker,
            target = %self.config.target.display(),
            namespace = %self.config.namespace,
            as_lists = self.config.as_lists,
            "starting export"
        );

        let sink = progress::sink_for(self.config.progress);
        let (stats, resources) = pool::run_export(
            self.config.clone(),
            self.api.clone(),
            sink,
            resources,
            shutdown,
        )
        .await?;

        if self.config.summary {
            self.print_summary(&stats, &resources);
        }

        if self.config.archive {
            let archive = archive::create_archive(&self.config)?;
            if self.config.archive_retention_days > 0 {
                archive::prune_archives(&self.config)?;
            }
            if let Some(s3) = &self.config.s3 {
                upload::upload_archive(&self.config, s3, &archive).await?;
            }
        }

        info!(
            duration = ?started.elapsed(),
            kinds = stats.kinds,
            resources = stats.resources,
            namespaces = stats.namespaces(),
            errors = stats.errors,
            "export finished"
        );
        Ok(stats)
    }

    fn keep(&self, res: &GroupResource) -> bool {
        if self.config.is_excluded(res) {
            return false;
        }
        // A namespace filter makes cluster-scoped kinds meaningless.
        if !res.namespaced && !self.config.namespace.is_empty() {
            return false;
        }
        true
    }

    fn purge_target(&self) -> Result<()> {
        if !self.config.target.exists() {
            return Ok(());
        }
        warn!(target = %self.config.target.display(), "deleting target");
        std::fs::remove_dir_all(&self.config.target)
            .with_context(|| format!("purging {}", self.config.target.display()))
    }

    fn print_summary(&self, stats: &Stats, resources: &[GroupResource]) {
        let with_size = self.config.print_size;
        let with_error = stats.has_errors();

        let mut headers = vec!["GROUP", "VERSION", "KIND", "NAMESPACED", "INSTANCES", "EXPORTED"];
        if with_size {
            headers.push("SIZE");
        }
        headers.push("QUERY");
        headers.push("EXPORT");
        headers.push("PAGES");
        if with_error {
            headers.push("ERROR");
        }

        let mut rows: Vec<Vec<String>> = resources
            .iter()
            .map(|r| r.report_row(with_size, true, with_error))
            .collect();

        let total_label = if self.config.worker > 1 {
            "CUMULATED TOTAL"
        } else {
            "TOTAL"
        };
        let query: std::time::Duration = resources.iter().map(|r| r.query_duration).sum();
        let export: std::time::Duration = resources.iter().map(|r| r.export_duration).sum();
        let instances: u64 = resources.iter().map(|r| r.instances).sum();
        let exported: u64 = resources.iter().map(|r| r.exported_instances).sum();
        let mut total = vec![
            total_label.to_string(),
            String::new(),
            String::new(),
            String::new(),
            instances.to_string(),
            exported.to_string(),
        ];
        if with_size {
            let bytes: u64 = resources.iter().map(|r| r.exported_bytes).sum();
            total.push(kubexporter_core::format_bytes(bytes));
        }
        total.push(format!("{query:?}"));
        total.push(format!("{export:?}"));
        total.push(stats.pages.to_string());
        rows.push(total);

        render::print_table(&headers, &rows);
        println!(
            "Exported {} resources of {} kinds across {} namespaces",
            stats.resources,
            stats.kinds,
            stats.namespaces()
        );
    }
}
