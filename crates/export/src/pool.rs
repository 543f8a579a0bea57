//! Fixed-size worker pool with a bounded job queue and a completion barrier.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::{mpsc, Mutex};

use kubexporter_cluster::ClusterApi;
use kubexporter_config::ExportConfig;
use kubexporter_core::{sort_resources, GroupResource, Stats};

use crate::progress::ProgressSink;
use crate::worker::Worker;

/// Run the export over all discovered kinds.
///
/// Every kind is delegated exactly once; the call returns only after one
/// completed `GroupResource` per kind has been collected and every worker's
/// stats have been folded into the run total. No kind is ever processed by
/// more than one worker.
pub async fn run_export(
    config: Arc<ExportConfig>,
    api: Arc<dyn ClusterApi>,
    progress: Arc<dyn ProgressSink>,
    resources: Vec<GroupResource>,
    shutdown: Arc<AtomicBool>,
) -> Result<(Stats, Vec<GroupResource>)> {
    let total = resources.len();
    let capacity = total.max(1);
    let (job_tx, job_rx) = mpsc::channel::<GroupResource>(capacity);
    let (out_tx, mut out_rx) = mpsc::channel::<GroupResource>(capacity);
    let jobs = Arc::new(Mutex::new(job_rx));

    let mut handles = Vec::with_capacity(config.worker);
    for id in 0..config.worker {
        let worker = Worker::new(id + 1, config.clone(), api.clone(), progress.clone());
        handles.push(tokio::spawn(worker.run(
            jobs.clone(),
            out_tx.clone(),
            shutdown.clone(),
        )));
    }
    drop(out_tx);

    for res in resources {
        job_tx
            .send(res)
            .await
            .map_err(|_| anyhow!("job queue closed before all kinds were delegated"))?;
    }
    drop(job_tx);

    let mut done = Vec::with_capacity(total);
    while let Some(res) = out_rx.recv().await {
        done.push(res);
    }
    if done.len() != total {
        bail!("dispatcher accounted for {} of {} kinds", done.len(), total);
    }

    let mut stats = Stats::default();
    for handle in handles {
        stats.merge(handle.await.context("joining worker")?);
    }
    sort_resources(&mut done);
    Ok((stats, done))
}
