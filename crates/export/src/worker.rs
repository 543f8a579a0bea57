//! One export lane: page through a kind, transform each instance, write the
//! output, accumulate local stats.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use kubexporter_cluster::ClusterApi;
use kubexporter_config::file::write_resource_file;
use kubexporter_config::ExportConfig;
use kubexporter_core::tree::meta_str;
use kubexporter_core::{ClusterError, GroupResource, Stats};

use crate::progress::ProgressSink;

pub struct Worker {
    id: usize,
    config: Arc<ExportConfig>,
    api: Arc<dyn ClusterApi>,
    progress: Arc<dyn ProgressSink>,
    stats: Stats,
}

impl Worker {
    pub fn new(
        id: usize,
        config: Arc<ExportConfig>,
        api: Arc<dyn ClusterApi>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            id,
            config,
            api,
            progress,
            stats: Stats::default(),
        }
    }

    /// Consume kinds from the shared job queue until it is drained, sending
    /// each completed kind back exactly once; returns the worker-local stats.
    pub async fn run(
        mut self,
        jobs: Arc<Mutex<mpsc::Receiver<GroupResource>>>,
        out: mpsc::Sender<GroupResource>,
        shutdown: Arc<AtomicBool>,
    ) -> Stats {
        loop {
            let job = {
                let mut rx = jobs.lock().await;
                rx.recv().await
            };
            let Some(mut res) = job else { break };
            self.stats.kinds += 1;
            if shutdown.load(Ordering::Relaxed) {
                res.error = Some("Cancelled".to_string());
            } else {
                self.export_kind(&mut res, &shutdown).await;
            }
            self.progress.kind_finished(self.id, &res);
            if out.send(res).await.is_err() {
                break;
            }
        }
        debug!(worker = self.id, "worker drained");
        self.stats
    }

    /// Page through one kind. Metrics accumulate on `res` across pages and
    /// are never reset between pages. A list failure marks the kind and
    /// returns; it never aborts the run.
    async fn export_kind(&mut self, res: &mut GroupResource, shutdown: &AtomicBool) {
        let group_kind = res.group_kind();
        self.progress.kind_started(self.id, &group_kind);

        let namespace = (res.namespaced && !self.config.namespace.is_empty())
            .then(|| self.config.namespace.clone());
        // Grouped-list output disables server-side pagination so a kind's
        // list file stays complete.
        let limit = (!self.config.as_lists && self.config.query_page_size > 0)
            .then_some(self.config.query_page_size);

        let mut continue_token: Option<String> = None;
        let mut lists: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        let mut seen_names: HashMap<String, u32> = HashMap::new();

        loop {
            let started = Instant::now();
            let page = self
                .api
                .list_page(res, namespace.as_deref(), continue_token.as_deref(), limit)
                .await;
            res.query_duration += started.elapsed();

            let page = match page {
                Ok(page) => page,
                Err(err) => {
                    self.stats.errors += 1;
                    res.error = Some(match err {
                        ClusterError::NotFound => "Not Found".to_string(),
                        ClusterError::NotAllowed => "Not Allowed".to_string(),
                        ClusterError::Other(msg) => format!("Error: {msg}"),
                    });
                    return;
                }
            };

            res.pages += 1;
            self.stats.pages += 1;
            res.instances += page.items.len() as u64;
            self.progress.page_fetched(self.id, &group_kind, page.items.len());

            let started = Instant::now();
            if self.config.as_lists {
                self.collect_list_items(res, page.items, &mut lists);
            } else {
                self.export_single_resources(res, page.items, &mut seen_names);
            }
            res.export_duration += started.elapsed();

            continue_token = page.continue_token;
            if continue_token.is_none() || shutdown.load(Ordering::Relaxed) {
                break;
            }
        }

        if self.config.as_lists {
            let started = Instant::now();
            self.write_lists(res, lists);
            res.export_duration += started.elapsed();
        }
    }

    fn export_single_resources(
        &mut self,
        res: &mut GroupResource,
        items: Vec<Value>,
        seen_names: &mut HashMap<String, u32>,
    ) {
        for mut doc in items {
            if self.config.is_instance_excluded(res, &doc) {
                continue;
            }
            let namespace = meta_str(&doc, "namespace");
            self.config.transform_instance(res, &mut doc);

            // Case-insensitive filesystems collide on names differing only
            // in case; disambiguate in encounter order.
            let collision_key =
                format!("{}/{}", namespace, meta_str(&doc, "name")).to_lowercase();
            let index = {
                let n = seen_names.entry(collision_key).or_insert(0);
                let current = *n;
                *n += 1;
                current
            };

            let filename = match self.config.file_name(res, &doc, index) {
                Ok(f) => f,
                Err(err) => {
                    res.error = Some(err.to_string());
                    continue;
                }
            };
            let path = self.config.target.join(filename);
            match write_resource_file(&path, self.config.output_format, &doc) {
                Ok(bytes) => {
                    res.exported_instances += 1;
                    res.exported_bytes += bytes;
                    self.stats.resources += 1;
                    self.stats.add_namespace(&namespace);
                    self.progress.instance_written(self.id, &res.group_kind());
                }
                Err(err) => {
                    res.error = Some(err.to_string());
                }
            }
        }
    }

    fn collect_list_items(
        &mut self,
        res: &mut GroupResource,
        items: Vec<Value>,
        lists: &mut BTreeMap<String, Vec<Value>>,
    ) {
        for mut doc in items {
            if self.config.is_instance_excluded(res, &doc) {
                continue;
            }
            let namespace = meta_str(&doc, "namespace");
            self.config.transform_instance(res, &mut doc);
            lists.entry(namespace).or_default().push(doc);
        }
    }

    /// Write one list document per namespace, with no list-level metadata.
    fn write_lists(&mut self, res: &mut GroupResource, lists: BTreeMap<String, Vec<Value>>) {
        for (namespace, items) in lists {
            let count = items.len() as u64;
            let list_doc = json!({
                "apiVersion": res.group_version(),
                "kind": format!("{}List", res.kind),
                "items": items,
            });
            let filename = match self.config.list_file_name(res, &namespace) {
                Ok(f) => f,
                Err(err) => {
                    res.error = Some(err.to_string());
                    continue;
                }
            };
            let path = self.config.target.join(filename);
            match write_resource_file(&path, self.config.output_format, &list_doc) {
                Ok(bytes) => {
                    res.exported_instances += count;
                    res.exported_bytes += bytes;
                    self.stats.resources += count;
                    self.stats.add_namespace(&namespace);
                }
                Err(err) => {
                    res.error = Some(err.to_string());
                }
            }
        }
    }
}
