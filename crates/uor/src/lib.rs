//! Owner-reference repair: rewrite stale owner UIDs in previously exported
//! files against a live cluster.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{info, warn};

use kubexporter_cluster::ClusterApi;
use kubexporter_config::file::{read_resource_file, write_resource_file};
use kubexporter_config::ExportConfig;
use kubexporter_core::tree::meta_str;

/// Per-file outcome of the repair pass.
#[derive(Debug, Clone)]
pub struct RepairReport {
    pub file: String,
    pub namespace: String,
    pub kind: String,
    pub name: String,
    /// References whose UID was rewritten.
    pub updated: usize,
    /// References whose live owner could not be found.
    pub unresolved: usize,
}

/// Walk the export target and repair the owner references of every document
/// that declares any. Documents without UID changes are left untouched on
/// disk; an unresolved owner is reported, never an abort.
pub async fn update_owner_references(
    config: &ExportConfig,
    api: Arc<dyn ClusterApi>,
) -> Result<Vec<RepairReport>> {
    let mut files = Vec::new();
    collect_export_files(&config.target, config.output_format.extension(), &mut files)?;

    let mut reports = Vec::new();
    for file in files {
        if let Some(report) = repair_file(&file, config, api.as_ref()).await? {
            reports.push(report);
        }
    }
    Ok(reports)
}

async fn repair_file(
    file: &Path,
    config: &ExportConfig,
    api: &dyn ClusterApi,
) -> Result<Option<RepairReport>> {
    let mut doc = read_resource_file(file)?;
    let Some(refs) = doc
        .get("metadata")
        .and_then(|m| m.get("ownerReferences"))
        .and_then(|v| v.as_array())
        .cloned()
    else {
        return Ok(None);
    };
    if refs.is_empty() {
        return Ok(None);
    }

    let namespace = meta_str(&doc, "namespace");
    // One lookup per distinct owner within a file.
    let mut owners: HashMap<String, Option<Value>> = HashMap::new();
    let mut updated_refs = refs;
    let mut updated = 0;
    let mut unresolved = 0;

    for r in updated_refs.iter_mut() {
        if !r.is_object() {
            continue;
        }
        let api_version = r
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let kind = r.get("kind").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let owner_name = r.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let old_uid = r.get("uid").and_then(|v| v.as_str()).unwrap_or_default().to_string();

        let cache_key = format!("{namespace}#{api_version}#{owner_name}");
        let owner = match owners.get(&cache_key) {
            Some(cached) => cached.clone(),
            None => {
                let fetched = match api
                    .get(
                        &api_version,
                        &kind,
                        (!namespace.is_empty()).then_some(namespace.as_str()),
                        &owner_name,
                    )
                    .await
                {
                    Ok(obj) => Some(obj),
                    Err(err) => {
                        warn!(
                            file = %file.display(),
                            owner = %format!("{kind}/{owner_name}"),
                            error = %err,
                            "owner not resolvable"
                        );
                        None
                    }
                };
                owners.insert(cache_key, fetched.clone());
                fetched
            }
        };

        match owner {
            Some(obj) => {
                let new_uid = meta_str(&obj, "uid");
                if !new_uid.is_empty() && new_uid != old_uid {
                    r["uid"] = Value::String(new_uid.clone());
                    updated += 1;
                    info!(
                        file = %file.display(),
                        owner = %format!("{kind}/{owner_name}"),
                        old = %old_uid,
                        new = %new_uid,
                        "owner reference updated"
                    );
                }
            }
            None => unresolved += 1,
        }
    }

    if updated > 0 {
        if let Some(meta) = doc.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.insert("ownerReferences".to_string(), Value::Array(updated_refs));
        }
        write_resource_file(file, config.output_format, &doc)
            .with_context(|| format!("rewriting {}", file.display()))?;
    }

    Ok(Some(RepairReport {
        file: file.display().to_string(),
        namespace,
        kind: doc.get("kind").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
        name: meta_str(&doc, "name"),
        updated,
        unresolved,
    }))
}

fn collect_export_files(dir: &Path, extension: &str, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_export_files(&path, extension, out)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some(extension) {
            out.push(path);
        }
    }
    out.sort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kubexporter_cluster::ResourcePage;
    use kubexporter_core::{ClusterError, GroupResource};
    use serde_json::json;
    use std::sync::Mutex;

    struct MockApi {
        owners: HashMap<String, Value>,
        gets: Mutex<usize>,
    }

    #[async_trait]
    impl ClusterApi for MockApi {
        async fn discover(&self) -> Result<Vec<GroupResource>> {
            Ok(Vec::new())
        }

        async fn list_page(
            &self,
            _res: &GroupResource,
            _namespace: Option<&str>,
            _continue_token: Option<&str>,
            _limit: Option<u32>,
        ) -> Result<ResourcePage, ClusterError> {
            Ok(ResourcePage::default())
        }

        async fn get(
            &self,
            _api_version: &str,
            kind: &str,
            _namespace: Option<&str>,
            name: &str,
        ) -> Result<Value, ClusterError> {
            *self.gets.lock().unwrap() += 1;
            self.owners
                .get(&format!("{kind}/{name}"))
                .cloned()
                .ok_or(ClusterError::NotFound)
        }
    }

    fn write_doc(dir: &Path, rel: &str, doc: &Value) -> PathBuf {
        let path = dir.join(rel);
        write_resource_file(&path, kubexporter_config::OutputFormat::Yaml, doc).unwrap();
        path
    }

    fn config_for(target: &Path) -> ExportConfig {
        let mut cfg = ExportConfig::default();
        cfg.target = target.to_path_buf();
        cfg.validate().unwrap();
        cfg
    }

    fn pod_with_owner(uid: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "namespace": "ns1",
                "name": "pod-a",
                "ownerReferences": [
                    {"apiVersion": "apps/v1", "kind": "ReplicaSet", "name": "rs-a", "uid": uid},
                    {"apiVersion": "apps/v1", "kind": "ReplicaSet", "name": "rs-a", "uid": uid}
                ]
            }
        })
    }

    #[tokio::test]
    async fn stale_uid_is_rewritten_with_cached_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_doc(dir.path(), "ns1/Pod.pod-a.yaml", &pod_with_owner("old-uid"));

        let mut owners = HashMap::new();
        owners.insert(
            "ReplicaSet/rs-a".to_string(),
            json!({"metadata": {"uid": "new-uid"}}),
        );
        let api = Arc::new(MockApi {
            owners,
            gets: Mutex::new(0),
        });

        let cfg = config_for(dir.path());
        let reports = update_owner_references(&cfg, api.clone()).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].updated, 2);
        assert_eq!(reports[0].unresolved, 0);
        // duplicate owner within one file resolved once
        assert_eq!(*api.gets.lock().unwrap(), 1);

        let doc = read_resource_file(&file).unwrap();
        for r in doc["metadata"]["ownerReferences"].as_array().unwrap() {
            assert_eq!(r["uid"], json!("new-uid"));
        }
    }

    #[tokio::test]
    async fn unchanged_document_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_doc(dir.path(), "ns1/Pod.pod-a.yaml", &pod_with_owner("same-uid"));
        let before = std::fs::metadata(&file).unwrap().modified().unwrap();

        let mut owners = HashMap::new();
        owners.insert(
            "ReplicaSet/rs-a".to_string(),
            json!({"metadata": {"uid": "same-uid"}}),
        );
        let api = Arc::new(MockApi {
            owners,
            gets: Mutex::new(0),
        });

        let cfg = config_for(dir.path());
        let reports = update_owner_references(&cfg, api).await.unwrap();
        assert_eq!(reports[0].updated, 0);
        assert_eq!(std::fs::metadata(&file).unwrap().modified().unwrap(), before);
    }

    #[tokio::test]
    async fn missing_owner_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_doc(dir.path(), "ns1/Pod.pod-a.yaml", &pod_with_owner("old-uid"));
        let api = Arc::new(MockApi {
            owners: HashMap::new(),
            gets: Mutex::new(0),
        });

        let cfg = config_for(dir.path());
        let reports = update_owner_references(&cfg, api).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].updated, 0);
        assert_eq!(reports[0].unresolved, 2);
    }

    #[tokio::test]
    async fn files_without_owner_references_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_doc(
            dir.path(),
            "ns1/ConfigMap.cm.yaml",
            &json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "cm"}}),
        );
        let api = Arc::new(MockApi {
            owners: HashMap::new(),
            gets: Mutex::new(0),
        });

        let cfg = config_for(dir.path());
        let reports = update_owner_references(&cfg, api).await.unwrap();
        assert!(reports.is_empty());
    }
}
