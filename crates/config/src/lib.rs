//! kubexporter export configuration and the per-instance field transform
//! engine.
//!
//! The configuration is deserialized from YAML, merged with CLI flags,
//! validated exactly once and then shared read-only behind an `Arc` by all
//! workers. There is no ambient global state.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use kubexporter_core::tree::{get_nested, get_nested_mut, remove_nested_field, render_value, set_nested, transform_nested_field};
use kubexporter_core::{FieldPath, FieldValue, GroupResource, KindFields};

pub mod encrypted;
pub mod file;
mod masked;
mod naming;

pub use encrypted::{
    decrypt_files, encrypt_files, Decryptor, Encrypted, FileReport, ENVELOPE_PREFIX, ENV_AES_KEY,
};
pub use masked::Masked;

/// Default replacement for masked fields without a checksum algorithm.
pub const DEFAULT_MASK_REPLACEMENT: &str = "*****";

/// Namespace directory used for cluster-scoped resources.
pub const CLUSTER_NAMESPACE_DIR: &str = "_cluster_";

/// Default single-resource file name template.
pub const DEFAULT_FILE_NAME_TEMPLATE: &str = "{Namespace}/{Group}/{Kind}.{Name}.{Extension}";
/// Default grouped-list file name template.
pub const DEFAULT_LIST_FILE_NAME_TEMPLATE: &str = "{Namespace}/{Group}/{Kind}.{Extension}";

/// Default export target directory.
pub const DEFAULT_TARGET: &str = "exports";

/// Fields stripped from every exported instance unless overridden.
pub fn default_excluded_fields() -> Vec<FieldPath> {
    [
        vec!["status"],
        vec!["metadata", "uid"],
        vec!["metadata", "selfLink"],
        vec!["metadata", "resourceVersion"],
        vec!["metadata", "creationTimestamp"],
        vec!["metadata", "deletionTimestamp"],
        vec!["metadata", "deletionGracePeriodSeconds"],
        vec!["metadata", "generation"],
        vec!["metadata", "annotations", "kubectl.kubernetes.io/last-applied-configuration"],
    ]
    .into_iter()
    .map(|p| p.into_iter().map(str::to_string).collect())
    .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Yaml,
    Json,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Yaml => "yaml",
            OutputFormat::Json => "json",
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "yaml" => Ok(OutputFormat::Yaml),
            "json" => Ok(OutputFormat::Json),
            other => bail!("unsupported output format [{other}]"),
        }
    }
}

/// Progress reporting mode. Rendering itself lives outside the export core;
/// workers only emit events to a sink selected from this mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Progress {
    #[default]
    Simple,
    None,
}

/// Kind- and instance-level exclusion parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Excluded {
    pub kinds: Vec<String>,
    pub fields: Vec<FieldPath>,
    pub kind_fields: KindFields,
    /// Paths restored after exclusion when they sit below an excluded path.
    pub preserved_fields: KindFields,
    /// Drop instances whose rendered field value matches one of the listed
    /// values.
    #[serde(rename = "kindByField")]
    pub kinds_by_field: BTreeMap<String, Vec<FieldValue>>,
}

impl Default for Excluded {
    fn default() -> Self {
        Self {
            kinds: Vec::new(),
            fields: default_excluded_fields(),
            kind_fields: KindFields::default(),
            preserved_fields: KindFields::default(),
            kinds_by_field: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Included {
    pub kinds: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct S3Config {
    pub endpoint: String,
    #[serde(rename = "accessKeyID")]
    pub access_key_id: String,
    pub secret_access_key: String,
    pub token: String,
    pub secure: bool,
    pub bucket: String,
}

/// The full set of recognized export options. Built once, validated once,
/// then treated as read-only by every worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExportConfig {
    pub excluded: Excluded,
    pub included: Included,
    /// Maximum instance age, e.g. "30m", "24h", "7d". Older instances are
    /// skipped.
    pub created_within: Option<String>,
    /// Exclude instances whose owner is itself an excluded kind.
    pub consider_owner_references: bool,
    pub masked: Masked,
    pub encrypted: Encrypted,
    pub sort_slices: KindFields,
    pub file_name_template: String,
    pub list_file_name_template: String,
    /// Write one list document per namespace per kind instead of one file
    /// per instance.
    pub as_lists: bool,
    /// Server-side page size; only applied in single-resource mode.
    pub query_page_size: u32,
    pub output_format: OutputFormat,
    pub target: PathBuf,
    pub clear_target: bool,
    pub summary: bool,
    pub progress: Progress,
    pub namespace: String,
    pub worker: usize,
    pub archive: bool,
    pub archive_retention_days: u32,
    pub archive_target: Option<PathBuf>,
    pub s3: Option<S3Config>,
    pub quiet: bool,
    pub verbose: bool,
    pub print_size: bool,

    #[serde(skip)]
    excluded_set: BTreeSet<String>,
    #[serde(skip)]
    included_set: BTreeSet<String>,
    #[serde(skip)]
    max_age: Option<chrono::Duration>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            excluded: Excluded::default(),
            included: Included::default(),
            created_within: None,
            consider_owner_references: false,
            masked: Masked::default(),
            encrypted: Encrypted::default(),
            sort_slices: KindFields::default(),
            file_name_template: DEFAULT_FILE_NAME_TEMPLATE.to_string(),
            list_file_name_template: DEFAULT_LIST_FILE_NAME_TEMPLATE.to_string(),
            as_lists: false,
            query_page_size: 0,
            output_format: OutputFormat::default(),
            target: PathBuf::from(DEFAULT_TARGET),
            clear_target: false,
            summary: false,
            progress: Progress::default(),
            namespace: String::new(),
            worker: 1,
            archive: false,
            archive_retention_days: 0,
            archive_target: None,
            s3: None,
            quiet: false,
            verbose: false,
            print_size: false,
            excluded_set: BTreeSet::new(),
            included_set: BTreeSet::new(),
            max_age: None,
        }
    }
}

impl ExportConfig {
    /// Load a config from a YAML file, leaving unset options at their
    /// defaults.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let cfg: ExportConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(cfg)
    }

    /// Validate the config and derive runtime state. Must be called exactly
    /// once before the config is shared; fails on the fatal configuration
    /// errors (bad templates, bad worker count, bad encryption key, bad
    /// checksum algorithm, unresolvable paths).
    pub fn validate(&mut self) -> Result<()> {
        if self.worker == 0 {
            bail!("worker must be > 0");
        }
        if self.file_name_template.is_empty() {
            bail!("file name template must not be empty");
        }
        if self.list_file_name_template.is_empty() {
            bail!("list file name template must not be empty");
        }
        let probe = GroupResource::new("group", "v1", "Kind", true);
        self.file_name(&probe, &serde_json::json!({}), 0)
            .with_context(|| format!("error parsing file name template [{}]", self.file_name_template))?;
        self.list_file_name(&probe, "ns")
            .with_context(|| {
                format!("error parsing list file name template [{}]", self.list_file_name_template)
            })?;

        if self.target.as_os_str().is_empty() {
            bail!("target must not be empty");
        }
        if self.target.is_relative() {
            self.target = std::env::current_dir()?.join(&self.target);
        }
        if let Some(at) = &self.archive_target {
            if at.is_relative() {
                self.archive_target = Some(std::env::current_dir()?.join(at));
            }
        }

        self.masked.setup()?;
        self.encrypted.setup()?;
        // Encryption wins over masking for the same field.
        self.masked.kind_fields = self.encrypted.kind_fields.diff(&self.masked.kind_fields);

        self.excluded_set = self.excluded.kinds.iter().cloned().collect();
        self.included_set = self.included.kinds.iter().cloned().collect();

        self.max_age = match &self.created_within {
            Some(s) if !s.is_empty() => Some(parse_duration(s)?),
            _ => None,
        };

        if self.quiet {
            self.summary = false;
            self.progress = Progress::None;
        }
        Ok(())
    }

    /// Kind-level include/exclude filter on the `group.Kind` identity. An
    /// explicit include list takes precedence over the exclude list.
    pub fn is_kind_excluded(&self, group_kind: &str) -> bool {
        if !self.included_set.is_empty() {
            return !self.included_set.contains(group_kind);
        }
        self.excluded_set.contains(group_kind)
    }

    pub fn is_excluded(&self, res: &GroupResource) -> bool {
        self.is_kind_excluded(&res.group_kind())
    }

    /// Instance-level exclusion, checked before any field transform runs.
    /// Any single match short-circuits.
    pub fn is_instance_excluded(&self, res: &GroupResource, doc: &Value) -> bool {
        if self.is_excluded_by_owner_reference(doc) {
            return true;
        }
        if let Some(max_age) = self.max_age {
            if let Some(ts) = doc
                .get("metadata")
                .and_then(|m| m.get("creationTimestamp"))
                .and_then(|v| v.as_str())
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            {
                if ts.with_timezone(&chrono::Utc) < chrono::Utc::now() - max_age {
                    return true;
                }
            }
        }
        if let Some(filters) = self.excluded.kinds_by_field.get(&res.group_kind()) {
            for fv in filters {
                if let Some(v) = get_nested(doc, &fv.field) {
                    if !v.is_null() {
                        let rendered = render_value(v);
                        if fv.values.iter().any(|want| *want == rendered) {
                            return true;
                        }
                    }
                }
            }
        }
        false
    }

    fn is_excluded_by_owner_reference(&self, doc: &Value) -> bool {
        if !self.consider_owner_references {
            return false;
        }
        let Some(refs) = doc
            .get("metadata")
            .and_then(|m| m.get("ownerReferences"))
            .and_then(|v| v.as_array())
        else {
            return false;
        };
        for r in refs {
            let kind = r.get("kind").and_then(|v| v.as_str()).unwrap_or_default();
            let api_version = r.get("apiVersion").and_then(|v| v.as_str()).unwrap_or_default();
            let (group, _version) = split_api_version(api_version);
            let group_kind = if group.is_empty() {
                kind.to_string()
            } else {
                format!("{group}.{kind}")
            };
            if self.is_kind_excluded(&group_kind) {
                return true;
            }
        }
        false
    }

    /// Remove every default and kind-specific excluded field, then restore
    /// the configured preserved paths that sat below an excluded subtree.
    pub fn filter_fields(&self, res: &GroupResource, doc: &mut Value) {
        let gk = res.group_kind();
        let preserved: Vec<(FieldPath, Value)> = self
            .excluded
            .preserved_fields
            .get(&gk)
            .iter()
            .filter_map(|p| get_nested(doc, p).cloned().map(|v| (p.clone(), v)))
            .collect();

        for f in &self.excluded.fields {
            remove_nested_field(doc, f);
        }
        for f in self.excluded.kind_fields.get(&gk) {
            remove_nested_field(doc, f);
        }
        for (path, value) in preserved {
            set_nested(doc, &path, value);
        }
    }

    pub fn mask_fields(&self, res: &GroupResource, doc: &mut Value) {
        for f in self.masked.kind_fields.get(&res.group_kind()) {
            transform_nested_field(doc, f, &mut |v| Value::String(self.masked.mask(v)));
        }
    }

    pub fn encrypt_fields(&self, res: &GroupResource, doc: &mut Value) {
        for f in self.encrypted.kind_fields.get(&res.group_kind()) {
            transform_nested_field(doc, f, &mut |v| self.encrypted.encrypt_value(v));
        }
    }

    /// Sort configured slices ascending by inferred element type so
    /// structurally equal exports diff cleanly.
    pub fn sort_slice_fields(&self, res: &GroupResource, doc: &mut Value) {
        for f in self.sort_slices.get(&res.group_kind()) {
            if let Some(Value::Array(items)) = get_nested_mut(doc, f) {
                sort_slice(items);
            }
        }
    }

    /// The full per-instance pipeline in its fixed order:
    /// exclude → mask → encrypt → sort-slices.
    pub fn transform_instance(&self, res: &GroupResource, doc: &mut Value) {
        self.filter_fields(res, doc);
        self.mask_fields(res, doc);
        self.encrypt_fields(res, doc);
        self.sort_slice_fields(res, doc);
    }
}

fn sort_slice(items: &mut [Value]) {
    let Some(first) = items.first() else { return };
    match first {
        Value::String(_) => {
            items.sort_by(|a, b| a.as_str().unwrap_or_default().cmp(b.as_str().unwrap_or_default()));
        }
        Value::Number(n) if n.is_i64() || n.is_u64() => {
            items.sort_by_key(|v| v.as_i64().unwrap_or(i64::MIN));
        }
        Value::Number(_) => {
            items.sort_by(|a, b| {
                a.as_f64()
                    .unwrap_or(f64::MIN)
                    .partial_cmp(&b.as_f64().unwrap_or(f64::MIN))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        _ => {
            items.sort_by_cached_key(|v| v.to_string());
        }
    }
}

/// Split an `apiVersion` string into (group, version); the core group has no
/// slash.
pub fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

fn parse_duration(s: &str) -> Result<chrono::Duration> {
    let s = s.trim();
    if s.is_empty() {
        bail!("empty duration");
    }
    let (num, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let n: i64 = num.parse().with_context(|| format!("invalid duration [{s}]"))?;
    match unit {
        "s" => Ok(chrono::Duration::seconds(n)),
        "m" => Ok(chrono::Duration::minutes(n)),
        "h" => Ok(chrono::Duration::hours(n)),
        "d" => Ok(chrono::Duration::days(n)),
        _ => bail!("invalid duration [{s}]: supported units are s/m/h/d"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fp(segs: &[&str]) -> FieldPath {
        segs.iter().map(|s| s.to_string()).collect()
    }

    fn validated(mut cfg: ExportConfig) -> ExportConfig {
        cfg.validate().unwrap();
        cfg
    }

    #[test]
    fn defaults_validate() {
        let cfg = validated(ExportConfig::default());
        assert_eq!(cfg.worker, 1);
        assert!(cfg.target.is_absolute());
    }

    #[test]
    fn zero_worker_rejected() {
        let mut cfg = ExportConfig::default();
        cfg.worker = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_template_variable_rejected() {
        let mut cfg = ExportConfig::default();
        cfg.file_name_template = "{Namespace}/{Nope}.{Extension}".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn include_list_wins_over_exclude_list() {
        let mut cfg = ExportConfig::default();
        cfg.included.kinds = vec!["ConfigMap".to_string()];
        cfg.excluded.kinds = vec!["ConfigMap".to_string()];
        let cfg = validated(cfg);
        assert!(!cfg.is_kind_excluded("ConfigMap"));
        assert!(cfg.is_kind_excluded("Secret"));
    }

    #[test]
    fn excluded_kinds_respected_without_includes() {
        let mut cfg = ExportConfig::default();
        cfg.excluded.kinds = vec!["events.k8s.io.Event".to_string()];
        let cfg = validated(cfg);
        assert!(cfg.is_kind_excluded("events.k8s.io.Event"));
        assert!(!cfg.is_kind_excluded("ConfigMap"));
    }

    #[test]
    fn default_fields_removed() {
        let cfg = validated(ExportConfig::default());
        let res = GroupResource::new("", "v1", "ConfigMap", true);
        let mut doc = json!({
            "metadata": {"name": "a", "uid": "x", "resourceVersion": "5"},
            "status": {"phase": "Active"},
            "data": {"k": "v"}
        });
        cfg.filter_fields(&res, &mut doc);
        assert_eq!(doc, json!({"metadata": {"name": "a"}, "data": {"k": "v"}}));
    }

    #[test]
    fn preserved_field_survives_exclusion() {
        let mut cfg = ExportConfig::default();
        cfg.excluded
            .preserved_fields
            .insert("Pod", fp(&["status", "phase"]));
        let cfg = validated(cfg);
        let res = GroupResource::new("", "v1", "Pod", true);
        let mut doc = json!({
            "metadata": {"name": "p"},
            "status": {"phase": "Running", "other": "x"}
        });
        cfg.filter_fields(&res, &mut doc);
        assert_eq!(
            doc,
            json!({"metadata": {"name": "p"}, "status": {"phase": "Running"}})
        );
    }

    #[test]
    fn encryption_wins_over_masking() {
        let mut cfg = ExportConfig::default();
        cfg.encrypted.aes_key = "1234567890123456".to_string();
        cfg.encrypted.kind_fields.insert("Secret", fp(&["data"]));
        cfg.masked.kind_fields.insert("Secret", fp(&["data", "password"]));
        cfg.masked.kind_fields.insert("Secret", fp(&["stringData"]));
        let cfg = validated(cfg);
        assert_eq!(cfg.masked.kind_fields.get("Secret"), &[fp(&["stringData"])]);
    }

    #[test]
    fn field_value_filter_excludes_instance() {
        let mut cfg = ExportConfig::default();
        cfg.excluded.kinds_by_field.insert(
            "ConfigMap".to_string(),
            vec![FieldValue {
                field: fp(&["metadata", "labels", "keep"]),
                values: vec!["false".to_string()],
            }],
        );
        let cfg = validated(cfg);
        let res = GroupResource::new("", "v1", "ConfigMap", true);
        let dropped = json!({"metadata": {"labels": {"keep": "false"}}});
        let kept = json!({"metadata": {"labels": {"keep": "true"}}});
        assert!(cfg.is_instance_excluded(&res, &dropped));
        assert!(!cfg.is_instance_excluded(&res, &kept));
    }

    #[test]
    fn owner_reference_to_excluded_kind_excludes_instance() {
        let mut cfg = ExportConfig::default();
        cfg.consider_owner_references = true;
        cfg.excluded.kinds = vec!["apps.ReplicaSet".to_string()];
        let cfg = validated(cfg);
        let res = GroupResource::new("", "v1", "Pod", true);
        let doc = json!({
            "metadata": {"ownerReferences": [
                {"apiVersion": "apps/v1", "kind": "ReplicaSet", "name": "rs", "uid": "u"}
            ]}
        });
        assert!(cfg.is_instance_excluded(&res, &doc));
    }

    #[test]
    fn old_instances_excluded_by_age() {
        let mut cfg = ExportConfig::default();
        cfg.created_within = Some("1h".to_string());
        let cfg = validated(cfg);
        let res = GroupResource::new("", "v1", "Pod", true);
        let old = json!({"metadata": {"creationTimestamp": "2020-01-01T00:00:00Z"}});
        let fresh = json!({"metadata": {"creationTimestamp": chrono::Utc::now().to_rfc3339()}});
        assert!(cfg.is_instance_excluded(&res, &old));
        assert!(!cfg.is_instance_excluded(&res, &fresh));
    }

    #[test]
    fn sort_string_slice_and_idempotence() {
        let mut cfg = ExportConfig::default();
        cfg.sort_slices.insert("Role", fp(&["rules"]));
        let cfg = validated(cfg);
        let res = GroupResource::new("", "v1", "Role", true);
        let mut doc = json!({"rules": ["watch", "get", "list"]});
        cfg.sort_slice_fields(&res, &mut doc);
        assert_eq!(doc, json!({"rules": ["get", "list", "watch"]}));
        let once = doc.clone();
        cfg.sort_slice_fields(&res, &mut doc);
        assert_eq!(doc, once);
    }

    #[test]
    fn sort_numeric_and_structured_slices() {
        let mut ints = vec![json!(3), json!(1), json!(2)];
        sort_slice(&mut ints);
        assert_eq!(ints, vec![json!(1), json!(2), json!(3)]);

        let mut floats = vec![json!(2.5), json!(0.5), json!(1.5)];
        sort_slice(&mut floats);
        assert_eq!(floats, vec![json!(0.5), json!(1.5), json!(2.5)]);

        let mut objs = vec![json!({"name": "b"}), json!({"name": "a"})];
        sort_slice(&mut objs);
        assert_eq!(objs, vec![json!({"name": "a"}), json!({"name": "b"})]);
    }

    #[test]
    fn transform_order_masks_then_sorts() {
        // sort-slices runs last so it sees post-mask values
        let mut cfg = ExportConfig::default();
        cfg.masked.checksum = Some("sha256".to_string());
        cfg.masked.kind_fields.insert("Thing", fp(&["secrets"]));
        cfg.sort_slices.insert("Thing", fp(&["names"]));
        let cfg = validated(cfg);
        let res = GroupResource::new("", "v1", "Thing", true);
        let mut doc = json!({"secrets": "top", "names": ["b", "a"]});
        cfg.transform_instance(&res, &mut doc);
        assert_ne!(doc["secrets"], json!("top"));
        assert_eq!(doc["names"], json!(["a", "b"]));
    }

    #[test]
    fn durations_parse() {
        assert_eq!(parse_duration("90s").unwrap(), chrono::Duration::seconds(90));
        assert_eq!(parse_duration("15m").unwrap(), chrono::Duration::minutes(15));
        assert_eq!(parse_duration("24h").unwrap(), chrono::Duration::hours(24));
        assert_eq!(parse_duration("7d").unwrap(), chrono::Duration::days(7));
        assert_eq!(parse_duration("42").unwrap(), chrono::Duration::seconds(42));
        assert!(parse_duration("7w").is_err());
    }

    #[test]
    fn quiet_disables_summary_and_progress() {
        let mut cfg = ExportConfig::default();
        cfg.quiet = true;
        cfg.summary = true;
        let cfg = validated(cfg);
        assert!(!cfg.summary);
        assert_eq!(cfg.progress, Progress::None);
    }

    #[test]
    fn config_roundtrips_through_yaml() {
        let yaml = r#"
excluded:
  kinds: ["Event"]
  kindFields:
    Secret:
      - ["metadata", "annotations"]
included:
  kinds: []
masked:
  checksum: sha256
  kindFields:
    Secret:
      - ["data"]
worker: 3
asLists: true
outputFormat: json
namespace: prod
"#;
        let mut cfg: ExportConfig = serde_yaml::from_str(yaml).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.worker, 3);
        assert!(cfg.as_lists);
        assert_eq!(cfg.output_format, OutputFormat::Json);
        assert_eq!(cfg.namespace, "prod");
        assert!(cfg.is_kind_excluded("Event"));
        // defaults untouched by partial file
        assert!(!cfg.excluded.fields.is_empty());
    }
}
