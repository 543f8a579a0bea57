//! Template-driven export file naming with filesystem-safe sanitization.

use std::path::PathBuf;

use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use kubexporter_core::tree::meta_str;
use kubexporter_core::GroupResource;

use crate::{ExportConfig, CLUSTER_NAMESPACE_DIR};

static TEMPLATE_VAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{([A-Za-z]+)\}").unwrap());
static INVALID_FILE_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-zA-Z0-9.\-]").unwrap());

fn render_template(template: &str, vars: &[(&str, &str)]) -> Result<String> {
    let mut unknown: Option<String> = None;
    let rendered = TEMPLATE_VAR.replace_all(template, |caps: &regex::Captures| {
        let key = &caps[1];
        match vars.iter().find(|(k, _)| *k == key) {
            Some((_, v)) => (*v).to_string(),
            None => {
                unknown.get_or_insert_with(|| key.to_string());
                String::new()
            }
        }
    });
    if let Some(key) = unknown {
        bail!("unknown template variable {{{key}}}");
    }
    Ok(rendered.into_owned())
}

/// Replace invalid filename characters per path segment and drop empty
/// segments.
fn sanitize_rel_path(rendered: &str) -> PathBuf {
    let mut out = PathBuf::new();
    for segment in rendered.split('/') {
        let cleaned = INVALID_FILE_CHARS.replace_all(segment, "_");
        if !cleaned.is_empty() {
            out.push(cleaned.as_ref());
        }
    }
    out
}

impl ExportConfig {
    /// Relative export path for one instance. `index > 0` marks a duplicate
    /// namespace+name (case-insensitive collision) and appends a numeric
    /// suffix in encounter order.
    pub fn file_name(&self, res: &GroupResource, doc: &Value, index: u32) -> Result<PathBuf> {
        let mut name = meta_str(doc, "name");
        if index > 0 {
            name = format!("{name}_{index}");
        }
        let namespace = meta_str(doc, "namespace");
        self.render_file_path(&self.file_name_template, res, &namespace, &name)
    }

    /// Relative export path for one grouped list file.
    pub fn list_file_name(&self, res: &GroupResource, namespace: &str) -> Result<PathBuf> {
        self.render_file_path(&self.list_file_name_template, res, namespace, "")
    }

    fn render_file_path(
        &self,
        template: &str,
        res: &GroupResource,
        namespace: &str,
        name: &str,
    ) -> Result<PathBuf> {
        let ns = if namespace.is_empty() {
            CLUSTER_NAMESPACE_DIR
        } else {
            namespace
        };
        let rendered = render_template(
            template,
            &[
                ("Namespace", ns),
                ("Name", name),
                ("Kind", &res.kind),
                ("Group", &res.api_group),
                ("Extension", self.output_format.extension()),
            ],
        )?;
        let path = sanitize_rel_path(&rendered);
        if path.as_os_str().is_empty() {
            bail!("template [{template}] renders an empty path");
        }
        Ok(path)
    }
}
