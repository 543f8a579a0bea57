//! Reading and writing exported resource documents.

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;

use crate::OutputFormat;

/// Serialize a document in the configured output format.
pub fn marshal(format: OutputFormat, doc: &Value) -> Result<Vec<u8>> {
    match format {
        OutputFormat::Yaml => Ok(serde_yaml::to_string(doc)?.into_bytes()),
        OutputFormat::Json => {
            let mut buf = serde_json::to_vec_pretty(doc)?;
            buf.push(b'\n');
            Ok(buf)
        }
    }
}

/// Read an exported document; accepts YAML or JSON regardless of extension.
pub fn read_resource_file(path: &Path) -> Result<Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let doc: Value = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(doc)
}

/// Write a document, creating parent directories; returns the number of
/// bytes written.
pub fn write_resource_file(path: &Path, format: OutputFormat, doc: &Value) -> Result<u64> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let bytes = marshal(format, doc)?;
    std::fs::write(path, &bytes).with_context(|| format!("writing {}", path.display()))?;
    Ok(bytes.len() as u64)
}
