//! Field path maps shared by the exclusion, masking, encryption and
//! slice-sort configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Ordered segments addressing one location inside a nested document.
/// Never empty in valid configuration.
pub type FieldPath = Vec<String>;

/// A field path plus the rendered values that exclude an instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldValue {
    pub field: FieldPath,
    pub values: Vec<String>,
}

/// Mapping from a kind identity (`group.Kind`) to a set of field paths.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KindFields(pub BTreeMap<String, Vec<FieldPath>>);

impl KindFields {
    pub fn is_empty(&self) -> bool {
        self.0.values().all(|f| f.is_empty())
    }

    pub fn get(&self, group_kind: &str) -> &[FieldPath] {
        self.0.get(group_kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn insert(&mut self, group_kind: &str, field: FieldPath) {
        self.0.entry(group_kind.to_string()).or_default().push(field);
    }

    /// Paths of `other` not already covered by a path in `self`.
    ///
    /// A path is covered when some path of `self` for the same kind is a
    /// segment-wise prefix of it. Kinds absent from `self` pass through
    /// unchanged. Used so encrypted fields are dropped from the mask map and
    /// never processed twice.
    pub fn diff(&self, other: &KindFields) -> KindFields {
        let mut out = BTreeMap::new();
        for (kind, fields) in &other.0 {
            let kept: Vec<FieldPath> = match self.0.get(kind) {
                Some(mine) => fields
                    .iter()
                    .filter(|f| !mine.iter().any(|m| is_prefix(m, f)))
                    .cloned()
                    .collect(),
                None => fields.clone(),
            };
            if !kept.is_empty() {
                out.insert(kind.clone(), kept);
            }
        }
        KindFields(out)
    }
}

fn is_prefix(prefix: &[String], path: &[String]) -> bool {
    prefix.len() <= path.len() && prefix.iter().zip(path.iter()).all(|(a, b)| a == b)
}
