//! Field masking: fixed replacement string or checksum digest.

use anyhow::{bail, Result};
use md5::Md5;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use kubexporter_core::tree::render_value;
use kubexporter_core::KindFields;

use crate::DEFAULT_MASK_REPLACEMENT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Checksum {
    Md5,
    Sha1,
    Sha256,
}

impl Checksum {
    fn digest(&self, s: &str) -> String {
        match self {
            Checksum::Md5 => hex::encode(Md5::digest(s.as_bytes())),
            Checksum::Sha1 => hex::encode(Sha1::digest(s.as_bytes())),
            Checksum::Sha256 => hex::encode(Sha256::digest(s.as_bytes())),
        }
    }
}

/// Masking parameters for configured field paths.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Masked {
    /// Replacement string used when no checksum algorithm is configured.
    pub replacement: String,
    /// Checksum algorithm name: md5, sha1 or sha256.
    pub checksum: Option<String>,
    pub kind_fields: KindFields,

    #[serde(skip)]
    digest: Option<Checksum>,
}

impl Masked {
    /// Select the digest function, or fail on an unrecognized algorithm
    /// name. An empty replacement falls back to the default.
    pub fn setup(&mut self) -> Result<()> {
        self.digest = match self.checksum.as_deref() {
            None | Some("") => None,
            Some("md5") => Some(Checksum::Md5),
            Some("sha1") => Some(Checksum::Sha1),
            Some("sha256") => Some(Checksum::Sha256),
            Some(other) => bail!("invalid checksum {other:?}: supported are [md5/sha1/sha256]"),
        };
        if self.replacement.is_empty() {
            self.replacement = DEFAULT_MASK_REPLACEMENT.to_string();
        }
        Ok(())
    }

    pub fn mask(&self, val: &Value) -> String {
        match &self.digest {
            Some(sum) => sum.digest(&render_value(val)),
            None => self.replacement.clone(),
        }
    }
}
