//! Reversible field encryption.
//!
//! Encrypted values are self-describing envelopes:
//! `KUBEXPORTER_AES@` + base64(nonce || ciphertext+tag), AES-GCM with a
//! 12-byte nonce. Decryption needs no schema: any string leaf carrying the
//! prefix is an encrypted field.

use std::path::PathBuf;

use aes_gcm::aead::{rand_core::RngCore, Aead, OsRng};
use aes_gcm::{AeadCore, Aes128Gcm, Aes256Gcm, AesGcm, KeyInit, Nonce};
use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use kubexporter_core::tree::{meta_str, render_value, transform_nested_field};
use kubexporter_core::KindFields;

use crate::file::{read_resource_file, write_resource_file};
use crate::{split_api_version, OutputFormat};

/// Marker prefix of encrypted field envelopes.
pub const ENVELOPE_PREFIX: &str = "KUBEXPORTER_AES@";
/// Environment variable overriding the configured AES key.
pub const ENV_AES_KEY: &str = "KUBEXPORTER_AES_KEY";

const NONCE_SIZE: usize = 12;

type Aes192Gcm = AesGcm<aes_gcm::aes::Aes192, <Aes128Gcm as AeadCore>::NonceSize>;

#[derive(Clone)]
enum AeadCipher {
    Aes128(Box<Aes128Gcm>),
    Aes192(Box<Aes192Gcm>),
    Aes256(Box<Aes256Gcm>),
}

impl AeadCipher {
    fn new(key: &[u8]) -> Result<Self> {
        match key.len() {
            16 => Ok(AeadCipher::Aes128(Box::new(
                Aes128Gcm::new_from_slice(key).map_err(|e| anyhow!("cipher init failed: {e}"))?,
            ))),
            24 => Ok(AeadCipher::Aes192(Box::new(
                Aes192Gcm::new_from_slice(key).map_err(|e| anyhow!("cipher init failed: {e}"))?,
            ))),
            32 => Ok(AeadCipher::Aes256(Box::new(
                Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!("cipher init failed: {e}"))?,
            ))),
            n => bail!("invalid key size {n}: aesKey must be 16, 24 or 32 bytes long"),
        }
    }

    fn seal(&self, nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce);
        match self {
            AeadCipher::Aes128(c) => c.encrypt(nonce, plaintext),
            AeadCipher::Aes192(c) => c.encrypt(nonce, plaintext),
            AeadCipher::Aes256(c) => c.encrypt(nonce, plaintext),
        }
        .map_err(|_| anyhow!("encryption failed"))
    }

    fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce);
        match self {
            AeadCipher::Aes128(c) => c.decrypt(nonce, ciphertext),
            AeadCipher::Aes192(c) => c.decrypt(nonce, ciphertext),
            AeadCipher::Aes256(c) => c.decrypt(nonce, ciphertext),
        }
        .map_err(|_| anyhow!("decryption failed (wrong key or corrupted data)"))
    }
}

/// Field encryption parameters plus the runtime state derived by
/// [`Encrypted::setup`].
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Encrypted {
    pub aes_key: String,
    pub kind_fields: KindFields,

    #[serde(skip)]
    sealer: Option<Sealer>,
}

impl std::fmt::Debug for Encrypted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encrypted")
            .field("aes_key", &"[REDACTED]")
            .field("kind_fields", &self.kind_fields)
            .field("ready", &self.sealer.is_some())
            .finish()
    }
}

#[derive(Clone)]
struct Sealer {
    cipher: AeadCipher,
    // One nonce per setup, reused for every field sealed in this run; each
    // envelope embeds it, and decryption reads it back per field.
    nonce: [u8; NONCE_SIZE],
}

impl Encrypted {
    /// Derive the cipher and run nonce. Fails closed: a missing or invalid
    /// key is an error whenever any field is targeted for encryption. The
    /// `KUBEXPORTER_AES_KEY` env variable overrides the configured key.
    pub fn setup(&mut self) -> Result<()> {
        if let Ok(key) = std::env::var(ENV_AES_KEY) {
            if !key.is_empty() {
                self.aes_key = key;
            }
        }
        if !self.aes_key.is_empty() {
            let cipher = AeadCipher::new(self.aes_key.as_bytes())?;
            let mut nonce = [0u8; NONCE_SIZE];
            OsRng.fill_bytes(&mut nonce);
            self.sealer = Some(Sealer { cipher, nonce });
        } else if !self.kind_fields.is_empty() {
            bail!(
                "encrypted mode needs a valid aesKey: provide 'aesKey' in the config \
                 or via the {ENV_AES_KEY} env variable"
            );
        }
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.sealer.is_some()
    }

    /// Seal a single value into its envelope string. Values already carrying
    /// the envelope prefix, and empty strings, are returned unchanged.
    pub fn encrypt_value(&self, val: &Value) -> Value {
        let Some(sealer) = &self.sealer else {
            return val.clone();
        };
        if let Some(s) = val.as_str() {
            if s.is_empty() || s.starts_with(ENVELOPE_PREFIX) {
                return val.clone();
            }
        }
        let plaintext = render_value(val);
        match sealer.cipher.seal(&sealer.nonce, plaintext.as_bytes()) {
            Ok(ciphertext) => {
                let mut payload = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
                payload.extend_from_slice(&sealer.nonce);
                payload.extend_from_slice(&ciphertext);
                Value::String(format!("{ENVELOPE_PREFIX}{}", BASE64.encode(payload)))
            }
            Err(err) => {
                warn!(error = %err, "sealing field failed; value left unchanged");
                val.clone()
            }
        }
    }
}

/// Decryption-only handle for batch operations on exported files.
pub struct Decryptor {
    cipher: AeadCipher,
}

impl Decryptor {
    pub fn new(aes_key: &str) -> Result<Self> {
        Ok(Self {
            cipher: AeadCipher::new(aes_key.as_bytes())?,
        })
    }

    /// Recursively decrypt every enveloped string leaf of `doc`, returning
    /// the number of fields decrypted. A malformed envelope, truncated
    /// payload or authentication failure aborts the whole operation.
    pub fn decrypt_all(&self, doc: &mut Value) -> Result<usize> {
        let mut count = 0;
        self.decrypt_value(doc, &mut count)?;
        Ok(count)
    }

    fn decrypt_value(&self, val: &mut Value, count: &mut usize) -> Result<()> {
        match val {
            Value::Object(map) => {
                for v in map.values_mut() {
                    self.decrypt_value(v, count)?;
                }
            }
            Value::Array(items) => {
                for v in items.iter_mut() {
                    self.decrypt_value(v, count)?;
                }
            }
            Value::String(s) if s.starts_with(ENVELOPE_PREFIX) => {
                let payload = BASE64
                    .decode(&s[ENVELOPE_PREFIX.len()..])
                    .context("decoding encrypted field")?;
                if payload.len() < NONCE_SIZE {
                    bail!("invalid encrypted field: truncated payload");
                }
                let (nonce, ciphertext) = payload.split_at(NONCE_SIZE);
                let plaintext = self.cipher.open(nonce, ciphertext)?;
                *s = String::from_utf8(plaintext).context("decrypted field is not valid UTF-8")?;
                *count += 1;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Per-file result of the batch encrypt/decrypt/repair tools.
#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub file: String,
    pub namespace: String,
    pub kind: String,
    pub name: String,
    pub changed: usize,
}

fn doc_group_kind(doc: &Value) -> String {
    let kind = doc.get("kind").and_then(|v| v.as_str()).unwrap_or_default();
    let api_version = doc
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let (group, _) = split_api_version(api_version);
    if group.is_empty() {
        kind.to_string()
    } else {
        format!("{group}.{kind}")
    }
}

/// Encrypt the configured fields of already-exported files in place.
pub fn encrypt_files(
    encrypted: &Encrypted,
    format: OutputFormat,
    files: &[PathBuf],
) -> Result<Vec<FileReport>> {
    if !encrypted.is_ready() {
        bail!("encryption is not configured: call setup with a valid aesKey first");
    }
    let mut reports = Vec::with_capacity(files.len());
    for file in files {
        let mut doc = read_resource_file(file)?;
        let gk = doc_group_kind(&doc);
        let mut changed = 0;
        for path in encrypted.kind_fields.get(&gk) {
            transform_nested_field(&mut doc, path, &mut |v| {
                let next = encrypted.encrypt_value(v);
                if &next != v {
                    changed += 1;
                }
                next
            });
        }
        write_resource_file(file, format, &doc)?;
        reports.push(FileReport {
            file: file.display().to_string(),
            namespace: meta_str(&doc, "namespace"),
            kind: doc.get("kind").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            name: meta_str(&doc, "name"),
            changed,
        });
    }
    Ok(reports)
}

/// Decrypt every enveloped field of the given files in place.
pub fn decrypt_files(
    aes_key: &str,
    format: OutputFormat,
    files: &[PathBuf],
) -> Result<Vec<FileReport>> {
    let decryptor = Decryptor::new(aes_key)?;
    let mut reports = Vec::with_capacity(files.len());
    for file in files {
        let mut doc = read_resource_file(file)?;
        let changed = decryptor
            .decrypt_all(&mut doc)
            .with_context(|| format!("decrypting {}", file.display()))?;
        write_resource_file(file, format, &doc)?;
        reports.push(FileReport {
            file: file.display().to_string(),
            namespace: meta_str(&doc, "namespace"),
            kind: doc.get("kind").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            name: meta_str(&doc, "name"),
            changed,
        });
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubexporter_core::GroupResource;
    use serde_json::json;

    const KEY16: &str = "1234567890123456";

    fn ready(key: &str, kind: &str, field: &[&str]) -> Encrypted {
        let mut enc = Encrypted::default();
        enc.aes_key = key.to_string();
        enc.kind_fields
            .insert(kind, field.iter().map(|s| s.to_string()).collect());
        std::env::remove_var(ENV_AES_KEY);
        enc.setup().unwrap();
        enc
    }

    #[test]
    fn setup_accepts_all_key_lengths() {
        for key in [
            "1234567890123456",
            "123456789012345678901234",
            "12345678901234567890123456789012",
        ] {
            let mut enc = Encrypted::default();
            enc.aes_key = key.to_string();
            enc.setup().unwrap();
            assert!(enc.is_ready());
        }
    }

    #[test]
    fn setup_rejects_bad_key_length_and_missing_key() {
        let mut enc = Encrypted::default();
        enc.aes_key = "short".to_string();
        assert!(enc.setup().is_err());

        let mut enc = Encrypted::default();
        enc.kind_fields.insert("Secret", vec!["data".to_string()]);
        assert!(enc.setup().is_err());

        // no key and no fields is fine
        let mut enc = Encrypted::default();
        enc.setup().unwrap();
        assert!(!enc.is_ready());
    }

    #[test]
    fn envelope_roundtrip() {
        let enc = ready(KEY16, "Secret", &["data"]);
        let sealed = enc.encrypt_value(&json!("alice"));
        let s = sealed.as_str().unwrap();
        assert!(s.starts_with(ENVELOPE_PREFIX));

        let mut doc = json!({"data": {"username": s}});
        let dec = Decryptor::new(KEY16).unwrap();
        let count = dec.decrypt_all(&mut doc).unwrap();
        assert_eq!(count, 1);
        assert_eq!(doc, json!({"data": {"username": "alice"}}));
    }

    #[test]
    fn encrypt_is_idempotent_on_envelopes_and_empty_strings() {
        let enc = ready(KEY16, "Secret", &["data"]);
        let sealed = enc.encrypt_value(&json!("alice"));
        assert_eq!(enc.encrypt_value(&sealed), sealed);
        assert_eq!(enc.encrypt_value(&json!("")), json!(""));
    }

    #[test]
    fn wrong_key_fails_whole_operation() {
        let enc = ready(KEY16, "Secret", &["data"]);
        let sealed = enc.encrypt_value(&json!("alice"));
        let mut doc = json!({"data": {"username": sealed}});
        let dec = Decryptor::new("6543210987654321").unwrap();
        assert!(dec.decrypt_all(&mut doc).is_err());
    }

    #[test]
    fn corrupted_payload_fails() {
        let dec = Decryptor::new(KEY16).unwrap();
        let mut doc = json!({"f": format!("{ENVELOPE_PREFIX}{}", BASE64.encode(b"xy"))});
        assert!(dec.decrypt_all(&mut doc).is_err());
        let mut doc = json!({"f": format!("{ENVELOPE_PREFIX}!!notbase64!!")});
        assert!(dec.decrypt_all(&mut doc).is_err());
    }

    #[test]
    fn non_enveloped_strings_left_untouched() {
        let dec = Decryptor::new(KEY16).unwrap();
        let mut doc = json!({"a": "plain", "b": [1, "two", {"c": true}]});
        let before = doc.clone();
        assert_eq!(dec.decrypt_all(&mut doc).unwrap(), 0);
        assert_eq!(doc, before);
    }

    #[test]
    fn document_roundtrip_through_transform_engine() {
        let enc = ready(KEY16, "Secret", &["data"]);
        let res = GroupResource::new("", "v1", "Secret", true);
        let mut doc = json!({
            "kind": "Secret",
            "metadata": {"name": "s"},
            "data": {"username": "alice", "password": "s3cret"}
        });
        let original = doc.clone();
        for path in enc.kind_fields.get(&res.group_kind()) {
            transform_nested_field(&mut doc, path, &mut |v| enc.encrypt_value(v));
        }
        assert_ne!(doc, original);

        let dec = Decryptor::new(KEY16).unwrap();
        let count = dec.decrypt_all(&mut doc).unwrap();
        assert_eq!(count, 2);
        assert_eq!(doc, original);
    }

    #[test]
    fn batch_encrypt_then_decrypt_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("secret.yaml");
        let doc = json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": "s", "namespace": "default"},
            "data": {"username": "alice"}
        });
        crate::file::write_resource_file(&file, OutputFormat::Yaml, &doc).unwrap();

        let enc = ready(KEY16, "Secret", &["data"]);
        let reports = encrypt_files(&enc, OutputFormat::Yaml, &[file.clone()]).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].changed, 1);
        assert_eq!(reports[0].kind, "Secret");
        assert_eq!(reports[0].namespace, "default");

        let on_disk = read_resource_file(&file).unwrap();
        let sealed = on_disk["data"]["username"].as_str().unwrap();
        assert!(sealed.starts_with(ENVELOPE_PREFIX));

        let reports = decrypt_files(KEY16, OutputFormat::Yaml, &[file.clone()]).unwrap();
        assert_eq!(reports[0].changed, 1);
        let restored = read_resource_file(&file).unwrap();
        assert_eq!(restored["data"]["username"], json!("alice"));
    }
}
