//! Archive creation and local retention pruning.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use regex::Regex;
use tracing::info;

use kubexporter_config::ExportConfig;

const ARCHIVE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H%M%S";

/// Archives land in the export target unless an explicit archive target is
/// configured.
pub fn archive_dir(config: &ExportConfig) -> PathBuf {
    config
        .archive_target
        .clone()
        .unwrap_or_else(|| config.target.clone())
}

fn target_base(config: &ExportConfig) -> String {
    config
        .target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "export".to_string())
}

/// Matches `<targetBase>(-<namespace>)?-YYYY-MM-DD-HHMMSS.tar.gz`.
pub fn archive_name_pattern(config: &ExportConfig) -> Result<Regex> {
    Regex::new(&format!(
        r"^{}-?.*-\d{{4}}-\d{{2}}-\d{{2}}-\d{{6}}\.tar\.gz$",
        regex::escape(&target_base(config))
    ))
    .context("building archive name pattern")
}

/// Tar-gzip every output file under the target directory; returns the
/// archive path.
pub fn create_archive(config: &ExportConfig) -> Result<PathBuf> {
    let dir = archive_dir(config);
    fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

    let stamp = chrono::Local::now().format(ARCHIVE_TIMESTAMP_FORMAT);
    let name = if config.namespace.is_empty() {
        format!("{}-{stamp}.tar.gz", target_base(config))
    } else {
        format!("{}-{}-{stamp}.tar.gz", target_base(config), config.namespace)
    };
    let archive_path = dir.join(name);

    let file = File::create(&archive_path)
        .with_context(|| format!("creating {}", archive_path.display()))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let extension = config.output_format.extension();
    let mut files = Vec::new();
    collect_output_files(&config.target, extension, &mut files)?;
    for path in &files {
        builder
            .append_path_with_name(path, entry_path(&config.target, path))
            .with_context(|| format!("archiving {}", path.display()))?;
    }

    let encoder = builder.into_inner().context("finalizing archive")?;
    encoder.finish().context("finalizing gzip stream")?;
    info!(archive = %archive_path.display(), files = files.len(), "archive created");
    Ok(archive_path)
}

fn collect_output_files(dir: &Path, extension: &str, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_output_files(&path, extension, out)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some(extension) {
            out.push(path);
        }
    }
    out.sort();
    Ok(())
}

/// Archive entry names stay relative to the working directory when the
/// target sits below it, otherwise to the target's parent.
fn entry_path(target: &Path, file: &Path) -> PathBuf {
    if let Ok(cwd) = std::env::current_dir() {
        if let Ok(rel) = file.strip_prefix(&cwd) {
            return rel.to_path_buf();
        }
    }
    match target.parent() {
        Some(parent) => file
            .strip_prefix(parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| file.to_path_buf()),
        None => file.to_path_buf(),
    }
}

/// Delete local archives older than the retention window; returns the
/// deleted paths.
pub fn prune_archives(config: &ExportConfig) -> Result<Vec<PathBuf>> {
    let dir = archive_dir(config);
    let pattern = archive_name_pattern(config)?;
    let cutoff = SystemTime::now()
        - Duration::from_secs(u64::from(config.archive_retention_days) * 24 * 60 * 60);

    let mut deleted = Vec::new();
    for entry in fs::read_dir(&dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !pattern.is_match(&name) {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        if modified < cutoff {
            fs::remove_file(entry.path())
                .with_context(|| format!("deleting {}", entry.path().display()))?;
            info!(archive = %name, "pruned expired archive");
            deleted.push(entry.path());
        }
    }
    Ok(deleted)
}
