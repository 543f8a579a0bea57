use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};

use kubexporter_cluster::KubeClusterApi;
use kubexporter_config::{decrypt_files, encrypt_files, ExportConfig, FileReport, ENV_AES_KEY};
use kubexporter_export::{render, Exporter};

#[derive(Parser, Debug)]
#[command(name = "kubexporter", version, about = "Export cluster resources to the filesystem")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Export all resources of the cluster
    Export(ExportArgs),
    /// Encrypt the configured fields of exported resource files in place
    Encrypt {
        #[command(flatten)]
        common: CryptoArgs,
    },
    /// Decrypt previously encrypted resource files in place
    Decrypt {
        #[command(flatten)]
        common: CryptoArgs,
    },
    /// Update stale owner reference UIDs in exported files against the live cluster
    UpdateOwnerReferences {
        /// Config file (yaml)
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct ExportArgs {
    /// Config file (yaml)
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
    /// Export only the given namespace
    #[arg(short = 'n', long = "namespace")]
    namespace: Option<String>,
    /// Output directory
    #[arg(short = 't', long = "target")]
    target: Option<PathBuf>,
    /// Number of parallel workers
    #[arg(short = 'w', long = "worker")]
    worker: Option<usize>,
    /// Output format (yaml or json)
    #[arg(short = 'f', long = "format")]
    format: Option<String>,
    /// Write one list file per namespace instead of one file per instance
    #[arg(short = 'l', long = "as-lists", action = ArgAction::SetTrue)]
    as_lists: bool,
    /// Delete the target directory before exporting
    #[arg(long = "clear-target", action = ArgAction::SetTrue)]
    clear_target: bool,
    /// Compress the export as tar.gz archive
    #[arg(short = 'a', long = "archive", action = ArgAction::SetTrue)]
    archive: bool,
    /// Print a per-kind summary table after the export
    #[arg(short = 's', long = "summary", action = ArgAction::SetTrue)]
    summary: bool,
    /// Suppress all output except errors
    #[arg(short = 'q', long = "quiet", action = ArgAction::SetTrue)]
    quiet: bool,
    /// Verbose logging
    #[arg(short = 'v', long = "verbose", action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Args, Debug)]
struct CryptoArgs {
    /// Config file (yaml)
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
    /// The AES key (16/24/32 bytes); falls back to KUBEXPORTER_AES_KEY
    #[arg(long = "aes-key")]
    aes_key: Option<String>,
    /// Files to process
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

fn init_tracing(verbose: bool, quiet: bool) {
    let default = if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        "info"
    };
    let env = std::env::var("KUBEXPORTER_LOG").unwrap_or_else(|_| default.to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<ExportConfig> {
    match path {
        Some(p) => ExportConfig::from_file(p),
        None => Ok(ExportConfig::default()),
    }
}

fn resolve_aes_key(flag: Option<String>) -> Result<String> {
    if let Some(key) = flag {
        return Ok(key);
    }
    if let Ok(key) = std::env::var(ENV_AES_KEY) {
        if !key.is_empty() {
            return Ok(key);
        }
    }
    bail!("no AES key: pass --aes-key or set {ENV_AES_KEY}");
}

fn shutdown_flag() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let handle = flag.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight pages, no new cluster calls");
            handle.store(true, Ordering::Relaxed);
        }
    });
    flag
}

fn print_file_reports(label: &str, reports: &[FileReport]) {
    let rows: Vec<Vec<String>> = reports
        .iter()
        .map(|r| {
            vec![
                r.file.clone(),
                r.namespace.clone(),
                r.kind.clone(),
                r.name.clone(),
                r.changed.to_string(),
            ]
        })
        .collect();
    render::print_table(&["FILE", "NAMESPACE", "KIND", "NAME", label], &rows);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Export(args) => {
            init_tracing(args.verbose, args.quiet);
            let mut config = load_config(args.config.as_ref())?;
            if let Some(ns) = args.namespace {
                config.namespace = ns;
            }
            if let Some(target) = args.target {
                config.target = target;
            }
            if let Some(worker) = args.worker {
                config.worker = worker;
            }
            if let Some(format) = args.format {
                config.output_format = format.parse()?;
            }
            config.as_lists |= args.as_lists;
            config.clear_target |= args.clear_target;
            config.archive |= args.archive;
            config.summary |= args.summary;
            config.quiet |= args.quiet;
            config.verbose |= args.verbose;

            let api = Arc::new(KubeClusterApi::new().await?);
            let exporter = Exporter::new(config, api)?;
            let stats = exporter.export(shutdown_flag()).await?;
            if stats.has_errors() {
                warn!(errors = stats.errors, "export finished with per-kind errors");
            }
        }
        Commands::Encrypt { common } => {
            init_tracing(false, false);
            let mut config = load_config(common.config.as_ref())?;
            if let Some(key) = common.aes_key {
                config.encrypted.aes_key = key;
            }
            config.validate()?;
            if config.encrypted.kind_fields.is_empty() {
                bail!("no encrypted kind fields configured; nothing to encrypt");
            }
            let reports = encrypt_files(&config.encrypted, config.output_format, &common.files)?;
            print_file_reports("ENCRYPTED FIELDS", &reports);
        }
        Commands::Decrypt { common } => {
            init_tracing(false, false);
            let config = load_config(common.config.as_ref())?;
            let key = resolve_aes_key(common.aes_key)?;
            let reports = decrypt_files(&key, config.output_format, &common.files)?;
            print_file_reports("DECRYPTED FIELDS", &reports);
        }
        Commands::UpdateOwnerReferences { config } => {
            init_tracing(false, false);
            let mut config = load_config(config.as_ref())?;
            config.validate()?;
            let api = Arc::new(KubeClusterApi::new().await?);
            let reports = kubexporter_uor::update_owner_references(&config, api).await?;
            let rows: Vec<Vec<String>> = reports
                .iter()
                .map(|r| {
                    vec![
                        r.file.clone(),
                        r.namespace.clone(),
                        r.kind.clone(),
                        r.name.clone(),
                        r.updated.to_string(),
                        r.unresolved.to_string(),
                    ]
                })
                .collect();
            render::print_table(
                &["FILE", "NAMESPACE", "KIND", "NAME", "UPDATED", "UNRESOLVED"],
                &rows,
            );
            info!(files = reports.len(), "owner reference update finished");
        }
    }

    Ok(())
}
