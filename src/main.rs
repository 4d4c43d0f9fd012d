//! RCH Distributed Build CLI
//!
//! Entry point for the `rch-distbuild` command-line tool.

use clap::{Parser, Subcommand};
use rch_distbuild::config::{ConfigError, ConfigOrigin, HOST_CONFIG_PATH, REPO_CONFIG_PATH};
use rch_distbuild::{DefaultHashCache, EffectiveConfig, SnapshotRecorder, SyncError, SyncSettings};
use rch_protocol::cache::{
    read_fetch_response_with_limit, read_store_request_with_limit, DecodedArtifact,
};
use rch_protocol::{ArtifactInfo, CellRoots, FetchResponse, InputPath, StoreRequest};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rch-distbuild")]
#[command(about = "Distributed build sync: hash snapshots, cache payloads, remote logs", version)]
struct Cli {
    /// Enable debug logging
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// Config overrides as a JSON object (highest precedence layer)
    #[arg(long, global = true)]
    config_json: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record the file hash snapshot of a set of inputs
    Snapshot {
        /// Cell root; repeat for more cells, the first is the root cell (default: .)
        #[arg(long = "cell")]
        cells: Vec<PathBuf>,

        /// Input to flag for preloading on workers; repeatable
        #[arg(long)]
        preload: Vec<String>,

        /// Where to write the snapshot JSON
        #[arg(long, short = 'o')]
        out: PathBuf,

        /// Inputs: file or directory paths, or `archive.tar!/member`
        inputs: Vec<String>,
    },

    /// Artifact cache payload tools
    Cache {
        #[command(subcommand)]
        action: CacheCommands,
    },

    /// Configuration tools
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Encode a payload file into a cache body
    Pack {
        /// Rule key; repeatable
        #[arg(long = "rule-key")]
        rule_keys: Vec<String>,

        /// Metadata entry as KEY=VALUE; repeatable
        #[arg(long = "meta", value_parser = parse_key_val)]
        metadata: Vec<(String, String)>,

        /// Write fetch-response framing instead of store-request framing
        #[arg(long)]
        fetch_format: bool,

        /// Payload file
        payload: PathBuf,

        /// Output body file
        out: PathBuf,
    },

    /// Decode a cache body and report its integrity
    Inspect {
        /// The body uses store-request framing
        #[arg(long)]
        store_format: bool,

        /// Write the decoded payload here
        #[arg(long)]
        payload_out: Option<PathBuf>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,

        /// Body file
        body: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration with provenance
    Show,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Snapshot {
            cells,
            preload,
            out,
            inputs,
        } => run_snapshot(cli.config_json, cells, &preload, &out, &inputs),
        Commands::Cache { action } => match action {
            CacheCommands::Pack {
                rule_keys,
                metadata,
                fetch_format,
                payload,
                out,
            } => run_cache_pack(cli.config_json, rule_keys, metadata, fetch_format, &payload, &out),
            CacheCommands::Inspect {
                store_format,
                payload_out,
                json,
                body,
            } => run_cache_inspect(cli.config_json, store_format, payload_out, json, &body),
        },
        Commands::Config { action } => match action {
            ConfigCommands::Show => run_config_show(cli.config_json),
        },
    };

    if let Err(e) = result {
        eprintln!("Error ({}): {}", e.kind(), e);
        process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(io::stderr)
        .init();
}

fn load_config(config_json: Option<String>) -> Result<EffectiveConfig, SyncError> {
    let overrides = config_json
        .map(|raw| serde_json::from_str::<serde_json::Value>(&raw))
        .transpose()
        .map_err(|e| ConfigError::Parse {
            origin: ConfigOrigin::Cli,
            message: format!("--config-json: {}", e),
        })?;
    let host = std::env::var_os("HOME").map(|home| PathBuf::from(home).join(HOST_CONFIG_PATH));
    let config = EffectiveConfig::build(host.as_deref(), Some(Path::new(REPO_CONFIG_PATH)), overrides)?;
    Ok(config)
}

fn load_settings(config_json: Option<String>) -> Result<SyncSettings, SyncError> {
    Ok(load_config(config_json)?.settings()?)
}

/// `lib/deps.tar!/pkg/A.class` names an archive member; anything else a file.
fn parse_input(raw: &str) -> Result<InputPath, SyncError> {
    let (path, member) = match raw.split_once("!/") {
        Some((archive, member)) => (archive, Some(member)),
        None => (raw, None),
    };
    let path = std::fs::canonicalize(path)?;
    Ok(match member {
        Some(member) => InputPath::archive_member(path, member),
        None => InputPath::file(path),
    })
}

fn run_snapshot(
    config_json: Option<String>,
    cells: Vec<PathBuf>,
    preload: &[String],
    out: &Path,
    inputs: &[String],
) -> Result<(), SyncError> {
    let settings = load_settings(config_json)?;
    let cells = if cells.is_empty() {
        vec![PathBuf::from(".")]
    } else {
        cells
    };
    let roots = cells
        .iter()
        .map(std::fs::canonicalize)
        .collect::<Result<Vec<_>, _>>()?;

    let recorder = SnapshotRecorder::new(
        CellRoots::from_roots(roots),
        Arc::new(DefaultHashCache::new()),
    )
    .with_inline_max_bytes(settings.inline_max_bytes);

    let inputs = inputs
        .iter()
        .map(|raw| parse_input(raw))
        .collect::<Result<Vec<_>, _>>()?;
    recorder.record_all(&inputs, settings.hashing_threads)?;
    for raw in preload {
        recorder.record_for_preload(&parse_input(raw)?)?;
    }

    let snapshot = recorder.finish();
    snapshot.write_to_file(out)?;
    println!(
        "Recorded {} entries across {} cells: {}",
        snapshot.entry_count(),
        snapshot.cells.len(),
        out.display()
    );
    Ok(())
}

fn run_cache_pack(
    config_json: Option<String>,
    rule_keys: Vec<String>,
    metadata: Vec<(String, String)>,
    fetch_format: bool,
    payload: &Path,
    out: &Path,
) -> Result<(), SyncError> {
    let settings = load_settings(config_json)?;
    let mut info = ArtifactInfo::new();
    for key in rule_keys {
        info = info.with_rule_key(key.as_str());
    }
    for (key, value) in metadata {
        info = info.with_metadata(key, value);
    }

    let writer = BufWriter::new(File::create(out)?);
    let (result, content_length) = if fetch_format {
        let response = FetchResponse::with_limit(&info, payload, settings.max_metadata_bytes)?;
        (response.write(writer)?, response.content_length())
    } else {
        let request = StoreRequest::with_limit(&info, payload, settings.max_metadata_bytes)?;
        (request.write(writer)?, request.content_length())
    };

    info!(out = %out.display(), content_length, "packed cache body");
    println!("checksum: {:08x}", result.checksum);
    println!("content_length: {}", content_length);
    println!("artifact_size_bytes: {}", result.artifact_size_bytes);
    println!("artifact_sha256: {}", result.artifact_sha256);
    Ok(())
}

fn run_cache_inspect(
    config_json: Option<String>,
    store_format: bool,
    payload_out: Option<PathBuf>,
    json: bool,
    body: &Path,
) -> Result<(), SyncError> {
    let settings = load_settings(config_json)?;
    let reader = BufReader::new(File::open(body)?);
    let mut sink: Box<dyn Write> = match &payload_out {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(io::sink()),
    };

    let artifact: DecodedArtifact = if store_format {
        read_store_request_with_limit(reader, &mut sink, settings.max_metadata_bytes)?.artifact
    } else {
        read_fetch_response_with_limit(reader, &mut sink, settings.max_metadata_bytes)?
    };
    sink.flush()?;

    if json {
        let output = serde_json::json!({
            "rule_keys": artifact.rule_keys.iter().map(|k| k.as_str()).collect::<Vec<_>>(),
            "metadata": artifact.metadata,
            "expected_checksum": format!("{:08x}", artifact.expected_checksum),
            "actual_checksum": format!("{:08x}", artifact.actual_checksum),
            "artifact_sha256": artifact.artifact_sha256,
            "artifact_size_bytes": artifact.artifact_size_bytes,
            "intact": artifact.is_intact(),
        });
        match serde_json::to_string_pretty(&output) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Error serializing output: {}", e);
                process::exit(1);
            }
        }
    } else {
        let keys: Vec<&str> = artifact.rule_keys.iter().map(|k| k.as_str()).collect();
        println!("Rule keys: {}", keys.join(", "));
        for (key, value) in &artifact.metadata {
            println!("  {} = {}", key, value);
        }
        println!("Payload: {} bytes, sha256 {}", artifact.artifact_size_bytes, artifact.artifact_sha256);
    }

    if !artifact.is_intact() {
        return Err(SyncError::ChecksumMismatch {
            expected: artifact.expected_checksum,
            actual: artifact.actual_checksum,
        });
    }
    Ok(())
}

fn run_config_show(config_json: Option<String>) -> Result<(), SyncError> {
    let config = load_config(config_json)?;
    config.settings()?;
    match config.to_json() {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Error serializing output: {}", e);
            process::exit(1);
        }
    }
    Ok(())
}
