//! OSDEMU - operator harness for the target engine
//!
//! Formats and inspects a device root and replays single CDBs against it.
//! The harness adds no transport semantics: a replayed CDB goes through the
//! same `submit` entry point a transport binding would call.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use osdemu_common::TargetConfig;
use osdemu_common::config::LoggingConfig;
use osdemu_target::{OsdDevice, Response, submit};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "osdemu")]
#[command(about = "OSD2 object storage target emulator")]
#[command(version)]
pub struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long, env = "OSDEMU_CONFIG")]
    pub config: Option<PathBuf>,

    /// Device root directory
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Log level, used when RUST_LOG is unset
    #[arg(long)]
    pub log_level: Option<String>,

    /// Emit JSON formatted log lines
    #[arg(long)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Recreate the catalog and data directories under the root
    Format,
    /// Print root facts as JSON
    Info,
    /// Run one CDB and print status, sense and output
    Submit {
        /// File holding the CDB as hex text
        #[arg(long)]
        cdb: PathBuf,

        /// File holding the data-out buffer
        #[arg(long)]
        data: Option<PathBuf>,
    },
}

/// Root facts printed by `info`
#[derive(Debug, Serialize)]
pub struct InfoReport {
    pub osd_name: Option<String>,
    /// Hex encoded
    pub system_id: String,
    pub partitions: u64,
    pub generation: u64,
}

/// Outcome of a replayed CDB printed by `submit`
#[derive(Debug, Serialize)]
pub struct SubmitReport {
    pub status: u8,
    /// Hex encoded sense buffer, empty on GOOD status
    pub sense: String,
    /// Hex encoded data-in buffer
    pub output: String,
}

impl From<&Response> for SubmitReport {
    fn from(response: &Response) -> Self {
        Self {
            status: response.status,
            sense: hex::encode(response.sense_bytes()),
            output: hex::encode(&response.output),
        }
    }
}

/// Load the configuration file, if any, and apply command line overrides
pub fn load_config(args: &Args) -> Result<TargetConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            toml::from_str(&text)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        }
        None => TargetConfig::default(),
    };

    // CLI takes precedence
    if let Some(root) = &args.root {
        config.root.clone_from(root);
    }
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
    if args.log_json {
        config.logging.json = true;
    }
    Ok(config)
}

/// Install the global subscriber
pub fn init_logging(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.level.clone().into());
    let json = logging.json;

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

/// Decode a CDB written as hex text; whitespace is ignored
pub fn parse_cdb_hex(text: &str) -> Result<Vec<u8>> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&digits).context("CDB file is not valid hex")
}

pub fn info(device: &mut OsdDevice) -> Result<InfoReport> {
    let summary = device.root_summary()?;
    Ok(InfoReport {
        osd_name: summary.osd_name,
        system_id: hex::encode(&summary.system_id),
        partitions: summary.partitions,
        generation: summary.generation,
    })
}

/// Replay the CDB in `cdb_path` with the data-out buffer in `data_path`
pub fn replay(device: &mut OsdDevice, cdb_path: &Path, data_path: Option<&Path>) -> Result<Response> {
    let text = std::fs::read_to_string(cdb_path)
        .with_context(|| format!("failed to read CDB file {}", cdb_path.display()))?;
    let cdb = parse_cdb_hex(&text)?;
    let input = match data_path {
        Some(path) => std::fs::read(path)
            .with_context(|| format!("failed to read data file {}", path.display()))?,
        None => Vec::new(),
    };
    info!("Submitting {} byte CDB with {} byte(s) of data", cdb.len(), input.len());
    Ok(submit(device, &cdb, &input))
}

/// Execute one subcommand against the configured device
pub fn run(command: &Commands, config: TargetConfig) -> Result<()> {
    let root = config.root.clone();
    let mut device = OsdDevice::open(config)
        .with_context(|| format!("failed to open device root {}", root.display()))?;

    match command {
        Commands::Format => {
            device.format()?;
            info!("Formatted {}", root.display());
        }
        Commands::Info => {
            let report = info(&mut device)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Submit { cdb, data } => {
            let response = replay(&mut device, cdb, data.as_deref())?;
            let report = SubmitReport::from(&response);
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use osdemu_common::{SAM_STAT_GOOD, ServiceAction};

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["osdemu"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    /// Hex text of a CREATE_PARTITION CDB for `pid`
    fn create_partition_hex(pid: u64) -> String {
        let mut cdb = vec![0u8; 236];
        cdb[0] = 0x7F;
        cdb[7] = 228;
        cdb[8..10].copy_from_slice(&ServiceAction::CreatePartition.code().to_be_bytes());
        cdb[11] = 0x30;
        cdb[16..24].copy_from_slice(&pid.to_be_bytes());
        cdb[64..68].copy_from_slice(&u32::MAX.to_be_bytes());
        hex::encode(cdb)
    }

    #[test]
    fn test_args_parse() {
        let parsed = args(&["--root", "/tmp/osd", "submit", "--cdb", "cdb.hex"]);
        assert_eq!(parsed.root, Some(PathBuf::from("/tmp/osd")));
        match parsed.command {
            Commands::Submit { cdb, data } => {
                assert_eq!(cdb, PathBuf::from("cdb.hex"));
                assert!(data.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_load_config_with_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("osdemu.toml");
        std::fs::write(
            &path,
            "root = \"/srv/osd\"\nosd_name = \"osd-1\"\n\n[logging]\nlevel = \"debug\"\n",
        )
        .unwrap();
        let path = path.to_str().unwrap();

        let config = load_config(&args(&["--config", path, "info"])).unwrap();
        assert_eq!(config.root, PathBuf::from("/srv/osd"));
        assert_eq!(config.osd_name.as_deref(), Some("osd-1"));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.read_map_chunk, 4);

        let config = load_config(&args(&[
            "--config",
            path,
            "--root",
            "/tmp/other",
            "--log-level",
            "warn",
            "--log-json",
            "info",
        ]))
        .unwrap();
        assert_eq!(config.root, PathBuf::from("/tmp/other"));
        assert_eq!(config.logging.level, "warn");
        assert!(config.logging.json);

        std::fs::write(dir.path().join("bad.toml"), "root = [").unwrap();
        let bad = dir.path().join("bad.toml");
        assert!(load_config(&args(&["--config", bad.to_str().unwrap(), "info"])).is_err());
    }

    #[test]
    fn test_parse_cdb_hex() {
        assert_eq!(parse_cdb_hex("7f 00\n0a\tff").unwrap(), vec![0x7F, 0, 0x0A, 0xFF]);
        assert!(parse_cdb_hex("7g").is_err());
        assert!(parse_cdb_hex("abc").is_err());
    }

    #[test]
    fn test_replay_and_info() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = TargetConfig::with_root(dir.path().join("osd"));
        config.osd_name = Some("bench".to_string());
        let mut device = OsdDevice::open(config).unwrap();

        let cdb_path = dir.path().join("create.hex");
        std::fs::write(&cdb_path, create_partition_hex(0x10000)).unwrap();
        let response = replay(&mut device, &cdb_path, None).unwrap();
        assert_eq!(response.status, SAM_STAT_GOOD);
        let report = SubmitReport::from(&response);
        assert!(report.sense.is_empty());
        assert!(report.output.is_empty());

        // the same partition again is a CDB error
        let response = replay(&mut device, &cdb_path, None).unwrap();
        assert_ne!(response.status, SAM_STAT_GOOD);
        assert!(!SubmitReport::from(&response).sense.is_empty());

        let report = info(&mut device).unwrap();
        assert_eq!(report.osd_name.as_deref(), Some("bench"));
        assert_eq!(report.partitions, 1);
        assert_eq!(report.system_id.len(), 40);

        device.format().unwrap();
        assert_eq!(info(&mut device).unwrap().partitions, 0);
    }

    #[test]
    fn test_replay_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = OsdDevice::open(TargetConfig::with_root(dir.path().join("osd"))).unwrap();
        assert!(replay(&mut device, &dir.path().join("missing.hex"), None).is_err());
    }
}
