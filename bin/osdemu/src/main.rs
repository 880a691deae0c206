//! OSDEMU - OSD2 target emulator
//!
//! This binary formats, inspects and replays CDBs against a device root.

use anyhow::Result;
use clap::Parser;
use osdemu::{Args, init_logging, load_config, run};
use tracing::{debug, error};

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_logging(&config.logging);
    debug!("Device root: {}", config.root.display());

    if let Err(e) = run(&args.command, config) {
        error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}
