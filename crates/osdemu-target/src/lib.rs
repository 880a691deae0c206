//! OSDEMU Target - OSD2 command engine
//!
//! This crate turns a 236-byte OSD CDB plus its data-out buffer into a
//! response: output bytes, optional sense data and a SCSI status. It owns
//! the per-device state (data files, catalog, session), the command
//! semantics and the sense builder.

pub mod blob;
pub mod cdb;
pub mod command;
pub mod device;
pub mod pages;
pub mod sense;

// Re-exports
pub use cdb::{Response, submit};
pub use device::{Ccap, DeviceError, IdCache, OsdDevice, RootSummary};
pub use sense::{CmdResult, Sense};
