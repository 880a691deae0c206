//! Command semantics
//!
//! Every OSD command is an `OsdDevice` method returning `CmdResult`. The
//! methods take decoded arguments and caller-provided output buffers; the
//! CDB dispatcher owns decoding and the get/set attribute steps around them.

pub mod atomics;
pub mod attr;
pub mod copy;
pub mod create;
pub mod data;
pub mod flush;
pub mod list;
pub mod query;
pub mod read_map;
pub mod remove;

pub use attr::EntryWriter;
pub use copy::CopySource;
pub use data::{Extent, Layout, Transfer};
pub use list::ListKind;

use crate::sense::{CmdResult, Sense};

/// Convert a wire length into a buffer length
pub(crate) fn to_usize(value: u64, pid: u64, oid: u64) -> CmdResult<usize> {
    usize::try_from(value).map_err(|_| Sense::cdb(pid, oid))
}
