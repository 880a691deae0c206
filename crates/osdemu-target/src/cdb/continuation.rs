//! CDB continuation segment
//!
//! A continuation sits at the start of the data-out buffer. It carries a
//! 40-byte header followed by typed descriptors, each an 8-byte descriptor
//! header and a body padded to a multiple of 8 bytes.

use crate::command::Extent;
use crate::sense::{CmdResult, Sense};
use osdemu_common::wire::{be16, be32, be64};
use tracing::warn;

/// Continuation header length
const SEGMENT_HDR_LEN: usize = 40;
/// Descriptor header length
const DESC_HDR_LEN: usize = 8;
/// Smallest valid segment
const MIN_SEGMENT_LEN: usize = 48;
/// The only defined continuation format
const FORMAT: u8 = 1;

mod kind {
    pub const END: u16 = 0x0000;
    pub const SCATTER_GATHER: u16 = 0x0001;
    pub const QUERY_LIST: u16 = 0x0002;
    pub const USER_OBJECT: u16 = 0x0100;
    pub const COPY_SOURCE: u16 = 0x0101;
    pub const EXTENSION_CAPABILITIES: u16 = 0xFFEE;
}

/// One decoded continuation descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Descriptor<'a> {
    ScatterGather(Vec<Extent>),
    QueryList(&'a [u8]),
    CopySource(&'a [u8]),
    ExtensionCapabilities,
}

/// Decoded continuation segment
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Continuation<'a> {
    /// Segment length; data for the command follows it in the input
    pub len: usize,
    pub descriptors: Vec<Descriptor<'a>>,
}

impl<'a> Continuation<'a> {
    /// Parse the `len`-byte segment at the start of `input` for a command
    /// with service action `action`. Failures are reported against
    /// (`pid`, `oid`).
    pub fn parse(input: &'a [u8], len: u32, action: u16, pid: u64, oid: u64) -> CmdResult<Self> {
        let fail = |what: &str| {
            warn!("Rejected continuation segment of {:#06x}: {}", action, what);
            Sense::cdb(pid, oid)
        };

        let len = usize::try_from(len).map_err(|_| fail("length"))?;
        if len % 8 != 0 || len < MIN_SEGMENT_LEN {
            return Err(fail("length"));
        }
        let segment = input.get(..len).ok_or_else(|| fail("short input"))?;
        if segment[0] != FORMAT {
            return Err(fail("format"));
        }
        if be16(segment, 2).map_err(|_| fail("header"))? != action {
            return Err(fail("service action"));
        }

        let mut descriptors = Vec::new();
        let mut at = SEGMENT_HDR_LEN;
        while at < len {
            let hdr = segment
                .get(at..at + DESC_HDR_LEN)
                .ok_or_else(|| fail("descriptor header"))?;
            let ty = be16(hdr, 0).map_err(|_| fail("descriptor header"))?;
            let pad = usize::from(hdr[3] & 0x7);
            let body_len = be32(hdr, 4).map_err(|_| fail("descriptor header"))? as usize;
            let padded = body_len.checked_add(pad).ok_or_else(|| fail("descriptor length"))?;
            if padded % 8 != 0 {
                return Err(fail("descriptor padding"));
            }
            let start = at + DESC_HDR_LEN;
            let body = start
                .checked_add(body_len)
                .and_then(|end| segment.get(start..end))
                .filter(|_| start + padded <= len)
                .ok_or_else(|| fail("descriptor overruns the segment"))?;

            match ty {
                kind::END => {}
                kind::SCATTER_GATHER if pad == 0 => {
                    let extents = body
                        .chunks_exact(16)
                        .map(|pair| -> osdemu_common::Result<Extent> {
                            Ok(Extent {
                                offset: be64(pair, 0)?,
                                length: be64(pair, 8)?,
                            })
                        })
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(|_| fail("scatter-gather list"))?;
                    descriptors.push(Descriptor::ScatterGather(extents));
                }
                kind::QUERY_LIST if pad == 0 => descriptors.push(Descriptor::QueryList(body)),
                kind::COPY_SOURCE => descriptors.push(Descriptor::CopySource(body)),
                kind::EXTENSION_CAPABILITIES => descriptors.push(Descriptor::ExtensionCapabilities),
                kind::SCATTER_GATHER | kind::QUERY_LIST => return Err(fail("non-zero pad")),
                kind::USER_OBJECT => return Err(fail("user object descriptor")),
                other => {
                    warn!("Unknown continuation descriptor type {:#06x}", other);
                    return Err(Sense::cdb(pid, oid));
                }
            }
            at = start + padded;
        }

        Ok(Self { len, descriptors })
    }

    /// The single optional scatter-gather list of a data command. Any other
    /// descriptor, or more than one, is rejected.
    pub fn scatter_gather(&self, pid: u64, oid: u64) -> CmdResult<Option<&[Extent]>> {
        match self.descriptors.as_slice() {
            [] => Ok(None),
            [Descriptor::ScatterGather(extents)] => Ok(Some(extents)),
            _ => Err(Sense::cdb(pid, oid)),
        }
    }
}
