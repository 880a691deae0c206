//! Attribute retrieval and update shared by every command
//!
//! Retrieval packs list entries into the retrieved-attributes area through an
//! [`EntryWriter`]. An entry is only started when the area still has room for
//! a header and the first value bytes; longer values are truncated while the
//! length field keeps the full length.

use crate::device::{Ccap, OsdDevice, resolve_type};
use crate::pages::Pages;
use crate::sense::{CmdResult, Sense};
use osdemu_catalog::Txn;
use osdemu_common::page::{self, ATTRNUM_GETALL, CUR_CMD_ATTR_PG, GETALLATTR_PG, USER_TMSTMP_PG};
use osdemu_common::wire::{self, LIST_HDR_LEN};
use osdemu_common::{ListFormat, ObjectType};
use std::path::Path;

/// Smallest room in which a list entry is started
const MIN_ENTRY_ROOM: usize = 16;
/// Smallest room in which a multi-object list entry is started
const MIN_MULTIOBJ_ENTRY_ROOM: usize = 24;

/// One attribute to set: (page, number, value); an empty value deletes
pub type SetEntry<'a> = (u32, u32, &'a [u8]);

/// Packs retrieved attributes as list entries into a bounded buffer
pub struct EntryWriter<'b> {
    buf: &'b mut [u8],
    used: usize,
    format: ListFormat,
}

impl<'b> EntryWriter<'b> {
    #[must_use]
    pub fn new(buf: &'b mut [u8], format: ListFormat) -> Self {
        Self {
            buf,
            used: 0,
            format,
        }
    }

    /// Bytes written so far
    #[must_use]
    pub const fn used(&self) -> usize {
        self.used
    }

    /// Pack one entry. Entries that cannot even be started are dropped
    /// without error.
    pub fn push(&mut self, oid: u64, page: u32, number: u32, value: &[u8]) -> CmdResult<()> {
        let room = &mut self.buf[self.used..];
        let written = match self.format {
            ListFormat::MultiObject => {
                if room.len() < MIN_MULTIOBJ_ENTRY_ROOM {
                    return Ok(());
                }
                wire::pack_multiobj_attr(room, oid, page, number, value)?
            }
            _ => {
                if room.len() < MIN_ENTRY_ROOM {
                    return Ok(());
                }
                wire::pack_attr(room, page, number, value)?
            }
        };
        self.used += written;
        Ok(())
    }
}

/// Attribute access to an existing object
fn object_pages<'a>(
    txn: &'a Txn,
    root: &'a Path,
    ccap: &'a Ccap,
    pid: u64,
    oid: u64,
) -> CmdResult<Pages<'a>> {
    let obj_type = resolve_type(txn, pid, oid)?;
    let present = match obj_type {
        ObjectType::Illegal => false,
        ObjectType::Partition => txn.object_exists(pid, oid)?,
        _ => true,
    };
    if !present {
        return Err(Sense::cdb(pid, oid));
    }
    Ok(Pages {
        txn,
        root,
        ccap,
        obj_type,
        pid,
        oid,
    })
}

impl OsdDevice {
    /// Retrieve each (page, number) request on every object of `oids`.
    ///
    /// A specific attribute that is not defined yields an empty entry;
    /// wildcard requests only yield what exists.
    pub fn get_attr_list(
        &mut self,
        pid: u64,
        oids: &[u64],
        requests: &[(u32, u32)],
        writer: &mut EntryWriter<'_>,
    ) -> CmdResult<()> {
        self.txn_with(|txn, root, session| {
            for &(pg, number) in requests {
                for &oid in oids {
                    let pages = object_pages(txn, root, &session.ccap, pid, oid)?;
                    if !page::is_gettable(pages.obj_type, pg) {
                        return Err(Sense::param_list(pid, oid));
                    }
                    let attrs = pages.retrieve(pg, number).map_err(|s| s.or_at(pid, oid))?;
                    if attrs.is_empty() && pg != GETALLATTR_PG && number != ATTRNUM_GETALL {
                        writer.push(oid, pg, number, &[])?;
                    }
                    for a in &attrs {
                        writer.push(oid, a.page, a.number, &a.value)?;
                    }
                }
            }
            Ok(())
        })
    }

    /// Retrieve one page in its page format into `buf`; returns the bytes
    /// used, 0 when the page does not fit.
    ///
    /// Only the current command page, the user object timestamps page and
    /// the all-attributes page have a page format.
    pub fn get_attr_page(&mut self, pid: u64, oid: u64, pg: u32, buf: &mut [u8]) -> CmdResult<usize> {
        self.txn_with(|txn, root, session| {
            let pages = object_pages(txn, root, &session.ccap, pid, oid)?;
            if !page::is_gettable(pages.obj_type, pg) {
                return Err(Sense::param_list(pid, oid));
            }
            let rendered = match pg {
                CUR_CMD_ATTR_PG => session.ccap.to_page().to_vec(),
                USER_TMSTMP_PG => pages.timestamps_page().map_err(|s| s.or_at(pid, oid))?.to_vec(),
                GETALLATTR_PG => return all_as_list(&pages, &mut *buf),
                _ => return Err(Sense::cdb(pid, oid)),
            };
            if buf.len() < rendered.len() {
                return Ok(0);
            }
            buf[..rendered.len()].copy_from_slice(&rendered);
            Ok(rendered.len())
        })
    }

    /// Apply each entry to every object of `oids` in one transaction.
    ///
    /// `formatting` is only set by FORMAT_OSD and unlocks the system id.
    pub fn set_attrs(
        &mut self,
        pid: u64,
        oids: &[u64],
        entries: &[SetEntry<'_>],
        formatting: bool,
    ) -> CmdResult<()> {
        self.txn_with(|txn, root, session| {
            for &(pg, number, value) in entries {
                for &oid in oids {
                    let pages = object_pages(txn, root, &session.ccap, pid, oid)?;
                    pages
                        .set(pg, number, value, formatting)
                        .map_err(|s| s.or_at(pid, oid))?;
                }
            }
            Ok(())
        })
    }
}

/// Every attribute of one object as a complete retrieved list
fn all_as_list(pages: &Pages<'_>, buf: &mut [u8]) -> CmdResult<usize> {
    if buf.len() < LIST_HDR_LEN {
        return Ok(0);
    }
    let (hdr, body) = buf.split_at_mut(LIST_HDR_LEN);
    let mut writer = EntryWriter::new(body, ListFormat::Entries);
    for a in pages.all()? {
        writer.push(pages.oid, a.page, a.number, &a.value)?;
    }
    let used = writer.used();
    let len = u32::try_from(used).map_err(|_| Sense::resource())?;
    wire::put_list_header(hdr, ListFormat::Entries, len)?;
    Ok(LIST_HDR_LEN + used)
}
