//! Per-verb decoding
//!
//! Each verb reads its arguments from the field table, runs the command
//! method on the device and then the attribute step that goes with it.

use super::Command;
use super::continuation::{Continuation, Descriptor};
use super::fields::{
    FORMAT_CAPACITY, GET_PAGE, GETSET, INITIAL_OID, LENGTH, LIST_ID, MAP_TYPE, MATCHES_CID,
    NUMOID, OFFSET, OID, OPTIONS, PID, SOURCE_CID,
};
use crate::command::copy::COPY_SOURCE_LEN;
use crate::command::{CopySource, Layout, ListKind};
use crate::device::OsdDevice;
use crate::sense::{CmdResult, Sense};
use osdemu_common::page::CUR_CMD_ATTR_PG;
use osdemu_common::wire::be64;
use osdemu_common::{Ddt, GetSetFormat, PARTITION_OID, ROOT_OID, ROOT_PID, ServiceAction};
use tracing::{debug, error, warn};

/// Atomic operand width
const ATOMIC_LEN: usize = 8;

/// Attribute flags of LIST and LIST_COLLECTION in the get/set byte
const LIST_ATTR: u8 = 0x40;
const LIST_RESERVED: u8 = 0x0F;

/// Force bit of REMOVE_COLLECTION in the get/set byte
const FORCE_REMOVAL: u8 = 0x01;

/// Flush scope in the options byte
const FLUSH_SCOPE: u8 = 0x03;

impl<'a> Command<'a> {
    pub(super) fn execute(&mut self, device: &mut OsdDevice) -> CmdResult<()> {
        let (pid, oid) = (self.cdb.u64(PID), self.cdb.u64(OID));
        let Some(action) = self.action else {
            return Err(Sense::unimplemented(pid, oid));
        };

        use ServiceAction as A;
        match action {
            A::Read => self.read(device, pid, oid),
            A::Write => self.write(device, pid, oid),
            A::Append => self.append(device, pid, oid),
            A::Clear | A::Punch => {
                self.no_continuation(pid, oid)?;
                let (offset, len) = (self.cdb.u64(OFFSET), self.cdb.u64(LENGTH));
                if action == A::Clear {
                    device.clear(pid, oid, offset, len)?;
                } else {
                    device.punch(pid, oid, offset, len)?;
                }
                self.set_then_get(device, pid, &[oid])
            }
            A::CopyUserObjects => self.copy_user_objects(device, pid, oid),
            A::Create => self.create(device, pid, oid),
            A::CreateAndWrite => self.create_and_write(device, pid, oid),
            A::CreateCollection => {
                self.no_continuation(pid, oid)?;
                let cid = device.create_collection(pid, oid)?;
                self.attrs_or_undo(device, pid, &[cid], |d| d.remove_collection(pid, cid, true))
            }
            A::CreateUserTrackingCollection => {
                let source = self.cdb.u64(SOURCE_CID);
                let has_continuation = self.cdb.continuation_len() != 0;
                if has_continuation {
                    self.continuation(pid, oid)?;
                }
                let cid =
                    device.create_user_tracking_collection(pid, oid, source, has_continuation)?;
                self.attrs_or_undo(device, pid, &[cid], |d| d.remove_collection(pid, cid, true))
            }
            A::CreatePartition => {
                self.no_continuation(pid, PARTITION_OID)?;
                let new = device.create_partition(pid)?;
                self.attrs_or_undo(device, new, &[PARTITION_OID], |d| d.remove_partition(new))
            }
            A::Flush => {
                self.no_continuation(pid, oid)?;
                let (offset, len) = (self.cdb.u64(OFFSET), self.cdb.u64(LENGTH));
                device.flush(pid, oid, offset, len, self.flush_scope())?;
                self.set_then_get(device, pid, &[oid])
            }
            A::FlushCollection => {
                self.no_continuation(pid, oid)?;
                device.flush_collection(pid, oid, self.flush_scope())?;
                self.set_then_get(device, pid, &[oid])
            }
            A::FlushPartition => {
                self.no_continuation(pid, PARTITION_OID)?;
                device.flush_partition(pid, self.flush_scope())?;
                self.set_then_get(device, pid, &[PARTITION_OID])
            }
            A::FlushOsd => {
                self.no_continuation(ROOT_PID, ROOT_OID)?;
                device.flush_osd(self.flush_scope())?;
                self.set_then_get(device, ROOT_PID, &[ROOT_OID])
            }
            A::FormatOsd => {
                self.no_continuation(ROOT_PID, ROOT_OID)?;
                debug!("Formatting with a requested capacity of {}", self.cdb.u64(FORMAT_CAPACITY));
                device.format()?;
                self.set_attributes(device, ROOT_PID, &[ROOT_OID], true)?;
                self.get_attributes(device, ROOT_PID, &[ROOT_OID])
            }
            A::GetAttributes => {
                self.no_continuation(pid, oid)?;
                self.get_attributes(device, pid, &[oid])?;
                self.set_attributes(device, pid, &[oid], false)
            }
            A::SetAttributes => {
                self.no_continuation(pid, oid)?;
                self.set_then_get(device, pid, &[oid])
            }
            A::List => self.list(device, pid, None),
            A::ListCollection => self.list(device, pid, Some(oid)),
            A::Query => self.query(device, pid, oid),
            // the map type shares its bytes with the continuation length
            A::ReadMap => {
                self.set_then_get(device, pid, &[oid])?;
                let (offset, kind) = (self.cdb.u64(OFFSET), self.cdb.u16(MAP_TYPE));
                let used = device.read_map(pid, oid, offset, kind, self.data_area())?;
                self.used = used;
                Ok(())
            }
            A::Remove => {
                self.no_continuation(pid, oid)?;
                self.set_then_get(device, pid, &[oid])?;
                device.remove(pid, oid)
            }
            A::RemoveCollection => {
                self.no_continuation(pid, oid)?;
                let force = self.cdb.u8(GETSET) & FORCE_REMOVAL != 0;
                self.set_then_get(device, pid, &[oid])?;
                device.remove_collection(pid, oid, force)
            }
            A::RemovePartition => {
                self.no_continuation(pid, PARTITION_OID)?;
                self.set_then_get(device, pid, &[PARTITION_OID])?;
                device.remove_partition(pid)
            }
            A::SetMemberAttributes => {
                self.no_continuation(pid, oid)?;
                if self.format != GetSetFormat::List {
                    return Err(Sense::cdb(pid, oid));
                }
                let entries = self.set_list(pid, oid).map_err(|_| Sense::cdb(pid, oid))?;
                device.set_member_attributes(pid, oid, &entries)
            }
            A::Cas | A::Fa => self.atomic(device, action, pid, oid),
            A::GenCas | A::CondSetattr => self.gen_cas(device, action, pid, oid),
            other => {
                debug!("{} is not implemented", other);
                Err(Sense::unimplemented(pid, oid))
            }
        }
    }

    fn no_continuation(&self, pid: u64, oid: u64) -> CmdResult<()> {
        if self.cdb.continuation_len() != 0 {
            warn!("Continuation segment given to a command that takes none");
            return Err(Sense::cdb(pid, oid));
        }
        Ok(())
    }

    fn continuation(&self, pid: u64, oid: u64) -> CmdResult<Continuation<'a>> {
        match self.cdb.continuation_len() {
            0 => Ok(Continuation::default()),
            len => Continuation::parse(self.input, len, self.cdb.action(), pid, oid),
        }
    }

    /// Data topology of a data command and the data following the
    /// continuation segment
    fn data_layout<'c>(
        &self,
        cont: &'c Continuation<'a>,
        pid: u64,
        oid: u64,
    ) -> CmdResult<(Layout<'c>, &'a [u8])> {
        let data = self.input.get(cont.len..).unwrap_or_default();
        let layout = match (cont.scatter_gather(pid, oid)?, Ddt::from_options(self.cdb.u8(OPTIONS))) {
            (Some(extents), _) => Layout::ScatterGather(extents),
            (None, Some(Ddt::Contiguous)) => Layout::Contiguous,
            (None, Some(Ddt::Vector)) => Layout::Vector,
            (None, Some(Ddt::ScatterGather) | None) => return Err(Sense::cdb(pid, oid)),
        };
        Ok((layout, data))
    }

    /// WRITE, APPEND and CREATE_AND_WRITE need `len` bytes of data-out
    fn require_input(&self, len: u64, pid: u64, oid: u64) -> CmdResult<()> {
        if (self.input.len() as u64) < len {
            return Err(Sense::bad_cdb(pid, oid));
        }
        Ok(())
    }

    fn flush_scope(&self) -> u8 {
        self.cdb.u8(OPTIONS) & FLUSH_SCOPE
    }

    /// Attribute step after a create; `undo` reverses the create on failure
    fn attrs_or_undo<F>(
        &mut self,
        device: &mut OsdDevice,
        pid: u64,
        oids: &[u64],
        undo: F,
    ) -> CmdResult<()>
    where
        F: FnOnce(&mut OsdDevice) -> CmdResult<()>,
    {
        let Err(sense) = self.set_then_get(device, pid, oids) else {
            return Ok(());
        };
        if let Err(e) = undo(device) {
            error!("Failed to roll back {} object(s) of {:#x}: {}", oids.len(), pid, e);
        }
        Err(sense)
    }

    fn read(&mut self, device: &mut OsdDevice, pid: u64, oid: u64) -> CmdResult<()> {
        let cont = self.continuation(pid, oid)?;
        let (layout, data) = self.data_layout(&cont, pid, oid)?;
        let (offset, len) = (self.cdb.u64(OFFSET), self.cdb.u64(LENGTH));
        let alloc = self.data_alloc;
        let transfer = device.read(pid, oid, offset, len, layout, data, &mut self.out[..alloc])?;
        self.used = transfer.used;
        self.set_then_get(device, pid, &[oid])?;
        match transfer.recovered {
            Some(sense) => Err(sense),
            None => Ok(()),
        }
    }

    fn write(&mut self, device: &mut OsdDevice, pid: u64, oid: u64) -> CmdResult<()> {
        let (offset, len) = (self.cdb.u64(OFFSET), self.cdb.u64(LENGTH));
        self.require_input(len, pid, oid)?;
        let cont = self.continuation(pid, oid)?;
        let (layout, data) = self.data_layout(&cont, pid, oid)?;
        device.write(pid, oid, offset, len, layout, data)?;
        self.set_then_get(device, pid, &[oid])
    }

    fn append(&mut self, device: &mut OsdDevice, pid: u64, oid: u64) -> CmdResult<()> {
        let len = self.cdb.u64(LENGTH);
        self.require_input(len, pid, oid)?;
        self.no_continuation(pid, oid)?;
        let cont = Continuation::default();
        let (layout, data) = self.data_layout(&cont, pid, oid)?;
        device.append(pid, oid, len, layout, data)?;
        self.set_then_get(device, pid, &[oid])
    }

    fn create(&mut self, device: &mut OsdDevice, pid: u64, requested: u64) -> CmdResult<()> {
        self.no_continuation(pid, requested)?;
        let numoid = self.cdb.u16(NUMOID);
        if numoid > 1
            && self.format == GetSetFormat::Page
            && self.cdb.u32(GET_PAGE) != CUR_CMD_ATTR_PG
        {
            return Err(Sense::cdb(pid, requested));
        }
        let oids = device.create(pid, requested, numoid)?;
        self.attrs_or_undo(device, pid, &oids, |d| {
            oids.iter().try_for_each(|&oid| d.remove(pid, oid))
        })
    }

    fn create_and_write(&mut self, device: &mut OsdDevice, pid: u64, requested: u64) -> CmdResult<()> {
        let (offset, len) = (self.cdb.u64(OFFSET), self.cdb.u64(LENGTH));
        self.require_input(len, pid, requested)?;
        let cont = self.continuation(pid, requested)?;
        let (layout, data) = self.data_layout(&cont, pid, requested)?;
        let oid = device.create_and_write(pid, requested, offset, len, layout, data)?;
        self.attrs_or_undo(device, pid, &[oid], |d| d.remove(pid, oid))
    }

    fn copy_user_objects(&mut self, device: &mut OsdDevice, pid: u64, requested: u64) -> CmdResult<()> {
        let cont = self.continuation(pid, requested)?;
        let body = match cont.descriptors.as_slice() {
            [Descriptor::CopySource(b)]
            | [Descriptor::CopySource(b), Descriptor::ExtensionCapabilities]
            | [Descriptor::ExtensionCapabilities, Descriptor::CopySource(b)] => *b,
            _ => return Err(Sense::cdb(pid, requested)),
        };
        if body.len() != COPY_SOURCE_LEN {
            return Err(Sense::cdb(pid, requested));
        }
        let source = CopySource::parse(body).ok_or(Sense::cdb(pid, requested))?;
        if source.freeze {
            debug!("Ignoring freeze of {:#x}:{:#x}", source.pid, source.oid);
        }
        let oid = device.copy_user_object(pid, requested, &source)?;
        self.attrs_or_undo(device, pid, &[oid], |d| d.remove(pid, oid))
    }

    fn list(&mut self, device: &mut OsdDevice, pid: u64, cid: Option<u64>) -> CmdResult<()> {
        let initial = self.cdb.u64(INITIAL_OID);
        let list_id = self.cdb.u32(LIST_ID);
        let getset = self.cdb.u8(GETSET);
        if self.format == GetSetFormat::Page || getset & LIST_RESERVED != 0 {
            return Err(Sense::cdb(pid, initial));
        }
        let requested = match self.format {
            GetSetFormat::List => self
                .retrieve_list(pid, initial)
                .map_err(|_| Sense::cdb(pid, initial))?
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        let kind = ListKind::from_request(getset & LIST_ATTR != 0, &requested)
            .ok_or(Sense::cdb(pid, initial))?;

        let alloc = self.data_alloc;
        let out = &mut self.out[..alloc];
        self.used = match cid {
            None => device.list(pid, kind, initial, list_id, out)?,
            Some(cid) => device.list_collection(pid, cid, kind, initial, list_id, out)?,
        };
        match cid {
            Some(cid) => self.set_then_get(device, pid, &[cid]),
            None => Ok(()),
        }
    }

    fn query(&mut self, device: &mut OsdDevice, pid: u64, cid: u64) -> CmdResult<()> {
        let cont = self.continuation(pid, cid)?;
        let matches = self.cdb.u64(MATCHES_CID);
        let list = match (matches, cont.descriptors.as_slice()) {
            (0, [Descriptor::QueryList(l)]) => *l,
            (
                m,
                [Descriptor::QueryList(l), Descriptor::ExtensionCapabilities]
                | [Descriptor::ExtensionCapabilities, Descriptor::QueryList(l)],
            ) if m != 0 => *l,
            _ => return Err(Sense::cdb(pid, cid)),
        };
        let alloc = self.data_alloc;
        self.used = device.query(pid, cid, list, &mut self.out[..alloc])?;
        self.set_then_get(device, pid, &[cid])
    }

    fn atomic(&mut self, device: &mut OsdDevice, action: ServiceAction, pid: u64, oid: u64) -> CmdResult<()> {
        self.no_continuation(pid, oid)?;
        let operand = |at| be64(self.input, at).map_err(|_| Sense::cdb(pid, oid));
        if self.cdb.u64(LENGTH) < ATOMIC_LEN as u64 {
            return Err(Sense::cdb(pid, oid));
        }
        let first = operand(0)?;
        let at = usize::try_from(self.cdb.u64(OFFSET)).map_err(|_| Sense::cdb(pid, oid))?;
        let alloc = self.data_alloc;
        let n = if action == ServiceAction::Cas {
            let swap = operand(8)?;
            let out = self.out.get_mut(at..alloc).ok_or(Sense::cdb(pid, oid))?;
            device.cas(pid, oid, first, swap, out)?
        } else {
            let out = self.out.get_mut(at..alloc).ok_or(Sense::cdb(pid, oid))?;
            device.fa(pid, oid, first, out)?
        };
        self.used = at + n;
        self.set_then_get(device, pid, &[oid])
    }

    fn gen_cas(&mut self, device: &mut OsdDevice, action: ServiceAction, pid: u64, oid: u64) -> CmdResult<()> {
        self.no_continuation(pid, oid)?;
        if self.format != GetSetFormat::List {
            return Err(Sense::cdb(pid, oid));
        }
        let entries = self.cas_list(pid, oid)?;
        let [(page, number, cmp), (_, _, swap), rest @ ..] = entries.as_slice() else {
            return Err(Sense::cdb(pid, oid));
        };
        let prior = device.gen_cas(pid, oid, *page, *number, cmp, swap)?;
        let prior = prior.unwrap_or_default();
        let matched = prior.as_slice() == *cmp;
        debug!(
            "{} on {:#x}:{:#x} {:#x}/{:#x} {}",
            action,
            pid,
            oid,
            page,
            number,
            if matched { "matched" } else { "did not match" }
        );

        if !rest.is_empty() && (action == ServiceAction::GenCas || matched) {
            device.set_attrs(pid, &[oid], rest, false)?;
        }
        self.get_after_cas(device, pid, oid, (*page, *number), &prior)
    }
}
