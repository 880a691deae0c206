//! Get and set attribute steps that run around a command
//!
//! The CDB carries them in one of three formats. The field format sets one
//! value held inline in the CDB and retrieves nothing. The page format sets
//! one value from the data-out buffer and retrieves a whole page. The list
//! format sets and retrieves attribute lists, with the retrieved list written
//! at the retrieved-attributes offset of the output.

use super::Command;
use super::fields::{
    Field, GET_LIST_ALLOC, GET_LIST_LEN, GET_LIST_OFFSET, GET_PAGE, GET_PAGE_ALLOC, SET_LEN,
    SET_LIST_LEN, SET_LIST_OFFSET, SET_NUMBER, SET_OFFSET, SET_PAGE, VALUE, VALUE_LEN,
    VALUE_NUMBER, VALUE_PAGE,
};
use crate::command::EntryWriter;
use crate::command::attr::SetEntry;
use crate::device::OsdDevice;
use crate::sense::{CmdResult, Sense};
use osdemu_common::page::{ATTRNUM_GETALL, CUR_CMD_ATTR_PG, GETALLATTR_PG};
use osdemu_common::wire::{self, LIST_HDR_LEN};
use osdemu_common::{GetSetFormat, ListFormat};

/// Largest value the field format carries inline
const MAX_FIELD_VALUE_LEN: usize = 18;

impl<'a> Command<'a> {
    /// `len` bytes of the data-out buffer at the offset held in `offset_field`
    fn input_at(&self, offset_field: Field, len: usize) -> Option<&'a [u8]> {
        let at = usize::try_from(self.cdb.offset(offset_field)?).ok()?;
        self.input.get(at..at.checked_add(len)?)
    }

    /// Entries of the set attributes list; empty when none is given
    pub(super) fn set_list(&self, pid: u64, oid: u64) -> CmdResult<Vec<SetEntry<'a>>> {
        let len = self.cdb.u32(SET_LIST_LEN) as usize;
        if len == 0 {
            return Ok(Vec::new());
        }
        let err = || Sense::param_list_len(pid, oid);
        if len < LIST_HDR_LEN || (len - LIST_HDR_LEN) % 8 != 0 {
            return Err(err());
        }
        let list = self.input_at(SET_LIST_OFFSET, len).ok_or_else(err)?;
        if ListFormat::from_u8(list[0]) != Some(ListFormat::Entries) {
            return Err(err());
        }
        let entries = wire::unpack_entries(&list[LIST_HDR_LEN..]).map_err(|_| err())?;
        Ok(entries.iter().map(|e| (e.page, e.number, e.value)).collect())
    }

    /// Set list of GEN_CAS and COND_SETATTR, whose header length must agree
    /// with the CDB
    pub(super) fn cas_list(&self, pid: u64, oid: u64) -> CmdResult<Vec<SetEntry<'a>>> {
        let len = self.cdb.u32(SET_LIST_LEN) as usize;
        let err = || Sense::param_list_len(pid, oid);
        if len < LIST_HDR_LEN {
            return Err(err());
        }
        let list = self.input_at(SET_LIST_OFFSET, len).ok_or_else(err)?;
        let (kind, body_len) = wire::get_list_header(list).map_err(|_| err())?;
        if kind != ListFormat::Entries as u8
            || body_len as usize + LIST_HDR_LEN != len
            || body_len % 8 != 0
        {
            return Err(err());
        }
        let entries = wire::unpack_entries(&list[LIST_HDR_LEN..]).map_err(|_| err())?;
        Ok(entries.iter().map(|e| (e.page, e.number, e.value)).collect())
    }

    /// (page, number) pairs of the get attributes list; `None` when no list
    /// is given
    pub(super) fn retrieve_list(&self, pid: u64, oid: u64) -> CmdResult<Option<Vec<(u32, u32)>>> {
        let len = self.cdb.u32(GET_LIST_LEN) as usize;
        if len == 0 {
            return Ok(None);
        }
        let err = || Sense::param_list_len(pid, oid);
        let at = self.cdb.offset(GET_LIST_OFFSET).ok_or_else(err)?;
        if len < LIST_HDR_LEN || at % 8 != 0 || self.cdb.u32(GET_LIST_ALLOC) % 8 != 0 {
            return Err(err());
        }
        let list = self.input_at(GET_LIST_OFFSET, len).ok_or_else(err)?;
        if ListFormat::from_u8(list[0]) != Some(ListFormat::Retrieve) {
            return Err(Sense::param_list(pid, oid));
        }
        let pairs = wire::unpack_retrieve_list(&list[LIST_HDR_LEN..]).map_err(|_| err())?;
        Ok(Some(pairs))
    }

    /// Apply the set attributes request of the CDB to every object of `oids`
    pub(super) fn set_attributes(
        &self,
        device: &mut OsdDevice,
        pid: u64,
        oids: &[u64],
        formatting: bool,
    ) -> CmdResult<()> {
        let Some(&first) = oids.first() else {
            return Err(Sense::cdb(pid, 0));
        };
        let cdb = self.cdb;
        match self.format {
            GetSetFormat::Field => {
                let page = cdb.u32(VALUE_PAGE);
                if page == 0 {
                    return Ok(());
                }
                let number = cdb.u32(VALUE_NUMBER);
                let len = usize::from(cdb.u16(VALUE_LEN));
                if len > MAX_FIELD_VALUE_LEN || page == GETALLATTR_PG || number == ATTRNUM_GETALL {
                    return Err(Sense::cdb(pid, first));
                }
                let value = &cdb.bytes(VALUE)[..len];
                device.set_attrs(pid, oids, &[(page, number, value)], formatting)
            }
            GetSetFormat::Page => {
                let page = cdb.u32(SET_PAGE);
                if page == 0 {
                    return Ok(());
                }
                let len = cdb.u32(SET_LEN) as usize;
                let value = self
                    .input_at(SET_OFFSET, len)
                    .ok_or(Sense::bad_cdb(pid, first))?;
                device.set_attrs(pid, oids, &[(page, cdb.u32(SET_NUMBER), value)], formatting)
            }
            GetSetFormat::List => {
                let entries = self.set_list(pid, first)?;
                if entries.is_empty() {
                    return Ok(());
                }
                device.set_attrs(pid, oids, &entries, formatting)
            }
        }
    }

    /// Run the get attributes request of the CDB on every object of `oids`,
    /// writing the result at the retrieved-attributes offset
    pub(super) fn get_attributes(
        &mut self,
        device: &mut OsdDevice,
        pid: u64,
        oids: &[u64],
    ) -> CmdResult<()> {
        let Some(&first) = oids.first() else {
            return Err(Sense::cdb(pid, 0));
        };
        match self.format {
            GetSetFormat::Field => Ok(()),
            GetSetFormat::Page => {
                let page = self.cdb.u32(GET_PAGE);
                if page == 0 || self.cdb.u32(GET_PAGE_ALLOC) == 0 {
                    return Ok(());
                }
                if oids.len() > 1 && page != CUR_CMD_ATTR_PG {
                    return Err(Sense::param_list_len(pid, first));
                }
                let Some(area) = self.retrieved_area() else {
                    return Ok(());
                };
                let used = device.get_attr_page(pid, first, page, area)?;
                self.get_used = used;
                Ok(())
            }
            GetSetFormat::List => {
                let Some(requests) = self.retrieve_list(pid, first)? else {
                    return Ok(());
                };
                let Some(area) = self.retrieved_area() else {
                    return Ok(());
                };
                if area.len() < LIST_HDR_LEN {
                    return Err(Sense::param_list_len(pid, first));
                }
                let format = if oids.len() > 1 {
                    ListFormat::MultiObject
                } else {
                    ListFormat::Entries
                };
                let (hdr, body) = area.split_at_mut(LIST_HDR_LEN);
                let mut writer = EntryWriter::new(body, format);
                device.get_attr_list(pid, oids, &requests, &mut writer)?;
                let used = writer.used();
                wire::put_list_header(hdr, format, list_len(used)?)?;
                self.get_used = LIST_HDR_LEN + used;
                Ok(())
            }
        }
    }

    /// Retrieved list of GEN_CAS and COND_SETATTR: the value held before the
    /// swap comes first, the requested attributes follow
    pub(super) fn get_after_cas(
        &mut self,
        device: &mut OsdDevice,
        pid: u64,
        oid: u64,
        (page, number): (u32, u32),
        prior: &[u8],
    ) -> CmdResult<()> {
        let requests = self.retrieve_list(pid, oid)?.unwrap_or_default();
        let prior_len = wire::entry_len(prior.len());
        let area = self.retrieved_area().ok_or(Sense::cdb(pid, oid))?;
        if area.len() < LIST_HDR_LEN + prior_len {
            return Err(Sense::cdb(pid, oid));
        }

        let (hdr, rest) = area.split_at_mut(LIST_HDR_LEN);
        let (first, body) = rest.split_at_mut(prior_len);
        wire::pack_attr(first, page, number, prior)?;
        let mut writer = EntryWriter::new(body, ListFormat::Entries);
        if !requests.is_empty() {
            device.get_attr_list(pid, &[oid], &requests, &mut writer)?;
        }
        let len = prior_len + writer.used();
        wire::put_list_header(hdr, ListFormat::Entries, list_len(len)?)?;
        self.get_used = LIST_HDR_LEN + len;
        Ok(())
    }

    /// Default attribute step: set, then get
    pub(super) fn set_then_get(
        &mut self,
        device: &mut OsdDevice,
        pid: u64,
        oids: &[u64],
    ) -> CmdResult<()> {
        self.set_attributes(device, pid, oids, false)?;
        self.get_attributes(device, pid, oids)
    }
}

fn list_len(used: usize) -> CmdResult<u32> {
    u32::try_from(used).map_err(|_| Sense::resource())
}
