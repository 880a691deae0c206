//! LIST and LIST_COLLECTION
//!
//! Output starts with a 24-byte header: be64 additional length, be64
//! continuation id, be32 list id and the object descriptor format in the
//! last byte. Ids or object descriptors follow.

use crate::device::OsdDevice;
use crate::sense::{CmdResult, Sense};
use osdemu_catalog::IdPage;
use osdemu_common::wire::{put_be32, put_be64};
use osdemu_common::{COLLECTION_OID_LB, ObjectType, PARTITION_OID};

/// List header length
pub const LIST_HDR_LEN: usize = 24;
/// Descriptor format of id-only lists
pub const FORMAT_IDS: u8 = 0x21 << 2;
/// Descriptor format of lists with attributes
pub const FORMAT_IDS_ATTRS: u8 = 0x22 << 2;

/// What a list enumerates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind<'a> {
    /// Ids only
    Ids,
    /// User objects, each with the requested attributes
    WithAttributes(&'a [(u32, u32)]),
}

impl<'a> ListKind<'a> {
    /// Decode the list-attributes bit and the get list of the command;
    /// `None` when they disagree
    #[must_use]
    pub fn from_request(list_attr: bool, requested: &'a [(u32, u32)]) -> Option<Self> {
        match (list_attr, requested.is_empty()) {
            (false, true) => Some(Self::Ids),
            (true, false) => Some(Self::WithAttributes(requested)),
            _ => None,
        }
    }
}

/// Fill in the header once the body is packed
fn finish(hdr: &mut [u8], format: u8, list_id: u32, page: IdPage) -> CmdResult<usize> {
    put_be64(hdr, 0, page.add_len.saturating_add(16))?;
    put_be64(hdr, 8, page.cont_id)?;
    put_be32(hdr, 16, list_id)?;
    hdr[LIST_HDR_LEN - 1] = format;
    Ok(LIST_HDR_LEN + page.used)
}

impl OsdDevice {
    /// LIST: partitions when `pid` is 0, else the user objects of `pid`
    /// from `initial_oid` on; returns the bytes of `out` used
    pub fn list(
        &mut self,
        pid: u64,
        kind: ListKind<'_>,
        initial_oid: u64,
        list_id: u32,
        out: &mut [u8],
    ) -> CmdResult<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if out.len() < LIST_HDR_LEN {
            return Err(Sense::cdb(pid, initial_oid));
        }
        let (hdr, body) = out.split_at_mut(LIST_HDR_LEN);
        hdr.fill(0);

        let used = match kind {
            ListKind::Ids => {
                let page = self.txn(|txn| {
                    Ok(if pid == 0 {
                        txn.partition_ids(initial_oid, &mut *body)?
                    } else {
                        txn.user_object_ids(pid, initial_oid, &mut *body)?
                    })
                })?;
                finish(hdr, FORMAT_IDS, list_id, page)?
            }
            ListKind::WithAttributes(_) if pid == 0 => 0,
            ListKind::WithAttributes(requested) => {
                let page = self.txn(|txn| {
                    Ok(txn.list_with_attributes(pid, initial_oid, requested, &mut *body)?)
                })?;
                finish(hdr, FORMAT_IDS_ATTRS, list_id, page)?
            }
        };
        self.set_ccap(ObjectType::Partition, pid, PARTITION_OID, 0);
        Ok(used)
    }

    /// LIST_COLLECTION: the collections of `pid` when `cid` is 0, else the
    /// members of `cid`
    pub fn list_collection(
        &mut self,
        pid: u64,
        cid: u64,
        kind: ListKind<'_>,
        initial_oid: u64,
        list_id: u32,
        out: &mut [u8],
    ) -> CmdResult<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if out.len() < LIST_HDR_LEN {
            return Err(Sense::cdb(pid, initial_oid));
        }
        let (hdr, body) = out.split_at_mut(LIST_HDR_LEN);
        hdr.fill(0);

        let used = match kind {
            ListKind::Ids => {
                let page = self.txn(|txn| {
                    Ok(if cid == 0 {
                        txn.collection_ids(pid, initial_oid, &mut *body)?
                    } else {
                        txn.member_ids(pid, cid, initial_oid, &mut *body)?
                    })
                })?;
                finish(hdr, FORMAT_IDS, list_id, page)?
            }
            // member attributes are not listed
            ListKind::WithAttributes(_) if cid != 0 => return Err(Sense::cdb(pid, initial_oid)),
            ListKind::WithAttributes(_) => 0,
        };
        self.set_ccap(ObjectType::Collection, pid, COLLECTION_OID_LB, 0);
        Ok(used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osdemu_common::wire::{be32, be64, unpack_attr};
    use crate::device::tests::open_device;

    const PID: u64 = 0x10000;

    fn ids(out: &[u8], used: usize) -> Vec<u64> {
        out[LIST_HDR_LEN..used]
            .chunks_exact(8)
            .map(|c| u64::from_be_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn test_list_kind_from_request() {
        let requested = [(0x20, 1)];
        assert_eq!(ListKind::from_request(false, &[]), Some(ListKind::Ids));
        assert_eq!(
            ListKind::from_request(true, &requested),
            Some(ListKind::WithAttributes(&requested))
        );
        assert_eq!(ListKind::from_request(true, &[]), None);
        assert_eq!(ListKind::from_request(false, &requested), None);
    }

    #[test]
    fn test_list_paging() {
        let (_dir, mut device) = open_device();
        device.create_partition(PID).unwrap();
        let oids = device.create(PID, 0, 5).unwrap();

        let mut out = [0u8; LIST_HDR_LEN + 16];
        let used = device.list(PID, ListKind::Ids, 0, 0, &mut out).unwrap();
        assert_eq!(used, 40);
        assert_eq!(ids(&out, used), oids[..2]);
        assert_eq!(be64(&out, 0).unwrap(), 16 + 40);
        assert_eq!(be64(&out, 8).unwrap(), oids[2]);
        assert_eq!(out[23], FORMAT_IDS);
        assert_eq!(device.ccap().obj_type, ObjectType::Partition);

        // continue where the first page stopped
        let mut out = [0u8; 256];
        let used = device.list(PID, ListKind::Ids, oids[2], 7, &mut out).unwrap();
        assert_eq!(ids(&out, used), oids[2..]);
        assert_eq!(be64(&out, 8).unwrap(), 0);
        assert_eq!(be32(&out, 16).unwrap(), 7);
    }

    #[test]
    fn test_list_partitions_and_bounds() {
        let (_dir, mut device) = open_device();
        device.create_partition(PID).unwrap();
        device.create_partition(0).unwrap();

        let mut out = [0u8; 64];
        let used = device.list(0, ListKind::Ids, 0, 0, &mut out).unwrap();
        assert_eq!(ids(&out, used), vec![PID, PID + 1]);

        assert_eq!(device.list(PID, ListKind::Ids, 0, 0, &mut []).unwrap(), 0);
        assert_eq!(
            device.list(PID, ListKind::Ids, 0, 0, &mut out[..23]).unwrap_err(),
            Sense::cdb(PID, 0)
        );
        let requested = [(0x20, 1)];
        assert_eq!(
            device
                .list(0, ListKind::WithAttributes(&requested), 0, 0, &mut out)
                .unwrap(),
            0
        );
    }

    #[test]
    fn test_list_with_attributes() {
        let (_dir, mut device) = open_device();
        device.create_partition(PID).unwrap();
        let oid = device.create(PID, 0, 1).unwrap()[0];
        device.set_attrs(PID, &[oid], &[(0x20, 1, b"abc")], false).unwrap();

        let requested = [(0x20, 1)];
        let mut out = [0u8; 128];
        let used = device
            .list(PID, ListKind::WithAttributes(&requested), 0, 0, &mut out)
            .unwrap();
        assert_eq!(out[23], FORMAT_IDS_ATTRS);
        assert_eq!(used, LIST_HDR_LEN + 16 + 16);
        assert_eq!(be64(&out, 24).unwrap(), oid);
        assert_eq!(be32(&out, 24 + 12).unwrap(), 16);
        let (entry, _) = unpack_attr(&out[40..]).unwrap();
        assert_eq!(entry.value, b"abc");
    }

    #[test]
    fn test_list_collection() {
        let (_dir, mut device) = open_device();
        device.create_partition(PID).unwrap();
        let cid = device.create_collection(PID, 0).unwrap();
        let oids = device.create(PID, 0, 2).unwrap();
        for &oid in &oids {
            device
                .set_attrs(PID, &[oid], &[(0x4, 1, &cid.to_be_bytes())], false)
                .unwrap();
        }

        let mut out = [0u8; 64];
        let used = device
            .list_collection(PID, 0, ListKind::Ids, 0, 0, &mut out)
            .unwrap();
        assert_eq!(ids(&out, used), vec![cid]);

        let used = device
            .list_collection(PID, cid, ListKind::Ids, 0, 0, &mut out)
            .unwrap();
        assert_eq!(ids(&out, used), oids);
        assert_eq!(device.ccap().oid, COLLECTION_OID_LB);

        let requested = [(0x20, 1)];
        assert!(device
            .list_collection(PID, cid, ListKind::WithAttributes(&requested), 0, 0, &mut out)
            .is_err());
    }
}
