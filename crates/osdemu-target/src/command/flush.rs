//! FLUSH family
//!
//! Attribute changes are durable once the catalog transaction of the command
//! that made them commits, so only user object data needs explicit syncing.

use crate::blob::DataFile;
use crate::device::OsdDevice;
use crate::sense::{CmdResult, Sense};
use osdemu_common::{
    ObjectType, PARTITION_OID, ROOT_OID, ROOT_PID, USEROBJECT_OID_LB, USEROBJECT_PID_LB,
};

/// Flush data and attributes
pub const SCOPE_ALL: u8 = 0;
/// Flush attributes only
pub const SCOPE_ATTRIBUTES: u8 = 1;
/// Flush a data range and attributes
pub const SCOPE_RANGE: u8 = 2;

impl OsdDevice {
    /// FLUSH of one user object
    pub fn flush(&mut self, pid: u64, oid: u64, offset: u64, len: u64, scope: u8) -> CmdResult<()> {
        if pid < USEROBJECT_PID_LB || oid < USEROBJECT_OID_LB {
            return Err(Sense::cdb(pid, oid));
        }
        let file = DataFile::open(self.root(), pid, oid).map_err(|_| Sense::cdb(pid, oid))?;
        let hw = |_| Sense::hw(pid, oid);

        match scope {
            SCOPE_ALL => file.sync_data().map_err(hw)?,
            SCOPE_RANGE => {
                let size = file.len().map_err(hw)?;
                if offset > size {
                    return Err(Sense::cdb(pid, oid));
                }
                // the clipped range is empty when nothing lies past `offset`
                if len.min(size - offset) > 0 {
                    file.sync_data().map_err(hw)?;
                }
            }
            SCOPE_ATTRIBUTES => {}
            _ => return Err(Sense::cdb(pid, oid)),
        }
        self.set_ccap(ObjectType::UserObject, pid, oid, 0);
        Ok(())
    }

    /// FLUSH_COLLECTION
    pub fn flush_collection(&mut self, pid: u64, cid: u64, scope: u8) -> CmdResult<()> {
        self.flush_catalog_object(ObjectType::Collection, pid, cid, scope)
    }

    /// FLUSH_PARTITION
    pub fn flush_partition(&mut self, pid: u64, scope: u8) -> CmdResult<()> {
        self.flush_catalog_object(ObjectType::Partition, pid, PARTITION_OID, scope)
    }

    /// FLUSH_OSD
    pub fn flush_osd(&mut self, scope: u8) -> CmdResult<()> {
        self.flush_catalog_object(ObjectType::Root, ROOT_PID, ROOT_OID, scope)
    }

    fn flush_catalog_object(
        &mut self,
        obj_type: ObjectType,
        pid: u64,
        oid: u64,
        scope: u8,
    ) -> CmdResult<()> {
        if scope > SCOPE_RANGE {
            return Err(Sense::cdb(pid, oid));
        }
        let found = self.txn(|txn| Ok(txn.object_type(pid, oid)?))?;
        if found != Some(obj_type) {
            return Err(Sense::cdb(pid, oid));
        }
        self.set_ccap(obj_type, pid, oid, 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Layout;
    use crate::device::tests::open_device;

    const PID: u64 = 0x10000;

    #[test]
    fn test_flush_user_object() {
        let (_dir, mut device) = open_device();
        device.create_partition(PID).unwrap();
        let oid = device.create(PID, 0, 1).unwrap()[0];
        device.write(PID, oid, 0, 4, Layout::Contiguous, b"abcd").unwrap();

        device.flush(PID, oid, 0, 0, SCOPE_ALL).unwrap();
        device.flush(PID, oid, 0, 0, SCOPE_ATTRIBUTES).unwrap();
        device.flush(PID, oid, 2, 100, SCOPE_RANGE).unwrap();
        device.flush(PID, oid, 4, 1, SCOPE_RANGE).unwrap();
        assert_eq!(device.flush(PID, oid, 5, 1, SCOPE_RANGE).unwrap_err(), Sense::cdb(PID, oid));
        assert!(device.flush(PID, oid, 0, 0, 3).is_err());
        assert!(device.flush(PID, oid + 1, 0, 0, SCOPE_ALL).is_err());
    }

    #[test]
    fn test_flush_catalog_objects() {
        let (_dir, mut device) = open_device();
        device.flush_osd(SCOPE_ALL).unwrap();
        assert_eq!(device.ccap().obj_type, ObjectType::Root);
        assert!(device.flush_partition(PID, SCOPE_ALL).is_err());

        device.create_partition(PID).unwrap();
        device.flush_partition(PID, SCOPE_ALL).unwrap();
        let cid = device.create_collection(PID, 0).unwrap();
        device.flush_collection(PID, cid, SCOPE_ATTRIBUTES).unwrap();
        assert!(device.flush_collection(PID, cid + 1, SCOPE_ALL).is_err());
    }
}
