//! Object, collection and partition removal

use crate::blob;
use crate::device::OsdDevice;
use crate::sense::{CmdResult, Sense};
use osdemu_common::{
    COLLECTION_OID_LB, COLLECTION_PID_LB, ObjectType, PARTITION_OID, USEROBJECT_OID_LB,
    USEROBJECT_PID_LB,
};
use tracing::{debug, error};

impl OsdDevice {
    /// REMOVE: drop the row, attributes, memberships and data file of a
    /// user object. Removing an absent object succeeds.
    ///
    /// The data file goes first, so a failed unlink leaves the object in
    /// the catalog and the command can be retried.
    pub fn remove(&mut self, pid: u64, oid: u64) -> CmdResult<()> {
        if pid < USEROBJECT_PID_LB || oid < USEROBJECT_OID_LB {
            return Err(Sense::cdb(pid, oid));
        }
        if let Err(e) = blob::remove(self.root(), pid, oid) {
            error!("Failed to unlink data file of {:#x}:{:#x}: {}", pid, oid, e);
            return Err(Sense::hw(pid, oid));
        }
        self.invalidate_id_cache();

        let existed = self.txn(|txn| {
            let attrs = txn.delete_all_attrs(pid, oid)?;
            let memberships = txn.purge_memberships_of(pid, oid)?;
            if txn.object_type(pid, oid)? == Some(ObjectType::Collection) {
                txn.purge_members(pid, oid)?;
            }
            let existed = txn.delete_object(pid, oid)?;
            debug!(
                "Dropped {:#x}:{:#x} with {} attribute(s) and {} membership(s)",
                pid, oid, attrs, memberships
            );
            Ok(existed)
        })?;

        if !existed {
            debug!("Remove of absent object {:#x}:{:#x}", pid, oid);
        }
        self.set_ccap(ObjectType::UserObject, pid, oid, 0);
        Ok(())
    }

    /// REMOVE_COLLECTION: a non-empty collection is only removed with
    /// `force`, which drops its memberships
    pub fn remove_collection(&mut self, pid: u64, cid: u64, force: bool) -> CmdResult<()> {
        if pid < COLLECTION_PID_LB || cid < COLLECTION_OID_LB {
            return Err(Sense::cdb(pid, cid));
        }
        self.invalidate_id_cache();

        self.txn(|txn| {
            if txn.object_type(pid, cid)? != Some(ObjectType::Collection) {
                return Err(Sense::cdb(pid, cid));
            }
            if !txn.is_collection_empty(pid, cid)? {
                if !force {
                    return Err(Sense::not_empty(pid, cid));
                }
                let purged = txn.purge_members(pid, cid)?;
                debug!("Purged {} member(s) of {:#x}:{:#x}", purged, pid, cid);
            }
            txn.delete_all_attrs(pid, cid)?;
            txn.delete_object(pid, cid)?;
            Ok(())
        })?;
        self.set_ccap(ObjectType::Collection, pid, cid, 0);
        Ok(())
    }

    /// REMOVE_PARTITION: only an empty partition can be removed
    pub fn remove_partition(&mut self, pid: u64) -> CmdResult<()> {
        if pid == 0 {
            return Err(Sense::cdb(pid, PARTITION_OID));
        }
        self.txn(|txn| {
            if !txn.is_partition_empty(pid)? {
                return Err(Sense::not_empty(pid, PARTITION_OID));
            }
            txn.delete_all_attrs(pid, PARTITION_OID)?;
            txn.delete_object(pid, PARTITION_OID)?;
            Ok(())
        })?;
        self.invalidate_id_cache();
        self.set_ccap(ObjectType::Partition, pid, PARTITION_OID, 0);
        Ok(())
    }
}
