//! Object, collection and partition creation

use crate::blob::DataFile;
use crate::command::Layout;
use crate::device::{IdCache, OsdDevice, Session, discard_data};
use crate::sense::{CmdResult, Sense};
use osdemu_catalog::Txn;
use osdemu_common::page::{self, USER_ATOMICS_PG, USER_TMSTMP_PG, atomics, id_value};
use osdemu_common::{
    COLLECTION_OID_LB, COLLECTION_PID_LB, ObjectType, PARTITION_OID, PARTITION_PID_LB,
    USER_TRACKING_COLLECTION_OID_LB, USEROBJECT_OID_LB, USEROBJECT_PID_LB,
};
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// What to allocate in one creation batch
pub(crate) struct Allocation {
    pub obj_type: ObjectType,
    pub pid: u64,
    /// Requested first id, 0 to allocate
    pub requested: u64,
    pub count: u64,
    /// Smallest id of the id space
    pub lower: u64,
}

/// Data files created by a batch; removed on drop unless the batch is kept
pub(crate) struct CreatedFiles {
    root: PathBuf,
    pid: u64,
    oids: Vec<u64>,
    keep: bool,
}

impl CreatedFiles {
    pub(crate) fn new(root: &Path, pid: u64) -> Self {
        Self {
            root: root.to_path_buf(),
            pid,
            oids: Vec::new(),
            keep: false,
        }
    }

    pub(crate) fn push(&mut self, oid: u64) {
        self.oids.push(oid);
    }

    pub(crate) fn keep(mut self) {
        self.keep = true;
    }
}

impl Drop for CreatedFiles {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        for &oid in &self.oids {
            discard_data(&self.root, self.pid, oid);
        }
    }
}

/// Next free id of a partition: the cached id, else one past the largest
/// id in use, raised to the lower bound of the id space
fn next_id(txn: &Txn, session: &Session, pid: u64, lower: u64) -> CmdResult<u64> {
    if let Some(cache) = session.id_cache.filter(|c| c.pid == pid) {
        return Ok(cache.next_id);
    }
    let next = match txn.max_oid(pid)? {
        Some(max) => max.checked_add(1).ok_or_else(Sense::resource)?,
        None => 1,
    };
    Ok(next.max(lower))
}

/// Insert the rows, data files and default pages of one batch inside an
/// open transaction; returns the allocated ids in ascending order
pub(crate) fn allocate(
    txn: &Txn,
    root: &Path,
    session: &mut Session,
    alloc: &Allocation,
    files: &mut CreatedFiles,
) -> CmdResult<Vec<u64>> {
    let pid = alloc.pid;
    if txn.object_type(pid, PARTITION_OID)? != Some(ObjectType::Partition) {
        return Err(Sense::cdb(pid, alloc.requested));
    }
    let first = if alloc.requested == 0 {
        next_id(txn, session, pid, alloc.lower)?
    } else {
        alloc.requested
    };

    let mut oids = Vec::new();
    for i in 0..alloc.count {
        let oid = first.checked_add(i).ok_or_else(Sense::resource)?;
        if txn.object_exists(pid, oid)? {
            return Err(Sense::cdb(pid, oid));
        }
        txn.insert_object(pid, oid, alloc.obj_type)?;
        if alloc.obj_type == ObjectType::UserObject {
            DataFile::create(root, pid, oid).map_err(|e| {
                error!("Failed to create data file of {:#x}:{:#x}: {}", pid, oid, e);
                Sense::cdb(pid, oid)
            })?;
            files.push(oid);
            write_user_defaults(txn, pid, oid)?;
        }
        oids.push(oid);
    }

    let last = oids.last().copied().unwrap_or(first);
    session.id_cache = if alloc.requested == 0 {
        last.checked_add(1).map(|next_id| IdCache { pid, next_id })
    } else {
        None
    };
    Ok(oids)
}

/// Identification of the stored user object pages and zeroed atomics
fn write_user_defaults(txn: &Txn, pid: u64, oid: u64) -> CmdResult<()> {
    txn.set_attr(pid, oid, USER_TMSTMP_PG, 0, &id_value(page::USER_TMSTMP_ID))?;
    txn.set_attr(pid, oid, USER_ATOMICS_PG, 0, &id_value(page::USER_ATOMICS_ID))?;
    txn.set_attr(pid, oid, USER_ATOMICS_PG, atomics::CAS, &0u64.to_be_bytes())?;
    txn.set_attr(pid, oid, USER_ATOMICS_PG, atomics::FA, &0u64.to_be_bytes())?;
    Ok(())
}

impl OsdDevice {
    /// Run one allocation batch, rolling back its data files on failure
    pub(crate) fn run_allocation(&mut self, alloc: &Allocation) -> CmdResult<Vec<u64>> {
        let mut files = CreatedFiles::new(self.root(), alloc.pid);
        let result = self.txn_with(|txn, root, session| allocate(txn, root, session, alloc, &mut files));
        match result {
            Ok(oids) => {
                files.keep();
                Ok(oids)
            }
            Err(sense) => {
                self.invalidate_id_cache();
                Err(sense)
            }
        }
    }

    /// CREATE: `numoid` user objects (0 means 1), at `requested` or at the
    /// next free ids
    pub fn create(&mut self, pid: u64, requested: u64, numoid: u16) -> CmdResult<Vec<u64>> {
        let count = u64::from(numoid.max(1));
        if pid < USEROBJECT_PID_LB
            || (requested != 0 && requested < USEROBJECT_OID_LB)
            || (requested != 0 && count > 1)
        {
            return Err(Sense::cdb(pid, requested));
        }

        let oids = self.run_allocation(&Allocation {
            obj_type: ObjectType::UserObject,
            pid,
            requested,
            count,
            lower: USEROBJECT_OID_LB,
        })?;
        let last = oids.last().copied().unwrap_or(requested);
        debug!("Created {} user object(s) in {:#x} up to {:#x}", oids.len(), pid, last);
        self.set_ccap(ObjectType::UserObject, pid, last, 0);
        Ok(oids)
    }

    /// CREATE_AND_WRITE: one user object, then a write into it. The object
    /// is removed again when the write fails.
    pub fn create_and_write(
        &mut self,
        pid: u64,
        requested: u64,
        offset: u64,
        len: u64,
        layout: Layout<'_>,
        input: &[u8],
    ) -> CmdResult<u64> {
        let oid = self
            .create(pid, requested, 1)?
            .first()
            .copied()
            .ok_or_else(Sense::resource)?;
        if let Err(sense) = self.write(pid, oid, offset, len, layout, input) {
            if let Err(e) = self.remove(pid, oid) {
                error!("Failed to remove {:#x}:{:#x} after a failed write: {}", pid, oid, e);
            }
            return Err(sense);
        }
        Ok(oid)
    }

    /// CREATE_COLLECTION
    pub fn create_collection(&mut self, pid: u64, requested: u64) -> CmdResult<u64> {
        if pid < COLLECTION_PID_LB || (requested != 0 && requested < COLLECTION_OID_LB) {
            return Err(Sense::cdb(pid, requested));
        }
        let cid = self.allocate_collection(pid, requested, COLLECTION_OID_LB)?;
        self.set_ccap(ObjectType::Collection, pid, cid, 0);
        Ok(cid)
    }

    fn allocate_collection(&mut self, pid: u64, requested: u64, lower: u64) -> CmdResult<u64> {
        self.run_allocation(&Allocation {
            obj_type: ObjectType::Collection,
            pid,
            requested,
            count: 1,
            lower,
        })?
        .first()
        .copied()
        .ok_or_else(Sense::resource)
    }

    /// CREATE_USER_TRACKING_COLLECTION: a new collection, seeded with the
    /// members of `source_cid` when non-zero
    pub fn create_user_tracking_collection(
        &mut self,
        pid: u64,
        requested: u64,
        source_cid: u64,
        has_continuation: bool,
    ) -> CmdResult<u64> {
        if pid < COLLECTION_PID_LB
            || (requested != 0 && requested < USER_TRACKING_COLLECTION_OID_LB)
            || (source_cid == 0) == has_continuation
        {
            return Err(Sense::cdb(pid, requested));
        }
        if source_cid != 0 && self.object_type(pid, source_cid)? != ObjectType::Collection {
            return Err(Sense::cdb(pid, source_cid));
        }

        let alloc = Allocation {
            obj_type: ObjectType::Collection,
            pid,
            requested,
            count: 1,
            lower: USER_TRACKING_COLLECTION_OID_LB,
        };
        let mut files = CreatedFiles::new(self.root(), pid);
        let result = self.txn_with(|txn, root, session| {
            let cid = allocate(txn, root, session, &alloc, &mut files)?
                .first()
                .copied()
                .ok_or_else(Sense::resource)?;
            if source_cid != 0 {
                let copied = txn.copy_members(pid, source_cid, cid)?;
                debug!("Seeded collection {:#x} with {} member(s) of {:#x}", cid, copied, source_cid);
            }
            Ok(cid)
        });
        let cid = result.inspect_err(|_| self.invalidate_id_cache())?;
        files.keep();
        self.set_ccap(ObjectType::Collection, pid, cid, 0);
        Ok(cid)
    }

    /// CREATE_PARTITION: `requested`, or one past the largest partition id
    pub fn create_partition(&mut self, requested: u64) -> CmdResult<u64> {
        if requested != 0 && requested < PARTITION_PID_LB {
            return Err(Sense::cdb(requested, PARTITION_OID));
        }
        let pid = self.txn(|txn| {
            let pid = if requested == 0 {
                let next = match txn.max_pid()? {
                    Some(max) => max.checked_add(1).ok_or_else(Sense::resource)?,
                    None => 1,
                };
                next.max(PARTITION_PID_LB)
            } else {
                if txn.object_exists(requested, PARTITION_OID)? {
                    return Err(Sense::cdb(requested, PARTITION_OID));
                }
                requested
            };
            txn.insert_object(pid, PARTITION_OID, ObjectType::Partition)?;
            Ok(pid)
        })?;
        debug!("Created partition {:#x}", pid);
        self.set_ccap(ObjectType::Partition, pid, PARTITION_OID, 0);
        Ok(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob;
    use crate::device::tests::open_device;

    const PID: u64 = 0x10000;

    fn has_data(device: &OsdDevice, pid: u64, oid: u64) -> bool {
        blob::exists(device.root(), pid, oid)
    }

    #[test]
    fn test_create_partition_ids() {
        let (_dir, mut device) = open_device();
        assert_eq!(device.create_partition(0).unwrap(), PID);
        assert_eq!(device.create_partition(0).unwrap(), PID + 1);
        assert_eq!(device.create_partition(0x20000).unwrap(), 0x20000);
        assert_eq!(device.create_partition(0).unwrap(), 0x20001);

        assert_eq!(device.create_partition(0x20000).unwrap_err(), Sense::cdb(0x20000, 0));
        assert!(device.create_partition(5).is_err());
        assert_eq!(device.ccap().obj_type, ObjectType::Partition);
        assert_eq!(device.ccap().pid, 0x20001);
    }

    #[test]
    fn test_create_uses_id_cache() {
        let (_dir, mut device) = open_device();
        device.create_partition(PID).unwrap();

        assert_eq!(device.create(PID, 0, 0).unwrap(), vec![0x10000]);
        assert_eq!(device.id_cache(), Some(IdCache { pid: PID, next_id: 0x10001 }));
        assert_eq!(device.create(PID, 0, 3).unwrap(), vec![0x10001, 0x10002, 0x10003]);
        assert_eq!(device.ccap().oid, 0x10003);
        assert_eq!(device.id_cache().unwrap().next_id, 0x10004);

        // a requested id drops the cache, the next allocation rescans
        assert_eq!(device.create(PID, 0x10010, 1).unwrap(), vec![0x10010]);
        assert!(device.id_cache().is_none());
        assert_eq!(device.create(PID, 0, 1).unwrap(), vec![0x10011]);
        assert!(has_data(&device, PID, 0x10011));
    }

    #[test]
    fn test_create_writes_defaults() {
        let (_dir, mut device) = open_device();
        device.create_partition(PID).unwrap();
        let oid = device.create(PID, 0, 1).unwrap()[0];
        let (cas, fa) = device
            .txn(|txn| {
                Ok((
                    txn.get_attr(PID, oid, USER_ATOMICS_PG, atomics::CAS)?,
                    txn.get_attr(PID, oid, USER_ATOMICS_PG, atomics::FA)?,
                ))
            })
            .unwrap();
        assert_eq!(cas.unwrap(), 0u64.to_be_bytes());
        assert_eq!(fa.unwrap(), 0u64.to_be_bytes());
    }

    #[test]
    fn test_create_argument_checks() {
        let (_dir, mut device) = open_device();
        // partition missing
        assert!(device.create(PID, 0, 1).is_err());
        assert!(device.id_cache().is_none());

        device.create_partition(PID).unwrap();
        assert!(device.create(5, 0, 1).is_err());
        assert!(device.create(PID, 0x10, 1).is_err());
        assert!(device.create(PID, 0x10000, 2).is_err());

        device.create(PID, 0x10000, 1).unwrap();
        assert_eq!(device.create(PID, 0x10000, 1).unwrap_err(), Sense::cdb(PID, 0x10000));
    }

    #[test]
    fn test_create_batch_rolls_back() {
        let (_dir, mut device) = open_device();
        device.create_partition(PID).unwrap();
        device.create(PID, 0x10002, 1).unwrap();
        device.create(PID, 0x10000, 1).unwrap();
        device.remove(PID, 0x10000).unwrap();

        // 0x10001 and 0x10002 are attempted; 0x10002 is taken
        device.session.id_cache = Some(IdCache { pid: PID, next_id: 0x10001 });
        let err = device.create(PID, 0, 2).unwrap_err();
        assert_eq!(err, Sense::cdb(PID, 0x10002));
        assert!(device.id_cache().is_none());
        assert!(!has_data(&device, PID, 0x10001));
        assert_eq!(device.object_type(PID, 0x10001).unwrap(), ObjectType::Illegal);
        assert!(has_data(&device, PID, 0x10002));
    }

    #[test]
    fn test_create_and_write_removes_on_failure() {
        let (_dir, mut device) = open_device();
        device.create_partition(PID).unwrap();
        let oid = device
            .create_and_write(PID, 0, 0, 4, Layout::Contiguous, b"data")
            .unwrap();
        assert!(has_data(&device, PID, oid));

        let err = device
            .create_and_write(PID, 0, 0, 16, Layout::Contiguous, b"short")
            .unwrap_err();
        assert_eq!(err, Sense::bad_cdb(PID, oid + 1));
        assert!(!has_data(&device, PID, oid + 1));
        assert_eq!(device.object_type(PID, oid + 1).unwrap(), ObjectType::Illegal);
    }

    #[test]
    fn test_create_collections() {
        let (_dir, mut device) = open_device();
        device.create_partition(PID).unwrap();
        let cid = device.create_collection(PID, 0).unwrap();
        assert_eq!(device.object_type(PID, cid).unwrap(), ObjectType::Collection);
        assert_eq!(device.ccap().obj_type, ObjectType::Collection);
        assert!(!has_data(&device, PID, cid));

        let oid = device.create(PID, 0, 1).unwrap()[0];
        assert_eq!(oid, cid + 1);
        device
            .txn(|txn| Ok(txn.insert_member(PID, cid, oid, 1)?))
            .unwrap();

        // a source requires a continuation and the reverse
        assert!(device.create_user_tracking_collection(PID, 0, cid, false).is_err());
        assert!(device.create_user_tracking_collection(PID, 0, 0, true).is_err());
        assert!(device.create_user_tracking_collection(PID, 0, oid, true).is_err());

        let tracking = device.create_user_tracking_collection(PID, 0, cid, true).unwrap();
        let members = device.txn(|txn| Ok(txn.members(PID, tracking)?)).unwrap();
        assert_eq!(members, vec![oid]);
    }
}
