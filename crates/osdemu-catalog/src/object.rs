//! Object table primitives and id paging.

use crate::store::{CatalogResult, Txn};
use crate::tables;
use osdemu_common::{ObjectType, PARTITION_OID};
use redb::ReadableTable;

/// Result of packing ids into a caller buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdPage {
    /// Bytes written into the buffer
    pub used: usize,
    /// Bytes the complete result would need, saturating
    pub add_len: u64,
    /// First id that did not fit, 0 when everything fit
    pub cont_id: u64,
}

/// Packs be64 ids into a buffer while 8 bytes remain
pub(crate) struct IdWriter<'b> {
    buf: &'b mut [u8],
    page: IdPage,
}

impl<'b> IdWriter<'b> {
    pub(crate) fn new(buf: &'b mut [u8]) -> Self {
        Self {
            buf,
            page: IdPage::default(),
        }
    }

    pub(crate) fn push(&mut self, id: u64) {
        let used = self.page.used;
        if self.buf.len() - used >= 8 {
            self.buf[used..used + 8].copy_from_slice(&id.to_be_bytes());
            self.page.used += 8;
        } else if self.page.cont_id == 0 {
            self.page.cont_id = id;
        }
        self.page.add_len = self.page.add_len.saturating_add(8);
    }

    pub(crate) const fn finish(self) -> IdPage {
        self.page
    }
}

impl Txn {
    /// Insert an object row
    pub fn insert_object(&self, pid: u64, oid: u64, obj_type: ObjectType) -> CatalogResult<()> {
        let mut table = self.wtxn.open_table(tables::OBJECTS)?;
        table.insert((pid, oid), obj_type.code())?;
        Ok(())
    }

    /// Delete an object row; returns whether it existed
    pub fn delete_object(&self, pid: u64, oid: u64) -> CatalogResult<bool> {
        let mut table = self.wtxn.open_table(tables::OBJECTS)?;
        let removed = table.remove((pid, oid))?.is_some();
        Ok(removed)
    }

    /// Stored type of an object
    pub fn object_type(&self, pid: u64, oid: u64) -> CatalogResult<Option<ObjectType>> {
        let table = self.wtxn.open_table(tables::OBJECTS)?;
        let found = table
            .get((pid, oid))?
            .map(|v| ObjectType::from_u8(v.value()));
        Ok(found)
    }

    /// Whether an object row exists
    pub fn object_exists(&self, pid: u64, oid: u64) -> CatalogResult<bool> {
        Ok(self.object_type(pid, oid)?.is_some())
    }

    /// Largest oid in a partition, counting the partition object itself
    pub fn max_oid(&self, pid: u64) -> CatalogResult<Option<u64>> {
        let table = self.wtxn.open_table(tables::OBJECTS)?;
        let last = table.range((pid, 0)..=(pid, u64::MAX))?.next_back();
        match last {
            Some(entry) => Ok(Some(entry?.0.value().1)),
            None => Ok(None),
        }
    }

    /// Largest pid of any object
    pub fn max_pid(&self) -> CatalogResult<Option<u64>> {
        let table = self.wtxn.open_table(tables::OBJECTS)?;
        let last = table.last()?.map(|(k, _)| k.value().0);
        Ok(last)
    }

    /// Whether a partition holds no objects besides its partition object
    pub fn is_partition_empty(&self, pid: u64) -> CatalogResult<bool> {
        let table = self.wtxn.open_table(tables::OBJECTS)?;
        let mut range = table.range((pid, PARTITION_OID + 1)..=(pid, u64::MAX))?;
        let empty = range.next().is_none();
        Ok(empty)
    }

    /// Ascending oids of one type in a partition, starting at `initial`
    pub fn oids_of_type(
        &self,
        pid: u64,
        obj_type: ObjectType,
        initial: u64,
    ) -> CatalogResult<Vec<u64>> {
        let table = self.wtxn.open_table(tables::OBJECTS)?;
        let mut oids = Vec::new();
        for entry in table.range((pid, initial)..=(pid, u64::MAX))? {
            let (k, v) = entry?;
            if v.value() == obj_type.code() {
                oids.push(k.value().1);
            }
        }
        Ok(oids)
    }

    /// Pack user object ids of a partition into `buf`
    pub fn user_object_ids(&self, pid: u64, initial: u64, buf: &mut [u8]) -> CatalogResult<IdPage> {
        self.object_ids(pid, ObjectType::UserObject, initial, buf)
    }

    /// Pack collection ids of a partition into `buf`
    pub fn collection_ids(&self, pid: u64, initial: u64, buf: &mut [u8]) -> CatalogResult<IdPage> {
        self.object_ids(pid, ObjectType::Collection, initial, buf)
    }

    fn object_ids(
        &self,
        pid: u64,
        obj_type: ObjectType,
        initial: u64,
        buf: &mut [u8],
    ) -> CatalogResult<IdPage> {
        let mut writer = IdWriter::new(buf);
        for oid in self.oids_of_type(pid, obj_type, initial)? {
            writer.push(oid);
        }
        Ok(writer.finish())
    }

    /// Ascending partition ids, starting at `initial`
    pub fn partitions(&self, initial: u64) -> CatalogResult<Vec<u64>> {
        let table = self.wtxn.open_table(tables::OBJECTS)?;
        let mut pids = Vec::new();
        // one lookup per partition: jump past each pid's objects
        let mut next = Some(initial);
        while let Some(from) = next {
            let mut range = table.range((from, PARTITION_OID)..)?;
            let Some(entry) = range.next() else {
                break;
            };
            let (k, v) = entry?;
            let (pid, oid) = k.value();
            if oid == PARTITION_OID && v.value() == ObjectType::Partition.code() {
                pids.push(pid);
            }
            next = pid.checked_add(1);
        }
        Ok(pids)
    }

    /// Pack partition ids into `buf`
    pub fn partition_ids(&self, initial: u64, buf: &mut [u8]) -> CatalogResult<IdPage> {
        let mut writer = IdWriter::new(buf);
        for pid in self.partitions(initial)? {
            writer.push(pid);
        }
        Ok(writer.finish())
    }

    /// Number of partitions
    pub fn partition_count(&self) -> CatalogResult<u64> {
        Ok(self.partitions(0)?.len() as u64)
    }
}
