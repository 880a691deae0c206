//! Collection membership primitives.
//!
//! Membership is stored twice: `MEMBERS` keyed by collection for listing and
//! queries, `MEMBER_OF` keyed by member for the collections page and for
//! purging an object's memberships.

use crate::object::{IdPage, IdWriter};
use crate::store::{CatalogResult, Txn};
use crate::tables;
use redb::ReadableTable;

impl Txn {
    /// Record that `oid` belongs to `cid` through collections-page slot `slot`
    pub fn insert_member(&self, pid: u64, cid: u64, oid: u64, slot: u32) -> CatalogResult<()> {
        let mut members = self.wtxn.open_table(tables::MEMBERS)?;
        let mut member_of = self.wtxn.open_table(tables::MEMBER_OF)?;
        members.insert((pid, cid, oid), slot)?;
        member_of.insert((pid, oid, cid), slot)?;
        Ok(())
    }

    /// Remove one membership; returns whether it existed
    pub fn delete_member(&self, pid: u64, cid: u64, oid: u64) -> CatalogResult<bool> {
        let mut members = self.wtxn.open_table(tables::MEMBERS)?;
        let mut member_of = self.wtxn.open_table(tables::MEMBER_OF)?;
        let removed = members.remove((pid, cid, oid))?.is_some();
        member_of.remove((pid, oid, cid))?;
        Ok(removed)
    }

    /// Collections `oid` belongs to, as (cid, slot) in cid order
    pub fn memberships(&self, pid: u64, oid: u64) -> CatalogResult<Vec<(u64, u32)>> {
        let member_of = self.wtxn.open_table(tables::MEMBER_OF)?;
        let mut result = Vec::new();
        for entry in member_of.range((pid, oid, 0)..=(pid, oid, u64::MAX))? {
            let (k, v) = entry?;
            result.push((k.value().2, v.value()));
        }
        Ok(result)
    }

    /// Collection referenced from `oid`'s collections-page slot
    pub fn collection_for_slot(&self, pid: u64, oid: u64, slot: u32) -> CatalogResult<Option<u64>> {
        let found = self
            .memberships(pid, oid)?
            .into_iter()
            .find(|&(_, s)| s == slot)
            .map(|(cid, _)| cid);
        Ok(found)
    }

    /// Drop every membership of `oid`; returns how many were removed
    pub fn purge_memberships_of(&self, pid: u64, oid: u64) -> CatalogResult<usize> {
        let cids = self.memberships(pid, oid)?;
        let mut members = self.wtxn.open_table(tables::MEMBERS)?;
        let mut member_of = self.wtxn.open_table(tables::MEMBER_OF)?;
        for &(cid, _) in &cids {
            members.remove((pid, cid, oid))?;
            member_of.remove((pid, oid, cid))?;
        }
        Ok(cids.len())
    }

    /// Drop every member of `cid`; returns how many were removed
    pub fn purge_members(&self, pid: u64, cid: u64) -> CatalogResult<usize> {
        let oids = self.members(pid, cid)?;
        let mut members = self.wtxn.open_table(tables::MEMBERS)?;
        let mut member_of = self.wtxn.open_table(tables::MEMBER_OF)?;
        for &oid in &oids {
            members.remove((pid, cid, oid))?;
            member_of.remove((pid, oid, cid))?;
        }
        Ok(oids.len())
    }

    /// Ascending member oids of a collection
    pub fn members(&self, pid: u64, cid: u64) -> CatalogResult<Vec<u64>> {
        self.members_from(pid, cid, 0)
    }

    fn members_from(&self, pid: u64, cid: u64, initial: u64) -> CatalogResult<Vec<u64>> {
        let members = self.wtxn.open_table(tables::MEMBERS)?;
        let mut result = Vec::new();
        for entry in members.range((pid, cid, initial)..=(pid, cid, u64::MAX))? {
            let (k, _) = entry?;
            result.push(k.value().2);
        }
        Ok(result)
    }

    /// Whether a collection has no members
    pub fn is_collection_empty(&self, pid: u64, cid: u64) -> CatalogResult<bool> {
        let members = self.wtxn.open_table(tables::MEMBERS)?;
        let mut range = members.range((pid, cid, 0)..=(pid, cid, u64::MAX))?;
        let empty = range.next().is_none();
        Ok(empty)
    }

    /// Pack member ids of a collection into `buf`
    pub fn member_ids(
        &self,
        pid: u64,
        cid: u64,
        initial: u64,
        buf: &mut [u8],
    ) -> CatalogResult<IdPage> {
        let mut writer = IdWriter::new(buf);
        for oid in self.members_from(pid, cid, initial)? {
            writer.push(oid);
        }
        Ok(writer.finish())
    }

    /// Copy every member of `src` into `dst` with slot 0
    pub fn copy_members(&self, pid: u64, src: u64, dst: u64) -> CatalogResult<usize> {
        let oids = self.members(pid, src)?;
        for &oid in &oids {
            self.insert_member(pid, dst, oid, 0)?;
        }
        Ok(oids.len())
    }
}
