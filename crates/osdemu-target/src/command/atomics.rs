//! Atomic primitives on user objects and collection-wide attribute updates

use crate::device::OsdDevice;
use crate::sense::{CmdResult, Sense};
use osdemu_catalog::Txn;
use osdemu_common::page::{USER_ATOMICS_PG, atomics, is_settable};
use osdemu_common::wire::put_be64;
use osdemu_common::ObjectType;
use tracing::debug;

/// Bytes of output produced by CAS and FA
pub const ATOMIC_LEN: usize = 8;

/// Only existing user objects carry atomics
fn require_user_object(txn: &Txn, pid: u64, oid: u64) -> CmdResult<()> {
    match txn.object_type(pid, oid)? {
        Some(ObjectType::UserObject) => Ok(()),
        _ => Err(Sense::cdb(pid, oid)),
    }
}

/// Current value of an atomics counter, zero-initialised on first use
fn load_counter(txn: &Txn, pid: u64, oid: u64, number: u32) -> CmdResult<u64> {
    match txn.get_attr(pid, oid, USER_ATOMICS_PG, number)? {
        Some(v) => {
            let raw: [u8; 8] = v.as_slice().try_into().map_err(|_| Sense::hw(pid, oid))?;
            Ok(u64::from_be_bytes(raw))
        }
        None => {
            txn.set_attr(pid, oid, USER_ATOMICS_PG, number, &0u64.to_be_bytes())?;
            Ok(0)
        }
    }
}

impl OsdDevice {
    /// CAS: replace the counter with `swap` when it equals `cmp`. The prior
    /// value is written to `out`.
    pub fn cas(&mut self, pid: u64, oid: u64, cmp: u64, swap: u64, out: &mut [u8]) -> CmdResult<usize> {
        if out.len() < ATOMIC_LEN {
            return Err(Sense::cdb(pid, oid));
        }
        let prior = self.txn(|txn| {
            require_user_object(txn, pid, oid)?;
            let prior = load_counter(txn, pid, oid, atomics::CAS)?;
            if prior == cmp {
                txn.set_attr(pid, oid, USER_ATOMICS_PG, atomics::CAS, &swap.to_be_bytes())?;
            }
            Ok(prior)
        })?;
        debug!("CAS {:#x}:{:#x} cmp {} swap {} was {}", pid, oid, cmp, swap, prior);

        put_be64(out, 0, prior)?;
        self.set_ccap(ObjectType::UserObject, pid, oid, 0);
        Ok(ATOMIC_LEN)
    }

    /// FA: add `addend` to the counter, wrapping. The prior value is
    /// written to `out`.
    pub fn fa(&mut self, pid: u64, oid: u64, addend: u64, out: &mut [u8]) -> CmdResult<usize> {
        if out.len() < ATOMIC_LEN {
            return Err(Sense::cdb(pid, oid));
        }
        let prior = self.txn(|txn| {
            require_user_object(txn, pid, oid)?;
            let prior = load_counter(txn, pid, oid, atomics::FA)?;
            let next = prior.wrapping_add(addend);
            txn.set_attr(pid, oid, USER_ATOMICS_PG, atomics::FA, &next.to_be_bytes())?;
            Ok(prior)
        })?;

        put_be64(out, 0, prior)?;
        self.set_ccap(ObjectType::UserObject, pid, oid, 0);
        Ok(ATOMIC_LEN)
    }

    /// Generalized compare and swap on any attribute of a user object.
    ///
    /// A non-empty `swap` is stored when the attribute is absent or equals
    /// `cmp`. An empty `swap` deletes an attribute equal to `cmp`. Returns
    /// the value held before the operation.
    pub fn gen_cas(
        &mut self,
        pid: u64,
        oid: u64,
        page: u32,
        number: u32,
        cmp: &[u8],
        swap: &[u8],
    ) -> CmdResult<Option<Vec<u8>>> {
        let prior = self.txn(|txn| {
            require_user_object(txn, pid, oid)?;
            let prior = txn.get_attr(pid, oid, page, number)?;
            let equal = prior.as_deref() == Some(cmp);
            if !swap.is_empty() && (prior.is_none() || equal) {
                txn.set_attr(pid, oid, page, number, swap)?;
            } else if swap.is_empty() && equal {
                txn.delete_attr(pid, oid, page, number)?;
            }
            Ok(prior)
        })?;
        self.set_ccap(ObjectType::UserObject, pid, oid, 0);
        Ok(prior)
    }

    /// SET_MEMBER_ATTRIBUTES: apply `entries` to every member of `cid` in
    /// one transaction
    pub fn set_member_attributes(
        &mut self,
        pid: u64,
        cid: u64,
        entries: &[(u32, u32, &[u8])],
    ) -> CmdResult<()> {
        let touched = self.txn(|txn| {
            if txn.object_type(pid, cid)? != Some(ObjectType::Collection) {
                return Err(Sense::cdb(pid, cid));
            }
            if entries
                .iter()
                .any(|&(page, _, _)| !is_settable(ObjectType::UserObject, page))
            {
                return Err(Sense::param_list(pid, cid));
            }
            Ok(txn.set_member_attrs(pid, cid, entries)?)
        })?;
        debug!("Set {} attribute(s) on {} member(s) of {:#x}:{:#x}", entries.len(), touched, pid, cid);

        self.set_ccap(ObjectType::Collection, pid, cid, 0);
        Ok(())
    }
}
