//! Multi-table queries over membership, objects and attributes.

use crate::object::IdPage;
use crate::store::{CatalogResult, Txn};
use osdemu_common::wire::{entry_len, pack_attr};
use osdemu_common::{ObjectType, QueryKind};
use std::collections::BTreeSet;

/// Object descriptor length in LIST-with-attributes output: be64 oid,
/// 4 reserved bytes, be32 attribute list length
pub const ODE_LEN: usize = 16;

/// One QUERY criterion; an empty bound is open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Criterion {
    pub page: u32,
    pub number: u32,
    pub min: Vec<u8>,
    pub max: Vec<u8>,
}

impl Criterion {
    /// Whether `value` lies within the inclusive byte-wise range
    #[must_use]
    pub fn matches(&self, value: &[u8]) -> bool {
        (self.min.is_empty() || value >= self.min.as_slice())
            && (self.max.is_empty() || value <= self.max.as_slice())
    }
}

impl Txn {
    /// Members of `cid` matching the criteria, ascending and deduplicated.
    ///
    /// With no criteria every member matches.
    pub fn run_query(
        &self,
        pid: u64,
        cid: u64,
        kind: QueryKind,
        criteria: &[Criterion],
    ) -> CatalogResult<Vec<u64>> {
        let members = self.members(pid, cid)?;
        if criteria.is_empty() {
            return Ok(members);
        }

        let mut matched = BTreeSet::new();
        for oid in members {
            let mut hits = 0;
            for c in criteria {
                let hit = self
                    .get_attr(pid, oid, c.page, c.number)?
                    .is_some_and(|v| c.matches(&v));
                if hit {
                    hits += 1;
                    if kind == QueryKind::Union {
                        break;
                    }
                }
            }
            let selected = match kind {
                QueryKind::Union => hits > 0,
                QueryKind::Intersect => hits == criteria.len(),
            };
            if selected {
                matched.insert(oid);
            }
        }
        Ok(matched.into_iter().collect())
    }

    /// Pack user objects of `pid` starting at `initial_oid`, each followed by
    /// its stored attributes among `requested`.
    ///
    /// No partial descriptor or entry is ever written. Once the buffer runs
    /// out the open sublist length is closed, `cont_id` records the object
    /// that did not fit and only `add_len` keeps growing.
    pub fn list_with_attributes(
        &self,
        pid: u64,
        initial_oid: u64,
        requested: &[(u32, u32)],
        buf: &mut [u8],
    ) -> CatalogResult<IdPage> {
        let mut page = IdPage::default();
        let mut writing = true;

        'objects: for oid in self.oids_of_type(pid, ObjectType::UserObject, initial_oid)? {
            let mut attrs = Vec::new();
            for &(pg, number) in requested {
                if let Some(value) = self.get_attr(pid, oid, pg, number)? {
                    attrs.push((pg, number, value));
                }
            }

            let Some(len) = page.add_len.checked_add(ODE_LEN as u64) else {
                page.add_len = u64::MAX;
                break;
            };
            page.add_len = len;

            // Offset of this object's attribute list length field
            let mut list_len_at = None;
            if writing {
                if buf.len() - page.used >= ODE_LEN {
                    let ode = &mut buf[page.used..page.used + ODE_LEN];
                    ode[..8].copy_from_slice(&oid.to_be_bytes());
                    ode[8..].fill(0);
                    list_len_at = Some(page.used + 12);
                    page.used += ODE_LEN;
                } else {
                    writing = false;
                    page.cont_id = oid;
                }
            }

            let mut list_len: u32 = 0;
            for (pg, number, value) in &attrs {
                let needed = entry_len(value.len());
                if writing && list_len_at.is_some() {
                    if buf.len() - page.used >= needed {
                        let written = pack_attr(&mut buf[page.used..], *pg, *number, value)?;
                        page.used += written;
                        list_len += written as u32;
                    } else {
                        writing = false;
                        page.cont_id = oid;
                    }
                }
                let Some(len) = page.add_len.checked_add(needed as u64) else {
                    page.add_len = u64::MAX;
                    close_list(buf, list_len_at, list_len);
                    break 'objects;
                };
                page.add_len = len;
            }
            close_list(buf, list_len_at, list_len);
        }
        Ok(page)
    }

    /// Insert or replace each entry on every member of `cid`; an empty value
    /// deletes. Returns the number of members touched.
    pub fn set_member_attrs(
        &self,
        pid: u64,
        cid: u64,
        entries: &[(u32, u32, &[u8])],
    ) -> CatalogResult<usize> {
        let members = self.members(pid, cid)?;
        for &oid in &members {
            for &(page, number, value) in entries {
                self.set_attr(pid, oid, page, number, value)?;
            }
        }
        Ok(members.len())
    }
}

fn close_list(buf: &mut [u8], list_len_at: Option<usize>, list_len: u32) {
    if let Some(at) = list_len_at {
        buf[at..at + 4].copy_from_slice(&list_len.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Catalog;

    const PID: u64 = 0x10000;
    const CID: u64 = 0x20000;
    const PAGE: u32 = 0x1_0000;

    fn populate(txn: &Txn, values: &[u64]) -> CatalogResult<()> {
        for (i, v) in values.iter().enumerate() {
            let oid = 0x10000 + i as u64;
            txn.insert_object(PID, oid, ObjectType::UserObject)?;
            txn.insert_member(PID, CID, oid, 1)?;
            txn.set_attr(PID, oid, PAGE, 1, &v.to_be_bytes())?;
        }
        Ok(())
    }

    fn range(min: u64, max: u64) -> Criterion {
        Criterion {
            page: PAGE,
            number: 1,
            min: min.to_be_bytes().to_vec(),
            max: max.to_be_bytes().to_vec(),
        }
    }

    #[test]
    fn test_range_query() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = Catalog::open(dir.path().join("osd.redb")).unwrap();
        let values = [20u64, 49, 59, 67, 75, 101, 200, 323];
        let matched = catalog
            .run(|txn| {
                populate(txn, &values)?;
                txn.run_query(PID, CID, QueryKind::Union, &[range(40, 80)])
            })
            .unwrap();
        let expected: Vec<u64> = vec![0x10001, 0x10002, 0x10003, 0x10004];
        assert_eq!(matched, expected);
    }

    #[test]
    fn test_union_and_intersect() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = Catalog::open(dir.path().join("osd.redb")).unwrap();
        catalog
            .run(|txn| -> CatalogResult<()> {
                populate(txn, &[10, 50, 90])?;
                let low = range(0, 60);
                let high = range(40, 100);
                assert_eq!(
                    txn.run_query(PID, CID, QueryKind::Union, &[low.clone(), high.clone()])?,
                    vec![0x10000, 0x10001, 0x10002]
                );
                assert_eq!(
                    txn.run_query(PID, CID, QueryKind::Intersect, &[low, high])?,
                    vec![0x10001]
                );
                assert_eq!(txn.run_query(PID, CID, QueryKind::Union, &[])?.len(), 3);

                let open = Criterion {
                    page: PAGE,
                    number: 1,
                    min: Vec::new(),
                    max: 50u64.to_be_bytes().to_vec(),
                };
                assert_eq!(
                    txn.run_query(PID, CID, QueryKind::Union, &[open])?,
                    vec![0x10000, 0x10001]
                );
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_list_with_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = Catalog::open(dir.path().join("osd.redb")).unwrap();
        catalog
            .run(|txn| -> CatalogResult<()> {
                populate(txn, &[1, 2, 3])?;
                let requested = [(PAGE, 1), (PAGE, 9)];

                let mut buf = vec![0u8; 256];
                let page = txn.list_with_attributes(PID, 0, &requested, &mut buf)?;
                // 16-byte descriptor plus one 24-byte entry per object
                assert_eq!(page.used, 3 * 40);
                assert_eq!(page.add_len, 3 * 40);
                assert_eq!(page.cont_id, 0);
                assert_eq!(&buf[..8], &0x10000u64.to_be_bytes());
                assert_eq!(&buf[12..16], &24u32.to_be_bytes());

                // room for one object and the next descriptor only
                let mut buf = vec![0u8; 60];
                let page = txn.list_with_attributes(PID, 0, &requested, &mut buf)?;
                assert_eq!(page.used, 56);
                assert_eq!(page.cont_id, 0x10001);
                assert_eq!(page.add_len, 120);
                assert_eq!(&buf[52..56], &0u32.to_be_bytes());

                let mut buf = vec![0u8; 256];
                let page = txn.list_with_attributes(PID, 0x10002, &requested, &mut buf)?;
                assert_eq!(page.used, 40);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_set_member_attrs() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = Catalog::open(dir.path().join("osd.redb")).unwrap();
        catalog
            .run(|txn| -> CatalogResult<()> {
                populate(txn, &[1, 2])?;
                let touched = txn.set_member_attrs(PID, CID, &[(PAGE, 5, b"v".as_slice()), (PAGE, 1, b"".as_slice())])?;
                assert_eq!(touched, 2);
                assert_eq!(txn.get_attr(PID, 0x10001, PAGE, 5)?, Some(b"v".to_vec()));
                assert_eq!(txn.get_attr(PID, 0x10001, PAGE, 1)?, None);
                Ok(())
            })
            .unwrap();
    }
}
