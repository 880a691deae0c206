//! Attribute table primitives.

use crate::store::{CatalogResult, Txn};
use crate::tables;
use redb::ReadableTable;

/// One stored attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAttr {
    pub page: u32,
    pub number: u32,
    pub value: Vec<u8>,
}

impl Txn {
    /// Insert or replace an attribute; an empty value deletes it
    pub fn set_attr(
        &self,
        pid: u64,
        oid: u64,
        page: u32,
        number: u32,
        value: &[u8],
    ) -> CatalogResult<()> {
        let mut table = self.wtxn.open_table(tables::ATTRIBUTES)?;
        if value.is_empty() {
            table.remove((pid, oid, page, number))?;
        } else {
            table.insert((pid, oid, page, number), value)?;
        }
        Ok(())
    }

    /// Delete an attribute; returns whether it existed
    pub fn delete_attr(&self, pid: u64, oid: u64, page: u32, number: u32) -> CatalogResult<bool> {
        let mut table = self.wtxn.open_table(tables::ATTRIBUTES)?;
        let removed = table.remove((pid, oid, page, number))?.is_some();
        Ok(removed)
    }

    /// Value of one attribute
    pub fn get_attr(
        &self,
        pid: u64,
        oid: u64,
        page: u32,
        number: u32,
    ) -> CatalogResult<Option<Vec<u8>>> {
        let table = self.wtxn.open_table(tables::ATTRIBUTES)?;
        let value = table
            .get((pid, oid, page, number))?
            .map(|v| v.value().to_vec());
        Ok(value)
    }

    /// Every attribute of an object in (page, number) order
    pub fn all_attrs(&self, pid: u64, oid: u64) -> CatalogResult<Vec<StoredAttr>> {
        self.attrs_in(pid, oid, 0, u32::MAX)
    }

    /// Every attribute on one page of an object
    pub fn page_attrs(&self, pid: u64, oid: u64, page: u32) -> CatalogResult<Vec<StoredAttr>> {
        self.attrs_in(pid, oid, page, page)
    }

    /// Attribute `number` on every page of an object
    pub fn attrs_numbered(&self, pid: u64, oid: u64, number: u32) -> CatalogResult<Vec<StoredAttr>> {
        Ok(self
            .all_attrs(pid, oid)?
            .into_iter()
            .filter(|a| a.number == number)
            .collect())
    }

    fn attrs_in(
        &self,
        pid: u64,
        oid: u64,
        first_page: u32,
        last_page: u32,
    ) -> CatalogResult<Vec<StoredAttr>> {
        let table = self.wtxn.open_table(tables::ATTRIBUTES)?;
        let mut result = Vec::new();
        for entry in table.range((pid, oid, first_page, 0)..=(pid, oid, last_page, u32::MAX))? {
            let (k, v) = entry?;
            let (_, _, page, number) = k.value();
            result.push(StoredAttr {
                page,
                number,
                value: v.value().to_vec(),
            });
        }
        Ok(result)
    }

    /// Drop every attribute of an object; returns how many were removed
    pub fn delete_all_attrs(&self, pid: u64, oid: u64) -> CatalogResult<usize> {
        let keys: Vec<(u32, u32)> = self
            .all_attrs(pid, oid)?
            .into_iter()
            .map(|a| (a.page, a.number))
            .collect();
        let mut table = self.wtxn.open_table(tables::ATTRIBUTES)?;
        for &(page, number) in &keys {
            table.remove((pid, oid, page, number))?;
        }
        Ok(keys.len())
    }

    /// Pages holding at least one attribute, with their identification
    /// value (number 0) when one is stored
    pub fn defined_pages(&self, pid: u64, oid: u64) -> CatalogResult<Vec<(u32, Option<Vec<u8>>)>> {
        let mut pages: Vec<(u32, Option<Vec<u8>>)> = Vec::new();
        for attr in self.all_attrs(pid, oid)? {
            let same_page = pages.last().is_some_and(|(page, _)| *page == attr.page);
            if !same_page {
                // number 0 sorts first, so only a new page can carry the id
                let id = (attr.number == 0).then_some(attr.value);
                pages.push((attr.page, id));
            }
        }
        Ok(pages)
    }
}

#[cfg(test)]
mod tests {
    use crate::store::{Catalog, CatalogResult};

    const PID: u64 = 0x10000;
    const OID: u64 = 0x10001;

    #[test]
    fn test_set_get_delete_attr() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = Catalog::open(dir.path().join("osd.redb")).unwrap();
        catalog
            .run(|txn| -> CatalogResult<()> {
                txn.set_attr(PID, OID, 0x20, 1, b"X\0")?;
                assert_eq!(txn.get_attr(PID, OID, 0x20, 1)?, Some(b"X\0".to_vec()));

                // zero length deletes, and deleting an absent attribute is fine
                txn.set_attr(PID, OID, 0x20, 1, b"")?;
                assert_eq!(txn.get_attr(PID, OID, 0x20, 1)?, None);
                txn.set_attr(PID, OID, 0x20, 1, b"")?;
                assert!(!txn.delete_attr(PID, OID, 0x20, 1)?);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_attr_scans() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = Catalog::open(dir.path().join("osd.redb")).unwrap();
        catalog
            .run(|txn| -> CatalogResult<()> {
                txn.set_attr(PID, OID, 3, 0, b"stamp\0")?;
                txn.set_attr(PID, OID, 3, 2, b"b")?;
                txn.set_attr(PID, OID, 6, 2, b"c")?;
                txn.set_attr(PID, OID, 0x20, 7, b"d")?;
                txn.set_attr(PID, OID + 1, 3, 2, b"other")?;

                assert_eq!(txn.all_attrs(PID, OID)?.len(), 4);
                assert_eq!(txn.page_attrs(PID, OID, 3)?.len(), 2);
                let numbered = txn.attrs_numbered(PID, OID, 2)?;
                assert_eq!(
                    numbered.iter().map(|a| a.page).collect::<Vec<_>>(),
                    vec![3, 6]
                );

                let pages = txn.defined_pages(PID, OID)?;
                assert_eq!(pages.len(), 3);
                assert_eq!(pages[0], (3, Some(b"stamp\0".to_vec())));
                assert_eq!(pages[1], (6, None));

                assert_eq!(txn.delete_all_attrs(PID, OID)?, 4);
                assert!(txn.all_attrs(PID, OID)?.is_empty());
                assert_eq!(txn.all_attrs(PID, OID + 1)?.len(), 1);
                Ok(())
            })
            .unwrap();
    }
}
