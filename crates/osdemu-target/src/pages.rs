//! Attribute pages: stored rows merged with synthesized virtual pages
//!
//! The current command, information, timestamps, collections and directory
//! pages are never stored as such. They are computed on every read from the
//! session, the catalog, the data files and the filesystem. Writes into them
//! go through a small whitelist; everything else lands in the catalog.

use crate::blob::{self, DataFile, FileTimes, FsCapacity};
use crate::device::{CATALOG_FILE, Ccap};
use crate::sense::{CmdResult, Sense};
use osdemu_catalog::Txn;
use osdemu_common::page::{
    self, ATTR_PAGE_ID_LEN, ATTRNUM_GETALL, COLLECTION_PG, CUR_CMD_ATTR_PG, GETALLATTR_PG,
    MAX_ATTR_LEN, PARTITION_INFO_PG, PARTITION_PG, PARTITION_TMSTMP_PG, ROOT_INFO_PG, ROOT_PG,
    USER_COLL_PG, USER_DIR_PG, USER_INFO_PG, USER_TMSTMP_PG, ccap, id_value, riap, ucap, uiap,
    utsap,
};
use osdemu_common::wire::time48;
use osdemu_common::{OSD_SYS_ID_SIZE, ObjectType};
use std::path::Path;

/// (number, value) pairs of one page in number order
pub type PageEntries = Vec<(u32, Vec<u8>)>;

/// One attribute with its page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub page: u32,
    pub number: u32,
    pub value: Vec<u8>,
}

/// Read and write access to the attributes of one object inside an open
/// catalog transaction
pub(crate) struct Pages<'a> {
    pub txn: &'a Txn,
    pub root: &'a Path,
    pub ccap: &'a Ccap,
    pub obj_type: ObjectType,
    pub pid: u64,
    pub oid: u64,
}

/// A synthesized page: its entries and every number it may ever carry
struct Virtual {
    entries: PageEntries,
    known: &'static [u32],
}

const CCAP_NUMBERS: &[u32] = &[0, ccap::RICV, ccap::OBJT, ccap::PID, ccap::OID, ccap::APPADDR];
const UTSAP_NUMBERS: &[u32] = &[
    0,
    utsap::CTIME,
    utsap::ATTR_ATIME,
    utsap::ATTR_MTIME,
    utsap::DATA_ATIME,
    utsap::DATA_MTIME,
];
const UIAP_NUMBERS: &[u32] = &[
    0,
    uiap::PID,
    uiap::OID,
    uiap::USERNAME,
    uiap::USED_CAPACITY,
    uiap::LOGICAL_LEN,
];
const PARTITION_INFO_NUMBERS: &[u32] = &[
    0,
    uiap::PID,
    uiap::USERNAME,
    uiap::USED_CAPACITY,
    uiap::PARTITION_CAPACITY_QUOTA,
];
const RIAP_NUMBERS: &[u32] = &[
    0,
    riap::OSD_SYSTEM_ID,
    riap::VENDOR_IDENTIFICATION,
    riap::PRODUCT_IDENTIFICATION,
    riap::PRODUCT_MODEL,
    riap::PRODUCT_REVISION_LEVEL,
    riap::PRODUCT_SERIAL_NUMBER,
    riap::OSD_NAME,
    riap::TOTAL_CAPACITY,
    riap::USED_CAPACITY,
    riap::NUMBER_OF_PARTITIONS,
    riap::CLOCK,
];

/// Directory page of an object type
const fn dir_page(obj_type: ObjectType) -> Option<u32> {
    match obj_type {
        ObjectType::UserObject => Some(USER_DIR_PG),
        ObjectType::Partition => Some(PARTITION_PG),
        ObjectType::Collection => Some(COLLECTION_PG),
        ObjectType::Root => Some(ROOT_PG),
        ObjectType::Illegal => None,
    }
}

/// Synthesized pages of an object type with their identification strings,
/// directory page first
fn virtual_pages(obj_type: ObjectType) -> &'static [(u32, &'static str)] {
    match obj_type {
        ObjectType::UserObject => &[
            (USER_DIR_PG, page::USER_DIR_ID),
            (USER_INFO_PG, page::USER_INFO_ID),
            (USER_TMSTMP_PG, page::USER_TMSTMP_ID),
            (USER_COLL_PG, page::USER_COLL_ID),
        ],
        ObjectType::Partition => &[
            (PARTITION_PG, page::PARTITION_DIR_ID),
            (PARTITION_INFO_PG, page::PARTITION_INFO_ID),
            (PARTITION_TMSTMP_PG, page::PARTITION_TMSTMP_ID),
        ],
        ObjectType::Collection => &[(COLLECTION_PG, page::COLL_DIR_ID)],
        ObjectType::Root => &[
            (ROOT_PG, page::ROOT_DIR_ID),
            (ROOT_INFO_PG, page::ROOT_INFO_ID),
        ],
        ObjectType::Illegal => &[],
    }
}

fn be64(v: u64) -> Vec<u8> {
    v.to_be_bytes().to_vec()
}

/// Re-pad a stored identification value to the fixed directory width
fn padded_id(stored: &[u8]) -> Vec<u8> {
    if stored.len() == ATTR_PAGE_ID_LEN {
        return stored.to_vec();
    }
    let text = stored.split(|&b| b == 0).next().unwrap_or_default();
    id_value(&String::from_utf8_lossy(text))
}

impl Pages<'_> {
    // ---- Reads ----

    /// Every attribute of the object: stored pages plus its synthesized
    /// pages. The current command page is only returned when asked for.
    pub fn all(&self) -> CmdResult<Vec<Attr>> {
        let mut out = Vec::new();
        let mut pages: Vec<u32> = self
            .txn
            .defined_pages(self.pid, self.oid)?
            .into_iter()
            .map(|(pg, _)| pg)
            .collect();
        pages.extend(virtual_pages(self.obj_type).iter().map(|&(pg, _)| pg));
        pages.sort_unstable();
        pages.dedup();

        for pg in pages {
            if !page::is_gettable(self.obj_type, pg) {
                continue;
            }
            for (number, value) in self.page(pg)? {
                out.push(Attr {
                    page: pg,
                    number,
                    value,
                });
            }
        }
        Ok(out)
    }

    /// Attribute `number` on every page
    pub fn numbered(&self, number: u32) -> CmdResult<Vec<Attr>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|a| a.number == number)
            .collect())
    }

    /// Every attribute on one page
    pub fn page(&self, pg: u32) -> CmdResult<PageEntries> {
        match self.synthesize(pg)? {
            Some(v) => Ok(v.entries),
            None => Ok(self
                .txn
                .page_attrs(self.pid, self.oid, pg)?
                .into_iter()
                .map(|a| (a.number, a.value))
                .collect()),
        }
    }

    /// Value of one attribute; a number a synthesized page can never carry
    /// is a parameter list error
    pub fn get(&self, pg: u32, number: u32) -> CmdResult<Option<Vec<u8>>> {
        match self.synthesize(pg)? {
            Some(v) => {
                if !v.known.is_empty() && !v.known.contains(&number) {
                    return Err(Sense::param_list(self.pid, self.oid));
                }
                Ok(v.entries.into_iter().find(|(n, _)| *n == number).map(|(_, value)| value))
            }
            None => Ok(self.txn.get_attr(self.pid, self.oid, pg, number)?),
        }
    }

    /// Dispatch a retrieval on (page, number) with wildcards
    pub fn retrieve(&self, pg: u32, number: u32) -> CmdResult<Vec<Attr>> {
        match (pg == GETALLATTR_PG, number == ATTRNUM_GETALL) {
            (true, true) => self.all(),
            (true, false) => self.numbered(number),
            (false, true) => Ok(self
                .page(pg)?
                .into_iter()
                .map(|(number, value)| Attr {
                    page: pg,
                    number,
                    value,
                })
                .collect()),
            (false, false) => Ok(self
                .get(pg, number)?
                .map(|value| Attr {
                    page: pg,
                    number,
                    value,
                })
                .into_iter()
                .collect()),
        }
    }

    fn stored_or(&self, pg: u32, number: u32, default: impl FnOnce() -> Vec<u8>) -> CmdResult<Vec<u8>> {
        Ok(self
            .txn
            .get_attr(self.pid, self.oid, pg, number)?
            .unwrap_or_else(default))
    }

    fn synthesize(&self, pg: u32) -> CmdResult<Option<Virtual>> {
        if pg == CUR_CMD_ATTR_PG {
            return Ok(Some(self.current_command()));
        }
        let v = match (self.obj_type, pg) {
            (ObjectType::UserObject, USER_INFO_PG) => self.user_info()?,
            (ObjectType::UserObject, USER_TMSTMP_PG) => self.user_timestamps()?,
            (ObjectType::UserObject, USER_COLL_PG) => self.user_collections()?,
            (ObjectType::Partition, PARTITION_INFO_PG) => self.partition_info()?,
            (ObjectType::Partition, PARTITION_TMSTMP_PG) => self.partition_timestamps()?,
            (ObjectType::Root, ROOT_INFO_PG) => self.root_info()?,
            (t, p) if dir_page(t) == Some(p) => self.directory(p)?,
            _ => return Ok(None),
        };
        Ok(Some(v))
    }

    fn current_command(&self) -> Virtual {
        let c = self.ccap;
        Virtual {
            entries: vec![
                (0, id_value(page::CUR_CMD_ID)),
                (ccap::RICV, c.ricv.to_vec()),
                (ccap::OBJT, vec![c.obj_type.code()]),
                (ccap::PID, be64(c.pid)),
                (ccap::OID, be64(c.oid)),
                (ccap::APPADDR, be64(c.append_off)),
            ],
            known: CCAP_NUMBERS,
        }
    }

    fn user_info(&self) -> CmdResult<Virtual> {
        let file = DataFile::open(self.root, self.pid, self.oid)?;
        let meta = file.metadata()?;

        let mut entries = vec![
            (0, self.stored_or(USER_INFO_PG, 0, || id_value(page::USER_INFO_ID))?),
            (uiap::PID, be64(self.pid)),
            (uiap::OID, be64(self.oid)),
        ];
        if let Some(name) = self.txn.get_attr(self.pid, self.oid, USER_INFO_PG, uiap::USERNAME)? {
            entries.push((uiap::USERNAME, name));
        }
        entries.push((uiap::USED_CAPACITY, be64(blob::allocated_bytes(&meta))));
        entries.push((uiap::LOGICAL_LEN, be64(meta.len())));
        Ok(Virtual {
            entries,
            known: UIAP_NUMBERS,
        })
    }

    fn partition_info(&self) -> CmdResult<Virtual> {
        let cap = FsCapacity::of(self.root)?;
        let mut entries = vec![
            (
                0,
                self.stored_or(PARTITION_INFO_PG, 0, || id_value(page::PARTITION_INFO_ID))?,
            ),
            (uiap::PID, be64(self.pid)),
        ];
        if let Some(name) = self
            .txn
            .get_attr(self.pid, self.oid, PARTITION_INFO_PG, uiap::USERNAME)?
        {
            entries.push((uiap::USERNAME, name));
        }
        entries.push((uiap::USED_CAPACITY, be64(cap.used)));
        entries.push((uiap::PARTITION_CAPACITY_QUOTA, be64(cap.total)));
        Ok(Virtual {
            entries,
            known: PARTITION_INFO_NUMBERS,
        })
    }

    fn timestamps(id: Vec<u8>, data: FileTimes, attr: FileTimes) -> CmdResult<Virtual> {
        Ok(Virtual {
            entries: vec![
                (0, id),
                (utsap::CTIME, time48(data.ctime)?.to_vec()),
                (utsap::ATTR_ATIME, time48(attr.atime)?.to_vec()),
                (utsap::ATTR_MTIME, time48(attr.mtime)?.to_vec()),
                (utsap::DATA_ATIME, time48(data.atime)?.to_vec()),
                (utsap::DATA_MTIME, time48(data.mtime)?.to_vec()),
            ],
            known: UTSAP_NUMBERS,
        })
    }

    fn catalog_times(&self) -> CmdResult<FileTimes> {
        Ok(FileTimes::of(&self.root.join(blob::MD_DIR).join(CATALOG_FILE))?)
    }

    fn user_timestamps(&self) -> CmdResult<Virtual> {
        let data = FileTimes::of(&blob::data_path(self.root, self.pid, self.oid))?;
        let id = self.stored_or(USER_TMSTMP_PG, 0, || id_value(page::USER_TMSTMP_ID))?;
        Self::timestamps(id, data, self.catalog_times()?)
    }

    fn partition_timestamps(&self) -> CmdResult<Virtual> {
        let attr = self.catalog_times()?;
        let id = self.stored_or(PARTITION_TMSTMP_PG, 0, || id_value(page::PARTITION_TMSTMP_ID))?;
        Self::timestamps(id, attr, attr)
    }

    /// The 38-byte page-format rendering of the user object timestamps
    pub fn timestamps_page(&self) -> CmdResult<[u8; utsap::TOTAL_LEN]> {
        let v = self.user_timestamps()?;
        let mut out = [0u8; utsap::TOTAL_LEN];
        out[..4].copy_from_slice(&USER_TMSTMP_PG.to_be_bytes());
        #[allow(clippy::cast_possible_truncation)]
        out[4..8].copy_from_slice(&((utsap::TOTAL_LEN - 8) as u32).to_be_bytes());
        for (number, value) in v.entries {
            let off = match number {
                utsap::CTIME => utsap::CTIME_OFF,
                utsap::ATTR_ATIME => utsap::ATTR_ATIME_OFF,
                utsap::ATTR_MTIME => utsap::ATTR_MTIME_OFF,
                utsap::DATA_ATIME => utsap::DATA_ATIME_OFF,
                utsap::DATA_MTIME => utsap::DATA_MTIME_OFF,
                _ => continue,
            };
            out[off..off + utsap::TIME_LEN].copy_from_slice(&value);
        }
        Ok(out)
    }

    fn user_collections(&self) -> CmdResult<Virtual> {
        let mut entries = vec![(
            0,
            self.stored_or(USER_COLL_PG, 0, || id_value(page::USER_COLL_ID))?,
        )];
        let mut slots: Vec<(u32, u64)> = self
            .txn
            .memberships(self.pid, self.oid)?
            .into_iter()
            .filter(|&(_, slot)| slot >= ucap::COLL_PTR_LB)
            .map(|(cid, slot)| (slot, cid))
            .collect();
        slots.sort_unstable();
        entries.extend(slots.into_iter().map(|(slot, cid)| (slot, be64(cid))));
        Ok(Virtual {
            entries,
            known: &[],
        })
    }

    fn root_info(&self) -> CmdResult<Virtual> {
        let cap = FsCapacity::of(self.root)?;
        let partitions = self.txn.partition_count()?;

        let mut entries = vec![
            (0, self.stored_or(ROOT_INFO_PG, 0, || id_value(page::ROOT_INFO_ID))?),
            (
                riap::OSD_SYSTEM_ID,
                self.stored_or(ROOT_INFO_PG, riap::OSD_SYSTEM_ID, || {
                    riap::DEFAULT_SYSTEM_ID.to_vec()
                })?,
            ),
            (riap::VENDOR_IDENTIFICATION, b"OSC\0".to_vec()),
            (riap::PRODUCT_IDENTIFICATION, b"OSDEMU\0".to_vec()),
            (riap::PRODUCT_MODEL, b"OSD2r05\0".to_vec()),
            (riap::PRODUCT_REVISION_LEVEL, 117u32.to_be_bytes().to_vec()),
            (riap::PRODUCT_SERIAL_NUMBER, b"2\0".to_vec()),
        ];
        if let Some(name) = self
            .txn
            .get_attr(self.pid, self.oid, ROOT_INFO_PG, riap::OSD_NAME)?
        {
            entries.push((riap::OSD_NAME, name));
        }
        entries.push((riap::TOTAL_CAPACITY, be64(cap.total)));
        entries.push((riap::USED_CAPACITY, be64(cap.used)));
        entries.push((riap::NUMBER_OF_PARTITIONS, be64(partitions)));
        entries.push((riap::CLOCK, time48(blob::now_millis())?.to_vec()));
        Ok(Virtual {
            entries,
            known: RIAP_NUMBERS,
        })
    }

    /// Directory page: stored directory rows, plus one 40-byte
    /// identification per other page that holds attributes
    fn directory(&self, dir: u32) -> CmdResult<Virtual> {
        let mut entries: PageEntries = self
            .txn
            .page_attrs(self.pid, self.oid, dir)?
            .into_iter()
            .map(|a| (a.number, a.value))
            .collect();
        let default_id = virtual_pages(self.obj_type)
            .first()
            .map_or(page::UNIDENTIFIED_PAGE_ID, |&(_, id)| id);
        if !entries.iter().any(|(n, _)| *n == 0) {
            entries.push((0, id_value(default_id)));
        }

        let mut described: Vec<(u32, Vec<u8>)> = Vec::new();
        for (pg, stored_id) in self.txn.defined_pages(self.pid, self.oid)? {
            if pg == dir {
                continue;
            }
            let id = stored_id.map_or_else(|| id_value(page::UNIDENTIFIED_PAGE_ID), |v| padded_id(&v));
            described.push((pg, id));
        }
        for &(pg, id) in virtual_pages(self.obj_type).iter().skip(1) {
            if !described.iter().any(|(p, _)| *p == pg) {
                described.push((pg, id_value(id)));
            }
        }
        for (pg, id) in described {
            if !entries.iter().any(|(n, _)| *n == pg) {
                entries.push((pg, id));
            }
        }
        entries.sort_by_key(|(n, _)| *n);
        Ok(Virtual {
            entries,
            known: &[],
        })
    }

    // ---- Writes ----

    /// Set one attribute; an empty value deletes it.
    ///
    /// `formatting` enables the system id on the root information page.
    pub fn set(&self, pg: u32, number: u32, value: &[u8], formatting: bool) -> CmdResult<()> {
        let (pid, oid) = (self.pid, self.oid);
        if self.obj_type == ObjectType::Illegal {
            return Err(Sense::cdb(pid, oid));
        }
        if !page::is_settable(self.obj_type, pg) || number == ATTRNUM_GETALL {
            return Err(Sense::param_list(pid, oid));
        }
        if number == 0 && (value.len() > ATTR_PAGE_ID_LEN || (!value.is_empty() && !value.contains(&0))) {
            return Err(Sense::cdb(pid, oid));
        }
        if value.len() > MAX_ATTR_LEN {
            return Err(Sense::param_list(pid, oid));
        }

        match (self.obj_type, pg) {
            (ObjectType::UserObject, USER_INFO_PG) => self.set_user_info(number, value),
            (ObjectType::Partition, PARTITION_INFO_PG) if number == uiap::USERNAME => {
                Ok(self.txn.set_attr(pid, oid, pg, number, value)?)
            }
            (ObjectType::Root, ROOT_INFO_PG) => self.set_root_info(number, value, formatting),
            (ObjectType::UserObject, USER_COLL_PG) => self.set_collection_pointer(number, value),
            (_, CUR_CMD_ATTR_PG)
            | (ObjectType::UserObject, USER_TMSTMP_PG)
            | (ObjectType::Partition, PARTITION_INFO_PG | PARTITION_TMSTMP_PG) => {
                Err(Sense::cdb(pid, oid))
            }
            _ => Ok(self.txn.set_attr(pid, oid, pg, number, value)?),
        }
    }

    fn set_user_info(&self, number: u32, value: &[u8]) -> CmdResult<()> {
        let (pid, oid) = (self.pid, self.oid);
        match number {
            uiap::USERNAME => Ok(self.txn.set_attr(pid, oid, USER_INFO_PG, number, value)?),
            uiap::LOGICAL_LEN => {
                let len: [u8; 8] = value.try_into().map_err(|_| Sense::cdb(pid, oid))?;
                let file = DataFile::open(self.root, pid, oid).map_err(|_| Sense::cdb(pid, oid))?;
                file.set_len(u64::from_be_bytes(len))
                    .map_err(|_| Sense::hw(pid, oid))
            }
            _ => Err(Sense::cdb(pid, oid)),
        }
    }

    fn set_root_info(&self, number: u32, value: &[u8], formatting: bool) -> CmdResult<()> {
        let (pid, oid) = (self.pid, self.oid);
        match number {
            riap::OSD_SYSTEM_ID if formatting && value.len() <= OSD_SYS_ID_SIZE => {
                let mut id = value.to_vec();
                id.resize(OSD_SYS_ID_SIZE, 0);
                Ok(self.txn.set_attr(pid, oid, ROOT_INFO_PG, number, &id)?)
            }
            riap::OSD_NAME => Ok(self.txn.set_attr(pid, oid, ROOT_INFO_PG, number, value)?),
            riap::CLOCK => Ok(()),
            _ => Err(Sense::cdb(pid, oid)),
        }
    }

    fn set_collection_pointer(&self, slot: u32, value: &[u8]) -> CmdResult<()> {
        let (pid, oid) = (self.pid, self.oid);
        if !(ucap::COLL_PTR_LB..=ucap::COLL_PTR_UB).contains(&slot) {
            return Err(Sense::cdb(pid, oid));
        }
        if value.is_empty() {
            if let Some(cid) = self.txn.collection_for_slot(pid, oid, slot)? {
                self.txn.delete_member(pid, cid, oid)?;
            }
            return Ok(());
        }
        let cid: [u8; 8] = value.try_into().map_err(|_| Sense::cdb(pid, oid))?;
        let cid = u64::from_be_bytes(cid);
        if self.txn.object_type(pid, cid)? != Some(ObjectType::Collection) {
            return Err(Sense::cdb(pid, oid));
        }
        self.txn.insert_member(pid, cid, oid, slot)?;
        Ok(())
    }
}
