//! OSD device handle and per-session state
//!
//! An [`OsdDevice`] owns the device root, the catalog and the session state
//! carried between commands: the id allocation cache, the current command
//! attributes and the service action being executed. Every command borrows
//! it mutably, so commands run one at a time and to completion.

use crate::blob::{self, DATA_DIR, MD_DIR, STRANDED_DIR};
use crate::sense::{CmdResult, Sense};
use osdemu_catalog::{Catalog, CatalogError, Txn};
use osdemu_common::page::{self, ccap as ccap_pg};
use osdemu_common::{
    OBJECT_PID_LB, ObjectType, ROOT_OID, ROOT_PID, ServiceAction, TargetConfig, USEROBJECT_OID_LB,
};
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// Catalog file name inside the metadata directory
pub const CATALOG_FILE: &str = "osd.redb";

/// Error type for opening a device root
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("device root {0} is not a directory")]
    NotADirectory(PathBuf),
    #[error("failed to prepare {path}: {source}")]
    Layout {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("device initialisation failed: {0}")]
    Init(Sense),
}

/// Last allocated partition and the next id to hand out in it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdCache {
    pub pid: u64,
    pub next_id: u64,
}

/// Current command attributes snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ccap {
    pub ricv: [u8; ccap_pg::RICV_LEN],
    pub obj_type: ObjectType,
    pub pid: u64,
    pub oid: u64,
    pub append_off: u64,
}

impl Ccap {
    /// Render the page-format form of the current command page
    #[must_use]
    pub fn to_page(&self) -> [u8; ccap_pg::TOTAL_LEN] {
        let mut out = [0u8; ccap_pg::TOTAL_LEN];
        out[..4].copy_from_slice(&page::CUR_CMD_ATTR_PG.to_be_bytes());
        #[allow(clippy::cast_possible_truncation)]
        out[4..8].copy_from_slice(&((ccap_pg::TOTAL_LEN - 8) as u32).to_be_bytes());
        out[ccap_pg::RICV_OFF..ccap_pg::RICV_OFF + ccap_pg::RICV_LEN].copy_from_slice(&self.ricv);
        out[ccap_pg::OBJT_OFF] = self.obj_type.code();
        out[ccap_pg::PID_OFF..ccap_pg::PID_OFF + 8].copy_from_slice(&self.pid.to_be_bytes());
        out[ccap_pg::OID_OFF..ccap_pg::OID_OFF + 8].copy_from_slice(&self.oid.to_be_bytes());
        out[ccap_pg::APPADDR_OFF..ccap_pg::APPADDR_OFF + 8]
            .copy_from_slice(&self.append_off.to_be_bytes());
        out
    }
}

/// Root facts reported by [`OsdDevice::root_summary`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootSummary {
    pub osd_name: Option<String>,
    pub system_id: Vec<u8>,
    pub partitions: u64,
    pub generation: u64,
}

/// State carried from one command to the next
#[derive(Debug, Default)]
pub(crate) struct Session {
    pub(crate) id_cache: Option<IdCache>,
    pub(crate) ccap: Ccap,
    pub(crate) action: Option<ServiceAction>,
}

/// One emulated OSD logical unit
pub struct OsdDevice {
    config: TargetConfig,
    root: PathBuf,
    catalog: Catalog,
    pub(crate) session: Session,
}

impl OsdDevice {
    /// Open the device rooted at `config.root`, creating the directory
    /// layout and the catalog when missing.
    pub fn open(config: TargetConfig) -> Result<Self, DeviceError> {
        let root = config.root.clone();
        prepare_layout(&root)?;

        let mut catalog = Catalog::open(root.join(MD_DIR).join(CATALOG_FILE))?;
        let fresh = catalog
            .run(|txn| -> CmdResult<bool> { Ok(!txn.object_exists(ROOT_PID, ROOT_OID)?) })
            .map_err(DeviceError::Init)?;

        let mut device = Self {
            config,
            root,
            catalog,
            session: Session::default(),
        };
        if fresh {
            device.initialize_db().map_err(DeviceError::Init)?;
        }
        info!("Opened OSD device at {}", device.root.display());
        Ok(device)
    }

    /// Device root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Target configuration
    pub const fn config(&self) -> &TargetConfig {
        &self.config
    }

    /// Path of the catalog file
    pub fn catalog_path(&self) -> &Path {
        self.catalog.path()
    }

    /// Catalog generation the device handle is prepared against
    pub const fn generation(&self) -> u64 {
        self.catalog.generation()
    }

    /// Current command attributes of the last command
    pub const fn ccap(&self) -> &Ccap {
        &self.session.ccap
    }

    /// Id allocation cache
    pub const fn id_cache(&self) -> Option<IdCache> {
        self.session.id_cache
    }

    /// Run `f` in one catalog transaction, retrying after a catalog
    /// re-initialisation
    pub(crate) fn txn<T, F>(&mut self, f: F) -> CmdResult<T>
    where
        F: FnMut(&Txn) -> CmdResult<T>,
    {
        self.catalog.run(f)
    }

    /// Run `f` in one catalog transaction with access to the device root
    /// and the session state
    pub(crate) fn txn_with<T, F>(&mut self, mut f: F) -> CmdResult<T>
    where
        F: FnMut(&Txn, &Path, &mut Session) -> CmdResult<T>,
    {
        let root = self.root.as_path();
        let session = &mut self.session;
        self.catalog.run(|txn| f(txn, root, &mut *session))
    }

    /// Record the current command attributes
    pub(crate) fn set_ccap(&mut self, obj_type: ObjectType, pid: u64, oid: u64, append_off: u64) {
        self.session.ccap = Ccap {
            ricv: [0; ccap_pg::RICV_LEN],
            obj_type,
            pid,
            oid,
            append_off,
        };
    }

    pub(crate) fn invalidate_id_cache(&mut self) {
        self.session.id_cache = None;
    }

    /// Type of the object addressed by (pid, oid), ILLEGAL when it does not
    /// exist or the ids cannot name an object
    pub(crate) fn object_type(&mut self, pid: u64, oid: u64) -> CmdResult<ObjectType> {
        self.txn(|txn| resolve_type(txn, pid, oid))
    }

    /// Write the root and partition-zero defaults
    fn initialize_db(&mut self) -> CmdResult<()> {
        let osd_name = self.config.osd_name.clone();
        self.txn(|txn| {
            use page::{PARTITION_PG, ROOT_PG, id_value};

            txn.insert_object(ROOT_PID, ROOT_OID, ObjectType::Root)?;
            let defaults: [(u32, u32, &str); 11] = [
                (ROOT_PG, 0, page::ROOT_DIR_ID),
                (ROOT_PG, ROOT_PG + 1, page::ROOT_INFO_ID),
                (ROOT_PG, ROOT_PG + 2, page::ROOT_QUOTA_ID),
                (ROOT_PG + 2, 0, page::ROOT_QUOTA_ID),
                (ROOT_PG, ROOT_PG + 3, page::ROOT_TMSTMP_ID),
                (ROOT_PG + 3, 0, page::ROOT_TMSTMP_ID),
                (ROOT_PG, ROOT_PG + 5, page::ROOT_POLICY_ID),
                (ROOT_PG + 5, 0, page::ROOT_POLICY_ID),
                (PARTITION_PG, 0, page::PARTITION_DIR_ID),
                (PARTITION_PG, PARTITION_PG + 1, page::PARTITION_INFO_ID),
                (PARTITION_PG + 1, 0, page::PARTITION_INFO_ID),
            ];
            for (pg, number, id) in defaults {
                txn.set_attr(ROOT_PID, ROOT_OID, pg, number, &id_value(id))?;
            }
            txn.set_attr(ROOT_PID, ROOT_OID, PARTITION_PG + 1, 1, &0u64.to_be_bytes())?;

            if let Some(name) = &osd_name {
                let mut value = name.as_bytes().to_vec();
                value.push(0);
                txn.set_attr(
                    ROOT_PID,
                    ROOT_OID,
                    page::ROOT_INFO_PG,
                    page::riap::OSD_NAME,
                    &value,
                )?;
            }
            Ok(())
        })?;
        info!("Initialised catalog defaults for {}", self.root.display());
        Ok(())
    }

    /// Facts about the root object, read in one transaction
    pub fn root_summary(&mut self) -> CmdResult<RootSummary> {
        let generation = self.generation();
        self.txn(|txn| {
            use page::{ROOT_INFO_PG, riap};

            let osd_name = txn
                .get_attr(ROOT_PID, ROOT_OID, ROOT_INFO_PG, riap::OSD_NAME)?
                .map(|v| {
                    let end = v.iter().position(|&b| b == 0).unwrap_or(v.len());
                    String::from_utf8_lossy(&v[..end]).into_owned()
                });
            let system_id = txn
                .get_attr(ROOT_PID, ROOT_OID, ROOT_INFO_PG, riap::OSD_SYSTEM_ID)?
                .unwrap_or_else(|| riap::DEFAULT_SYSTEM_ID.to_vec());
            Ok(RootSummary {
                osd_name,
                system_id,
                partitions: txn.partition_count()?,
                generation,
            })
        })
    }

    /// Drop every object and attribute, empty the data directories and
    /// write the defaults again.
    pub fn format(&mut self) -> CmdResult<()> {
        let generation = self.txn(|txn| Ok(txn.wipe()?))?;

        for dir in [DATA_DIR, STRANDED_DIR] {
            let path = self.root.join(dir);
            if let Err(e) = std::fs::remove_dir_all(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    error!("Failed to empty '{}': {}", path.display(), e);
                    return Err(Sense::resource().or_at(ROOT_PID, ROOT_OID));
                }
            }
        }
        prepare_layout(&self.root).map_err(|e| {
            error!("Failed to recreate layout under '{}': {}", self.root.display(), e);
            Sense::resource().or_at(ROOT_PID, ROOT_OID)
        })?;

        self.session = Session {
            action: self.session.action,
            ..Session::default()
        };
        self.initialize_db()?;
        info!(
            "Formatted OSD device at {} (catalog generation {})",
            self.root.display(),
            generation
        );
        Ok(())
    }
}

/// Resolve the type of (pid, oid) inside an open transaction
pub(crate) fn resolve_type(txn: &Txn, pid: u64, oid: u64) -> CmdResult<ObjectType> {
    match ObjectType::classify(pid, oid) {
        ObjectType::Illegal if pid >= OBJECT_PID_LB && oid >= USEROBJECT_OID_LB => {
            Ok(txn.object_type(pid, oid)?.unwrap_or(ObjectType::Illegal))
        }
        other => Ok(other),
    }
}

fn prepare_layout(root: &Path) -> Result<(), DeviceError> {
    let mkdir = |path: PathBuf| {
        std::fs::create_dir_all(&path).map_err(|source| DeviceError::Layout { path, source })
    };

    mkdir(root.to_path_buf())?;
    if !root.is_dir() {
        return Err(DeviceError::NotADirectory(root.to_path_buf()));
    }
    for bucket in 0..=0xffu32 {
        mkdir(root.join(DATA_DIR).join(format!("{bucket:02x}")))?;
    }
    mkdir(root.join(STRANDED_DIR))?;
    mkdir(root.join(MD_DIR))?;
    Ok(())
}

/// Remove an object's data file, logging instead of failing
pub(crate) fn discard_data(root: &Path, pid: u64, oid: u64) {
    if let Err(e) = blob::remove(root, pid, oid) {
        error!("Failed to remove data file of {:#x}:{:#x}: {}", pid, oid, e);
    }
}
