//! Per-object data files
//!
//! User object data lives in `root/dfiles/{oid & 0xff:02x}/{pid:x}.{oid:x}`.
//! Files are opened per command and closed when the handle drops.

use osdemu_common::{Error, Result};
use std::fs::{File, Metadata, OpenOptions};
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Directory holding the data file buckets
pub const DATA_DIR: &str = "dfiles";
/// Directory for files orphaned by interrupted commands
pub const STRANDED_DIR: &str = "stranded";
/// Directory holding the catalog
pub const MD_DIR: &str = "md";

/// Path of an object's data file
#[must_use]
pub fn data_path(root: &Path, pid: u64, oid: u64) -> PathBuf {
    root.join(DATA_DIR)
        .join(format!("{:02x}", oid & 0xff))
        .join(format!("{pid:x}.{oid:x}"))
}

/// Open handle on one object's data file
pub struct DataFile {
    file: File,
    path: PathBuf,
}

impl DataFile {
    /// Create a new, empty data file; fails if it already exists
    pub fn create(root: &Path, pid: u64, oid: u64) -> Result<Self> {
        let path = data_path(root, pid, oid);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| Error::Storage(format!("failed to create {}: {}", path.display(), e)))?;
        Ok(Self { file, path })
    }

    /// Open an existing data file for reading and writing
    pub fn open(root: &Path, pid: u64, oid: u64) -> Result<Self> {
        let path = data_path(root, pid, oid);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::DiskIo(e)
                } else {
                    Error::Storage(format!("failed to open {}: {}", path.display(), e))
                }
            })?;
        Ok(Self { file, path })
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current file metadata
    pub fn metadata(&self) -> Result<Metadata> {
        self.file.metadata().map_err(|e| {
            Error::Storage(format!(
                "failed to get metadata for {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    /// Current length in bytes
    pub fn len(&self) -> Result<u64> {
        Ok(self.metadata()?.len())
    }

    /// Read into `buf` at `offset` until it is full or the end of the file
    /// is reached; returns the bytes read
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let n = self
                .file
                .read_at(&mut buf[done..], offset + done as u64)
                .map_err(|e| {
                    Error::Storage(format!("read failed on {}: {}", self.path.display(), e))
                })?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }

    /// Write all of `data` at `offset`
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.write_all_at(data, offset).map_err(|e| {
            Error::Storage(format!("write failed on {}: {}", self.path.display(), e))
        })
    }

    /// Truncate or extend the file
    pub fn set_len(&self, len: u64) -> Result<()> {
        self.file.set_len(len).map_err(|e| {
            Error::Storage(format!(
                "failed to set size for {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    /// Sync data only (not metadata) to disk
    pub fn sync_data(&self) -> Result<()> {
        self.file.sync_data().map_err(|e| {
            Error::Storage(format!("sync_data failed on {}: {}", self.path.display(), e))
        })
    }
}

/// Whether an object's data file exists
#[must_use]
pub fn exists(root: &Path, pid: u64, oid: u64) -> bool {
    data_path(root, pid, oid).is_file()
}

/// Unlink an object's data file; returns whether it existed
pub fn remove(root: &Path, pid: u64, oid: u64) -> Result<bool> {
    let path = data_path(root, pid, oid);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::Storage(format!(
            "failed to remove {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Copy the data of `src` into the freshly created data file of `dst`
pub fn copy(root: &Path, src: (u64, u64), dst: (u64, u64)) -> Result<u64> {
    let from = data_path(root, src.0, src.1);
    let to = data_path(root, dst.0, dst.1);
    std::fs::copy(&from, &to).map_err(|e| {
        Error::Storage(format!(
            "failed to copy {} to {}: {}",
            from.display(),
            to.display(),
            e
        ))
    })
}

/// Bytes allocated to a file on disk
#[must_use]
pub fn allocated_bytes(meta: &Metadata) -> u64 {
    meta.blocks().saturating_mul(512)
}

/// Timestamps of a data or catalog file in milliseconds since the epoch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileTimes {
    pub ctime: u64,
    pub atime: u64,
    pub mtime: u64,
}

impl FileTimes {
    /// Collect the times of `path`
    pub fn of(path: &Path) -> Result<Self> {
        let meta = std::fs::metadata(path).map_err(|e| {
            Error::Storage(format!(
                "failed to get metadata for {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Self::from_metadata(&meta))
    }

    /// Collect the times from already fetched metadata
    #[must_use]
    pub fn from_metadata(meta: &Metadata) -> Self {
        Self {
            ctime: millis(meta.ctime(), meta.ctime_nsec()),
            atime: millis(meta.atime(), meta.atime_nsec()),
            mtime: millis(meta.mtime(), meta.mtime_nsec()),
        }
    }
}

fn millis(secs: i64, nsecs: i64) -> u64 {
    let secs = u64::try_from(secs).unwrap_or(0);
    let nsecs = u64::try_from(nsecs).unwrap_or(0);
    secs.saturating_mul(1000).saturating_add(nsecs / 1_000_000)
}

/// Current wall clock in milliseconds since the epoch
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Capacity of the filesystem holding the device root
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsCapacity {
    pub total: u64,
    pub used: u64,
}

impl FsCapacity {
    /// Query the filesystem holding `path`
    #[allow(clippy::unnecessary_cast, clippy::useless_conversion)]
    pub fn of(path: &Path) -> Result<Self> {
        let vfs = nix::sys::statvfs::statvfs(path).map_err(|e| {
            Error::Storage(format!("statvfs failed on {}: {}", path.display(), e))
        })?;
        let frsize = vfs.fragment_size() as u64;
        let blocks = vfs.blocks() as u64;
        let free = vfs.blocks_free() as u64;
        Ok(Self {
            total: blocks.saturating_mul(frsize),
            used: blocks.saturating_sub(free).saturating_mul(frsize),
        })
    }
}
