//! COPY_USER_OBJECTS

use crate::blob;
use crate::command::create::{Allocation, CreatedFiles, allocate};
use crate::device::OsdDevice;
use crate::sense::{CmdResult, Sense};
use osdemu_common::page::PARTITION_PG;
use osdemu_common::{ObjectType, USEROBJECT_OID_LB, USEROBJECT_PID_LB};
use tracing::{debug, error};

/// Body length of a copy user object source descriptor
pub const COPY_SOURCE_LEN: usize = 18;

/// Source of a copy, as carried in the continuation segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopySource {
    pub pid: u64,
    pub oid: u64,
    /// Copy the stored user object attributes as well as the data
    pub copy_attrs: bool,
    /// Requested freezing of the source; accepted and not acted on
    pub freeze: bool,
}

impl CopySource {
    /// Decode a descriptor body
    #[must_use]
    pub fn parse(body: &[u8]) -> Option<Self> {
        let body = body.get(..COPY_SOURCE_LEN)?;
        let pid = u64::from_be_bytes(body[0..8].try_into().ok()?);
        let oid = u64::from_be_bytes(body[8..16].try_into().ok()?);
        let flags = body[16];
        Some(Self {
            pid,
            oid,
            copy_attrs: flags & 0x1 != 0,
            freeze: flags & 0x2 != 0,
        })
    }
}

impl OsdDevice {
    /// Copy a user object into a new object of `pid`; returns the new id
    pub fn copy_user_object(
        &mut self,
        pid: u64,
        requested: u64,
        source: &CopySource,
    ) -> CmdResult<u64> {
        if pid < USEROBJECT_PID_LB || (requested != 0 && requested < USEROBJECT_OID_LB) {
            return Err(Sense::cdb(pid, requested));
        }
        let (src_pid, src_oid) = (source.pid, source.oid);
        if self.object_type(src_pid, src_oid)? != ObjectType::UserObject {
            return Err(Sense::cdb(src_pid, src_oid));
        }

        let alloc = Allocation {
            obj_type: ObjectType::UserObject,
            pid,
            requested,
            count: 1,
            lower: USEROBJECT_OID_LB,
        };
        let mut files = CreatedFiles::new(self.root(), pid);
        let result = self.txn_with(|txn, root, session| {
            let oid = allocate(txn, root, session, &alloc, &mut files)?
                .first()
                .copied()
                .ok_or_else(Sense::resource)?;
            let bytes = blob::copy(root, (src_pid, src_oid), (pid, oid)).map_err(|e| {
                error!("Failed to copy {:#x}:{:#x}: {}", src_pid, src_oid, e);
                Sense::hw(pid, oid)
            })?;

            let mut copied = 0;
            if source.copy_attrs {
                for attr in txn.all_attrs(src_pid, src_oid)? {
                    if attr.page < PARTITION_PG {
                        txn.set_attr(pid, oid, attr.page, attr.number, &attr.value)?;
                        copied += 1;
                    }
                }
            }
            debug!(
                "Copied {:#x}:{:#x} to {:#x}:{:#x}, {} byte(s) and {} attribute(s)",
                src_pid, src_oid, pid, oid, bytes, copied
            );
            Ok(oid)
        });
        let oid = result.inspect_err(|_| self.invalidate_id_cache())?;
        files.keep();
        self.set_ccap(ObjectType::UserObject, pid, oid, 0);
        Ok(oid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Layout;
    use crate::device::tests::open_device;

    const PID: u64 = 0x10000;

    fn source(oid: u64, flags: u8) -> CopySource {
        let mut body = [0u8; 24];
        body[..8].copy_from_slice(&PID.to_be_bytes());
        body[8..16].copy_from_slice(&oid.to_be_bytes());
        body[16] = flags;
        CopySource::parse(&body).unwrap()
    }

    #[test]
    fn test_parse_copy_source() {
        let src = source(0x10005, 0x3);
        assert_eq!(src.pid, PID);
        assert_eq!(src.oid, 0x10005);
        assert!(src.copy_attrs && src.freeze);
        assert!(CopySource::parse(&[0u8; 17]).is_none());
    }

    #[test]
    fn test_copy_data_and_attributes() {
        let (_dir, mut device) = open_device();
        device.create_partition(PID).unwrap();
        let oid = device.create(PID, 0, 1).unwrap()[0];
        device.write(PID, oid, 0, 5, Layout::Contiguous, b"hello").unwrap();
        device.set_attrs(PID, &[oid], &[(0x1_0000, 2, b"v")], false).unwrap();

        let plain = device.copy_user_object(PID, 0, &source(oid, 0)).unwrap();
        let full = device.copy_user_object(PID, 0, &source(oid, 1)).unwrap();
        assert_eq!(device.ccap().oid, full);

        let mut out = [0u8; 5];
        device
            .read(PID, full, 0, 5, Layout::Contiguous, &[], &mut out)
            .unwrap();
        assert_eq!(&out, b"hello");

        let (a, b) = device
            .txn(|txn| {
                Ok((
                    txn.get_attr(PID, plain, 0x1_0000, 2)?,
                    txn.get_attr(PID, full, 0x1_0000, 2)?,
                ))
            })
            .unwrap();
        assert_eq!(a, None);
        assert_eq!(b, Some(b"v".to_vec()));
    }

    #[test]
    fn test_copy_checks() {
        let (_dir, mut device) = open_device();
        device.create_partition(PID).unwrap();
        let oid = device.create(PID, 0, 1).unwrap()[0];

        assert!(device.copy_user_object(PID, 0, &source(oid + 9, 0)).is_err());
        assert!(device.copy_user_object(PID + 1, 0, &source(oid, 0)).is_err());
        assert!(device.copy_user_object(PID, oid, &source(oid, 0)).is_err());
        assert!(!blob::exists(device.root(), PID + 1, USEROBJECT_OID_LB));
    }
}
