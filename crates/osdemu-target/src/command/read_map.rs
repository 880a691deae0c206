//! READ_MAP: written-data map of a user object

use crate::blob::DataFile;
use crate::device::OsdDevice;
use crate::sense::{CmdResult, Sense};
use osdemu_common::wire::{put_be16, put_be32, put_be64};
use osdemu_common::{ObjectType, USEROBJECT_OID_LB, USEROBJECT_PID_LB, map_type};

/// Map header: be64 additional length
const MAP_HDR_LEN: usize = 8;
/// One extent descriptor
const DESCRIPTOR_LEN: usize = 16;
/// Smallest allocation holding the header and one descriptor
const MIN_ALLOC: usize = 24;

impl OsdDevice {
    /// Describe the data from `offset` to the end of the object as extents
    /// of at most `read_map_chunk` bytes; returns the bytes of `out` used
    pub fn read_map(
        &mut self,
        pid: u64,
        oid: u64,
        offset: u64,
        kind: u16,
        out: &mut [u8],
    ) -> CmdResult<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if out.len() < MIN_ALLOC || pid < USEROBJECT_PID_LB || oid < USEROBJECT_OID_LB {
            return Err(Sense::cdb(pid, oid));
        }
        let file = DataFile::open(self.root(), pid, oid).map_err(|_| Sense::cdb(pid, oid))?;
        let size = file.len().map_err(|_| Sense::hw(pid, oid))?;
        if offset > size {
            return Err(Sense::cdb(pid, oid));
        }
        if kind != map_type::WRITTEN_DATA {
            return Err(Sense::unimplemented(pid, oid));
        }

        out.fill(0);
        let chunk = u64::from(self.config().read_map_chunk.max(1));
        let (mut at, mut pos) = (offset, MAP_HDR_LEN);
        while at < size && out.len() - pos >= DESCRIPTOR_LEN {
            let extent = (size - at).min(chunk);
            put_be16(out, pos + 2, kind)?;
            #[allow(clippy::cast_possible_truncation)]
            put_be32(out, pos + 4, extent as u32)?;
            put_be64(out, pos + 8, at)?;
            pos += DESCRIPTOR_LEN;
            at += extent;
        }
        put_be64(out, 0, map_add_len(size - offset, chunk))?;

        self.set_ccap(ObjectType::UserObject, pid, oid, 0);
        Ok(pos)
    }
}

/// Additional length of a map describing `span` bytes in `chunk` sized
/// extents, clipped to 32 bits
fn map_add_len(span: u64, chunk: u64) -> u64 {
    span.div_ceil(chunk)
        .saturating_mul(DESCRIPTOR_LEN as u64)
        .min(0xFFFF_FFFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Layout;
    use crate::device::tests::open_device;
    use osdemu_common::wire::{be32, be64};

    const PID: u64 = 0x10000;

    fn prepare(device: &mut OsdDevice, len: usize) -> u64 {
        device.create_partition(PID).unwrap();
        let oid = device.create(PID, 0, 1).unwrap()[0];
        let data = vec![1u8; len];
        device
            .write(PID, oid, 0, len as u64, Layout::Contiguous, &data)
            .unwrap();
        oid
    }

    #[test]
    fn test_read_map_descriptors() {
        let (_dir, mut device) = open_device();
        let oid = prepare(&mut device, 10);

        let mut out = [0u8; 64];
        let used = device
            .read_map(PID, oid, 0, map_type::WRITTEN_DATA, &mut out)
            .unwrap();
        assert_eq!(used, 8 + 3 * 16);
        assert_eq!(be64(&out, 0).unwrap(), 48);
        assert_eq!(be32(&out, 8 + 4).unwrap(), 4);
        assert_eq!(be64(&out, 8 + 8).unwrap(), 0);
        assert_eq!(be64(&out, 24 + 8).unwrap(), 4);
        assert_eq!(be32(&out, 40 + 4).unwrap(), 2);
        assert_eq!(be64(&out, 40 + 8).unwrap(), 8);
    }

    #[test]
    fn test_read_map_bounded_by_allocation() {
        let (_dir, mut device) = open_device();
        let oid = prepare(&mut device, 10);

        let mut out = [0u8; 30];
        let used = device
            .read_map(PID, oid, 2, map_type::WRITTEN_DATA, &mut out)
            .unwrap();
        assert_eq!(used, 24);
        assert_eq!(be64(&out, 0).unwrap(), 32);
        assert_eq!(be64(&out, 16).unwrap(), 2);
    }

    #[test]
    fn test_read_map_large_sparse_object() {
        let (_dir, mut device) = open_device();
        let oid = prepare(&mut device, 10);
        let size = 6u64 << 30;
        DataFile::open(device.root(), PID, oid)
            .unwrap()
            .set_len(size)
            .unwrap();

        let mut out = [0u8; MIN_ALLOC];
        let used = device
            .read_map(PID, oid, 0, map_type::WRITTEN_DATA, &mut out)
            .unwrap();
        assert_eq!(used, MIN_ALLOC);
        assert_eq!(be64(&out, 0).unwrap(), 0xFFFF_FFFF);
        assert_eq!(be32(&out, 8 + 4).unwrap(), 4);

        // a tail small enough not to clip
        let offset = size - 4096 - 2;
        let used = device
            .read_map(PID, oid, offset, map_type::WRITTEN_DATA, &mut out)
            .unwrap();
        assert_eq!(used, MIN_ALLOC);
        assert_eq!(be64(&out, 0).unwrap(), 1025 * 16);
        assert_eq!(be64(&out, 8 + 8).unwrap(), offset);
    }

    #[test]
    fn test_map_add_len() {
        assert_eq!(map_add_len(0, 4), 0);
        assert_eq!(map_add_len(10, 4), 48);
        assert_eq!(map_add_len(8, 4), 32);
        assert_eq!(map_add_len(u64::MAX, 1), 0xFFFF_FFFF);
    }

    #[test]
    fn test_read_map_checks() {
        let (_dir, mut device) = open_device();
        let oid = prepare(&mut device, 4);

        assert_eq!(device.read_map(PID, oid, 0, 1, &mut []).unwrap(), 0);
        let mut small = [0u8; 16];
        assert!(device.read_map(PID, oid, 0, 1, &mut small).is_err());

        let mut out = [0u8; 32];
        assert_eq!(
            device.read_map(PID, oid, 5, 1, &mut out).unwrap_err(),
            Sense::cdb(PID, oid)
        );
        assert_eq!(
            device
                .read_map(PID, oid, 0, map_type::DATA_HOLE, &mut out)
                .unwrap_err(),
            Sense::unimplemented(PID, oid)
        );
        // nothing past the end
        assert_eq!(device.read_map(PID, oid, 4, 1, &mut out).unwrap(), 8);
    }
}
