//! Data commands on user object files
//!
//! READ, WRITE and APPEND support three data-delivery topologies. Contiguous
//! transfers move `len` bytes at `offset`. Scatter-gather transfers move one
//! segment per [`Extent`], each relative to the command offset, packed back
//! to back in the data buffer. Vector transfers start the data-out buffer with
//! a be64 stride and a be64 segment length and place a segment every stride
//! bytes.

use super::to_usize;
use crate::blob::DataFile;
use crate::device::OsdDevice;
use crate::sense::{CmdResult, Sense};
use osdemu_common::wire::be64;
use osdemu_common::{ObjectType, USEROBJECT_OID_LB, USEROBJECT_PID_LB};
use std::path::Path;
use tracing::debug;

/// Block size for zeroing and shifting file ranges
const CHUNK: usize = 64 * 1024;
/// Vector header: be64 stride, be64 segment length
const VECTOR_HDR_LEN: usize = 16;

/// One scatter-gather segment, relative to the command offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub offset: u64,
    pub length: u64,
}

/// Data-delivery topology of one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout<'a> {
    Contiguous,
    ScatterGather(&'a [Extent]),
    Vector,
}

/// Outcome of a read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    /// Bytes of output produced
    pub used: usize,
    /// Recovered-error sense to report with the output
    pub recovered: Option<Sense>,
}

#[derive(Debug, Clone, Copy)]
struct Stride {
    stride: u64,
    segment: usize,
}

impl Stride {
    fn parse(input: &[u8], pid: u64, oid: u64) -> CmdResult<Self> {
        let stride = be64(input, 0).map_err(|_| Sense::bad_cdb(pid, oid))?;
        let segment = be64(input, 8).map_err(|_| Sense::bad_cdb(pid, oid))?;
        if segment == 0 || stride < segment {
            return Err(Sense::cdb(pid, oid));
        }
        Ok(Self {
            stride,
            segment: to_usize(segment, pid, oid)?,
        })
    }

    /// Object offset of the `index`th segment
    fn at(self, base: u64, index: usize, pid: u64, oid: u64) -> CmdResult<u64> {
        u64::try_from(index)
            .ok()
            .and_then(|i| i.checked_mul(self.stride))
            .and_then(|rel| rel.checked_add(base))
            .ok_or(Sense::cdb(pid, oid))
    }
}

fn open_object(root: &Path, pid: u64, oid: u64) -> CmdResult<DataFile> {
    if pid < USEROBJECT_PID_LB || oid < USEROBJECT_OID_LB {
        return Err(Sense::cdb(pid, oid));
    }
    DataFile::open(root, pid, oid).map_err(|e| {
        debug!("No data file for {:#x}:{:#x}: {}", pid, oid, e);
        Sense::cdb(pid, oid)
    })
}

/// Write the data-out buffer of a WRITE or APPEND at `offset`
fn put(
    file: &DataFile,
    offset: u64,
    len: u64,
    layout: Layout<'_>,
    input: &[u8],
    (pid, oid): (u64, u64),
) -> CmdResult<()> {
    let hw = |_| Sense::hw(pid, oid);
    match layout {
        Layout::Contiguous => {
            let data = input
                .get(..to_usize(len, pid, oid)?)
                .ok_or(Sense::bad_cdb(pid, oid))?;
            file.write_at(offset, data).map_err(hw)
        }
        Layout::ScatterGather(extents) => {
            if (input.len() as u64) < len {
                return Err(Sense::bad_cdb(pid, oid));
            }
            let mut pos = 0usize;
            for ext in extents {
                let end = pos
                    .checked_add(to_usize(ext.length, pid, oid)?)
                    .ok_or(Sense::cdb(pid, oid))?;
                let data = input.get(pos..end).ok_or(Sense::bad_cdb(pid, oid))?;
                let at = offset.checked_add(ext.offset).ok_or(Sense::cdb(pid, oid))?;
                file.write_at(at, data).map_err(hw)?;
                pos = end;
            }
            Ok(())
        }
        Layout::Vector => {
            // `len` counts the vector header
            let body = input
                .get(VECTOR_HDR_LEN..to_usize(len, pid, oid)?)
                .ok_or(Sense::bad_cdb(pid, oid))?;
            let stride = Stride::parse(input, pid, oid)?;
            for (i, segment) in body.chunks(stride.segment).enumerate() {
                file.write_at(stride.at(offset, i, pid, oid)?, segment)
                    .map_err(hw)?;
            }
            Ok(())
        }
    }
}

impl OsdDevice {
    /// READ `len` bytes at `offset` into `out`.
    ///
    /// A short contiguous or scatter-gather read zero-fills what the object
    /// could not provide and reports the bytes actually read in a recovered
    /// error.
    #[allow(clippy::too_many_arguments)]
    pub fn read(
        &mut self,
        pid: u64,
        oid: u64,
        offset: u64,
        len: u64,
        layout: Layout<'_>,
        input: &[u8],
        out: &mut [u8],
    ) -> CmdResult<Transfer> {
        let file = open_object(self.root(), pid, oid)?;
        let hw = |_| Sense::hw(pid, oid);

        let transfer = match layout {
            Layout::Contiguous => {
                let want = to_usize(len, pid, oid)?;
                let buf = out.get_mut(..want).ok_or(Sense::cdb(pid, oid))?;
                let n = file.read_at(offset, buf).map_err(hw)?;
                buf[n..].fill(0);
                Transfer {
                    used: want,
                    recovered: (n < want).then(|| Sense::read_past_end(pid, oid, n as u64)),
                }
            }
            Layout::ScatterGather(extents) => {
                let (mut pos, mut read) = (0usize, 0u64);
                for ext in extents {
                    let end = pos
                        .checked_add(to_usize(ext.length, pid, oid)?)
                        .ok_or(Sense::cdb(pid, oid))?;
                    let buf = out.get_mut(pos..end).ok_or(Sense::cdb(pid, oid))?;
                    let at = offset.checked_add(ext.offset).ok_or(Sense::cdb(pid, oid))?;
                    let n = file.read_at(at, buf).map_err(hw)?;
                    buf[n..].fill(0);
                    read += n as u64;
                    pos = end;
                }
                Transfer {
                    used: pos,
                    recovered: (read < len).then(|| Sense::read_past_end(pid, oid, read)),
                }
            }
            Layout::Vector => {
                let stride = Stride::parse(input, pid, oid)?;
                let want = to_usize(len, pid, oid)?;
                let buf = out.get_mut(..want).ok_or(Sense::cdb(pid, oid))?;
                for (i, segment) in buf.chunks_mut(stride.segment).enumerate() {
                    let n = file.read_at(stride.at(offset, i, pid, oid)?, segment).map_err(hw)?;
                    if n != segment.len() {
                        return Err(Sense::hw(pid, oid));
                    }
                }
                Transfer {
                    used: want,
                    recovered: None,
                }
            }
        };

        self.set_ccap(ObjectType::UserObject, pid, oid, 0);
        Ok(transfer)
    }

    /// WRITE `len` bytes of `input` at `offset`
    pub fn write(
        &mut self,
        pid: u64,
        oid: u64,
        offset: u64,
        len: u64,
        layout: Layout<'_>,
        input: &[u8],
    ) -> CmdResult<()> {
        let file = open_object(self.root(), pid, oid)?;
        put(&file, offset, len, layout, input, (pid, oid))?;
        self.set_ccap(ObjectType::UserObject, pid, oid, 0);
        Ok(())
    }

    /// APPEND `len` bytes of `input` at the current end of the object
    pub fn append(
        &mut self,
        pid: u64,
        oid: u64,
        len: u64,
        layout: Layout<'_>,
        input: &[u8],
    ) -> CmdResult<()> {
        let file = open_object(self.root(), pid, oid)?;
        let end = file.len().map_err(|_| Sense::hw(pid, oid))?;
        put(&file, end, len, layout, input, (pid, oid))?;
        self.set_ccap(ObjectType::UserObject, pid, oid, end);
        Ok(())
    }

    /// CLEAR: write `len` zero bytes at `offset`
    pub fn clear(&mut self, pid: u64, oid: u64, offset: u64, len: u64) -> CmdResult<()> {
        let file = open_object(self.root(), pid, oid)?;
        let zeros = vec![0u8; CHUNK];
        let mut done = 0u64;
        while done < len {
            let step = (len - done).min(CHUNK as u64);
            let at = offset.checked_add(done).ok_or(Sense::cdb(pid, oid))?;
            file.write_at(at, &zeros[..step as usize])
                .map_err(|_| Sense::hw(pid, oid))?;
            done += step;
        }
        self.set_ccap(ObjectType::UserObject, pid, oid, 0);
        Ok(())
    }

    /// PUNCH: remove `len` bytes at `offset`, shifting the tail left
    pub fn punch(&mut self, pid: u64, oid: u64, offset: u64, len: u64) -> CmdResult<()> {
        let file = open_object(self.root(), pid, oid)?;
        let hw = |_| Sense::hw(pid, oid);
        let size = file.len().map_err(hw)?;
        if offset > size {
            return Err(Sense::cdb(pid, oid));
        }

        let tail = offset.saturating_add(len);
        if tail >= size {
            file.set_len(offset).map_err(hw)?;
        } else {
            let mut buf = vec![0u8; CHUNK];
            let (mut from, mut to) = (tail, offset);
            while from < size {
                let step = (size - from).min(CHUNK as u64) as usize;
                let n = file.read_at(from, &mut buf[..step]).map_err(hw)?;
                if n != step {
                    return Err(Sense::hw(pid, oid));
                }
                file.write_at(to, &buf[..step]).map_err(hw)?;
                from += step as u64;
                to += step as u64;
            }
            file.set_len(size - len).map_err(hw)?;
        }
        self.set_ccap(ObjectType::UserObject, pid, oid, 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::open_device;
    use osdemu_common::{Asc, SenseKey};

    const PID: u64 = 0x10000;

    fn prepare(device: &mut OsdDevice) -> u64 {
        device.create_partition(PID).unwrap();
        device.create(PID, 0, 1).unwrap()[0]
    }

    fn contents(device: &mut OsdDevice, oid: u64) -> Vec<u8> {
        std::fs::read(crate::blob::data_path(device.root(), PID, oid)).unwrap()
    }

    fn vector_input(stride: u64, segment: u64, data: &[u8]) -> Vec<u8> {
        let mut input = stride.to_be_bytes().to_vec();
        input.extend_from_slice(&segment.to_be_bytes());
        input.extend_from_slice(data);
        input
    }

    #[test]
    fn test_short_read_is_recovered() {
        let (_dir, mut device) = open_device();
        let oid = prepare(&mut device);
        let data = b"The Rain in Spain ... ";
        assert_eq!(data.len(), 22);
        device.write(PID, oid, 0, 22, Layout::Contiguous, data).unwrap();

        let mut out = vec![0xAAu8; 256];
        let transfer = device
            .read(PID, oid, 0, 256, Layout::Contiguous, &[], &mut out)
            .unwrap();
        assert_eq!(transfer.used, 256);
        assert_eq!(&out[..22], data);
        assert!(out[22..].iter().all(|&b| b == 0));

        let sense = transfer.recovered.unwrap();
        assert_eq!(sense.key, SenseKey::RecoveredError);
        assert_eq!(sense.asc, Asc::READ_PAST_END_OF_USER_OBJECT);
        assert_eq!(sense.csi, Some(22));
        assert_eq!(device.ccap().oid, oid);
    }

    #[test]
    fn test_full_read_has_no_sense() {
        let (_dir, mut device) = open_device();
        let oid = prepare(&mut device);
        device.write(PID, oid, 4, 4, Layout::Contiguous, b"abcd").unwrap();
        let mut out = [0u8; 8];
        let transfer = device
            .read(PID, oid, 0, 8, Layout::Contiguous, &[], &mut out)
            .unwrap();
        assert_eq!(transfer.recovered, None);
        assert_eq!(&out, b"\0\0\0\0abcd");
    }

    #[test]
    fn test_write_checks() {
        let (_dir, mut device) = open_device();
        let oid = prepare(&mut device);

        let err = device
            .write(PID, oid, 0, 10, Layout::Contiguous, b"short")
            .unwrap_err();
        assert_eq!(err, Sense::bad_cdb(PID, oid));
        assert_eq!(err.asc, Asc::NONE);

        let err = device
            .write(PID, oid + 1, 0, 1, Layout::Contiguous, b"x")
            .unwrap_err();
        assert_eq!(err, Sense::cdb(PID, oid + 1));
        assert!(device.write(PID, 5, 0, 1, Layout::Contiguous, b"x").is_err());
    }

    #[test]
    fn test_append_records_offset() {
        let (_dir, mut device) = open_device();
        let oid = prepare(&mut device);
        device.append(PID, oid, 3, Layout::Contiguous, b"abc").unwrap();
        assert_eq!(device.ccap().append_off, 0);
        device.append(PID, oid, 2, Layout::Contiguous, b"de").unwrap();
        assert_eq!(device.ccap().append_off, 3);
        assert_eq!(contents(&mut device, oid), b"abcde");
    }

    #[test]
    fn test_scatter_gather_transfer() {
        let (_dir, mut device) = open_device();
        let oid = prepare(&mut device);
        let extents = [
            Extent { offset: 0, length: 2 },
            Extent { offset: 6, length: 3 },
        ];
        device
            .write(PID, oid, 10, 5, Layout::ScatterGather(&extents), b"ab123")
            .unwrap();
        let stored = contents(&mut device, oid);
        assert_eq!(stored.len(), 19);
        assert_eq!(&stored[10..12], b"ab");
        assert_eq!(&stored[16..19], b"123");

        let mut out = [0u8; 5];
        let transfer = device
            .read(PID, oid, 10, 5, Layout::ScatterGather(&extents), &[], &mut out)
            .unwrap();
        assert_eq!(transfer, Transfer { used: 5, recovered: None });
        assert_eq!(&out, b"ab123");

        // the second segment runs past the end
        let extents = [Extent { offset: 0, length: 2 }, Extent { offset: 8, length: 4 }];
        let mut out = [0xFFu8; 6];
        let transfer = device
            .read(PID, oid, 10, 6, Layout::ScatterGather(&extents), &[], &mut out)
            .unwrap();
        assert_eq!(transfer.used, 6);
        assert_eq!(&out, b"ab3\0\0\0");
        assert_eq!(transfer.recovered.unwrap().csi, Some(3));
    }

    #[test]
    fn test_vector_transfer() {
        let (_dir, mut device) = open_device();
        let oid = prepare(&mut device);
        let input = vector_input(4, 2, b"aabbcc");
        device
            .write(PID, oid, 0, input.len() as u64, Layout::Vector, &input)
            .unwrap();
        assert_eq!(contents(&mut device, oid), b"aa\0\0bb\0\0cc");

        let header = vector_input(4, 2, b"");
        let mut out = [0u8; 6];
        let transfer = device
            .read(PID, oid, 0, 6, Layout::Vector, &header, &mut out)
            .unwrap();
        assert_eq!(transfer.used, 6);
        assert_eq!(&out, b"aabbcc");

        let bad = vector_input(1, 2, b"");
        assert_eq!(
            device.read(PID, oid, 0, 6, Layout::Vector, &bad, &mut out).unwrap_err(),
            Sense::cdb(PID, oid)
        );
        // segments must be complete
        assert_eq!(
            device.read(PID, oid, 4, 6, Layout::Vector, &header, &mut out).unwrap_err(),
            Sense::hw(PID, oid)
        );
    }

    #[test]
    fn test_clear() {
        let (_dir, mut device) = open_device();
        let oid = prepare(&mut device);
        device.write(PID, oid, 0, 6, Layout::Contiguous, b"abcdef").unwrap();
        device.clear(PID, oid, 2, 2).unwrap();
        assert_eq!(contents(&mut device, oid), b"ab\0\0ef");
        device.clear(PID, oid, 8, 2).unwrap();
        assert_eq!(contents(&mut device, oid).len(), 10);
    }

    #[test]
    fn test_punch() {
        let (_dir, mut device) = open_device();
        let oid = prepare(&mut device);
        device.write(PID, oid, 0, 10, Layout::Contiguous, b"0123456789").unwrap();

        // interior range shifts the tail
        device.punch(PID, oid, 2, 3).unwrap();
        assert_eq!(contents(&mut device, oid), b"0156789");

        // range reaching the end truncates
        device.punch(PID, oid, 4, 100).unwrap();
        assert_eq!(contents(&mut device, oid), b"0156");

        // offset at the end is a no-op truncate
        device.punch(PID, oid, 4, 1).unwrap();
        assert_eq!(contents(&mut device, oid), b"0156");

        assert_eq!(device.punch(PID, oid, 5, 1).unwrap_err(), Sense::cdb(PID, oid));
    }
}
