//! Wire codec for OSD attribute lists and CDB fields
//!
//! Attribute list entries carry a 10-byte header (page, number, be16 length)
//! followed by the value and zero padding up to the next 8-byte boundary. The
//! multi-object variant prefixes the header with a be64 object id. Lists start
//! with an 8-byte header holding the list type and a be32 length.

use crate::error::{Error, Result};
use crate::types::{ListFormat, OFFSET_UNUSED};
use bytes::{Buf, BufMut};

/// Attribute entry header length
pub const LE_HDR_LEN: usize = 10;
/// Multi-object attribute entry header length
pub const MLE_HDR_LEN: usize = 18;
/// Attribute list header length
pub const LIST_HDR_LEN: usize = 8;
/// Retrieve-list entry length (page, number)
pub const RETRIEVE_ENTRY_LEN: usize = 8;
/// Length field value reported for an attribute that is not defined
pub const NULL_ATTR_LEN: u16 = 0xFFFF;

/// Round `n` up to the next multiple of 8
#[must_use]
pub const fn roundup8(n: usize) -> usize {
    (n + 7) & !7
}

/// Padded on-wire length of an entry carrying `value_len` bytes
#[must_use]
pub const fn entry_len(value_len: usize) -> usize {
    roundup8(LE_HDR_LEN + value_len)
}

/// One decoded attribute list entry, borrowing its value from the input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrEntry<'a> {
    pub page: u32,
    pub number: u32,
    pub value: &'a [u8],
}

/// Pack one attribute entry into `buf`.
///
/// The value is truncated to the room left after the header while the length
/// field keeps the full value length. Returns the bytes consumed including
/// padding, bounded by `buf.len()`.
pub fn pack_attr(buf: &mut [u8], page: u32, number: u32, value: &[u8]) -> Result<usize> {
    if buf.len() < LE_HDR_LEN {
        return Err(Error::Overflow {
            needed: LE_HDR_LEN,
            available: buf.len(),
        });
    }
    let vlen = checked_value_len(value)?;

    let mut hdr = &mut buf[..LE_HDR_LEN];
    hdr.put_u32(page);
    hdr.put_u32(number);
    hdr.put_u16(vlen);

    Ok(pack_value(&mut buf[LE_HDR_LEN..], value) + LE_HDR_LEN)
}

/// Pack one multi-object attribute entry (be64 oid prefix) into `buf`
pub fn pack_multiobj_attr(
    buf: &mut [u8],
    oid: u64,
    page: u32,
    number: u32,
    value: &[u8],
) -> Result<usize> {
    if buf.len() < MLE_HDR_LEN {
        return Err(Error::Overflow {
            needed: MLE_HDR_LEN,
            available: buf.len(),
        });
    }
    let vlen = checked_value_len(value)?;

    let mut hdr = &mut buf[..MLE_HDR_LEN];
    hdr.put_u64(oid);
    hdr.put_u32(page);
    hdr.put_u32(number);
    hdr.put_u16(vlen);

    Ok(pack_value(&mut buf[MLE_HDR_LEN..], value) + MLE_HDR_LEN)
}

fn checked_value_len(value: &[u8]) -> Result<u16> {
    match u16::try_from(value.len()) {
        Ok(len) if len != NULL_ATTR_LEN => Ok(len),
        _ => Err(Error::invalid_param_list(format!(
            "attribute value of {} bytes exceeds the list entry limit",
            value.len()
        ))),
    }
}

// Copies as much of the value as fits, then zero pads to the 8-byte boundary
// of the whole entry (header lengths are 2 mod 8).
fn pack_value(room: &mut [u8], value: &[u8]) -> usize {
    let copied = value.len().min(room.len());
    room[..copied].copy_from_slice(&value[..copied]);
    let padded = (roundup8(LE_HDR_LEN + copied) - LE_HDR_LEN).min(room.len());
    room[copied..padded].fill(0);
    padded
}

/// Decode one attribute entry from the front of `buf`.
///
/// Returns the entry and the number of bytes it occupies including padding.
/// Trailing padding may be missing on the last entry of a list.
pub fn unpack_attr(buf: &[u8]) -> Result<(AttrEntry<'_>, usize)> {
    if buf.len() < LE_HDR_LEN {
        return Err(Error::Truncated {
            needed: LE_HDR_LEN,
            available: buf.len(),
        });
    }
    let mut hdr = &buf[..LE_HDR_LEN];
    let page = hdr.get_u32();
    let number = hdr.get_u32();
    let raw_len = hdr.get_u16();
    let vlen = if raw_len == NULL_ATTR_LEN {
        0
    } else {
        usize::from(raw_len)
    };

    let end = LE_HDR_LEN + vlen;
    if buf.len() < end {
        return Err(Error::Truncated {
            needed: end,
            available: buf.len(),
        });
    }
    let entry = AttrEntry {
        page,
        number,
        value: &buf[LE_HDR_LEN..end],
    };
    Ok((entry, roundup8(end).min(buf.len())))
}

/// Iterate over the entries of a set or retrieved list body
pub fn unpack_entries(mut body: &[u8]) -> Result<Vec<AttrEntry<'_>>> {
    let mut entries = Vec::new();
    while !body.is_empty() {
        let (entry, used) = unpack_attr(body)?;
        entries.push(entry);
        body = &body[used..];
    }
    Ok(entries)
}

/// Decode the (page, number) pairs of a retrieve list body
pub fn unpack_retrieve_list(body: &[u8]) -> Result<Vec<(u32, u32)>> {
    if body.len() % RETRIEVE_ENTRY_LEN != 0 {
        return Err(Error::invalid_param_list(format!(
            "retrieve list length {} is not a multiple of {}",
            body.len(),
            RETRIEVE_ENTRY_LEN
        )));
    }
    Ok(body
        .chunks_exact(RETRIEVE_ENTRY_LEN)
        .map(|mut c| (c.get_u32(), c.get_u32()))
        .collect())
}

/// Write an attribute list header
pub fn put_list_header(buf: &mut [u8], format: ListFormat, len: u32) -> Result<()> {
    if buf.len() < LIST_HDR_LEN {
        return Err(Error::Overflow {
            needed: LIST_HDR_LEN,
            available: buf.len(),
        });
    }
    let mut hdr = &mut buf[..LIST_HDR_LEN];
    hdr.put_u8(format as u8);
    hdr.put_bytes(0, 3);
    hdr.put_u32(len);
    Ok(())
}

/// Read an attribute list header, returning the raw type nibble and length
pub fn get_list_header(buf: &[u8]) -> Result<(u8, u32)> {
    if buf.len() < LIST_HDR_LEN {
        return Err(Error::Truncated {
            needed: LIST_HDR_LEN,
            available: buf.len(),
        });
    }
    Ok((buf[0] & 0x0F, be32(buf, 4)?))
}

/// Decode an OSD offset field; `None` when the field is unused.
///
/// The top four bits are a signed exponent and the low 28 bits the mantissa:
/// `offset = mantissa << (exponent + 8)`.
#[must_use]
pub const fn decode_offset(raw: u32) -> Option<u64> {
    if raw == OFFSET_UNUSED {
        return None;
    }
    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    let shift = (((raw as i32) >> 28) + 8) as u32;
    Some(((raw & 0x0FFF_FFFF) as u64) << shift)
}

/// Encode a byte offset into the OSD offset form.
///
/// The low three bits are dropped. Returns `None` when the offset cannot be
/// represented.
#[must_use]
pub const fn encode_offset(offset: u64) -> Option<u32> {
    let mut exponent: i32 = -5;
    let mut mantissa = offset >> 3;
    while mantissa > 0x0FFF_FFFF {
        exponent += 1;
        mantissa >>= 1;
    }
    if exponent > 7 {
        return None;
    }
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    Some(((exponent as u32) & 0xF) << 28 | mantissa as u32)
}

// ---- Big-endian field access ----

fn window(buf: &[u8], off: usize, len: usize) -> Result<&[u8]> {
    buf.get(off..off.saturating_add(len))
        .ok_or(Error::Truncated {
            needed: off.saturating_add(len),
            available: buf.len(),
        })
}

fn window_mut(buf: &mut [u8], off: usize, len: usize) -> Result<&mut [u8]> {
    let available = buf.len();
    buf.get_mut(off..off.saturating_add(len))
        .ok_or(Error::Overflow {
            needed: off.saturating_add(len),
            available,
        })
}

/// Read a be16 at `off`
pub fn be16(buf: &[u8], off: usize) -> Result<u16> {
    Ok(window(buf, off, 2)?.get_u16())
}

/// Read a be32 at `off`
pub fn be32(buf: &[u8], off: usize) -> Result<u32> {
    Ok(window(buf, off, 4)?.get_u32())
}

/// Read a be64 at `off`
pub fn be64(buf: &[u8], off: usize) -> Result<u64> {
    Ok(window(buf, off, 8)?.get_u64())
}

/// Write a be16 at `off`
pub fn put_be16(buf: &mut [u8], off: usize, v: u16) -> Result<()> {
    window_mut(buf, off, 2)?.put_u16(v);
    Ok(())
}

/// Write a be32 at `off`
pub fn put_be32(buf: &mut [u8], off: usize, v: u32) -> Result<()> {
    window_mut(buf, off, 4)?.put_u32(v);
    Ok(())
}

/// Write a be64 at `off`
pub fn put_be64(buf: &mut [u8], off: usize, v: u64) -> Result<()> {
    window_mut(buf, off, 8)?.put_u64(v);
    Ok(())
}

/// Encode a millisecond timestamp as the 6-byte big-endian OSD time
pub fn put_time48(buf: &mut [u8], off: usize, millis: u64) -> Result<()> {
    if millis >> 48 != 0 {
        return Err(Error::internal(format!("timestamp {millis} exceeds 48 bits")));
    }
    window_mut(buf, off, 6)?.copy_from_slice(&millis.to_be_bytes()[2..]);
    Ok(())
}

/// 6-byte OSD time as an owned value
pub fn time48(millis: u64) -> Result<[u8; 6]> {
    let mut out = [0u8; 6];
    put_time48(&mut out, 0, millis)?;
    Ok(out)
}
