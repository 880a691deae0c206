//! QUERY: select members of a collection by attribute value ranges

use crate::device::OsdDevice;
use crate::sense::{CmdResult, Sense};
use osdemu_catalog::Criterion;
use osdemu_common::page::PARTITION_PG;
use osdemu_common::wire::{be16, be32, put_be64};
use osdemu_common::{COLLECTION_PID_LB, ObjectType, QueryKind};

/// Smallest query list: header plus one empty criterion header
pub const MIN_QUERY_LIST_LEN: usize = 8;
/// Smallest allocation: match list header plus the descriptor format byte
pub const MIN_MATCH_LIST_LEN: usize = 13;

const QUERY_HDR_LEN: usize = 4;
const MATCH_FORMAT: u8 = 0x21 << 2;

/// Decode a query list into its kind and criteria; `None` when malformed
fn parse_query_list(list: &[u8]) -> Option<(QueryKind, Vec<Criterion>)> {
    let kind = QueryKind::from_u8(*list.first()?)?;
    let mut criteria = Vec::new();
    let mut at = QUERY_HDR_LEN;

    while at < list.len() {
        let qce_len = be16(list, at + 2).ok()?;
        if qce_len == 0 {
            break;
        }
        let page = be32(list, at + 4).ok()?;
        if page >= PARTITION_PG {
            return None;
        }
        let number = be32(list, at + 8).ok()?;
        let min_len = usize::from(be16(list, at + 12).ok()?);
        at += 14;
        let min = list.get(at..at + min_len)?.to_vec();
        at += min_len;
        let max_len = usize::from(be16(list, at).ok()?);
        at += 2;
        let max = list.get(at..at + max_len)?.to_vec();
        at += max_len;
        criteria.push(Criterion {
            page,
            number,
            min,
            max,
        });
    }
    Some((kind, criteria))
}

impl OsdDevice {
    /// Write the ids of the members of `cid` matching `query_list` into
    /// `out`; returns the bytes used
    pub fn query(
        &mut self,
        pid: u64,
        cid: u64,
        query_list: &[u8],
        out: &mut [u8],
    ) -> CmdResult<usize> {
        if pid < COLLECTION_PID_LB {
            return Err(Sense::cdb(pid, cid));
        }
        if !self.txn(|txn| Ok(txn.object_exists(pid, cid)?))? {
            return Err(Sense::cdb(pid, cid));
        }
        if query_list.len() < MIN_QUERY_LIST_LEN {
            return Err(Sense::cdb(pid, cid));
        }
        if out.is_empty() {
            return Ok(0);
        }
        if out.len() < MIN_MATCH_LIST_LEN {
            return Err(Sense::cdb(pid, cid));
        }
        let (kind, criteria) = parse_query_list(query_list).ok_or(Sense::cdb(pid, cid))?;

        let matched = self.txn(|txn| Ok(txn.run_query(pid, cid, kind, &criteria)?))?;

        out[..MIN_MATCH_LIST_LEN].fill(0);
        out[12] = MATCH_FORMAT;
        let mut used = MIN_MATCH_LIST_LEN;
        let mut add_len: u64 = (MIN_MATCH_LIST_LEN - 8) as u64;
        for oid in matched {
            if out.len() - used >= 8 {
                out[used..used + 8].copy_from_slice(&oid.to_be_bytes());
                used += 8;
            }
            add_len = add_len.saturating_add(8);
        }
        put_be64(out, 0, add_len)?;

        self.set_ccap(ObjectType::Collection, pid, cid, 0);
        Ok(used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::open_device;
    use osdemu_common::wire::be64;

    const PID: u64 = 0x10000;
    const PAGE: u32 = 0x1_0000;

    fn criterion(page: u32, number: u32, min: &[u8], max: &[u8]) -> Vec<u8> {
        let mut c = vec![0u8; 14];
        c[2..4].copy_from_slice(&((12 + min.len() + max.len()) as u16).to_be_bytes());
        c[4..8].copy_from_slice(&page.to_be_bytes());
        c[8..12].copy_from_slice(&number.to_be_bytes());
        c[12..14].copy_from_slice(&(min.len() as u16).to_be_bytes());
        c.extend_from_slice(min);
        c.extend_from_slice(&(max.len() as u16).to_be_bytes());
        c.extend_from_slice(max);
        c
    }

    fn query_list(kind: u8, criteria: &[Vec<u8>]) -> Vec<u8> {
        let mut list = vec![kind, 0, 0, 0];
        for c in criteria {
            list.extend_from_slice(c);
        }
        list
    }

    fn populate(device: &mut OsdDevice, values: &[u64]) -> (u64, Vec<u64>) {
        device.create_partition(PID).unwrap();
        let cid = device.create_collection(PID, 0).unwrap();
        let oids = device.create(PID, 0, values.len() as u16).unwrap();
        for (&oid, v) in oids.iter().zip(values) {
            device
                .set_attrs(
                    PID,
                    &[oid],
                    &[(0x4, 1, &cid.to_be_bytes()), (PAGE, 1, &v.to_be_bytes())],
                    false,
                )
                .unwrap();
        }
        (cid, oids)
    }

    fn matches(out: &[u8], used: usize) -> Vec<u64> {
        out[MIN_MATCH_LIST_LEN..used]
            .chunks_exact(8)
            .map(|c| u64::from_be_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn test_parse_query_list() {
        let list = query_list(1, &[criterion(PAGE, 1, b"a", b""), vec![0; 4]]);
        let (kind, criteria) = parse_query_list(&list).unwrap();
        assert_eq!(kind, QueryKind::Intersect);
        assert_eq!(criteria.len(), 1);
        assert_eq!(criteria[0].min, b"a");
        assert!(criteria[0].max.is_empty());

        assert!(parse_query_list(&query_list(2, &[])).is_none());
        assert!(parse_query_list(&query_list(0, &[criterion(PARTITION_PG, 1, b"", b"")])).is_none());
        let mut truncated = query_list(0, &[criterion(PAGE, 1, b"abc", b"")]);
        truncated.truncate(truncated.len() - 3);
        assert!(parse_query_list(&truncated).is_none());
    }

    #[test]
    fn test_query_range() {
        let (_dir, mut device) = open_device();
        let values = [20u64, 49, 59, 67, 75, 101, 200, 323];
        let (cid, oids) = populate(&mut device, &values);

        let list = query_list(
            0,
            &[criterion(PAGE, 1, &40u64.to_be_bytes(), &80u64.to_be_bytes())],
        );
        let mut out = [0u8; 128];
        let used = device.query(PID, cid, &list, &mut out).unwrap();
        assert_eq!(matches(&out, used), oids[1..5]);
        assert_eq!(be64(&out, 0).unwrap(), 5 + 4 * 8);
        assert_eq!(out[12], MATCH_FORMAT);
        assert_eq!(device.ccap().obj_type, ObjectType::Collection);
    }

    #[test]
    fn test_query_union_and_intersect() {
        let (_dir, mut device) = open_device();
        let values = [1u64, 2, 3, 4];
        let (cid, oids) = populate(&mut device, &values);
        let low = criterion(PAGE, 1, b"", &2u64.to_be_bytes());
        let high = criterion(PAGE, 1, &4u64.to_be_bytes(), b"");
        let mut out = [0u8; 64];

        let used = device
            .query(PID, cid, &query_list(0, &[low.clone(), high.clone()]), &mut out)
            .unwrap();
        assert_eq!(matches(&out, used), vec![oids[0], oids[1], oids[3]]);

        let used = device
            .query(PID, cid, &query_list(1, &[low, high]), &mut out)
            .unwrap();
        assert!(matches(&out, used).is_empty());
    }

    #[test]
    fn test_query_bounds() {
        let (_dir, mut device) = open_device();
        let (cid, oids) = populate(&mut device, &[5, 6, 7]);
        let list = query_list(0, &[criterion(PAGE, 1, b"", b"")]);

        // only the first match fits, add_len still counts all
        let mut out = [0u8; 21];
        let used = device.query(PID, cid, &list, &mut out).unwrap();
        assert_eq!(matches(&out, used), vec![oids[0]]);
        assert_eq!(be64(&out, 0).unwrap(), 5 + 3 * 8);

        assert_eq!(device.query(PID, cid, &list, &mut []).unwrap(), 0);
        assert!(device.query(PID, cid, &list, &mut out[..12]).is_err());
        assert!(device.query(PID, cid, &list[..4], &mut out).is_err());
        assert!(device.query(PID, cid + 100, &list, &mut out).is_err());
        assert!(device.query(1, cid, &list, &mut out).is_err());
    }
}
