//! CDB dispatcher
//!
//! [`submit`] is the single entry point of the target. It validates the CDB
//! header, sizes the output buffer, dispatches on the service action and
//! reconciles the data and retrieved-attribute regions of the output before
//! handing back the response.

pub mod continuation;
mod dispatch;
pub mod fields;
mod getset;

use crate::device::OsdDevice;
use crate::sense::{CmdResult, Sense};
use bytes::Bytes;
use fields::{
    ALLOC_LEN, Cdb, GET_LIST_ALLOC, GET_PAGE_ALLOC, LIST_RETRIEVED_OFFSET, OID,
    PAGE_RETRIEVED_OFFSET, PID,
};
use osdemu_common::{
    Asc, GetSetFormat, SAM_STAT_CHECK_CONDITION, SAM_STAT_GOOD, SenseKey, ServiceAction,
};
use tracing::debug;

/// Outcome of one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Data-in buffer: command data followed by retrieved attributes
    pub output: Bytes,
    pub sense: Option<Sense>,
    /// SCSI status, GOOD or CHECK CONDITION
    pub status: u8,
}

impl Response {
    fn failed(sense: Sense) -> Self {
        Self {
            output: Bytes::new(),
            sense: Some(sense),
            status: SAM_STAT_CHECK_CONDITION,
        }
    }

    /// Rendered sense buffer, empty on GOOD status
    #[must_use]
    pub fn sense_bytes(&self) -> Vec<u8> {
        self.sense.map(|s| s.to_bytes()).unwrap_or_default()
    }
}

/// Where retrieved attributes go in the output
#[derive(Debug, Clone, Copy)]
struct Retrieved {
    offset: usize,
    alloc: usize,
}

/// One command in flight
pub(crate) struct Command<'a> {
    cdb: Cdb<'a>,
    action: Option<ServiceAction>,
    format: GetSetFormat,
    input: &'a [u8],
    out: Vec<u8>,
    /// Room for command data at the start of `out`
    data_alloc: usize,
    retrieved: Option<Retrieved>,
    /// Command data bytes produced
    used: usize,
    /// Retrieved attribute bytes produced
    get_used: usize,
}

impl<'a> Command<'a> {
    /// Size the output buffer for `cdb`
    pub(crate) fn new(
        cdb: Cdb<'a>,
        action: Option<ServiceAction>,
        input: &'a [u8],
        max_output_len: usize,
    ) -> CmdResult<Self> {
        let format = cdb.getset_format().ok_or(Sense::header(
            SenseKey::IllegalRequest,
            Asc::INVALID_FIELD_IN_CDB,
        ))?;

        let data_alloc = match action {
            Some(a) if a.returns_data() => cdb.u64(ALLOC_LEN),
            _ => 0,
        };
        let retrieved = match format {
            GetSetFormat::Field => None,
            GetSetFormat::Page => cdb
                .offset(PAGE_RETRIEVED_OFFSET)
                .map(|at| (at, u64::from(cdb.u32(GET_PAGE_ALLOC)))),
            GetSetFormat::List => cdb
                .offset(LIST_RETRIEVED_OFFSET)
                .map(|at| (at, u64::from(cdb.u32(GET_LIST_ALLOC)))),
        };
        let end = match retrieved {
            Some((at, alloc)) => at.checked_add(alloc).ok_or_else(Sense::resource)?,
            None => 0,
        };

        let out_len = data_alloc.max(end);
        let fits = |n: u64| usize::try_from(n).ok().filter(|&n| n <= max_output_len);
        let Some(out_len) = fits(out_len) else {
            debug!("Output of {} bytes exceeds the limit of {}", out_len, max_output_len);
            return Err(Sense::resource());
        };
        let retrieved = retrieved
            .map(|(at, alloc)| -> CmdResult<Retrieved> {
                Ok(Retrieved {
                    offset: fits(at).ok_or_else(Sense::resource)?,
                    alloc: fits(alloc).ok_or_else(Sense::resource)?,
                })
            })
            .transpose()?;

        Ok(Self {
            cdb,
            action,
            format,
            input,
            out: vec![0; out_len],
            data_alloc: fits(data_alloc).ok_or_else(Sense::resource)?,
            retrieved,
            used: 0,
            get_used: 0,
        })
    }

    /// Output region for command data
    fn data_area(&mut self) -> &mut [u8] {
        &mut self.out[..self.data_alloc]
    }

    /// Output region for retrieved attributes; `None` when the offset is unused
    fn retrieved_area(&mut self) -> Option<&mut [u8]> {
        let r = self.retrieved?;
        self.out.get_mut(r.offset..r.offset + r.alloc)
    }

    /// Merge data and retrieved attributes into the response
    fn finish(mut self, result: CmdResult<()>) -> Response {
        let sense = match result {
            Ok(()) => None,
            Err(sense) if sense.is_recovered() => Some(sense),
            Err(sense) => return Response::failed(sense),
        };

        if self.get_used > 0 {
            if let Some(r) = self.retrieved {
                if self.used < r.offset {
                    self.out[self.used..r.offset].fill(0);
                }
                self.used = r.offset + self.get_used;
            }
        }
        self.out.truncate(self.used);

        Response {
            output: Bytes::from(self.out),
            sense,
            status: if sense.is_some() {
                SAM_STAT_CHECK_CONDITION
            } else {
                SAM_STAT_GOOD
            },
        }
    }
}

/// Execute one CDB against `device` with `input` as the data-out buffer
pub fn submit(device: &mut OsdDevice, cdb: &[u8], input: &[u8]) -> Response {
    let Some(cdb) = Cdb::new(cdb) else {
        return Response::failed(Sense::header(
            SenseKey::IllegalRequest,
            Asc::INVALID_COMMAND_OPCODE,
        ));
    };
    let code = cdb.action();
    let action = ServiceAction::from_u16(code);

    let mut cmd = match Command::new(cdb, action, input, device.config().max_output_len) {
        Ok(cmd) => cmd,
        Err(sense) => return Response::failed(sense),
    };
    device.session.action = action;
    match action {
        Some(a) => debug!(
            "Dispatching {} on {:#x}:{:#x}, {} byte(s) in, {} byte(s) out",
            a,
            cdb.u64(PID),
            cdb.u64(OID),
            input.len(),
            cmd.out.len()
        ),
        None => debug!("Dispatching unknown service action {:#06x}", code),
    }

    let result = cmd.execute(device);
    cmd.finish(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdb::continuation::tests::{segment, sg_body};
    use crate::device::tests::open_device;
    use fields::tests::{cdb_for, put, put_offset};
    use fields::{OID as OID_FIELD, PID as PID_FIELD};
    use fields::{
        CONTINUATION_LEN, GET_LIST_LEN, GET_LIST_OFFSET, LENGTH, NUMOID, OFFSET, OPTIONS,
        SET_LIST_LEN, SET_LIST_OFFSET,
    };
    use osdemu_common::ObjectType;
    use osdemu_common::wire::{self, be32, be64};

    const PID: u64 = 0x10000;
    const OID: u64 = 0x10000;
    const PAGE: u32 = 0x1_0000;

    fn run(device: &mut OsdDevice, cdb: &[u8], input: &[u8]) -> Response {
        submit(device, cdb, input)
    }

    fn good(device: &mut OsdDevice, cdb: &[u8], input: &[u8]) -> Bytes {
        let response = run(device, cdb, input);
        assert_eq!(response.status, SAM_STAT_GOOD, "sense {:?}", response.sense);
        response.output
    }

    fn set_list(entries: &[(u32, u32, &[u8])]) -> Vec<u8> {
        let mut body = vec![0u8; 256];
        let mut used = 0;
        for &(page, number, value) in entries {
            used += wire::pack_attr(&mut body[used..], page, number, value).unwrap();
        }
        let mut list = vec![0x9, 0, 0, 0];
        list.extend_from_slice(&(used as u32).to_be_bytes());
        list.extend_from_slice(&body[..used]);
        list
    }

    fn retrieve_list(pairs: &[(u32, u32)]) -> Vec<u8> {
        let mut list = vec![0x1, 0, 0, 0];
        list.extend_from_slice(&((pairs.len() * 8) as u32).to_be_bytes());
        for &(page, number) in pairs {
            list.extend_from_slice(&page.to_be_bytes());
            list.extend_from_slice(&number.to_be_bytes());
        }
        list
    }

    /// Partition PID holding user object OID
    fn setup(device: &mut OsdDevice) {
        let mut cdb = cdb_for(ServiceAction::CreatePartition.code(), 3);
        put(&mut cdb, PID_FIELD, PID);
        good(device, &cdb, &[]);

        let mut cdb = cdb_for(ServiceAction::Create.code(), 3);
        put(&mut cdb, PID_FIELD, PID);
        put(&mut cdb, OID_FIELD, OID);
        put(&mut cdb, NUMOID, 1);
        good(device, &cdb, &[]);
    }

    fn data_cdb(action: ServiceAction, len: u64, offset: u64) -> Vec<u8> {
        let mut cdb = cdb_for(action.code(), 3);
        put(&mut cdb, PID_FIELD, PID);
        put(&mut cdb, OID_FIELD, OID);
        put(&mut cdb, LENGTH, len);
        put(&mut cdb, OFFSET, offset);
        cdb
    }

    #[test]
    fn test_submit_rejects_bad_header() {
        let (_dir, mut device) = open_device();

        let response = run(&mut device, &[0x7F; 16], &[]);
        assert_eq!(response.status, SAM_STAT_CHECK_CONDITION);
        assert_eq!(
            response.sense,
            Some(Sense::header(SenseKey::IllegalRequest, Asc::INVALID_COMMAND_OPCODE))
        );
        assert!(response.output.is_empty());
        assert_eq!(response.sense_bytes().len(), 8);

        let mut cdb = cdb_for(ServiceAction::Read.code(), 3);
        cdb[0] = 0x12;
        assert_eq!(
            run(&mut device, &cdb, &[]).sense.unwrap().asc,
            Asc::INVALID_COMMAND_OPCODE
        );

        let cdb = cdb_for(ServiceAction::Read.code(), 0);
        assert_eq!(
            run(&mut device, &cdb, &[]).sense,
            Some(Sense::header(SenseKey::IllegalRequest, Asc::INVALID_FIELD_IN_CDB))
        );
    }

    #[test]
    fn test_submit_unknown_and_unimplemented() {
        let (_dir, mut device) = open_device();
        let mut cdb = cdb_for(0x8123, 3);
        put(&mut cdb, PID_FIELD, PID);
        assert_eq!(run(&mut device, &cdb, &[]).sense, Some(Sense::unimplemented(PID, 0)));

        let cdb = cdb_for(ServiceAction::CreateSnapshot.code(), 3);
        let sense = run(&mut device, &cdb, &[]).sense.unwrap();
        assert_eq!(sense.asc, Asc::INVALID_COMMAND_OPCODE);
        assert_eq!(device.session.action, Some(ServiceAction::CreateSnapshot));
    }

    #[test]
    fn test_output_limit() {
        let (_dir, mut device) = open_device();
        let cdb = data_cdb(ServiceAction::Read, 1 << 40, 0);
        assert_eq!(run(&mut device, &cdb, &[]).sense, Some(Sense::resource()));
    }

    #[test]
    fn test_short_read_is_recovered() {
        let (_dir, mut device) = open_device();
        setup(&mut device);
        let data: Vec<u8> = (1..=22).collect();
        good(&mut device, &data_cdb(ServiceAction::Write, 22, 0), &data);

        let response = run(&mut device, &data_cdb(ServiceAction::Read, 256, 0), &[]);
        assert_eq!(response.status, SAM_STAT_CHECK_CONDITION);
        let sense = response.sense.unwrap();
        assert_eq!(sense, Sense::read_past_end(PID, OID, 22));
        assert_eq!(response.output.len(), 256);
        assert_eq!(&response.output[..22], &data[..]);
        assert!(response.output[22..].iter().all(|&b| b == 0));

        let bytes = response.sense_bytes();
        assert_eq!(bytes[1], SenseKey::RecoveredError as u8);
        assert_eq!(be64(&bytes, bytes.len() - 8).unwrap(), 22);
    }

    #[test]
    fn test_set_then_get_attribute() {
        let (_dir, mut device) = open_device();
        setup(&mut device);

        let list = set_list(&[(PAGE, 1, b"X\0")]);
        let mut cdb = cdb_for(ServiceAction::SetAttributes.code(), 3);
        put(&mut cdb, PID_FIELD, PID);
        put(&mut cdb, OID_FIELD, OID);
        put(&mut cdb, SET_LIST_LEN, list.len() as u64);
        put_offset(&mut cdb, SET_LIST_OFFSET, 0);
        assert!(good(&mut device, &cdb, &list).is_empty());

        let list = retrieve_list(&[(PAGE, 1)]);
        let mut cdb = cdb_for(ServiceAction::GetAttributes.code(), 3);
        put(&mut cdb, PID_FIELD, PID);
        put(&mut cdb, OID_FIELD, OID);
        put(&mut cdb, GET_LIST_LEN, list.len() as u64);
        put_offset(&mut cdb, GET_LIST_OFFSET, 0);
        put(&mut cdb, fields::GET_LIST_ALLOC, 64);
        put_offset(&mut cdb, LIST_RETRIEVED_OFFSET, 0);

        let out = good(&mut device, &cdb, &list);
        assert_eq!(out.len(), 8 + 16);
        assert_eq!(out[0], 0x9);
        assert_eq!(be32(&out, 4).unwrap(), 16);
        let (entry, _) = wire::unpack_attr(&out[8..]).unwrap();
        assert_eq!((entry.page, entry.number, entry.value), (PAGE, 1, &b"X\0"[..]));
    }

    #[test]
    fn test_data_and_attributes_reconciled() {
        let (_dir, mut device) = open_device();
        setup(&mut device);
        good(&mut device, &data_cdb(ServiceAction::Write, 4, 0), b"abcd");

        let list = retrieve_list(&[(PAGE, 1)]);
        let mut cdb = data_cdb(ServiceAction::Read, 4, 0);
        put(&mut cdb, GET_LIST_LEN, list.len() as u64);
        put_offset(&mut cdb, GET_LIST_OFFSET, 0);
        put(&mut cdb, fields::GET_LIST_ALLOC, 32);
        put_offset(&mut cdb, LIST_RETRIEVED_OFFSET, 16);

        let out = good(&mut device, &cdb, &list);
        assert_eq!(&out[..4], b"abcd");
        assert!(out[4..16].iter().all(|&b| b == 0));
        assert_eq!(out[16], 0x9);
        assert_eq!(be32(&out, 20).unwrap(), 16);
        assert_eq!(out.len(), 16 + 8 + 16);
    }

    #[test]
    fn test_scatter_gather_write() {
        let (_dir, mut device) = open_device();
        setup(&mut device);

        let action = ServiceAction::Write.code();
        let body = sg_body(&[(0, 4), (8, 4)]);
        let mut input = segment(action, &[(0x1, 0, &body)]);
        let cont_len = input.len();
        input.extend_from_slice(b"abcdwxyz");

        let mut cdb = data_cdb(ServiceAction::Write, 8, 0);
        put(&mut cdb, CONTINUATION_LEN, cont_len as u64);
        good(&mut device, &cdb, &input);

        let out = good(&mut device, &data_cdb(ServiceAction::Read, 12, 0), &[]);
        assert_eq!(&out[..], b"abcd\0\0\0\0wxyz");

        // a scatter-gather topology needs the continuation
        let mut cdb = data_cdb(ServiceAction::Write, 4, 0);
        cdb[OPTIONS.offset] = 0x1;
        assert_eq!(run(&mut device, &cdb, b"abcd").sense, Some(Sense::cdb(PID, OID)));
    }

    #[test]
    fn test_continuation_rejected_where_unused() {
        let (_dir, mut device) = open_device();
        setup(&mut device);
        let mut cdb = cdb_for(ServiceAction::SetAttributes.code(), 3);
        put(&mut cdb, PID_FIELD, PID);
        put(&mut cdb, OID_FIELD, OID);
        put(&mut cdb, CONTINUATION_LEN, 48);
        assert_eq!(run(&mut device, &cdb, &[0; 48]).sense, Some(Sense::cdb(PID, OID)));
    }

    #[test]
    fn test_create_rolls_back_on_attribute_failure() {
        let (_dir, mut device) = open_device();
        setup(&mut device);

        // reserved page: the set step fails after the objects exist
        let list = set_list(&[(0x80, 1, b"v")]);
        let mut cdb = cdb_for(ServiceAction::Create.code(), 3);
        put(&mut cdb, PID_FIELD, PID);
        put(&mut cdb, NUMOID, 3);
        put(&mut cdb, SET_LIST_LEN, list.len() as u64);
        put_offset(&mut cdb, SET_LIST_OFFSET, 0);

        let response = run(&mut device, &cdb, &list);
        assert_eq!(response.status, SAM_STAT_CHECK_CONDITION);
        for oid in OID + 1..=OID + 3 {
            assert_eq!(device.object_type(PID, oid).unwrap(), ObjectType::Illegal);
        }
        assert_eq!(device.object_type(PID, OID).unwrap(), ObjectType::UserObject);
    }

    #[test]
    fn test_cas_through_submit() {
        let (_dir, mut device) = open_device();
        setup(&mut device);
        let mut input = 0u64.to_be_bytes().to_vec();
        input.extend_from_slice(&5u64.to_be_bytes());

        let mut cdb = data_cdb(ServiceAction::Cas, 8, 0);
        let out = good(&mut device, &cdb, &input);
        assert_eq!(be64(&out, 0).unwrap(), 0);
        let out = good(&mut device, &cdb, &input);
        assert_eq!(be64(&out, 0).unwrap(), 5);

        put(&mut cdb, LENGTH, 4);
        assert!(run(&mut device, &cdb, &input).sense.is_some());
    }

    #[test]
    fn test_gen_cas_returns_prior_first() {
        let (_dir, mut device) = open_device();
        setup(&mut device);

        let gen_cas = |device: &mut OsdDevice, cmp: &[u8], swap: &[u8]| {
            let list = set_list(&[(PAGE, 7, cmp), (PAGE, 7, swap), (PAGE, 8, b"tail")]);
            let mut cdb = cdb_for(ServiceAction::CondSetattr.code(), 3);
            put(&mut cdb, PID_FIELD, PID);
            put(&mut cdb, OID_FIELD, OID);
            put(&mut cdb, SET_LIST_LEN, list.len() as u64);
            put_offset(&mut cdb, SET_LIST_OFFSET, 0);
            put(&mut cdb, fields::GET_LIST_ALLOC, 64);
            put_offset(&mut cdb, LIST_RETRIEVED_OFFSET, 0);
            good(device, &cdb, &list)
        };
        let tail = |device: &mut OsdDevice| {
            device
                .txn(|txn| Ok(txn.get_attr(PID, OID, PAGE, 8)?))
                .unwrap()
        };

        // absent: stored, but the comparison did not match
        let out = gen_cas(&mut device, b"zz", b"one");
        assert_eq!(out[0], 0x9);
        let (prior, _) = wire::unpack_attr(&out[8..]).unwrap();
        assert_eq!((prior.page, prior.number, prior.value), (PAGE, 7, &b""[..]));
        assert_eq!(tail(&mut device), None);

        let out = gen_cas(&mut device, b"one", b"two");
        let (prior, _) = wire::unpack_attr(&out[8..]).unwrap();
        assert_eq!(prior.value, b"one");
        assert_eq!(tail(&mut device), Some(b"tail".to_vec()));
    }

    #[test]
    fn test_list_through_submit() {
        let (_dir, mut device) = open_device();
        setup(&mut device);

        let mut cdb = cdb_for(ServiceAction::List.code(), 3);
        put(&mut cdb, PID_FIELD, PID);
        put(&mut cdb, ALLOC_LEN, 64);
        put(&mut cdb, fields::LIST_ID, 3);
        let out = good(&mut device, &cdb, &[]);
        assert_eq!(out.len(), 24 + 8);
        assert_eq!(be32(&out, 16).unwrap(), 3);
        assert_eq!(be64(&out, 24).unwrap(), OID);

        // the page format has no list form
        let mut cdb = cdb_for(ServiceAction::List.code(), 2);
        put(&mut cdb, PID_FIELD, PID);
        put(&mut cdb, ALLOC_LEN, 64);
        assert_eq!(run(&mut device, &cdb, &[]).sense, Some(Sense::cdb(PID, 0)));
    }
}
