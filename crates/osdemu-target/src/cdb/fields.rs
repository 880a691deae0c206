//! Declarative CDB field table
//!
//! Every verb reads its arguments through named [`Field`]s instead of raw
//! offsets. A [`Cdb`] is only built from a buffer holding the full 236-byte
//! CDB, so field reads cannot run past the end.

use osdemu_common::wire::decode_offset;
use osdemu_common::{GetSetFormat, OSD_CDB_ADDITIONAL_LEN, OSD_CDB_SIZE, VARLEN_CDB};

/// One big-endian CDB field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub offset: usize,
    pub width: usize,
}

const fn field(name: &'static str, offset: usize, width: usize) -> Field {
    Field {
        name,
        offset,
        width,
    }
}

// Common header
pub const OPCODE: Field = field("opcode", 0, 1);
pub const ADDITIONAL_LEN: Field = field("additional_cdb_length", 7, 1);
pub const SERVICE_ACTION: Field = field("service_action", 8, 2);
pub const OPTIONS: Field = field("options", 10, 1);
pub const GETSET: Field = field("getset_options", 11, 1);
pub const PID: Field = field("partition_id", 16, 8);
pub const OID: Field = field("object_id", 24, 8);
pub const LENGTH: Field = field("length", 32, 8);
pub const OFFSET: Field = field("starting_byte", 40, 8);
pub const CONTINUATION_LEN: Field = field("cdb_continuation_length", 48, 4);

// Verb specific
pub const NUMOID: Field = field("number_of_user_objects", 32, 2);
pub const ALLOC_LEN: Field = field("allocation_length", 32, 8);
pub const FORMAT_CAPACITY: Field = field("formatted_capacity", 32, 8);
pub const INITIAL_OID: Field = field("initial_object_id", 40, 8);
pub const MATCHES_CID: Field = field("matches_collection_id", 40, 8);
pub const SOURCE_CID: Field = field("source_collection_id", 40, 8);
pub const LIST_ID: Field = field("list_identifier", 48, 4);
pub const MAP_TYPE: Field = field("requested_map_type", 48, 2);

// Page format get/set
pub const GET_PAGE: Field = field("get_attributes_page", 52, 4);
pub const GET_PAGE_ALLOC: Field = field("get_attributes_allocation_length", 56, 4);
pub const PAGE_RETRIEVED_OFFSET: Field = field("retrieved_attributes_offset", 60, 4);
pub const SET_PAGE: Field = field("set_attribute_page", 64, 4);
pub const SET_NUMBER: Field = field("set_attribute_number", 68, 4);
pub const SET_LEN: Field = field("set_attribute_length", 72, 4);
pub const SET_OFFSET: Field = field("set_attribute_offset", 76, 4);

// List format get/set
pub const GET_LIST_LEN: Field = field("get_attributes_list_length", 52, 4);
pub const GET_LIST_OFFSET: Field = field("get_attributes_list_offset", 56, 4);
pub const GET_LIST_ALLOC: Field = field("get_attributes_allocation_length", 60, 4);
pub const LIST_RETRIEVED_OFFSET: Field = field("retrieved_attributes_offset", 64, 4);
pub const SET_LIST_LEN: Field = field("set_attributes_list_length", 68, 4);
pub const SET_LIST_OFFSET: Field = field("set_attributes_list_offset", 72, 4);

// Field format set
pub const VALUE_PAGE: Field = field("set_attribute_page", 52, 4);
pub const VALUE_NUMBER: Field = field("set_attribute_number", 56, 4);
pub const VALUE_LEN: Field = field("set_attribute_length", 60, 2);
pub const VALUE: Field = field("set_attribute_value", 62, 18);

/// A complete OSD CDB
#[derive(Debug, Clone, Copy)]
pub struct Cdb<'a>(&'a [u8]);

impl<'a> Cdb<'a> {
    /// Accept a buffer carrying the variable-length OSD CDB header
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Option<Self> {
        let cdb = Self(bytes.get(..OSD_CDB_SIZE)?);
        (cdb.u8(OPCODE) == VARLEN_CDB && cdb.u8(ADDITIONAL_LEN) == OSD_CDB_ADDITIONAL_LEN)
            .then_some(cdb)
    }

    /// Raw bytes of a field
    #[must_use]
    pub fn bytes(&self, f: Field) -> &'a [u8] {
        &self.0[f.offset..f.offset + f.width]
    }

    /// Unsigned value of a field of at most 8 bytes
    #[must_use]
    pub fn value(&self, f: Field) -> u64 {
        debug_assert!(f.width <= 8, "{} is not an integer field", f.name);
        self.bytes(f)
            .iter()
            .fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
    }

    #[must_use]
    pub fn u64(&self, f: Field) -> u64 {
        self.value(f)
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn u32(&self, f: Field) -> u32 {
        debug_assert!(f.width <= 4, "{} is wider than 32 bits", f.name);
        self.value(f) as u32
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn u16(&self, f: Field) -> u16 {
        debug_assert!(f.width <= 2, "{} is wider than 16 bits", f.name);
        self.value(f) as u16
    }

    #[must_use]
    pub fn u8(&self, f: Field) -> u8 {
        self.0[f.offset]
    }

    /// Decoded OSD offset field; `None` when unused
    #[must_use]
    pub fn offset(&self, f: Field) -> Option<u64> {
        decode_offset(self.u32(f))
    }

    pub fn action(&self) -> u16 {
        self.u16(SERVICE_ACTION)
    }

    /// Get/set attribute parameter format; `None` for the reserved value
    pub fn getset_format(&self) -> Option<GetSetFormat> {
        GetSetFormat::from_bits(self.u8(GETSET) >> 4)
    }

    pub fn continuation_len(&self) -> u32 {
        self.u32(CONTINUATION_LEN)
    }
}
