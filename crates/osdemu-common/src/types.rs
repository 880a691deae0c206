//! Core type definitions for OSDEMU
//!
//! This module defines the fundamental protocol types used throughout the
//! target: object addressing, object types, service actions, sense codes and
//! the small enumerations carried inside a CDB.

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Variable-length CDB operation code
pub const VARLEN_CDB: u8 = 0x7F;
/// Total CDB size in bytes
pub const OSD_CDB_SIZE: usize = 236;
/// Value of the additional CDB length byte (total minus the 8-byte header)
pub const OSD_CDB_ADDITIONAL_LEN: u8 = 228;
/// Maximum sense buffer size
pub const OSD_MAX_SENSE: usize = 252;
/// Size of the OSD system id stored on the root information page
pub const OSD_SYS_ID_SIZE: usize = 20;
/// Marker for an unused OSD offset field
pub const OFFSET_UNUSED: u32 = 0xFFFF_FFFF;

// Well-known identifiers
pub const ROOT_PID: u64 = 0;
pub const ROOT_OID: u64 = 0;
pub const PARTITION_OID: u64 = 0;
pub const PARTITION_PID_LB: u64 = 0x10000;
pub const OBJECT_PID_LB: u64 = 0x10000;
pub const USEROBJECT_PID_LB: u64 = OBJECT_PID_LB;
pub const COLLECTION_PID_LB: u64 = OBJECT_PID_LB;
pub const USEROBJECT_OID_LB: u64 = 0x10000;
pub const COLLECTION_OID_LB: u64 = 0x10000;
pub const USER_TRACKING_COLLECTION_OID_LB: u64 = 0x10000;

/// SCSI status codes returned alongside sense data
pub const SAM_STAT_GOOD: u8 = 0x00;
pub const SAM_STAT_CHECK_CONDITION: u8 = 0x02;

/// Address of one object in the store
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[display("{pid:#x}:{oid:#x}")]
pub struct ObjectId {
    /// Partition id
    pub pid: u64,
    /// Object id within the partition
    pub oid: u64,
}

impl ObjectId {
    /// Create a new object address
    #[must_use]
    pub const fn new(pid: u64, oid: u64) -> Self {
        Self { pid, oid }
    }

    /// The root object (0, 0)
    #[must_use]
    pub const fn root() -> Self {
        Self::new(ROOT_PID, ROOT_OID)
    }

    /// The partition object (pid, 0)
    #[must_use]
    pub const fn partition(pid: u64) -> Self {
        Self::new(pid, PARTITION_OID)
    }
}

/// Object type codes, as stored in the catalog and reported on the CCAP
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[repr(u8)]
pub enum ObjectType {
    #[default]
    #[display("ILLEGAL")]
    Illegal = 0x00,
    #[display("ROOT")]
    Root = 0x01,
    #[display("PARTITION")]
    Partition = 0x02,
    #[display("COLLECTION")]
    Collection = 0x40,
    #[display("USEROBJECT")]
    UserObject = 0x80,
}

impl ObjectType {
    /// Decode a stored type byte; unknown codes map to `Illegal`
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0x01 => Self::Root,
            0x02 => Self::Partition,
            0x40 => Self::Collection,
            0x80 => Self::UserObject,
            _ => Self::Illegal,
        }
    }

    /// Wire code of this type
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Classify an address the way the id ranges lay it out
    #[must_use]
    pub const fn classify(pid: u64, oid: u64) -> Self {
        if pid == ROOT_PID && oid == ROOT_OID {
            Self::Root
        } else if pid >= PARTITION_PID_LB && oid == PARTITION_OID {
            Self::Partition
        } else {
            Self::Illegal
        }
    }
}

/// OSD2 service actions (cdb[8..10])
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
#[repr(u16)]
pub enum ServiceAction {
    ObjectStructureCheck = 0x8880,
    FormatOsd = 0x8881,
    Create = 0x8882,
    List = 0x8883,
    Punch = 0x8884,
    Read = 0x8885,
    Write = 0x8886,
    Append = 0x8887,
    Flush = 0x8888,
    Clear = 0x8889,
    Remove = 0x888A,
    CreatePartition = 0x888B,
    RemovePartition = 0x888C,
    Cas = 0x888D,
    GetAttributes = 0x888E,
    SetAttributes = 0x888F,
    Fa = 0x8890,
    CondSetattr = 0x8891,
    CreateAndWrite = 0x8892,
    CopyUserObjects = 0x8893,
    CreateUserTrackingCollection = 0x8894,
    CreateCollection = 0x8895,
    RemoveCollection = 0x8896,
    ListCollection = 0x8897,
    SetKey = 0x8898,
    SetMasterKey = 0x8899,
    FlushCollection = 0x889A,
    FlushPartition = 0x889B,
    FlushOsd = 0x889C,
    Query = 0x88A0,
    RemoveMemberObjects = 0x88A1,
    GetMemberAttributes = 0x88A2,
    SetMemberAttributes = 0x88A3,
    GenCas = 0x88A5,
    CreateClone = 0x88A8,
    CreateSnapshot = 0x88A9,
    DetachClone = 0x88AA,
    RefreshSnapshotOrClone = 0x88AB,
    RestorePartitionFromSnapshot = 0x88AC,
    ReadMap = 0x88B1,
    ReadMapsAndCompare = 0x88B2,
    PerformScsiCommand = 0x8F7C,
    PerformTaskMgmtFunc = 0x8F7D,
}

impl ServiceAction {
    /// All known actions, used for decoding
    const ALL: [Self; 43] = [
        Self::ObjectStructureCheck,
        Self::FormatOsd,
        Self::Create,
        Self::List,
        Self::Punch,
        Self::Read,
        Self::Write,
        Self::Append,
        Self::Flush,
        Self::Clear,
        Self::Remove,
        Self::CreatePartition,
        Self::RemovePartition,
        Self::Cas,
        Self::GetAttributes,
        Self::SetAttributes,
        Self::Fa,
        Self::CondSetattr,
        Self::CreateAndWrite,
        Self::CopyUserObjects,
        Self::CreateUserTrackingCollection,
        Self::CreateCollection,
        Self::RemoveCollection,
        Self::ListCollection,
        Self::SetKey,
        Self::SetMasterKey,
        Self::FlushCollection,
        Self::FlushPartition,
        Self::FlushOsd,
        Self::Query,
        Self::RemoveMemberObjects,
        Self::GetMemberAttributes,
        Self::SetMemberAttributes,
        Self::GenCas,
        Self::CreateClone,
        Self::CreateSnapshot,
        Self::DetachClone,
        Self::RefreshSnapshotOrClone,
        Self::RestorePartitionFromSnapshot,
        Self::ReadMap,
        Self::ReadMapsAndCompare,
        Self::PerformScsiCommand,
        Self::PerformTaskMgmtFunc,
    ];

    /// Decode a service action code
    #[must_use]
    pub fn from_u16(code: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|a| a.code() == code)
    }

    /// Wire code of this action
    #[must_use]
    pub const fn code(self) -> u16 {
        self as u16
    }

    /// Actions whose data allocation length (cdb[32..40]) sizes the output
    #[must_use]
    pub const fn returns_data(self) -> bool {
        matches!(
            self,
            Self::List
                | Self::ListCollection
                | Self::Read
                | Self::Query
                | Self::Cas
                | Self::Fa
                | Self::GenCas
                | Self::ReadMap
        )
    }
}

/// SCSI sense keys
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
#[repr(u8)]
pub enum SenseKey {
    #[display("NO_SENSE")]
    NoSense = 0x00,
    #[display("RECOVERED_ERROR")]
    RecoveredError = 0x01,
    #[display("NOT_READY")]
    NotReady = 0x02,
    #[display("MEDIUM_ERROR")]
    MediumError = 0x03,
    #[display("HARDWARE_ERROR")]
    HardwareError = 0x04,
    #[display("ILLEGAL_REQUEST")]
    IllegalRequest = 0x05,
    #[display("UNIT_ATTENTION")]
    UnitAttention = 0x06,
    #[display("DATA_PROTECTION")]
    DataProtection = 0x07,
}

impl SenseKey {
    /// Decode a sense key byte
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => Self::NoSense,
            0x01 => Self::RecoveredError,
            0x02 => Self::NotReady,
            0x03 => Self::MediumError,
            0x04 => Self::HardwareError,
            0x05 => Self::IllegalRequest,
            0x06 => Self::UnitAttention,
            0x07 => Self::DataProtection,
            _ => return None,
        })
    }
}

/// Additional sense code and qualifier packed as `ASC << 8 | ASCQ`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
#[display("{_0:#06x}")]
pub struct Asc(pub u16);

impl Asc {
    /// ASC 0, used for "bad CDB" reports on short input
    pub const NONE: Self = Self(0x0000);
    pub const INVALID_COMMAND_OPCODE: Self = Self(0x2000);
    pub const INVALID_FIELD_IN_CDB: Self = Self(0x2400);
    pub const INVALID_FIELD_IN_PARAM_LIST: Self = Self(0x2600);
    pub const PARAMETER_LIST_LENGTH_ERROR: Self = Self(0x1A00);
    pub const PART_OR_COLL_CONTAINS_USER_OBJECTS: Self = Self(0x2C0A);
    pub const READ_PAST_END_OF_USER_OBJECT: Self = Self(0x3B17);
    pub const QUOTA_ERROR: Self = Self(0x5507);
    pub const SYSTEM_RESOURCE_FAILURE: Self = Self(0x5500);

    /// Additional sense code byte
    #[must_use]
    pub const fn asc(self) -> u8 {
        (self.0 >> 8) as u8
    }

    /// Additional sense code qualifier byte
    #[must_use]
    pub const fn ascq(self) -> u8 {
        (self.0 & 0xFF) as u8
    }
}

/// Get/set attribute parameter format (cdb[11] bits 4..5)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GetSetFormat {
    /// Get one field into the retrieved area, set one value inline in the CDB
    Field,
    /// Get a whole page, set one value from the data-out buffer
    Page,
    /// Get and set attribute lists
    List,
}

impl GetSetFormat {
    /// Decode the two-bit format field; 0 is reserved
    #[must_use]
    pub const fn from_bits(bits: u8) -> Option<Self> {
        match bits & 0x3 {
            1 => Some(Self::Field),
            2 => Some(Self::Page),
            3 => Some(Self::List),
            _ => None,
        }
    }
}

/// Attribute list type codes (low nibble of the list header)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ListFormat {
    /// Retrieve list: (page, number) pairs only
    Retrieve = 0x01,
    /// Retrieved or set list with full entries
    Entries = 0x09,
    /// Retrieved multi-object list
    MultiObject = 0x0F,
}

impl ListFormat {
    /// Decode a list type nibble
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value & 0x0F {
            0x01 => Some(Self::Retrieve),
            0x09 => Some(Self::Entries),
            0x0F => Some(Self::MultiObject),
            _ => None,
        }
    }
}

/// Data-delivery topology for data commands (options bits 0..1)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Ddt {
    #[default]
    Contiguous,
    ScatterGather,
    Vector,
}

impl Ddt {
    /// Decode the options byte of a data command
    #[must_use]
    pub const fn from_options(options: u8) -> Option<Self> {
        match options & 0x3 {
            0 => Some(Self::Contiguous),
            1 => Some(Self::ScatterGather),
            2 => Some(Self::Vector),
            _ => None,
        }
    }
}

/// Query criteria combination (low nibble of query list byte 0)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryKind {
    Union,
    Intersect,
}

impl QueryKind {
    /// Decode the query type nibble
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value & 0x0F {
            0 => Some(Self::Union),
            1 => Some(Self::Intersect),
            _ => None,
        }
    }
}

/// READ_MAP requested map types
pub mod map_type {
    pub const ALL: u16 = 0x0000;
    pub const WRITTEN_DATA: u16 = 0x0001;
    pub const DATA_HOLE: u16 = 0x0002;
    pub const DAMAGED_DATA: u16 = 0x0003;
    pub const DAMAGED_ATTRIBUTES: u16 = 0x8000;
}
