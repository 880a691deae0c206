//! Attribute page and number constants
//!
//! Pages are partitioned into per-object-type ranges. Inside a range the
//! relative page selects a standard, reserved, LUN or vendor page set.

use crate::types::ObjectType;

// Page bases
pub const USEROBJECT_PG: u32 = 0x0;
pub const PARTITION_PG: u32 = 0x3000_0000;
pub const COLLECTION_PG: u32 = 0x6000_0000;
pub const ROOT_PG: u32 = 0x9000_0000;
pub const RESERVED_PG: u32 = 0xC000_0000;
pub const ANY_PG: u32 = 0xF000_0000;
pub const CUR_CMD_ATTR_PG: u32 = 0xFFFF_FFFE;
pub const GETALLATTR_PG: u32 = 0xFFFF_FFFF;

// Relative page sets
pub const STD_PG_LB: u32 = 0x0;
pub const STD_PG_UB: u32 = 0x7F;
pub const RSRV_PG_LB: u32 = 0x80;
pub const RSRV_PG_UB: u32 = 0x7FFF;
pub const LUN_PG_LB: u32 = 0x1_0000;
pub const LUN_PG_UB: u32 = 0x1FFF_FFFF;
pub const VEND_PG_LB: u32 = 0x2000_0000;
pub const VEND_PG_UB: u32 = 0x2FFF_FFFF;

// Named pages
pub const USER_DIR_PG: u32 = 0x0;
pub const USER_INFO_PG: u32 = 0x1;
pub const USER_QUOTA_PG: u32 = 0x2;
pub const USER_TMSTMP_PG: u32 = 0x3;
pub const USER_COLL_PG: u32 = 0x4;
pub const USER_POLICY_PG: u32 = 0x5;
pub const USER_ATOMICS_PG: u32 = 0x6;
pub const ROOT_INFO_PG: u32 = ROOT_PG + 0x1;
pub const PARTITION_INFO_PG: u32 = PARTITION_PG + 0x1;
pub const PARTITION_TMSTMP_PG: u32 = PARTITION_PG + 0x3;

// Attribute numbers
pub const ATTRNUM_INFO: u32 = 0x0;
pub const ATTRNUM_UB: u32 = 0xFFFF_FFFE;
pub const ATTRNUM_GETALL: u32 = 0xFFFF_FFFF;

/// Maximum length of the page identification value (attribute number 0)
pub const ATTR_PAGE_ID_LEN: usize = 40;
/// Maximum stored attribute value length
pub const MAX_ATTR_LEN: usize = 0xFFFE;

/// Current command attributes page
pub mod ccap {
    pub const RICV: u32 = 0x1;
    pub const OBJT: u32 = 0x2;
    pub const PID: u32 = 0x3;
    pub const OID: u32 = 0x4;
    pub const APPADDR: u32 = 0x5;

    pub const RICV_LEN: usize = 32;

    // Offsets within the page-format rendering
    pub const RICV_OFF: usize = 8;
    pub const OBJT_OFF: usize = 40;
    pub const PID_OFF: usize = 44;
    pub const OID_OFF: usize = 52;
    pub const APPADDR_OFF: usize = 60;
    pub const TOTAL_LEN: usize = 68;
}

/// User object timestamps page
pub mod utsap {
    pub const CTIME: u32 = 0x1;
    pub const ATTR_ATIME: u32 = 0x2;
    pub const ATTR_MTIME: u32 = 0x3;
    pub const DATA_ATIME: u32 = 0x4;
    pub const DATA_MTIME: u32 = 0x5;

    pub const TIME_LEN: usize = 6;

    pub const CTIME_OFF: usize = 8;
    pub const ATTR_ATIME_OFF: usize = 14;
    pub const ATTR_MTIME_OFF: usize = 20;
    pub const DATA_ATIME_OFF: usize = 26;
    pub const DATA_MTIME_OFF: usize = 32;
    pub const TOTAL_LEN: usize = 38;
}

/// User object information page
pub mod uiap {
    pub const PID: u32 = 0x1;
    pub const OID: u32 = 0x2;
    pub const USERNAME: u32 = 0x9;
    pub const USED_CAPACITY: u32 = 0x81;
    pub const LOGICAL_LEN: u32 = 0x82;
    pub const PARTITION_CAPACITY_QUOTA: u32 = 0x1_0001;
}

/// Root information page
pub mod riap {
    pub const OSD_SYSTEM_ID: u32 = 0x3;
    pub const VENDOR_IDENTIFICATION: u32 = 0x4;
    pub const PRODUCT_IDENTIFICATION: u32 = 0x5;
    pub const PRODUCT_MODEL: u32 = 0x6;
    pub const PRODUCT_REVISION_LEVEL: u32 = 0x7;
    pub const PRODUCT_SERIAL_NUMBER: u32 = 0x8;
    pub const OSD_NAME: u32 = 0x9;
    pub const TOTAL_CAPACITY: u32 = 0x80;
    pub const USED_CAPACITY: u32 = 0x81;
    pub const NUMBER_OF_PARTITIONS: u32 = 0xC0;
    pub const CLOCK: u32 = 0x100;

    /// System id reported until FORMAT_OSD stores one
    pub const DEFAULT_SYSTEM_ID: [u8; 20] = *b"\xf1\x81\x00\x0eOSC     OSDEMU\x00\x00";
}

/// User object collections page
pub mod ucap {
    pub const COLL_PTR_LB: u32 = 0x1;
    pub const COLL_PTR_UB: u32 = 0xFFFF_FF00;
}

/// User object atomics page
pub mod atomics {
    pub const CAS: u32 = 0x1;
    pub const FA: u32 = 0x2;
}

// Identification strings
pub const ROOT_DIR_ID: &str = "INCITS  T10 Root Directory";
pub const ROOT_INFO_ID: &str = "INCITS  T10 Root Information";
pub const PARTITION_DIR_ID: &str = "INCITS  T10 Partition Directory";
pub const PARTITION_INFO_ID: &str = "INCITS  T10 Partition Information";
pub const PARTITION_TMSTMP_ID: &str = "INCITS  T10 Partition Timestamps";
pub const USER_DIR_ID: &str = "INCITS  T10 User Object Directory";
pub const USER_INFO_ID: &str = "INCITS  T10 User Object Information";
pub const USER_TMSTMP_ID: &str = "INCITS  T10 User Object Timestamps";
pub const USER_COLL_ID: &str = "INCITS  T10 User Object Collections";
pub const USER_ATOMICS_ID: &str = "INCITS  T10 User Object Atomics";
pub const COLL_DIR_ID: &str = "INCITS  T10 Collection Directory";
pub const ROOT_QUOTA_ID: &str = "INCITS  T10 Root Quotas";
pub const ROOT_TMSTMP_ID: &str = "INCITS  T10 Root Timestamps";
pub const ROOT_POLICY_ID: &str = "INCITS  T10 Root Policy/Security";
pub const UNIDENTIFIED_PAGE_ID: &str = "        unidentified attributes page";
pub const CUR_CMD_ID: &str = "INCITS  T10 Current Command";

/// Page range owned by an object type
#[must_use]
pub const fn page_base(obj_type: ObjectType) -> Option<u32> {
    match obj_type {
        ObjectType::UserObject => Some(USEROBJECT_PG),
        ObjectType::Collection => Some(COLLECTION_PG),
        ObjectType::Partition => Some(PARTITION_PG),
        ObjectType::Root => Some(ROOT_PG),
        ObjectType::Illegal => None,
    }
}

/// Whether `page` falls inside the range owned by `obj_type`
#[must_use]
pub const fn in_type_range(obj_type: ObjectType, page: u32) -> bool {
    match obj_type {
        ObjectType::UserObject => page < PARTITION_PG,
        ObjectType::Collection => COLLECTION_PG <= page && page < ROOT_PG,
        ObjectType::Partition => PARTITION_PG <= page && page < COLLECTION_PG,
        ObjectType::Root => ROOT_PG <= page && page < RESERVED_PG,
        ObjectType::Illegal => false,
    }
}

/// Whether attributes on `page` may be set for an object of `obj_type`
#[must_use]
pub const fn is_settable(obj_type: ObjectType, page: u32) -> bool {
    let Some(base) = page_base(obj_type) else {
        return false;
    };
    if !in_type_range(obj_type, page) {
        return page >= ANY_PG;
    }
    let rel = page - base;
    rel <= STD_PG_UB || (LUN_PG_LB <= rel && rel <= LUN_PG_UB)
}

/// Whether attributes on `page` may be retrieved for an object of `obj_type`
#[must_use]
pub const fn is_gettable(obj_type: ObjectType, page: u32) -> bool {
    let Some(base) = page_base(obj_type) else {
        return false;
    };
    if !in_type_range(obj_type, page) {
        return page >= ANY_PG;
    }
    let rel = page - base;
    !((RSRV_PG_LB <= rel && rel <= RSRV_PG_UB) || rel > VEND_PG_UB)
}

/// Pack an identification string the way it is stored: space padded and
/// NUL terminated to exactly [`ATTR_PAGE_ID_LEN`] bytes
#[must_use]
pub fn id_value(id: &str) -> Vec<u8> {
    let mut v = vec![b' '; ATTR_PAGE_ID_LEN];
    let n = id.len().min(ATTR_PAGE_ID_LEN - 1);
    v[..n].copy_from_slice(&id.as_bytes()[..n]);
    v[ATTR_PAGE_ID_LEN - 1] = 0;
    v
}
