//! Descriptor-format sense data.
//!
//! A [`Sense`] is the error type of every command function. It is rendered
//! into the wire buffer only once, by the dispatcher, as an 8-byte header
//! followed by an optional object identification descriptor and an optional
//! command-specific information descriptor.

use osdemu_catalog::CatalogError;
use osdemu_common::{Asc, OSD_MAX_SENSE, ObjectId, SenseKey};
use tracing::{error, warn};

/// Response code for current, descriptor-format sense data
const RESPONSE_CODE: u8 = 0x72;
/// Functions reported as not initiated in the identification descriptor
const NOT_INITIATED_FUNCS: u32 = 0x3030_10b0;

const HDR_LEN: usize = 8;
const SDD_LEN: usize = 32;
const CSI_LEN: usize = 12;

/// Result type of command functions
pub type CmdResult<T> = Result<T, Sense>;

/// Structured sense data
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("sense {key} asc {asc}")]
pub struct Sense {
    pub key: SenseKey,
    pub asc: Asc,
    /// Object the failure is reported against
    pub ident: Option<ObjectId>,
    /// Command-specific information, only emitted with an identification
    pub csi: Option<u64>,
}

impl Sense {
    /// Header-only sense
    #[must_use]
    pub const fn header(key: SenseKey, asc: Asc) -> Self {
        Self {
            key,
            asc,
            ident: None,
            csi: None,
        }
    }

    /// Sense with object identification
    #[must_use]
    pub const fn sdd(key: SenseKey, asc: Asc, pid: u64, oid: u64) -> Self {
        Self {
            key,
            asc,
            ident: Some(ObjectId::new(pid, oid)),
            csi: None,
        }
    }

    /// Sense with object identification and command-specific information
    #[must_use]
    pub const fn sdd_csi(key: SenseKey, asc: Asc, pid: u64, oid: u64, csi: u64) -> Self {
        Self {
            key,
            asc,
            ident: Some(ObjectId::new(pid, oid)),
            csi: Some(csi),
        }
    }

    /// Invalid field in the CDB
    #[must_use]
    pub const fn cdb(pid: u64, oid: u64) -> Self {
        Self::sdd(SenseKey::IllegalRequest, Asc::INVALID_FIELD_IN_CDB, pid, oid)
    }

    /// Invalid field in a parameter list
    #[must_use]
    pub const fn param_list(pid: u64, oid: u64) -> Self {
        Self::sdd(
            SenseKey::IllegalRequest,
            Asc::INVALID_FIELD_IN_PARAM_LIST,
            pid,
            oid,
        )
    }

    /// Parameter list length error
    #[must_use]
    pub const fn param_list_len(pid: u64, oid: u64) -> Self {
        Self::sdd(
            SenseKey::IllegalRequest,
            Asc::PARAMETER_LIST_LENGTH_ERROR,
            pid,
            oid,
        )
    }

    /// Per-object I/O failure
    #[must_use]
    pub const fn hw(pid: u64, oid: u64) -> Self {
        Self::sdd(SenseKey::HardwareError, Asc::INVALID_FIELD_IN_CDB, pid, oid)
    }

    /// Resource exhaustion, reported without identification
    #[must_use]
    pub const fn resource() -> Self {
        Self::header(SenseKey::HardwareError, Asc::SYSTEM_RESOURCE_FAILURE)
    }

    /// Malformed request that carries no specific additional sense code
    #[must_use]
    pub const fn bad_cdb(pid: u64, oid: u64) -> Self {
        Self::sdd(SenseKey::IllegalRequest, Asc::NONE, pid, oid)
    }

    /// Command recognised but not implemented
    #[must_use]
    pub const fn unimplemented(pid: u64, oid: u64) -> Self {
        Self::sdd(SenseKey::IllegalRequest, Asc::INVALID_COMMAND_OPCODE, pid, oid)
    }

    /// Partition or collection still holds objects
    #[must_use]
    pub const fn not_empty(pid: u64, oid: u64) -> Self {
        Self::sdd(
            SenseKey::IllegalRequest,
            Asc::PART_OR_COLL_CONTAINS_USER_OBJECTS,
            pid,
            oid,
        )
    }

    /// Read ended before the requested length; `transferred` bytes came
    /// from the object
    #[must_use]
    pub const fn read_past_end(pid: u64, oid: u64, transferred: u64) -> Self {
        Self::sdd_csi(
            SenseKey::RecoveredError,
            Asc::READ_PAST_END_OF_USER_OBJECT,
            pid,
            oid,
            transferred,
        )
    }

    /// Attach an identification when none was recorded yet
    #[must_use]
    pub fn or_at(mut self, pid: u64, oid: u64) -> Self {
        if self.ident.is_none() {
            self.ident = Some(ObjectId::new(pid, oid));
        }
        self
    }

    /// Whether the command completed with recovered data
    #[must_use]
    pub fn is_recovered(&self) -> bool {
        self.key == SenseKey::RecoveredError
    }

    /// Render the sense buffer
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HDR_LEN + SDD_LEN + CSI_LEN);
        out.extend_from_slice(&[
            RESPONSE_CODE,
            self.key as u8,
            self.asc.asc(),
            self.asc.ascq(),
            0,
            0,
            0,
            0,
        ]);

        if let Some(id) = self.ident {
            out.extend_from_slice(&[0x06, 0x1E, 0, 0, 0, 0, 0, 0]);
            out.extend_from_slice(&NOT_INITIATED_FUNCS.to_be_bytes());
            out.extend_from_slice(&0u32.to_be_bytes());
            out.extend_from_slice(&id.pid.to_be_bytes());
            out.extend_from_slice(&id.oid.to_be_bytes());

            if let Some(csi) = self.csi {
                out.extend_from_slice(&[0x01, 0x0A, 0, 0]);
                out.extend_from_slice(&csi.to_be_bytes());
            }
        }
        debug_assert!(out.len() <= OSD_MAX_SENSE);
        #[allow(clippy::cast_possible_truncation)]
        {
            out[7] = (out.len() - HDR_LEN) as u8;
        }

        match self.ident {
            Some(id) => warn!(
                "Built sense key={} asc={} for {} csi={:?}",
                self.key, self.asc, id, self.csi
            ),
            None => warn!("Built sense key={} asc={}", self.key, self.asc),
        }
        out
    }
}

impl From<CatalogError> for Sense {
    fn from(e: CatalogError) -> Self {
        error!("Catalog failure: {}", e);
        Self::resource()
    }
}

impl From<osdemu_common::Error> for Sense {
    fn from(e: osdemu_common::Error) -> Self {
        let (key, asc) = e.sense_class();
        if key == SenseKey::HardwareError {
            error!("Command failed: {}", e);
        }
        Self::header(key, asc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osdemu_common::wire::be64;

    #[test]
    fn test_header_only_layout() {
        let bytes = Sense::header(SenseKey::IllegalRequest, Asc::INVALID_COMMAND_OPCODE).to_bytes();
        assert_eq!(bytes, vec![0x72, 0x05, 0x20, 0x00, 0, 0, 0, 0]);
    }

    #[test]
    fn test_identification_layout() {
        let bytes = Sense::cdb(0x10000, 0x10003).to_bytes();
        assert_eq!(bytes.len(), 40);
        assert_eq!(&bytes[..4], &[0x72, 0x05, 0x24, 0x00]);
        assert_eq!(bytes[7], 32);
        assert_eq!(&bytes[8..10], &[0x06, 0x1E]);
        assert_eq!(&bytes[16..20], &[0x30, 0x30, 0x10, 0xb0]);
        assert_eq!(be64(&bytes, 24).unwrap(), 0x10000);
        assert_eq!(be64(&bytes, 32).unwrap(), 0x10003);
    }

    #[test]
    fn test_csi_layout() {
        let sense = Sense::read_past_end(0x10000, 0x10000, 22);
        assert!(sense.is_recovered());
        let bytes = sense.to_bytes();
        assert_eq!(bytes.len(), 52);
        assert_eq!(bytes[1], SenseKey::RecoveredError as u8);
        assert_eq!(&bytes[2..4], &[0x3B, 0x17]);
        assert_eq!(bytes[7], 44);
        assert_eq!(&bytes[40..42], &[0x01, 0x0A]);
        assert_eq!(be64(&bytes, 44).unwrap(), 22);
    }

    #[test]
    fn test_or_at_keeps_existing_ident() {
        let sense = Sense::cdb(1, 2).or_at(3, 4);
        assert_eq!(sense.ident, Some(ObjectId::new(1, 2)));
        let sense = Sense::resource().or_at(3, 4);
        assert_eq!(sense.ident, Some(ObjectId::new(3, 4)));
    }

    #[test]
    fn test_from_common_error() {
        let sense = Sense::from(osdemu_common::Error::invalid_param_list("type"));
        assert_eq!(sense.key, SenseKey::IllegalRequest);
        assert_eq!(sense.asc, Asc::INVALID_FIELD_IN_PARAM_LIST);
        assert!(sense.ident.is_none());
    }
}
