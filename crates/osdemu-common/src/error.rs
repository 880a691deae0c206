//! Error types for OSDEMU
//!
//! This module defines the common error type shared by the wire codec, the
//! object data files and the command engine, together with its mapping onto
//! SCSI sense keys and additional sense codes.

use crate::types::{Asc, ObjectId, SenseKey};
use thiserror::Error;

/// Common result type for OSDEMU operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for OSDEMU
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("object not found: {0}")]
    ObjectNotFound(ObjectId),

    #[error("object already exists: {0}")]
    ObjectAlreadyExists(ObjectId),

    // Wire codec errors
    #[error("buffer overflow: need {needed} bytes, have {available}")]
    Overflow { needed: usize, available: usize },

    #[error("truncated input: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    // Command decoding errors
    #[error("invalid field in CDB: {0}")]
    InvalidCdb(String),

    #[error("invalid field in parameter list: {0}")]
    InvalidParamList(String),

    #[error("parameter list length error: {0}")]
    ParamListLength(String),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a not implemented error
    pub fn not_implemented(feature: impl Into<String>) -> Self {
        Self::NotImplemented(feature.into())
    }

    /// Create an invalid CDB field error
    pub fn invalid_cdb(msg: impl Into<String>) -> Self {
        Self::InvalidCdb(msg.into())
    }

    /// Create an invalid parameter list error
    pub fn invalid_param_list(msg: impl Into<String>) -> Self {
        Self::InvalidParamList(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Check if this is a transient I/O condition worth retrying
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::DiskIo(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::ObjectNotFound(_) => true,
            Self::DiskIo(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Sense key and additional sense code reported for this error
    #[must_use]
    pub fn sense_class(&self) -> (SenseKey, Asc) {
        match self {
            // Caller addressed something that does not exist or is malformed
            Self::ObjectNotFound(_)
            | Self::ObjectAlreadyExists(_)
            | Self::Overflow { .. }
            | Self::Truncated { .. }
            | Self::InvalidCdb(_) => (SenseKey::IllegalRequest, Asc::INVALID_FIELD_IN_CDB),

            Self::DiskIo(e) if e.kind() == std::io::ErrorKind::NotFound => {
                (SenseKey::IllegalRequest, Asc::INVALID_FIELD_IN_CDB)
            }

            Self::InvalidParamList(_) => {
                (SenseKey::IllegalRequest, Asc::INVALID_FIELD_IN_PARAM_LIST)
            }

            Self::ParamListLength(_) => {
                (SenseKey::IllegalRequest, Asc::PARAMETER_LIST_LENGTH_ERROR)
            }

            Self::NotImplemented(_) => (SenseKey::IllegalRequest, Asc::INVALID_COMMAND_OPCODE),

            // Per-object I/O failures
            Self::DiskIo(_) | Self::Storage(_) => {
                (SenseKey::HardwareError, Asc::INVALID_FIELD_IN_CDB)
            }

            Self::Internal(_) | Self::Configuration(_) => {
                (SenseKey::HardwareError, Asc::SYSTEM_RESOURCE_FAILURE)
            }
        }
    }
}
