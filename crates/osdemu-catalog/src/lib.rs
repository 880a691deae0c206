//! OSDEMU Catalog - transactional object store catalog
//!
//! This crate persists objects, collection membership and attributes in redb
//! and exposes them as narrow primitives on an open transaction, plus the
//! multi-table queries used by QUERY, LIST and SET_MEMBER_ATTRIBUTES.

pub mod attribute;
pub mod collection;
pub mod object;
pub mod query;
pub mod store;
pub mod tables;

// Re-exports
pub use attribute::StoredAttr;
pub use object::IdPage;
pub use query::{Criterion, ODE_LEN};
pub use store::{Catalog, CatalogError, CatalogInfo, CatalogResult, Exec, Txn};
