//! Redb table definitions for the object catalog.

use redb::TableDefinition;

// Objects
// Key: (pid, oid), Value: object type code
pub const OBJECTS: TableDefinition<(u64, u64), u8> = TableDefinition::new("objects");

// Collection membership, kept in both directions
// Key: (pid, cid, oid), Value: slot on the member's collections page
pub const MEMBERS: TableDefinition<(u64, u64, u64), u32> = TableDefinition::new("members");
// Key: (pid, oid, cid), Value: slot
pub const MEMBER_OF: TableDefinition<(u64, u64, u64), u32> = TableDefinition::new("member_of");

// Attributes
// Key: (pid, oid, page, number), Value: attribute bytes (never empty)
pub const ATTRIBUTES: TableDefinition<(u64, u64, u32, u32), &[u8]> =
    TableDefinition::new("attributes");

// Catalog metadata
// Key: "catalog", Value: bincode-encoded CatalogInfo
pub const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
