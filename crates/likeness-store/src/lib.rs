//! likeness-store: Durable identities and face signature records.
//!
//! SQLite holds two tables: `identities` and `signatures`, the latter owned by
//! the former. Every mutation runs in a single transaction so a record is
//! never visible half-written and an identity never outlives, or is outlived
//! by, its signatures.

mod codec;
mod records;
mod store;

pub use records::{Identity, IdentityProfile, SignatureRecord};
pub use store::{SignatureStore, StoreError};
