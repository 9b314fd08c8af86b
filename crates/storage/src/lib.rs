//! Object storage for uploaded files.
//!
//! [`ObjectStore`] is the narrow surface the upload path and the scan worker
//! consume: presigning, metadata-tagged writes, streamed reads, idempotent
//! deletes and stat. Cloud backends live in their own crates.

pub mod error;
pub mod keys;
pub mod memory;
pub mod store;
pub mod types;

pub use error::StorageError;
pub use keys::{object_key, sanitize_file_name, tenant_segment};
pub use memory::MemoryObjectStore;
pub use store::ObjectStore;
pub use types::{ObjectInfo, ObjectPut, PresignedUrl, TENANT_ID_META, UPLOADED_BY_META};
