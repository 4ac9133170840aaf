//! Job record model and document stores for Cadence.
//!
//! The scheduler only ever talks to a [`JobStore`]. This crate defines that
//! boundary along with the record type it moves across it:
//!
//! - **Records**: [`JobRecord`], [`JobStatus`] and [`NewJob`]
//! - **Queries**: [`JobFilter`] and [`JobUpdate`], a small typed query language
//!   covering exactly what the scheduler needs
//! - **Stores**: [`MemoryStore`] (in-process) and [`FileStore`] (a JSON file shared between processes)

mod error;
mod file;
mod memory;
mod query;
mod record;
mod store;

pub use error::StoreError;
pub use file::FileStore;
pub use memory::MemoryStore;
pub use query::{JobFilter, JobUpdate, LockFilter};
pub use record::{JobId, JobRecord, JobStatus, NewJob};
pub use store::JobStore;
