//! # dsrepl Storage
//!
//! Byte-store backends underneath the dsrepl changelog.
//!
//! Backends are **opaque byte stores**: they know nothing about change
//! records, CSNs or segment naming. The changelog in `dsrepl_core` owns the
//! record envelope and only asks a backend to read, append and sync bytes.
//!
//! ## Design Principles
//!
//! - One writer handle per file, any number of read-only handles
//! - Read-only handles can [`StorageBackend::refresh`] to observe bytes
//!   appended through the writer handle
//! - Must be `Send + Sync` so segment readers can move between threads
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For tests and record codec checks
//! - [`FileBackend`] - Segment files on the local file system
//!
//! ## Example
//!
//! ```rust
//! use dsrepl_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"change").unwrap();
//! assert_eq!(backend.read_at(offset, 6).unwrap(), b"change");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::{AccessMode, StorageBackend};
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
