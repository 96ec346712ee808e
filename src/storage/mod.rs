//! Upload storage subsystem.
//!
//! # Data Flow
//! ```text
//! multipart part
//!     → http::upload (extract, size check, content type)
//!     → file_store.rs (write under <id>_<basename>, index in memory)
//!     → executor sees FileUpload { path, ... }
//!     → deleted after the request, on TTL sweep, or on close
//! ```

pub mod file_store;

pub use file_store::{sanitize_filename, FileStore, StoreError, TemporaryFileStore, UploadedFile};
