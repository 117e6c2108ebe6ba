//! chunkstore: random-access virtual files over stores that have no files.
//!
//! A logical file is kept as an ordered run of immutable, size-bounded
//! blobs in an object store bucket, a document store collection, or a log
//! broker topic.  The [`connector::Connector`] contract hides which one:
//! writes are chunked into blobs, reads are reassembled from them, and
//! partial deletes fall back to compaction where the backend cannot delete
//! selectively.

use std::future::Future;
use std::pin::Pin;

pub mod blob;
pub mod chunking;
pub mod config;
pub mod connector;
pub mod errors;
pub mod handles;
pub mod key;
pub mod logging;
pub mod metrics;
pub mod path;
pub mod storage;

pub use blob::{Blob, LogCoordinates};
pub use connector::{BlobBackend, BlobConnector, Children, Connector};
pub use errors::{BlobError, Result};
pub use path::VirtualPath;

/// Boxed `Send` future returned by every async trait method in the crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
