//! Content-addressable storage with composable encryption and compression backends.
//!
//! Overview
//! - Blobs are keyed by the SHA-512 digest of their content (`ContentId`);
//!   writing identical bytes under the id they already hash to is a no-op.
//! - A uniform `Backend` contract — `token`/`exists`/`list`/`type_of`/`hash`/
//!   `read`/`write`/`delete`/`rename`, each with a streaming variant — is
//!   implemented by three base backends (`MemoryBackend`, `FilesBackend`,
//!   `BucketBackend`) and composed transparently by codec wrapper backends
//!   (`CompressionWrapper`, `SecretWrapper`, `AsymmetricWrapper`), any number
//!   of which can be stacked in any order over any base.
//! - `Frontend` builds mutable, versioned names on top of any `Backend`:
//!   each name resolves through a deterministic pointer slot to an
//!   append-only chain of immutable JSON tag records.
//!
//! Concurrency
//! - Every `Backend` write is gated by an optimistic `ConflictToken`
//!   (compare-and-swap on the resource's current hash/ETag, minted and
//!   checked by the same backend instance). The `Files` backend additionally
//!   serializes token-gated writes through an advisory cross-process lock.
//! - Every operation accepts a `Cancel` handle, checked cooperatively at
//!   stream chunk boundaries and lock-wait iterations — there is no async
//!   runtime here, just synchronous I/O with cooperative cancellation.
//!
//! Usage example
//! ```
//! use castore::{Cancel, Frontend, MemoryBackend, MimeType};
//!
//! let frontend = Frontend::new(MemoryBackend::new());
//! let cancel = Cancel::new();
//!
//! let cid = frontend.push(b"Hello, world!", MimeType::text_plain(), &cancel).unwrap().unwrap();
//! assert_eq!(frontend.pull(&cid, &cancel).unwrap().unwrap(), b"Hello, world!");
//!
//! frontend.set("doc", b"v1", MimeType::text_plain(), None, &cancel).unwrap();
//! assert_eq!(frontend.get("doc", &cancel).unwrap().unwrap(), b"v1");
//! ```

#![warn(missing_docs)]

pub mod asymmetric;
pub mod backend;
pub mod bucket;
pub mod cancel;
pub mod compress;
pub mod error;
pub mod files;
pub mod frontend;
pub mod id;
pub mod lock;
pub mod memory;
pub mod observer;
pub mod secret;

pub use asymmetric::{AsymmetricKey, AsymmetricWrapper, RsaKeyPair};
pub use backend::{Backend, Object};
pub use bucket::{BucketBackend, BucketClient, Head, ReqwestBucketClient};
pub use cancel::Cancel;
pub use compress::{Codec, CompressionWrapper};
pub use error::{Error, Result};
pub use files::FilesBackend;
pub use frontend::{Frontend, Tag, Tags};
pub use id::{ConflictToken, ContentId, MimeType};
pub use lock::LockGuard;
pub use memory::MemoryBackend;
pub use observer::{set_observer, Observer, Span};
pub use secret::SecretWrapper;
