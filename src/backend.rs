//! The `Backend` contract: the uniform interface every storage node — base
//! or wrapper — implements.
//!
//! Streams are modeled as `Read`/`Write` trait objects rather than an async
//! `Stream`, a pull-based chunk-at-a-time style that keeps every
//! implementation synchronous. `list()` returns a `Vec` rather than a lazy
//! iterator: every base backend here (Memory, Files, Bucket) has to walk its
//! whole namespace to enumerate it anyway, so laziness isn't worth the added
//! object-safety cost of a boxed streaming iterator in a `dyn Backend`.

use std::io::{Read, Write};

use crate::cancel::Cancel;
use crate::error::Result;
use crate::id::{ConflictToken, ContentId, MimeType};

/// A resolved read: the stored bytes together with their recorded MIME type.
#[derive(Clone, Debug)]
pub struct Object {
    /// The object's declared MIME type.
    pub ty: MimeType,
    /// The object's plaintext-at-this-layer bytes.
    pub bytes: Vec<u8>,
}

/// Every Backend exposes this uniform contract.
///
/// All fallible operations return `Ok(None)`/`Ok(false)` for expected
/// absence/conflict; they return `Err` only for genuinely unexpected
/// conditions (I/O errors other than not-found, network faults other than
/// 404/409/412).
pub trait Backend: Send + Sync {
    /// This backend instance's identity, used to bind `ConflictToken`s minted by it.
    fn backend_id(&self) -> u64;

    /// Current token for `id`, or `None` if the resource is absent.
    fn token(&self, id: &ContentId, cancel: &Cancel) -> Result<Option<ConflictToken>>;

    /// Whether `id` currently has a stored object.
    fn exists(&self, id: &ContentId, cancel: &Cancel) -> Result<bool>;

    /// Enumerate stored ids. Ordering is unspecified; may reflect a running snapshot.
    fn list(&self, cancel: &Cancel) -> Result<Vec<ContentId>>;

    /// The stored MIME type for `id`, or `None` if absent.
    fn type_of(&self, id: &ContentId, cancel: &Cancel) -> Result<Option<MimeType>>;

    /// The stored-bytes hash (or ETag) for `id`, or `None` if absent.
    fn hash(&self, id: &ContentId, cancel: &Cancel) -> Result<Option<String>>;

    /// Read the full object, or `None` if absent.
    fn read(&self, id: &ContentId, cancel: &Cancel) -> Result<Option<Object>>;

    /// Conditionally write `bytes` under `id`. Succeeds (`Ok(true)`) iff:
    /// - `token` is `None` and `id` does not currently exist, or
    /// - `token` is `Some` and `id` exists with `hash == token.value`.
    ///
    /// Otherwise returns `Ok(false)`.
    fn write(
        &self,
        id: &ContentId,
        bytes: &[u8],
        ty: MimeType,
        token: Option<&ConflictToken>,
        cancel: &Cancel,
    ) -> Result<bool>;

    /// Conditionally delete `id`. Requires a token matching the current hash.
    fn delete(&self, id: &ContentId, token: &ConflictToken, cancel: &Cancel) -> Result<bool>;

    /// A pull-based stream of the object's bytes, or `None` if absent.
    fn read_stream(&self, id: &ContentId, cancel: &Cancel) -> Result<Option<(Box<dyn Read + Send>, MimeType)>>;

    /// Stream-write `reader`'s contents under `id`, under the same CAS gate as `write`.
    fn write_stream(
        &self,
        id: &ContentId,
        reader: &mut dyn Read,
        ty: MimeType,
        token: Option<&ConflictToken>,
        cancel: &Cancel,
    ) -> Result<bool>;

    /// Move the stored object from `source` to `target` without rehashing.
    /// Succeeds iff `source` exists and `target` does not.
    fn rename(&self, source: &ContentId, target: &ContentId, cancel: &Cancel) -> Result<bool>;
}

/// An `Arc`'d backend is itself a `Backend` — lets one base backend be
/// shared underneath several independently-constructed wrapper stacks (e.g.
/// a `Secret`-wrapped view and a raw inspection view over the same store),
/// without cloning its state.
impl<B: Backend + ?Sized> Backend for std::sync::Arc<B> {
    fn backend_id(&self) -> u64 {
        (**self).backend_id()
    }

    fn token(&self, id: &ContentId, cancel: &Cancel) -> Result<Option<ConflictToken>> {
        (**self).token(id, cancel)
    }

    fn exists(&self, id: &ContentId, cancel: &Cancel) -> Result<bool> {
        (**self).exists(id, cancel)
    }

    fn list(&self, cancel: &Cancel) -> Result<Vec<ContentId>> {
        (**self).list(cancel)
    }

    fn type_of(&self, id: &ContentId, cancel: &Cancel) -> Result<Option<MimeType>> {
        (**self).type_of(id, cancel)
    }

    fn hash(&self, id: &ContentId, cancel: &Cancel) -> Result<Option<String>> {
        (**self).hash(id, cancel)
    }

    fn read(&self, id: &ContentId, cancel: &Cancel) -> Result<Option<Object>> {
        (**self).read(id, cancel)
    }

    fn write(
        &self,
        id: &ContentId,
        bytes: &[u8],
        ty: MimeType,
        token: Option<&ConflictToken>,
        cancel: &Cancel,
    ) -> Result<bool> {
        (**self).write(id, bytes, ty, token, cancel)
    }

    fn delete(&self, id: &ContentId, token: &ConflictToken, cancel: &Cancel) -> Result<bool> {
        (**self).delete(id, token, cancel)
    }

    fn read_stream(&self, id: &ContentId, cancel: &Cancel) -> Result<Option<(Box<dyn Read + Send>, MimeType)>> {
        (**self).read_stream(id, cancel)
    }

    fn write_stream(
        &self,
        id: &ContentId,
        reader: &mut dyn Read,
        ty: MimeType,
        token: Option<&ConflictToken>,
        cancel: &Cancel,
    ) -> Result<bool> {
        (**self).write_stream(id, reader, ty, token, cancel)
    }

    fn rename(&self, source: &ContentId, target: &ContentId, cancel: &Cancel) -> Result<bool> {
        (**self).rename(source, target, cancel)
    }
}

/// Copy a reader into a writer while feeding a hasher, chunk by chunk,
/// honoring cancellation between chunks — the streaming discipline shared by
/// every backend's `write_stream`/`writeStream` implementation.
pub(crate) fn copy_hashing<R: Read, W: Write, H: sha2::digest::Update>(
    mut reader: R,
    mut writer: W,
    hasher: &mut H,
    cancel: &Cancel,
) -> std::io::Result<usize> {
    const CHUNK: usize = 64 * 1024;
    let mut buf = vec![0u8; CHUNK];
    let mut total = 0usize;
    loop {
        if cancel.is_cancelled() {
            return Err(std::io::Error::other("cancelled"));
        }
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n])?;
        total += n;
    }
    Ok(total)
}
