//! The naming layer: mutable, versioned names built entirely on the
//! `Backend` contract (`spec.md` §4.8). `Frontend` never bypasses a
//! `Backend` — every operation here reduces to `read`/`write`/`rename` calls
//! on whatever `Backend` it was constructed with.
//!
//! A name `n` resolves through a deterministic *pointer slot* at
//! `ContentId::of_name(n)` to the id of its current [`Tag`] record. Tag
//! records are themselves pushed as content-addressed JSON blobs and are
//! never rewritten; `pre` links each to its predecessor, giving every name
//! an append-only version chain. Only the pointer slot is mutable, and it is
//! mutated exclusively through the same optimistic CAS the `Backend`
//! contract already provides.

use std::io::Read;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::cancel::Cancel;
use crate::error::{Error, Result};
use crate::id::{ConflictToken, ContentId, MimeType};

/// An immutable record describing one version of a named entity.
///
/// Pushed as a content-addressed JSON blob; never rewritten once pushed.
/// `pre` chains to the id of the previous tag record for the same `name`,
/// terminating at `None` for the first-ever tag.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tag {
    /// The human-readable name this tag describes.
    pub name: String,
    /// The blob this tag points to, or `None` for a tombstone.
    pub cid: Option<ContentId>,
    /// The MIME type of the pointed-to blob.
    #[serde(rename = "type")]
    pub ty: MimeType,
    /// Creation timestamp, milliseconds since the Unix epoch.
    pub date: i64,
    /// The id of the previous tag record for this name, or `None` if this is the first.
    pub pre: Option<ContentId>,
}

fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

/// Tees a reader through a running SHA-512 hash, used by [`Frontend::push_stream`]
/// to compute the content id without buffering the whole stream up front.
struct HashingTee<'a> {
    inner: &'a mut dyn Read,
    hasher: sha2::Sha512,
}

impl Read for HashingTee<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        sha2::digest::Update::update(&mut self.hasher, &buf[..n]);
        Ok(n)
    }
}

/// Naming, history, and content-addressing, layered on any `Backend`.
pub struct Frontend {
    backend: Box<dyn Backend>,
}

impl Frontend {
    /// Build a `Frontend` over `backend` — a base backend, or any stack of
    /// codec wrappers around one.
    pub fn new(backend: impl Backend + 'static) -> Self {
        Self { backend: Box::new(backend) }
    }

    /// The `Backend` this frontend is built on, for callers that need to
    /// drop to the raw contract (e.g. to mint a token for a retry).
    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// Push `bytes` under their content id. Idempotent: re-pushing identical
    /// bytes returns the same id without rewriting anything. `None` only on
    /// a genuine CAS race against a concurrent, conflicting write.
    pub fn push(&self, bytes: &[u8], ty: MimeType, cancel: &Cancel) -> Result<Option<ContentId>> {
        let cid = ContentId::of_content(bytes);
        let token = self.backend.token(&cid, cancel)?;
        if self.backend.write(&cid, bytes, ty, token.as_ref(), cancel)? {
            Ok(Some(cid))
        } else {
            Ok(None)
        }
    }

    /// Read the bytes stored at `cid`, or `None` if absent.
    pub fn pull(&self, cid: &ContentId, cancel: &Cancel) -> Result<Option<Vec<u8>>> {
        Ok(self.backend.read(cid, cancel)?.map(|o| o.bytes))
    }

    /// Stream `reader` into storage under its eventual content id: body is
    /// hashed incrementally while landing at a temporary name, then
    /// published under the computed digest via `rename` — so a partially
    /// written stream never becomes visible under its final id.
    pub fn push_stream(&self, reader: &mut dyn Read, ty: MimeType, cancel: &Cancel) -> Result<Option<ContentId>> {
        let tmp = ContentId::of_name(&uuid::Uuid::new_v4().to_string());
        let mut tee = HashingTee { inner: reader, hasher: sha2::Sha512::default() };
        if !self.backend.write_stream(&tmp, &mut tee, ty, None, cancel)? {
            return Ok(None);
        }
        let digest = sha2::digest::FixedOutput::finalize_fixed(tee.hasher);
        let cid = ContentId::parse(hex::encode(digest))?;

        if self.backend.rename(&tmp, &cid, cancel)? {
            return Ok(Some(cid));
        }
        // The target may already exist because another writer pushed the
        // same content first — content addressing makes that a convergence,
        // not a conflict. Clean up the now-orphaned temp entry either way.
        let converged = self.backend.exists(&cid, cancel)?;
        if let Some(tok) = self.backend.token(&tmp, cancel)? {
            let _ = self.backend.delete(&tmp, &tok, cancel);
        }
        if converged {
            Ok(Some(cid))
        } else {
            Ok(None)
        }
    }

    /// A stream over the bytes stored at `cid`, or `None` if absent.
    pub fn pull_stream(
        &self,
        cid: &ContentId,
        cancel: &Cancel,
    ) -> Result<Option<(Box<dyn Read + Send>, MimeType)>> {
        self.backend.read_stream(cid, cancel)
    }

    /// The current tag record id for `name`, read from its pointer slot.
    fn pointer(&self, name: &str, cancel: &Cancel) -> Result<Option<ContentId>> {
        let nid = ContentId::of_name(name);
        let Some(obj) = self.backend.read(&nid, cancel)? else { return Ok(None) };
        let s = std::str::from_utf8(&obj.bytes).map_err(|_| Error::Integrity)?;
        Ok(Some(ContentId::parse(s)?))
    }

    /// The current tag record for `name`, or `None` if the name has never been written.
    pub fn tag(&self, name: &str, cancel: &Cancel) -> Result<Option<Tag>> {
        let Some(tid) = self.pointer(name, cancel)? else { return Ok(None) };
        let Some(obj) = self.backend.read(&tid, cancel)? else { return Ok(None) };
        Ok(Some(serde_json::from_slice(&obj.bytes)?))
    }

    /// Lazily walk `name`'s version chain, newest first, terminating at the
    /// first-ever tag (whose `pre` is `None`). `None` if `name` has never
    /// been written.
    pub fn tags<'a>(&'a self, name: &str, cancel: &Cancel) -> Result<Option<Tags<'a>>> {
        match self.pointer(name, cancel)? {
            Some(head) => Ok(Some(Tags { frontend: self, next: Some(head), cancel: cancel.clone() })),
            None => Ok(None),
        }
    }

    /// Whether `name` currently points at content (not a tombstone, not absent).
    pub fn has(&self, name: &str, cancel: &Cancel) -> Result<bool> {
        Ok(self.tag(name, cancel)?.is_some_and(|t| t.cid.is_some()))
    }

    /// The bytes `name` currently points to, or `None` if absent/tombstoned.
    pub fn get(&self, name: &str, cancel: &Cancel) -> Result<Option<Vec<u8>>> {
        let Some(tag) = self.tag(name, cancel)? else { return Ok(None) };
        let Some(cid) = tag.cid else { return Ok(None) };
        self.pull(&cid, cancel)
    }

    /// `name`'s content, decoded as UTF-8 text.
    pub fn text(&self, name: &str, cancel: &Cancel) -> Result<Option<String>> {
        match self.get(name, cancel)? {
            Some(bytes) => Ok(Some(String::from_utf8(bytes).map_err(|_| Error::Integrity)?)),
            None => Ok(None),
        }
    }

    /// `name`'s content, parsed as JSON.
    pub fn json(&self, name: &str, cancel: &Cancel) -> Result<Option<serde_json::Value>> {
        match self.get(name, cancel)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// The token on `name`'s pointer slot — not on the tag blob, not on the content blob.
    pub fn token(&self, name: &str, cancel: &Cancel) -> Result<Option<ConflictToken>> {
        self.backend.token(&ContentId::of_name(name), cancel)
    }

    /// The shared shape of `set`/`write_stream`/`copy`/`delete`: push a tag
    /// record chained onto `name`'s current history, then CAS-write the
    /// pointer slot to reference it. Returns the CAS write's result.
    ///
    /// Steps 2 (read `pre`) and 4 (CAS the pointer) are not serialized: two
    /// concurrent callers can each read the same `pre`, each push a distinct
    /// tag record, and race on step 4. The loser's tag blob is orphaned but
    /// harmless — content-addressed storage, so no corruption, just an
    /// unreachable record (`spec.md` §4.8's documented open question).
    fn commit(
        &self,
        name: &str,
        cid: Option<ContentId>,
        ty: MimeType,
        token: Option<&ConflictToken>,
        cancel: &Cancel,
    ) -> Result<bool> {
        let pre = self.pointer(name, cancel)?;
        let tagdata = Tag { name: name.to_string(), cid, ty, date: now_millis(), pre };
        let bytes = serde_json::to_vec(&tagdata)?;
        let tid = self
            .push(&bytes, MimeType::json_utf8(), cancel)?
            .ok_or(Error::Integrity)?;
        let nid = ContentId::of_name(name);
        self.backend.write(&nid, tid.as_str().as_bytes(), MimeType::sha512_pointer(), token, cancel)
    }

    /// Push `bytes` and chain a new tag for `name` onto it.
    pub fn set(&self, name: &str, bytes: &[u8], ty: MimeType, token: Option<&ConflictToken>, cancel: &Cancel) -> Result<bool> {
        let cid = self.push(bytes, ty.clone(), cancel)?.ok_or(Error::Integrity)?;
        self.commit(name, Some(cid), ty, token, cancel)
    }

    /// Stream `reader` into storage and chain a new tag for `name` onto the result.
    pub fn write_stream(
        &self,
        name: &str,
        reader: &mut dyn Read,
        ty: MimeType,
        token: Option<&ConflictToken>,
        cancel: &Cancel,
    ) -> Result<bool> {
        let cid = self.push_stream(reader, ty.clone(), cancel)?.ok_or(Error::Integrity)?;
        self.commit(name, Some(cid), ty, token, cancel)
    }

    /// Point `dest` at `source`'s current content, without rehashing or
    /// re-pushing it. Does not mutate `source`'s history.
    pub fn copy(&self, source: &str, dest: &str, token: Option<&ConflictToken>, cancel: &Cancel) -> Result<bool> {
        let Some(tag) = self.tag(source, cancel)? else { return Ok(false) };
        self.commit(dest, tag.cid, tag.ty, token, cancel)
    }

    /// Chain a tombstone tag (`cid = None`, `type = application/empty`) onto `name`.
    /// Prior history remains walkable through `tags`.
    pub fn delete(&self, name: &str, token: Option<&ConflictToken>, cancel: &Cancel) -> Result<bool> {
        self.commit(name, None, MimeType::empty(), token, cancel)
    }
}

/// A lazy, finite walk of a name's tag chain, newest first. Returned by
/// [`Frontend::tags`].
pub struct Tags<'a> {
    frontend: &'a Frontend,
    next: Option<ContentId>,
    cancel: Cancel,
}

impl Iterator for Tags<'_> {
    type Item = Result<Tag>;

    fn next(&mut self) -> Option<Self::Item> {
        let tid = self.next.take()?;
        match self.frontend.backend.read(&tid, &self.cancel) {
            Ok(Some(obj)) => match serde_json::from_slice::<Tag>(&obj.bytes) {
                Ok(tag) => {
                    self.next = tag.pre.clone();
                    Some(Ok(tag))
                }
                Err(e) => Some(Err(e.into())),
            },
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;

    fn frontend() -> Frontend {
        Frontend::new(MemoryBackend::new())
    }

    #[test]
    fn push_then_pull_roundtrips_and_is_idempotent() {
        let fe = frontend();
        let cancel = Cancel::new();
        let cid1 = fe.push(b"Hello, world!", MimeType::text_plain(), &cancel).unwrap().unwrap();
        let cid2 = fe.push(b"Hello, world!", MimeType::text_plain(), &cancel).unwrap().unwrap();
        assert_eq!(cid1, cid2);
        assert_eq!(fe.pull(&cid1, &cancel).unwrap().unwrap(), b"Hello, world!");
    }

    #[test]
    fn push_stream_matches_push() {
        let fe = frontend();
        let cancel = Cancel::new();
        let chunks: Vec<&[u8]> = vec![b"test", b" - ", b"data"];
        let mut joined = Vec::new();
        for c in &chunks {
            joined.extend_from_slice(c);
        }
        let mut reader = std::io::Cursor::new(joined.clone());
        let cid = fe.push_stream(&mut reader, MimeType::octet_stream(), &cancel).unwrap().unwrap();
        assert_eq!(cid, ContentId::of_content(&joined));
        let (mut s, _ty) = fe.pull_stream(&cid, &cancel).unwrap().unwrap();
        let mut out = Vec::new();
        s.read_to_end(&mut out).unwrap();
        assert_eq!(out, joined);
    }

    #[test]
    fn set_then_update_with_token_advances_history() {
        let fe = frontend();
        let cancel = Cancel::new();
        assert!(fe.set("doc", b"v1", MimeType::text_plain(), None, &cancel).unwrap());
        assert_eq!(fe.get("doc", &cancel).unwrap().unwrap(), b"v1");

        let tok = fe.token("doc", &cancel).unwrap().unwrap();
        assert!(fe.set("doc", b"v2", MimeType::text_plain(), Some(&tok), &cancel).unwrap());
        assert_eq!(fe.get("doc", &cancel).unwrap().unwrap(), b"v2");

        let entries: Vec<Tag> = fe.tags("doc", &cancel).unwrap().unwrap().collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].cid.as_ref().unwrap(), &ContentId::of_content(b"v2"));
        assert_eq!(entries[1].cid.as_ref().unwrap(), &ContentId::of_content(b"v1"));
        assert!(entries[1].pre.is_none());
    }

    #[test]
    fn set_without_current_token_conflicts() {
        let fe = frontend();
        let cancel = Cancel::new();
        fe.set("doc", b"v1", MimeType::text_plain(), None, &cancel).unwrap();
        assert!(!fe.set("doc", b"v2", MimeType::text_plain(), None, &cancel).unwrap());
        assert_eq!(fe.get("doc", &cancel).unwrap().unwrap(), b"v1");
    }

    #[test]
    fn copy_points_at_same_content_without_mutating_source() {
        let fe = frontend();
        let cancel = Cancel::new();
        fe.set("doc", b"v1", MimeType::text_plain(), None, &cancel).unwrap();
        assert!(fe.copy("doc", "alias", None, &cancel).unwrap());

        assert!(fe.has("alias", &cancel).unwrap());
        assert_eq!(fe.tag("alias", &cancel).unwrap().unwrap().cid, fe.tag("doc", &cancel).unwrap().unwrap().cid);
        assert_eq!(fe.tag("alias", &cancel).unwrap().unwrap().name, "alias");
        assert_eq!(fe.tags("doc", &cancel).unwrap().unwrap().count(), 1);
    }

    #[test]
    fn delete_tombstones_but_preserves_history() {
        let fe = frontend();
        let cancel = Cancel::new();
        fe.set("doc", b"v1", MimeType::text_plain(), None, &cancel).unwrap();
        let tok = fe.token("doc", &cancel).unwrap().unwrap();
        assert!(fe.delete("doc", Some(&tok), &cancel).unwrap());

        assert!(!fe.has("doc", &cancel).unwrap());
        let entries: Vec<Tag> = fe.tags("doc", &cancel).unwrap().unwrap().collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].cid.is_none());
        assert_eq!(entries[0].ty.as_str(), MimeType::empty().as_str());
    }

    #[test]
    fn tags_on_unknown_name_is_none() {
        let fe = frontend();
        let cancel = Cancel::new();
        assert!(fe.tags("nope", &cancel).unwrap().is_none());
        assert!(fe.tag("nope", &cancel).unwrap().is_none());
    }
}
