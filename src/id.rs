//! Shared identifier types: `ContentId`, `MimeType`, `ConflictToken`.
//!
//! Small and pure — no I/O, matching `spec.md` §2's description of this
//! layer as "leaves first" in the component stack.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::digest::{FixedOutput as _, Update as _};

use crate::error::Error;

fn content_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^-?[0-9a-f]{128}$").expect("static pattern"))
}

fn mime_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[\w|-]+/[\w|-]+(?:;\s\w+=[\w-]+)*$").expect("static pattern"))
}

/// A 512-bit SHA-512 digest, lowercase hex, optionally `-`-prefixed to mark
/// a name identifier rather than a content digest.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct ContentId(String);

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContentId").field(&self.0).finish()
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl ContentId {
    /// Parse and strictly validate a hex content id (length 128 or 129, pattern-checked).
    pub fn parse(s: impl Into<String>) -> Result<Self, Error> {
        let s = s.into();
        if !content_id_re().is_match(&s) {
            return Err(Error::InvalidId(s));
        }
        Ok(Self(s))
    }

    /// Compute the content id for a byte slice: `sha512_hex(bytes)`.
    pub fn of_content(bytes: &[u8]) -> Self {
        Self(sha512_hex(bytes))
    }

    /// Deterministic name-identifier for a name string: `"-" ∥ sha512_hex(n)`.
    pub fn of_name(name: &str) -> Self {
        Self(format!("-{}", sha512_hex(name.as_bytes())))
    }

    /// True iff this id is a name-identifier (leading `-`), not a content digest.
    pub fn is_name(&self) -> bool {
        self.0.starts_with('-')
    }

    /// The raw id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The hex digits only, with any leading `-` stripped — used for path sharding,
    /// since the shard levels are derived from the digest, not the name marker.
    fn hex_digits(&self) -> &str {
        self.0.strip_prefix('-').unwrap_or(&self.0)
    }

    /// Six-level directory shard plus filename: `h/h/h/h/h/h/<full-id>`.
    pub fn path_segments(&self) -> Vec<&str> {
        let hex = self.hex_digits();
        let mut segs: Vec<&str> = (0..6).map(|i| &hex[i..i + 1]).collect();
        segs.push(&self.0);
        segs
    }
}

impl Serialize for ContentId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ContentId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        ContentId::parse(s).map_err(serde::de::Error::custom)
    }
}

fn sha512_hex(bytes: &[u8]) -> String {
    let mut h = sha2::Sha512::default();
    sha2::digest::Update::update(&mut h, bytes);
    let out = sha2::digest::FixedOutput::finalize_fixed(h);
    hex::encode(out)
}

/// A validated MIME type string, e.g. `application/octet-stream`.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct MimeType(String);

impl fmt::Debug for MimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MimeType").field(&self.0).finish()
    }
}

impl fmt::Display for MimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Default for MimeType {
    fn default() -> Self {
        Self::octet_stream()
    }
}

impl MimeType {
    /// The default binary type string.
    pub const OCTET_STREAM_STR: &'static str = "application/octet-stream";

    /// `application/octet-stream`, the default type for untyped blobs.
    pub fn octet_stream() -> Self {
        Self(Self::OCTET_STREAM_STR.to_string())
    }

    /// Parse and validate a MIME type string.
    pub fn parse(s: impl Into<String>) -> Result<Self, Error> {
        let s = s.into();
        if !mime_re().is_match(&s) {
            return Err(Error::InvalidMime(s));
        }
        Ok(Self(s))
    }

    /// `text/plain`.
    pub fn text_plain() -> Self {
        Self("text/plain".to_string())
    }

    /// `application/json; charset=utf-8`.
    pub fn json_utf8() -> Self {
        Self("application/json; charset=utf-8".to_string())
    }

    /// `text/sha-512` — the Frontend's internal marker for name→tag-id pointer slots.
    pub fn sha512_pointer() -> Self {
        Self("text/sha-512".to_string())
    }

    /// `application/empty` — tombstone marker used by `Frontend::delete`.
    pub fn empty() -> Self {
        Self("application/empty".to_string())
    }

    /// The raw MIME type string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Serialize for MimeType {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for MimeType {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        MimeType::parse(s).map_err(serde::de::Error::custom)
    }
}

static NEXT_BACKEND_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh identity for a newly-constructed backend instance.
///
/// Used so `ConflictToken`s can be bound to the backend that minted them.
pub fn next_backend_id() -> u64 {
    NEXT_BACKEND_ID.fetch_add(1, Ordering::Relaxed)
}

/// Opaque witness of a prior read of a resource's hash, usable exactly once
/// with the minting backend to perform a conditional write.
///
/// `value` is only readable by the backend whose `backend_id` matches the one
/// recorded at mint time — `spec.md` §3: "Tokens are first-class but
/// non-transferable between backends."
#[derive(Clone, Debug)]
pub struct ConflictToken {
    backend_id: u64,
    value: String,
}

impl ConflictToken {
    /// Mint a token bound to `backend_id` carrying the resource's current hash/etag.
    pub fn new(backend_id: u64, value: impl Into<String>) -> Self {
        Self { backend_id, value: value.into() }
    }

    /// Read the token's value, but only if `backend_id` matches the minting backend.
    pub fn value_for(&self, backend_id: u64) -> Result<&str, Error> {
        if self.backend_id == backend_id {
            Ok(&self.value)
        } else {
            Err(Error::WrongBackend)
        }
    }

    /// The backend identity that minted this token.
    pub fn backend_id(&self) -> u64 {
        self.backend_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_id_roundtrip() {
        let id = ContentId::of_content(b"hello");
        assert_eq!(id.as_str().len(), 128);
        assert!(!id.is_name());
        assert!(ContentId::parse(id.as_str()).is_ok());
    }

    #[test]
    fn name_id_is_prefixed_and_128_plus_one() {
        let id = ContentId::of_name("doc");
        assert_eq!(id.as_str().len(), 129);
        assert!(id.is_name());
    }

    #[test]
    fn rejects_bad_shape() {
        assert!(ContentId::parse("not-hex").is_err());
        assert!(ContentId::parse("a".repeat(127)).is_err());
    }

    #[test]
    fn mime_validation() {
        assert!(MimeType::parse("application/json; charset=utf-8").is_ok());
        assert!(MimeType::parse("bad mime").is_err());
    }

    #[test]
    fn token_rejects_wrong_backend() {
        let t = ConflictToken::new(1, "abc");
        assert!(t.value_for(1).is_ok());
        assert!(matches!(t.value_for(2), Err(Error::WrongBackend)));
    }
}
