//! In-process, `HashMap`-backed implementation of the `Backend` contract.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::Mutex;

use sha2::digest::{FixedOutput as _, Update as _};

use crate::backend::{Backend, Object};
use crate::cancel::Cancel;
use crate::error::{Error, Result};
use crate::id::{next_backend_id, ConflictToken, ContentId, MimeType};

struct Slot {
    ty: MimeType,
    hash: String,
    bytes: Vec<u8>,
}

/// A `HashMap`-backed store, kept behind a `Mutex` so CAS is a simple
/// compare-and-swap on the slot.
pub struct MemoryBackend {
    id: u64,
    slots: Mutex<HashMap<String, Slot>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Construct an empty in-memory store.
    pub fn new() -> Self {
        Self { id: next_backend_id(), slots: Mutex::new(HashMap::new()) }
    }
}

fn sha512_hex(bytes: &[u8]) -> String {
    let mut h = sha2::Sha512::default();
    sha2::digest::Update::update(&mut h, bytes);
    hex::encode(sha2::digest::FixedOutput::finalize_fixed(h))
}

impl Backend for MemoryBackend {
    fn backend_id(&self) -> u64 {
        self.id
    }

    fn token(&self, id: &ContentId, _cancel: &Cancel) -> Result<Option<ConflictToken>> {
        let slots = self.slots.lock().unwrap();
        Ok(slots.get(id.as_str()).map(|s| ConflictToken::new(self.id, s.hash.clone())))
    }

    fn exists(&self, id: &ContentId, _cancel: &Cancel) -> Result<bool> {
        Ok(self.slots.lock().unwrap().contains_key(id.as_str()))
    }

    fn list(&self, _cancel: &Cancel) -> Result<Vec<ContentId>> {
        let slots = self.slots.lock().unwrap();
        Ok(slots.keys().filter_map(|k| ContentId::parse(k.clone()).ok()).collect())
    }

    fn type_of(&self, id: &ContentId, _cancel: &Cancel) -> Result<Option<MimeType>> {
        Ok(self.slots.lock().unwrap().get(id.as_str()).map(|s| s.ty.clone()))
    }

    fn hash(&self, id: &ContentId, _cancel: &Cancel) -> Result<Option<String>> {
        Ok(self.slots.lock().unwrap().get(id.as_str()).map(|s| s.hash.clone()))
    }

    fn read(&self, id: &ContentId, _cancel: &Cancel) -> Result<Option<Object>> {
        Ok(self
            .slots
            .lock()
            .unwrap()
            .get(id.as_str())
            .map(|s| Object { ty: s.ty.clone(), bytes: s.bytes.clone() }))
    }

    fn write(
        &self,
        id: &ContentId,
        bytes: &[u8],
        ty: MimeType,
        token: Option<&ConflictToken>,
        _cancel: &Cancel,
    ) -> Result<bool> {
        let mut slots = self.slots.lock().unwrap();
        let current = slots.get(id.as_str());
        let gate_ok = match (token, current) {
            (None, None) => true,
            (Some(t), Some(s)) => t.value_for(self.id)? == s.hash,
            _ => false,
        };
        if !gate_ok {
            crate::observer::observer().conflict(id.as_str());
            return Ok(false);
        }
        let hash = sha512_hex(bytes);
        slots.insert(id.as_str().to_string(), Slot { ty, hash, bytes: bytes.to_vec() });
        crate::observer::observer().bytes_written(bytes.len() as u64);
        Ok(true)
    }

    fn delete(&self, id: &ContentId, token: &ConflictToken, _cancel: &Cancel) -> Result<bool> {
        let mut slots = self.slots.lock().unwrap();
        match slots.get(id.as_str()) {
            Some(s) if token.value_for(self.id)? == s.hash => {
                slots.remove(id.as_str());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn read_stream(
        &self,
        id: &ContentId,
        cancel: &Cancel,
    ) -> Result<Option<(Box<dyn Read + Send>, MimeType)>> {
        match self.read(id, cancel)? {
            Some(obj) => Ok(Some((Box::new(Cursor::new(obj.bytes)), obj.ty))),
            None => Ok(None),
        }
    }

    fn write_stream(
        &self,
        id: &ContentId,
        reader: &mut dyn Read,
        ty: MimeType,
        token: Option<&ConflictToken>,
        cancel: &Cancel,
    ) -> Result<bool> {
        // No partial-write state to manage in memory: just buffer and delegate.
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).map_err(Error::Io)?;
        cancel.check()?;
        self.write(id, &buf, ty, token, cancel)
    }

    fn rename(&self, source: &ContentId, target: &ContentId, _cancel: &Cancel) -> Result<bool> {
        let mut slots = self.slots.lock().unwrap();
        if !slots.contains_key(source.as_str()) || slots.contains_key(target.as_str()) {
            return Ok(false);
        }
        let slot = slots.remove(source.as_str()).expect("checked above");
        slots.insert(target.as_str().to_string(), slot);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrips() {
        let be = MemoryBackend::new();
        let cancel = Cancel::new();
        let id = ContentId::of_content(b"hello");
        assert!(!be.exists(&id, &cancel).unwrap());
        assert!(be.write(&id, b"hello", MimeType::text_plain(), None, &cancel).unwrap());
        assert!(be.exists(&id, &cancel).unwrap());
        let obj = be.read(&id, &cancel).unwrap().unwrap();
        assert_eq!(obj.bytes, b"hello");
        assert_eq!(obj.ty.as_str(), "text/plain");
    }

    #[test]
    fn cas_gate_rejects_stale_token() {
        let be = MemoryBackend::new();
        let cancel = Cancel::new();
        let id = ContentId::of_name("doc");
        assert!(be.write(&id, b"v1", MimeType::octet_stream(), None, &cancel).unwrap());
        let stale = ConflictToken::new(be.backend_id(), "not-the-hash");
        assert!(!be.write(&id, b"v2", MimeType::octet_stream(), Some(&stale), &cancel).unwrap());
        assert_eq!(be.read(&id, &cancel).unwrap().unwrap().bytes, b"v1");

        let good = be.token(&id, &cancel).unwrap().unwrap();
        assert!(be.write(&id, b"v2", MimeType::octet_stream(), Some(&good), &cancel).unwrap());
    }

    #[test]
    fn rename_moves_the_slot() {
        let be = MemoryBackend::new();
        let cancel = Cancel::new();
        let a = ContentId::of_name("a");
        let b = ContentId::of_name("b");
        be.write(&a, b"x", MimeType::octet_stream(), None, &cancel).unwrap();
        assert!(be.rename(&a, &b, &cancel).unwrap());
        assert!(!be.exists(&a, &cancel).unwrap());
        assert!(be.exists(&b, &cancel).unwrap());
    }

    #[test]
    fn delete_requires_matching_token() {
        let be = MemoryBackend::new();
        let cancel = Cancel::new();
        let id = ContentId::of_name("doc");
        be.write(&id, b"v1", MimeType::octet_stream(), None, &cancel).unwrap();
        let tok = be.token(&id, &cancel).unwrap().unwrap();
        assert!(be.delete(&id, &tok, &cancel).unwrap());
        assert!(!be.exists(&id, &cancel).unwrap());
    }
}
