//! Filesystem `Backend`: each id maps to two sibling files under the base
//! directory — the raw bytes, and a `.data` sidecar holding
//! `{"type": MimeType, "hash": ContentId}`. Token-gated writes and deletes
//! are serialized by the advisory lock.
//!
//! Sharded paths (a six-level single-character fan-out of the id's hex
//! digits) keep any one directory from accumulating too many entries;
//! writes land in a `.incoming` temp file and are published via rename so a
//! reader never observes a partial write.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::Digest as _;

use crate::backend::{copy_hashing, Backend, Object};
use crate::cancel::Cancel;
use crate::error::{Error, Result};
use crate::id::{next_backend_id, ConflictToken, ContentId, MimeType};

const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize, Deserialize)]
struct Sidecar {
    #[serde(rename = "type")]
    ty: String,
    hash: String,
}

/// A filesystem-rooted `Backend`.
pub struct FilesBackend {
    id: u64,
    root: PathBuf,
}

impl FilesBackend {
    /// Open (creating if absent) a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(Error::Io)?;
        Ok(Self { id: next_backend_id(), root })
    }

    fn data_path(&self, id: &ContentId) -> PathBuf {
        let mut p = self.root.clone();
        for seg in id.path_segments() {
            p.push(seg);
        }
        p
    }

    fn sidecar_path(&self, id: &ContentId) -> PathBuf {
        let mut p = self.data_path(id).into_os_string();
        p.push(".data");
        PathBuf::from(p)
    }

    fn read_sidecar(&self, id: &ContentId) -> Result<Option<Sidecar>> {
        match fs::read(self.sidecar_path(id)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn lock_name(&self, id: &ContentId) -> String {
        format!("{}:{}", self.root.display(), id.as_str())
    }

    fn write_pair(&self, id: &ContentId, bytes: &[u8], ty: &MimeType, hash: &str, truncate: bool) -> Result<()> {
        let data_path = self.data_path(id);
        let sidecar_path = self.sidecar_path(id);
        if let Some(parent) = data_path.parent() {
            fs::create_dir_all(parent).map_err(Error::Io)?;
        }
        let sidecar_json = serde_json::to_vec(&Sidecar { ty: ty.as_str().to_string(), hash: hash.to_string() })?;
        if truncate {
            fs::write(&data_path, bytes).map_err(Error::Io)?;
            fs::write(&sidecar_path, &sidecar_json).map_err(Error::Io)?;
        } else {
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&data_path)
                .and_then(|mut f| f.write_all(bytes))
                .map_err(Error::Io)?;
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&sidecar_path)
                .and_then(|mut f| f.write_all(&sidecar_json))
                .map_err(Error::Io)?;
        }
        Ok(())
    }
}

fn walk_ids(root: &Path, out: &mut Vec<ContentId>) -> std::io::Result<()> {
    if !root.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk_ids(&path, out)?;
        } else if path.extension().map(|e| e == "data").unwrap_or(false) {
            continue;
        } else if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if let Ok(id) = ContentId::parse(name.to_string()) {
                out.push(id);
            }
        }
    }
    Ok(())
}

impl Backend for FilesBackend {
    fn backend_id(&self) -> u64 {
        self.id
    }

    fn token(&self, id: &ContentId, _cancel: &Cancel) -> Result<Option<ConflictToken>> {
        Ok(self.read_sidecar(id)?.map(|s| ConflictToken::new(self.id, s.hash)))
    }

    fn exists(&self, id: &ContentId, _cancel: &Cancel) -> Result<bool> {
        Ok(self.data_path(id).exists())
    }

    fn list(&self, _cancel: &Cancel) -> Result<Vec<ContentId>> {
        let mut out = Vec::new();
        walk_ids(&self.root, &mut out).map_err(Error::Io)?;
        Ok(out)
    }

    fn type_of(&self, id: &ContentId, _cancel: &Cancel) -> Result<Option<MimeType>> {
        match self.read_sidecar(id)? {
            Some(s) => Ok(Some(MimeType::parse(s.ty)?)),
            None => Ok(None),
        }
    }

    fn hash(&self, id: &ContentId, _cancel: &Cancel) -> Result<Option<String>> {
        Ok(self.read_sidecar(id)?.map(|s| s.hash))
    }

    fn read(&self, id: &ContentId, _cancel: &Cancel) -> Result<Option<Object>> {
        let Some(sidecar) = self.read_sidecar(id)? else { return Ok(None) };
        match fs::read(self.data_path(id)) {
            Ok(bytes) => Ok(Some(Object { ty: MimeType::parse(sidecar.ty)?, bytes })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn write(
        &self,
        id: &ContentId,
        bytes: &[u8],
        ty: MimeType,
        token: Option<&ConflictToken>,
        cancel: &Cancel,
    ) -> Result<bool> {
        let hash = hex::encode(sha2::Sha512::digest(bytes));
        match token {
            None => {
                if self.exists(id, cancel)? {
                    return Ok(false);
                }
                match self.write_pair(id, bytes, &ty, &hash, false) {
                    Ok(()) => Ok(true),
                    Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
                    Err(e) => Err(e),
                }
            }
            Some(token) => {
                let _span = crate::observer::observer().span("files.cas_write");
                let expected = token.value_for(self.id)?.to_string();
                let mut guard = crate::lock::acquire_wait(&self.lock_name(id), LOCK_TIMEOUT, cancel)?
                    .ok_or_else(|| Error::Lock(format!("timed out acquiring lock for {}", id)))?;
                let current = self.hash(id, cancel)?;
                let gate_ok = current.as_deref() == Some(expected.as_str());
                let result = if gate_ok { self.write_pair(id, bytes, &ty, &hash, true).map(|()| true) } else { Ok(false) };
                guard.release();
                if !gate_ok {
                    crate::observer::observer().conflict(id.as_str());
                }
                result
            }
        }
    }

    fn delete(&self, id: &ContentId, token: &ConflictToken, cancel: &Cancel) -> Result<bool> {
        let _span = crate::observer::observer().span("files.cas_delete");
        let expected = token.value_for(self.id)?.to_string();
        let mut guard = crate::lock::acquire_wait(&self.lock_name(id), LOCK_TIMEOUT, cancel)?
            .ok_or_else(|| Error::Lock(format!("timed out acquiring lock for {}", id)))?;
        let current = self.hash(id, cancel)?;
        let gate_ok = current.as_deref() == Some(expected.as_str());
        let result = if gate_ok {
            let data_removed = fs::remove_file(self.data_path(id)).is_ok();
            let sidecar_removed = fs::remove_file(self.sidecar_path(id)).is_ok();
            Ok(data_removed || sidecar_removed)
        } else {
            Ok(false)
        };
        guard.release();
        if !gate_ok {
            crate::observer::observer().conflict(id.as_str());
        }
        result
    }

    fn read_stream(
        &self,
        id: &ContentId,
        _cancel: &Cancel,
    ) -> Result<Option<(Box<dyn Read + Send>, MimeType)>> {
        let Some(sidecar) = self.read_sidecar(id)? else { return Ok(None) };
        match File::open(self.data_path(id)) {
            Ok(f) => Ok(Some((Box::new(f), MimeType::parse(sidecar.ty)?))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
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
        let data_path = self.data_path(id);
        if let Some(parent) = data_path.parent() {
            fs::create_dir_all(parent).map_err(Error::Io)?;
        }
        let tmp_path = data_path.with_extension("incoming");
        let mut hasher = sha2::Sha512::default();
        {
            let tmp_file = File::create(&tmp_path).map_err(Error::Io)?;
            copy_hashing(reader, tmp_file, &mut hasher, cancel).map_err(Error::Io)?;
        }
        let hash = hex::encode(sha2::digest::FixedOutput::finalize_fixed(hasher));
        let bytes = fs::read(&tmp_path).map_err(Error::Io)?;

        let result = match token {
            None => {
                if self.exists(id, cancel)? {
                    Ok(false)
                } else {
                    match self.write_pair(id, &bytes, &ty, &hash, false) {
                        Ok(()) => Ok(true),
                        Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
                        Err(e) => Err(e),
                    }
                }
            }
            Some(token) => {
                let _span = crate::observer::observer().span("files.cas_write_stream");
                let expected = token.value_for(self.id)?.to_string();
                let mut guard = crate::lock::acquire_wait(&self.lock_name(id), LOCK_TIMEOUT, cancel)?
                    .ok_or_else(|| Error::Lock(format!("timed out acquiring lock for {}", id)))?;
                let current = self.hash(id, cancel)?;
                let gate_ok = current.as_deref() == Some(expected.as_str());
                let result = if gate_ok { self.write_pair(id, &bytes, &ty, &hash, true).map(|()| true) } else { Ok(false) };
                guard.release();
                result
            }
        };
        let _ = fs::remove_file(&tmp_path);
        if matches!(result, Ok(false)) {
            crate::observer::observer().conflict(id.as_str());
        }
        result
    }

    fn rename(&self, source: &ContentId, target: &ContentId, cancel: &Cancel) -> Result<bool> {
        if !self.exists(source, cancel)? || self.exists(target, cancel)? {
            return Ok(false);
        }
        let target_data = self.data_path(target);
        if let Some(parent) = target_data.parent() {
            fs::create_dir_all(parent).map_err(Error::Io)?;
        }
        fs::rename(self.data_path(source), &target_data).map_err(Error::Io)?;
        fs::rename(self.sidecar_path(source), self.sidecar_path(target)).map_err(Error::Io)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (FilesBackend, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (FilesBackend::new(dir.path()).unwrap(), dir)
    }

    #[test]
    fn write_read_roundtrip() {
        let (be, _dir) = store();
        let cancel = Cancel::new();
        let id = ContentId::of_content(b"hello world");
        assert!(be.write(&id, b"hello world", MimeType::text_plain(), None, &cancel).unwrap());
        let obj = be.read(&id, &cancel).unwrap().unwrap();
        assert_eq!(obj.bytes, b"hello world");
        assert_eq!(obj.ty.as_str(), "text/plain");
    }

    #[test]
    fn second_unconditional_write_is_rejected() {
        let (be, _dir) = store();
        let cancel = Cancel::new();
        let id = ContentId::of_name("doc");
        assert!(be.write(&id, b"v1", MimeType::octet_stream(), None, &cancel).unwrap());
        assert!(!be.write(&id, b"v1-again", MimeType::octet_stream(), None, &cancel).unwrap());
    }

    #[test]
    fn cas_write_then_delete() {
        let (be, _dir) = store();
        let cancel = Cancel::new();
        let id = ContentId::of_name("doc");
        be.write(&id, b"v1", MimeType::octet_stream(), None, &cancel).unwrap();
        let tok = be.token(&id, &cancel).unwrap().unwrap();
        assert!(be.write(&id, b"v2", MimeType::octet_stream(), Some(&tok), &cancel).unwrap());
        assert!(!be.write(&id, b"v3", MimeType::octet_stream(), Some(&tok), &cancel).unwrap());

        let tok2 = be.token(&id, &cancel).unwrap().unwrap();
        assert!(be.delete(&id, &tok2, &cancel).unwrap());
        assert!(!be.exists(&id, &cancel).unwrap());
    }

    #[test]
    fn rename_moves_both_sibling_files() {
        let (be, _dir) = store();
        let cancel = Cancel::new();
        let a = ContentId::of_name("a");
        let b = ContentId::of_name("b");
        be.write(&a, b"x", MimeType::octet_stream(), None, &cancel).unwrap();
        assert!(be.rename(&a, &b, &cancel).unwrap());
        assert!(!be.exists(&a, &cancel).unwrap());
        let obj = be.read(&b, &cancel).unwrap().unwrap();
        assert_eq!(obj.bytes, b"x");
    }

    #[test]
    fn write_stream_matches_write() {
        let (be, _dir) = store();
        let cancel = Cancel::new();
        let id = ContentId::of_content(b"streamed");
        let mut r = std::io::Cursor::new(b"streamed".to_vec());
        assert!(be.write_stream(&id, &mut r, MimeType::octet_stream(), None, &cancel).unwrap());
        assert_eq!(be.read(&id, &cancel).unwrap().unwrap().bytes, b"streamed");
    }
}
