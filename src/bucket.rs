//! S3-compatible object-store `Backend`.
//!
//! The HTTP client is an external collaborator: this module only specifies
//! the `BucketClient` interface the backend needs from it —
//! `head`/`get`/`put`/`delete` with conditional-write semantics — and ships
//! one concrete implementation, `ReqwestBucketClient`, built on `reqwest`'s
//! blocking client.

use std::io::{Cursor, Read};

use crate::backend::{Backend, Object};
use crate::cancel::Cancel;
use crate::error::{Error, Result};
use crate::id::{next_backend_id, ConflictToken, ContentId, MimeType};

/// The result of a HEAD request against an object key.
pub struct Head {
    /// The server-supplied ETag, trusted as an opaque comparable string —
    /// never reinterpreted or parsed, only compared for equality.
    pub etag: String,
    /// The object's declared content type.
    pub ty: MimeType,
}

/// The minimal S3-shaped HTTP surface this backend requires.
///
/// 404 from the server must surface as `Ok(None)` from `head`/`get`; 412/409
/// from `put`/`delete` must surface as `Ok(false)`/conflict, never `Err`.
/// Any other non-404 failure propagates as `Err`.
pub trait BucketClient: Send + Sync {
    /// `HEAD` the object at `key`.
    fn head(&self, key: &str) -> Result<Option<Head>>;
    /// `GET` the object body at `key`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// Conditionally `PUT` `bytes` at `key`. `if_match` pins to an existing
    /// ETag; `None` requests `If-None-Match: *` (create-only). Returns the
    /// new ETag on success, `None` on a 409/412 conflict.
    fn put(&self, key: &str, bytes: &[u8], ty: &MimeType, if_match: Option<&str>) -> Result<Option<String>>;
    /// Conditionally `DELETE` the object at `key`, pinned to `if_match`.
    fn delete(&self, key: &str, if_match: &str) -> Result<bool>;
    /// Copy `source` to `target` (used to implement `rename` as copy+delete).
    fn copy(&self, source: &str, target: &str) -> Result<bool>;
    /// List every object key under `prefix` (full keys, not relative to it).
    /// Ordering is unspecified, matching `spec.md` §5's `list()` contract.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// One `<Contents>` entry of a `ListObjectsV2` response.
#[derive(serde::Deserialize)]
struct ListEntry {
    #[serde(rename = "Key")]
    key: String,
}

/// The body of an S3 `ListObjectsV2` response, just the fields this client needs.
#[derive(serde::Deserialize, Default)]
struct ListBucketResult {
    #[serde(rename = "Contents", default)]
    contents: Vec<ListEntry>,
    #[serde(rename = "IsTruncated", default)]
    is_truncated: bool,
    #[serde(rename = "NextContinuationToken", default)]
    next_continuation_token: Option<String>,
}

/// `reqwest`-backed blocking implementation of [`BucketClient`] against an
/// S3-compatible endpoint.
pub struct ReqwestBucketClient {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl ReqwestBucketClient {
    /// Build a client against `base_url` (scheme+host+bucket, no trailing slash).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { client: reqwest::blocking::Client::new(), base_url: base_url.into() }
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), key)
    }
}

impl BucketClient for ReqwestBucketClient {
    fn head(&self, key: &str) -> Result<Option<Head>> {
        let resp = self.client.head(self.url(key)).send().map_err(|e| Error::Http(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Error::Http(format!("head {key}: {}", resp.status())));
        }
        let etag = resp
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let ty = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| MimeType::parse(s).ok())
            .unwrap_or_else(MimeType::octet_stream);
        Ok(Some(Head { etag, ty }))
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let resp = self.client.get(self.url(key)).send().map_err(|e| Error::Http(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Error::Http(format!("get {key}: {}", resp.status())));
        }
        Ok(Some(resp.bytes().map_err(|e| Error::Http(e.to_string()))?.to_vec()))
    }

    fn put(&self, key: &str, bytes: &[u8], ty: &MimeType, if_match: Option<&str>) -> Result<Option<String>> {
        let mut req = self
            .client
            .put(self.url(key))
            .header(reqwest::header::CONTENT_TYPE, ty.as_str())
            .body(bytes.to_vec());
        req = match if_match {
            Some(etag) => req.header(reqwest::header::IF_MATCH, etag),
            None => req.header(reqwest::header::IF_NONE_MATCH, "*"),
        };
        let resp = req.send().map_err(|e| Error::Http(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::PRECONDITION_FAILED || resp.status() == reqwest::StatusCode::CONFLICT
        {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Error::Http(format!("put {key}: {}", resp.status())));
        }
        let etag = resp
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        Ok(Some(etag))
    }

    fn delete(&self, key: &str, if_match: &str) -> Result<bool> {
        let resp = self
            .client
            .delete(self.url(key))
            .header(reqwest::header::IF_MATCH, if_match)
            .send()
            .map_err(|e| Error::Http(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::PRECONDITION_FAILED || resp.status() == reqwest::StatusCode::CONFLICT
        {
            return Ok(false);
        }
        // A 404 means the object has no current hash to match `if_match`
        // against, so the delete cannot have succeeded against it — same
        // "already gone is not success" rule the Files backend applies to
        // ENOENT on unlink.
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !resp.status().is_success() {
            return Err(Error::Http(format!("delete {key}: {}", resp.status())));
        }
        Ok(true)
    }

    fn copy(&self, source: &str, target: &str) -> Result<bool> {
        let bytes = match self.get(source)? {
            Some(b) => b,
            None => return Ok(false),
        };
        let ty = self.head(source)?.map(|h| h.ty).unwrap_or_else(MimeType::octet_stream);
        Ok(self.put(target, &bytes, &ty, None)?.is_some())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let root = self.base_url.trim_end_matches('/');
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;
        loop {
            let mut query = vec![("list-type", "2".to_string()), ("prefix", prefix.to_string())];
            if let Some(tok) = &continuation_token {
                query.push(("continuation-token", tok.clone()));
            }
            let resp = self.client.get(root).query(&query).send().map_err(|e| Error::Http(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(Error::Http(format!("list {prefix}: {}", resp.status())));
            }
            let body = resp.text().map_err(|e| Error::Http(e.to_string()))?;
            let parsed: ListBucketResult = quick_xml::de::from_str(&body)
                .map_err(|e| Error::Http(format!("list {prefix}: malformed response: {e}")))?;
            keys.extend(parsed.contents.into_iter().map(|e| e.key));

            continuation_token = if parsed.is_truncated { parsed.next_continuation_token } else { None };
            if continuation_token.is_none() {
                break;
            }
        }
        Ok(keys)
    }
}

/// An S3-compatible `Backend`, using HTTP ETags as token values. `rename` is
/// copy+delete, non-atomic at the protocol level — an accepted limitation of
/// object stores that don't expose a native atomic move.
pub struct BucketBackend {
    id: u64,
    client: Box<dyn BucketClient>,
    prefix: String,
}

impl BucketBackend {
    /// Construct a backend storing objects under `prefix` (normalized to end in `/`).
    pub fn new(client: impl BucketClient + 'static, prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self { id: next_backend_id(), client: Box::new(client), prefix }
    }

    fn key_for(&self, id: &ContentId) -> String {
        format!("{}{}", self.prefix, id.path_segments().join("/"))
    }
}

impl Backend for BucketBackend {
    fn backend_id(&self) -> u64 {
        self.id
    }

    fn token(&self, id: &ContentId, _cancel: &Cancel) -> Result<Option<ConflictToken>> {
        Ok(self.client.head(&self.key_for(id))?.map(|h| ConflictToken::new(self.id, h.etag)))
    }

    fn exists(&self, id: &ContentId, _cancel: &Cancel) -> Result<bool> {
        Ok(self.client.head(&self.key_for(id))?.is_some())
    }

    fn list(&self, _cancel: &Cancel) -> Result<Vec<ContentId>> {
        Ok(self
            .client
            .list(&self.prefix)?
            .into_iter()
            .filter_map(|key| key.rsplit('/').next().and_then(|id| ContentId::parse(id).ok()))
            .collect())
    }

    fn type_of(&self, id: &ContentId, _cancel: &Cancel) -> Result<Option<MimeType>> {
        Ok(self.client.head(&self.key_for(id))?.map(|h| h.ty))
    }

    fn hash(&self, id: &ContentId, _cancel: &Cancel) -> Result<Option<String>> {
        Ok(self.client.head(&self.key_for(id))?.map(|h| h.etag))
    }

    fn read(&self, id: &ContentId, _cancel: &Cancel) -> Result<Option<Object>> {
        let key = self.key_for(id);
        let Some(bytes) = self.client.get(&key)? else { return Ok(None) };
        let ty = self.client.head(&key)?.map(|h| h.ty).unwrap_or_else(MimeType::octet_stream);
        Ok(Some(Object { ty, bytes }))
    }

    fn write(
        &self,
        id: &ContentId,
        bytes: &[u8],
        ty: MimeType,
        token: Option<&ConflictToken>,
        _cancel: &Cancel,
    ) -> Result<bool> {
        let _span = crate::observer::observer().span("bucket.conditional_write");
        let if_match = token.map(|t| t.value_for(self.id)).transpose()?;
        let wrote = self.client.put(&self.key_for(id), bytes, &ty, if_match)?.is_some();
        if !wrote {
            crate::observer::observer().conflict(id.as_str());
        }
        Ok(wrote)
    }

    fn delete(&self, id: &ContentId, token: &ConflictToken, _cancel: &Cancel) -> Result<bool> {
        let _span = crate::observer::observer().span("bucket.conditional_delete");
        let etag = token.value_for(self.id)?;
        let deleted = self.client.delete(&self.key_for(id), etag)?;
        if !deleted {
            crate::observer::observer().conflict(id.as_str());
        }
        Ok(deleted)
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
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).map_err(Error::Io)?;
        cancel.check()?;
        self.write(id, &buf, ty, token, cancel)
    }

    fn rename(&self, source: &ContentId, target: &ContentId, cancel: &Cancel) -> Result<bool> {
        if !self.exists(source, cancel)? || self.exists(target, cancel)? {
            return Ok(false);
        }
        if !self.client.copy(&self.key_for(source), &self.key_for(target))? {
            return Ok(false);
        }
        let Some(tok) = self.token(source, cancel)? else { return Ok(false) };
        // best-effort: the source etag pinned above may have moved on; a
        // concurrent mutation here would fail this delete, leaving the copy
        // in place — acceptable under the documented non-atomicity (§4.4).
        let _ = self.client.delete(&self.key_for(source), tok.value_for(self.id)?);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeClient {
        objects: Mutex<HashMap<String, (String, MimeType, Vec<u8>)>>,
        next_etag: Mutex<u64>,
    }

    impl FakeClient {
        fn new() -> Self {
            Self { objects: Mutex::new(HashMap::new()), next_etag: Mutex::new(1) }
        }

        fn mint_etag(&self) -> String {
            let mut n = self.next_etag.lock().unwrap();
            let etag = format!("\"etag-{n}\"");
            *n += 1;
            etag
        }
    }

    impl BucketClient for FakeClient {
        fn head(&self, key: &str) -> Result<Option<Head>> {
            Ok(self.objects.lock().unwrap().get(key).map(|(etag, ty, _)| Head { etag: etag.clone(), ty: ty.clone() }))
        }
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            Ok(self.objects.lock().unwrap().get(key).map(|(_, _, b)| b.clone()))
        }
        fn put(&self, key: &str, bytes: &[u8], ty: &MimeType, if_match: Option<&str>) -> Result<Option<String>> {
            let mut objs = self.objects.lock().unwrap();
            let current = objs.get(key).map(|(etag, _, _)| etag.clone());
            let ok = match if_match {
                None => current.is_none(),
                Some(etag) => current.as_deref() == Some(etag),
            };
            if !ok {
                return Ok(None);
            }
            let etag = self.mint_etag();
            objs.insert(key.to_string(), (etag.clone(), ty.clone(), bytes.to_vec()));
            Ok(Some(etag))
        }
        fn delete(&self, key: &str, if_match: &str) -> Result<bool> {
            let mut objs = self.objects.lock().unwrap();
            match objs.get(key) {
                Some((etag, _, _)) if etag == if_match => {
                    objs.remove(key);
                    Ok(true)
                }
                _ => Ok(false),
            }
        }
        fn copy(&self, source: &str, target: &str) -> Result<bool> {
            let val = self.objects.lock().unwrap().get(source).cloned();
            match val {
                Some((_etag, ty, bytes)) => {
                    self.put(target, &bytes, &ty, None)?;
                    Ok(true)
                }
                None => Ok(false),
            }
        }
        fn list(&self, prefix: &str) -> Result<Vec<String>> {
            Ok(self.objects.lock().unwrap().keys().filter(|k| k.starts_with(prefix)).cloned().collect())
        }
    }

    #[test]
    fn write_read_and_cas() {
        let be = BucketBackend::new(FakeClient::new(), "objs/");
        let cancel = Cancel::new();
        let id = ContentId::of_name("doc");
        assert!(be.write(&id, b"v1", MimeType::octet_stream(), None, &cancel).unwrap());
        assert!(!be.write(&id, b"v1-again", MimeType::octet_stream(), None, &cancel).unwrap());

        let tok = be.token(&id, &cancel).unwrap().unwrap();
        assert!(be.write(&id, b"v2", MimeType::octet_stream(), Some(&tok), &cancel).unwrap());
        assert!(!be.write(&id, b"v3", MimeType::octet_stream(), Some(&tok), &cancel).unwrap());
        assert_eq!(be.read(&id, &cancel).unwrap().unwrap().bytes, b"v2");
    }

    #[test]
    fn delete_of_missing_object_is_not_success() {
        let be = BucketBackend::new(FakeClient::new(), "objs/");
        let cancel = Cancel::new();
        let id = ContentId::of_name("never-written");
        let bogus_token = ConflictToken::new(be.backend_id(), "\"etag-0\"".to_string());
        assert!(!be.delete(&id, &bogus_token, &cancel).unwrap());
    }

    #[test]
    fn rename_is_copy_then_delete() {
        let be = BucketBackend::new(FakeClient::new(), "objs/");
        let cancel = Cancel::new();
        let a = ContentId::of_name("a");
        let b = ContentId::of_name("b");
        be.write(&a, b"x", MimeType::octet_stream(), None, &cancel).unwrap();
        assert!(be.rename(&a, &b, &cancel).unwrap());
        assert!(!be.exists(&a, &cancel).unwrap());
        assert_eq!(be.read(&b, &cancel).unwrap().unwrap().bytes, b"x");
    }

    #[test]
    fn list_enumerates_every_stored_id() {
        let be = BucketBackend::new(FakeClient::new(), "objs/");
        let cancel = Cancel::new();
        let a = ContentId::of_name("a");
        let b = ContentId::of_name("b");
        be.write(&a, b"x", MimeType::octet_stream(), None, &cancel).unwrap();
        be.write(&b, b"y", MimeType::octet_stream(), None, &cancel).unwrap();

        let mut ids = be.list(&cancel).unwrap();
        ids.sort_by(|x, y| x.as_str().cmp(y.as_str()));
        let mut expected = vec![a, b];
        expected.sort_by(|x, y| x.as_str().cmp(y.as_str()));
        assert_eq!(ids, expected);
    }

    #[test]
    fn reqwest_client_list_parses_list_objects_v2_xml() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>bucket</Name>
  <Prefix>objs/</Prefix>
  <KeyCount>2</KeyCount>
  <IsTruncated>false</IsTruncated>
  <Contents><Key>objs/a/b/c/d/e/f/abc</Key></Contents>
  <Contents><Key>objs/1/2/3/4/5/6/def</Key></Contents>
</ListBucketResult>"#;
        let parsed: ListBucketResult = quick_xml::de::from_str(xml).unwrap();
        assert!(!parsed.is_truncated);
        assert_eq!(parsed.contents.len(), 2);
        assert_eq!(parsed.contents[0].key, "objs/a/b/c/d/e/f/abc");
    }
}
