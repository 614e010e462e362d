//! Hybrid public-key encryption `Backend` wrapper.
//!
//! Same shape as [`crate::secret`]'s symmetric wrapper, but the per-object
//! data key is wrapped with RSA-OAEP instead of a password-derived key.
//! Framing: `"AKE:"(4) ∥ uint16_BE(enckey_len) ∥ enckey(enckey_len) ∥
//! data(var) ∥ authTag(16)` — the length prefix exists because RSA-wrapped
//! key size depends on the recipient key's modulus size.

use std::io::{Cursor, Read};
use std::sync::Arc;

use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit, Nonce};
use rand::RngCore;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};

use crate::backend::{Backend, Object};
use crate::cancel::Cancel;
use crate::error::{Error, Result};
use crate::id::{ConflictToken, ContentId, MimeType};

const MAGIC: &[u8; 4] = b"AKE:";

/// An RSA key usable by the wrapper: always able to wrap (public-encrypt) a
/// data key; able to unwrap (private-decrypt) one only if holding the
/// private half.
pub trait AsymmetricKey: Send + Sync {
    /// RSA-OAEP encrypt `data` (expected to be the 48-byte data key).
    fn public_encrypt(&self, data: &[u8]) -> Result<Vec<u8>>;
    /// RSA-OAEP decrypt `data` back to the data key. `None` if this key has
    /// no private half, or decryption fails (wrong key / tampered frame).
    fn private_decrypt(&self, data: &[u8]) -> Option<Vec<u8>>;
}

/// An in-memory RSA key pair (or public-key-only handle).
pub struct RsaKeyPair {
    public: RsaPublicKey,
    private: Option<RsaPrivateKey>,
}

impl RsaKeyPair {
    /// A full key pair, able to both wrap and unwrap.
    pub fn new(private: RsaPrivateKey) -> Self {
        let public = RsaPublicKey::from(&private);
        Self { public, private: Some(private) }
    }

    /// A public-key-only handle, able to wrap but never unwrap.
    pub fn public_only(public: RsaPublicKey) -> Self {
        Self { public, private: None }
    }
}

impl AsymmetricKey for RsaKeyPair {
    fn public_encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut rng = rand::rngs::OsRng;
        self.public
            .encrypt(&mut rng, Oaep::new::<sha2::Sha256>(), data)
            .map_err(|e| Error::Crypto(e.to_string()))
    }

    fn private_decrypt(&self, data: &[u8]) -> Option<Vec<u8>> {
        let private = self.private.as_ref()?;
        private.decrypt(Oaep::new::<sha2::Sha256>(), data).ok()
    }
}

fn aead_encrypt(key_bytes: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key_bytes).map_err(|e| Error::Crypto(e.to_string()))?;
    #[allow(deprecated)]
    let nonce = Nonce::from_slice(&iv[..12]);
    cipher.encrypt(nonce, plaintext).map_err(|_| Error::Crypto("encrypt failed".into()))
}

fn aead_decrypt(key_bytes: &[u8], iv: &[u8], ciphertext_and_tag: &[u8]) -> Option<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key_bytes).ok()?;
    #[allow(deprecated)]
    let nonce = Nonce::from_slice(&iv[..12]);
    cipher.decrypt(nonce, ciphertext_and_tag).ok()
}

fn random_data_key() -> [u8; 48] {
    let mut out = [0u8; 48];
    rand::rngs::OsRng.fill_bytes(&mut out);
    out
}

fn split_key_iv(secret: &[u8; 48]) -> (&[u8], &[u8]) {
    (&secret[..32], &secret[32..48])
}

fn seal(key: &dyn AsymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let data_key = random_data_key();
    let enckey = key.public_encrypt(&data_key)?;
    let (d_key, d_iv) = split_key_iv(&data_key);
    let wrapped_payload = aead_encrypt(d_key, d_iv, plaintext)?;

    let mut out = Vec::with_capacity(4 + 2 + enckey.len() + wrapped_payload.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&(enckey.len() as u16).to_be_bytes());
    out.extend_from_slice(&enckey);
    out.extend_from_slice(&wrapped_payload);
    Ok(out)
}

fn open(key: &dyn AsymmetricKey, framed: &[u8]) -> Option<Vec<u8>> {
    if framed.len() < 6 || &framed[..4] != MAGIC {
        return None;
    }
    let enckey_len = u16::from_be_bytes([framed[4], framed[5]]) as usize;
    if framed.len() < 6 + enckey_len {
        return None;
    }
    let enckey = &framed[6..6 + enckey_len];
    let data_key_bytes = key.private_decrypt(enckey)?;
    if data_key_bytes.len() != 48 {
        return None;
    }
    let mut data_key = [0u8; 48];
    data_key.copy_from_slice(&data_key_bytes);
    let (d_key, d_iv) = split_key_iv(&data_key);
    let payload = &framed[6 + enckey_len..];
    aead_decrypt(d_key, d_iv, payload)
}

fn fill_from(source: &mut dyn Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

enum Mode {
    Unclassified,
    Passthrough(Cursor<Vec<u8>>),
    Decrypted(Cursor<Vec<u8>>),
}

/// Streaming decrypt reader, mirroring [`crate::secret`]'s: only the magic
/// plus the length-prefixed wrapped key are buffered before classifying the
/// stream as framed or unframed. Unframed data streams straight from the
/// source from then on. Framed data still needs the whole ciphertext+tag
/// buffered once AES-GCM verification is reached, since the wire format
/// carries a single tag over the whole payload.
struct LazyDecryptReader {
    key: Arc<dyn AsymmetricKey>,
    source: Option<Box<dyn Read + Send>>,
    mode: Mode,
}

impl LazyDecryptReader {
    fn new(key: Arc<dyn AsymmetricKey>, source: Box<dyn Read + Send>) -> Self {
        Self { key, source: Some(source), mode: Mode::Unclassified }
    }

    fn classify(&mut self) -> std::io::Result<()> {
        let src = self.source.as_mut().expect("classify runs exactly once");
        let mut prefix = vec![0u8; 6];
        let filled = fill_from(src.as_mut(), &mut prefix)?;
        prefix.truncate(filled);

        if filled != 6 || &prefix[..4] != MAGIC {
            self.mode = Mode::Passthrough(Cursor::new(prefix));
            return Ok(());
        }

        let enckey_len = u16::from_be_bytes([prefix[4], prefix[5]]) as usize;
        let mut enckey = vec![0u8; enckey_len];
        let src = self.source.as_mut().expect("classify runs exactly once");
        let ek_filled = fill_from(src.as_mut(), &mut enckey)?;
        enckey.truncate(ek_filled);

        if ek_filled != enckey_len {
            let mut leftover = prefix;
            leftover.extend_from_slice(&enckey);
            self.mode = Mode::Passthrough(Cursor::new(leftover));
            return Ok(());
        }

        let _span = crate::observer::observer().span("asymmetric.unwrap_data_key");
        let data_key_bytes =
            self.key.private_decrypt(&enckey).ok_or_else(|| std::io::Error::other("authentication failed"))?;
        drop(_span);
        if data_key_bytes.len() != 48 {
            return Err(std::io::Error::other("authentication failed"));
        }
        let mut data_key = [0u8; 48];
        data_key.copy_from_slice(&data_key_bytes);

        let mut rest = Vec::new();
        self.source.take().expect("classify runs exactly once").read_to_end(&mut rest)?;
        let _span = crate::observer::observer().span("asymmetric.unwrap_payload");
        let (d_key, d_iv) = split_key_iv(&data_key);
        let plain = aead_decrypt(d_key, d_iv, &rest).ok_or_else(|| std::io::Error::other("authentication failed"))?;
        self.mode = Mode::Decrypted(Cursor::new(plain));
        Ok(())
    }
}

impl Read for LazyDecryptReader {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if matches!(self.mode, Mode::Unclassified) {
            self.classify()?;
        }
        match &mut self.mode {
            Mode::Unclassified => unreachable!("classified above"),
            Mode::Decrypted(cur) => cur.read(out),
            Mode::Passthrough(cur) => {
                let n = cur.read(out)?;
                if n > 0 {
                    return Ok(n);
                }
                match self.source.as_mut() {
                    Some(s) => s.read(out),
                    None => Ok(0),
                }
            }
        }
    }
}

/// Wraps any `Backend`, encrypting bytes at rest under a hybrid RSA+AES-GCM
/// scheme. Reads of data written before the wrapper was applied pass
/// through unchanged.
pub struct AsymmetricWrapper {
    inner: Box<dyn Backend>,
    key: Arc<dyn AsymmetricKey>,
}

impl AsymmetricWrapper {
    /// Wrap `inner`, using `key` to wrap/unwrap per-object data keys.
    pub fn new(inner: impl Backend + 'static, key: impl AsymmetricKey + 'static) -> Self {
        Self { inner: Box::new(inner), key: Arc::new(key) }
    }
}

impl Backend for AsymmetricWrapper {
    fn backend_id(&self) -> u64 {
        self.inner.backend_id()
    }

    fn token(&self, id: &ContentId, cancel: &Cancel) -> Result<Option<ConflictToken>> {
        self.inner.token(id, cancel)
    }

    fn exists(&self, id: &ContentId, cancel: &Cancel) -> Result<bool> {
        self.inner.exists(id, cancel)
    }

    fn list(&self, cancel: &Cancel) -> Result<Vec<ContentId>> {
        self.inner.list(cancel)
    }

    fn type_of(&self, id: &ContentId, cancel: &Cancel) -> Result<Option<MimeType>> {
        self.inner.type_of(id, cancel)
    }

    fn hash(&self, id: &ContentId, cancel: &Cancel) -> Result<Option<String>> {
        self.inner.hash(id, cancel)
    }

    fn read(&self, id: &ContentId, cancel: &Cancel) -> Result<Option<Object>> {
        match self.inner.read(id, cancel)? {
            Some(obj) => {
                let plain = if obj.bytes.len() >= 4 && &obj.bytes[..4] == MAGIC {
                    let _span = crate::observer::observer().span("asymmetric.unwrap");
                    match open(self.key.as_ref(), &obj.bytes) {
                        Some(p) => p,
                        None => return Ok(None),
                    }
                } else {
                    obj.bytes
                };
                Ok(Some(Object { ty: obj.ty, bytes: plain }))
            }
            None => Ok(None),
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
        let _span = crate::observer::observer().span("asymmetric.wrap");
        let framed = seal(self.key.as_ref(), bytes)?;
        self.inner.write(id, &framed, ty, token, cancel)
    }

    fn delete(&self, id: &ContentId, token: &ConflictToken, cancel: &Cancel) -> Result<bool> {
        self.inner.delete(id, token, cancel)
    }

    fn read_stream(
        &self,
        id: &ContentId,
        cancel: &Cancel,
    ) -> Result<Option<(Box<dyn Read + Send>, MimeType)>> {
        match self.inner.read_stream(id, cancel)? {
            Some((r, ty)) => {
                let reader: Box<dyn Read + Send> = Box::new(LazyDecryptReader::new(self.key.clone(), r));
                Ok(Some((reader, ty)))
            }
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
        let mut plain = Vec::new();
        reader.read_to_end(&mut plain).map_err(Error::Io)?;
        cancel.check()?;
        self.write(id, &plain, ty, token, cancel)
    }

    fn rename(&self, source: &ContentId, target: &ContentId, cancel: &Cancel) -> Result<bool> {
        self.inner.rename(source, target, cancel)
    }
}
