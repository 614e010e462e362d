//! Transparent compression `Backend` wrapper (`spec.md` §4.5).
//!
//! Configured at construction with exactly one codec. `token`/`exists`/
//! `list`/`type_of`/`hash`/`delete`/`rename` delegate unchanged — the inner
//! backend only ever sees compressed-sized blobs. No header is added: the
//! wrapper must be applied symmetrically on both ends, exactly as
//! `spec.md` §4.5 describes.

use std::io::{Read, Write};

use crate::backend::{Backend, Object};
use crate::cancel::Cancel;
use crate::error::{Error, Result};
use crate::id::{ConflictToken, ContentId, MimeType};

/// One of the four codecs `spec.md` names.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Codec {
    /// Raw DEFLATE.
    Deflate,
    /// Gzip-framed DEFLATE.
    Gzip,
    /// Brotli.
    Brotli,
    /// Zstandard.
    Zstd,
}

const ZSTD_LEVEL: i32 = 3;
const BROTLI_QUALITY: u32 = 5;
const BROTLI_LGWIN: u32 = 22;
const BROTLI_BUFFER: usize = 64 * 1024;

fn compress_bytes(codec: Codec, bytes: &[u8]) -> Result<Vec<u8>> {
    match codec {
        Codec::Deflate => {
            let mut enc = flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(bytes).map_err(Error::Io)?;
            enc.finish().map_err(Error::Io)
        }
        Codec::Gzip => {
            let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(bytes).map_err(Error::Io)?;
            enc.finish().map_err(Error::Io)
        }
        Codec::Brotli => {
            let mut out = Vec::new();
            let mut writer = brotli::CompressorWriter::new(&mut out, BROTLI_BUFFER, BROTLI_QUALITY, BROTLI_LGWIN);
            writer.write_all(bytes).map_err(Error::Io)?;
            writer.flush().map_err(Error::Io)?;
            drop(writer);
            Ok(out)
        }
        Codec::Zstd => {
            let mut enc = zstd::stream::write::Encoder::new(Vec::new(), ZSTD_LEVEL).map_err(Error::Io)?;
            enc.write_all(bytes).map_err(Error::Io)?;
            enc.finish().map_err(Error::Io)
        }
    }
}

fn decompress_bytes(codec: Codec, bytes: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    decompress_reader(codec, std::io::Cursor::new(bytes))
        .read_to_end(&mut out)
        .map_err(|_| Error::Integrity)?;
    Ok(out)
}

fn compress_reader<'a, R: Read + Send + 'a>(codec: Codec, reader: R) -> Box<dyn Read + Send + 'a> {
    match codec {
        Codec::Deflate => Box::new(flate2::read::DeflateEncoder::new(reader, flate2::Compression::default())),
        Codec::Gzip => Box::new(flate2::read::GzEncoder::new(reader, flate2::Compression::default())),
        Codec::Brotli => Box::new(brotli::CompressorReader::new(reader, BROTLI_BUFFER, BROTLI_QUALITY, BROTLI_LGWIN)),
        Codec::Zstd => Box::new(
            zstd::stream::read::Encoder::new(reader, ZSTD_LEVEL).expect("zstd encoder init"),
        ),
    }
}

fn decompress_reader<'a, R: Read + Send + 'a>(codec: Codec, reader: R) -> Box<dyn Read + Send + 'a> {
    match codec {
        Codec::Deflate => Box::new(flate2::read::DeflateDecoder::new(reader)),
        Codec::Gzip => Box::new(flate2::read::GzDecoder::new(reader)),
        Codec::Brotli => Box::new(brotli::Decompressor::new(reader, BROTLI_BUFFER)),
        Codec::Zstd => Box::new(zstd::stream::read::Decoder::new(reader).expect("zstd decoder init")),
    }
}

/// Wraps any `Backend`, compressing bytes at rest with a single fixed codec.
pub struct CompressionWrapper {
    inner: Box<dyn Backend>,
    codec: Codec,
}

impl CompressionWrapper {
    /// Wrap `inner`, compressing/decompressing with `codec`.
    pub fn new(inner: impl Backend + 'static, codec: Codec) -> Self {
        Self { inner: Box::new(inner), codec }
    }
}

impl Backend for CompressionWrapper {
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
            Some(obj) => Ok(Some(Object { ty: obj.ty, bytes: decompress_bytes(self.codec, &obj.bytes)? })),
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
        let compressed = compress_bytes(self.codec, bytes)?;
        self.inner.write(id, &compressed, ty, token, cancel)
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
            Some((r, ty)) => Ok(Some((decompress_reader(self.codec, r), ty))),
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
        let mut compressing = compress_reader(self.codec, reader);
        self.inner.write_stream(id, &mut compressing, ty, token, cancel)
    }

    fn rename(&self, source: &ContentId, target: &ContentId, cancel: &Cancel) -> Result<bool> {
        self.inner.rename(source, target, cancel)
    }
}
