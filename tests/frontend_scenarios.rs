//! The concrete scenarios from `spec.md` §8 (S1-S6), run against `Frontend`
//! over a plain `MemoryBackend` and, where it matters, over a
//! `Secret`-wrapped one to exercise the codec/frontend interaction.

use std::io::Read;
use std::sync::Arc;

use castore::{Backend, Cancel, ContentId, Frontend, MemoryBackend, MimeType, SecretWrapper};

#[test]
fn s1_push_and_pull_roundtrip_with_type() {
    let fe = Frontend::new(MemoryBackend::new());
    let cancel = Cancel::new();

    let cid = fe.push(b"Hello, world!", MimeType::text_plain(), &cancel).unwrap().unwrap();
    assert_eq!(fe.pull(&cid, &cancel).unwrap().unwrap(), b"Hello, world!");
    assert_eq!(fe.backend().type_of(&cid, &cancel).unwrap().unwrap().as_str(), "text/plain");
}

#[test]
fn s2_set_then_update_yields_two_tags_newest_first() {
    let fe = Frontend::new(MemoryBackend::new());
    let cancel = Cancel::new();

    assert!(fe.set("doc", b"v1", MimeType::text_plain(), None, &cancel).unwrap());
    let tok = fe.token("doc", &cancel).unwrap().unwrap();
    assert!(fe.set("doc", b"v2", MimeType::text_plain(), Some(&tok), &cancel).unwrap());
    assert_eq!(fe.get("doc", &cancel).unwrap().unwrap(), b"v2");

    let entries: Vec<_> = fe.tags("doc", &cancel).unwrap().unwrap().collect::<castore::Result<Vec<_>>>().unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries[1].pre.is_none());
}

#[test]
fn s3_set_with_stale_or_missing_token_conflicts() {
    let fe = Frontend::new(MemoryBackend::new());
    let cancel = Cancel::new();

    assert!(fe.set("doc", b"v1", MimeType::text_plain(), None, &cancel).unwrap());
    assert!(!fe.set("doc", b"v2", MimeType::text_plain(), None, &cancel).unwrap());
    assert_eq!(fe.get("doc", &cancel).unwrap().unwrap(), b"v1");
}

#[test]
fn s4_streamed_push_matches_concatenation_and_content_id() {
    let fe = Frontend::new(MemoryBackend::new());
    let cancel = Cancel::new();

    let chunks: [&[u8]; 3] = [b"test", b" - ", b"data"];
    let mut joined = Vec::new();
    for c in chunks {
        joined.extend_from_slice(c);
    }

    let mut reader = std::io::Cursor::new(joined.clone());
    let cid = fe.push_stream(&mut reader, MimeType::octet_stream(), &cancel).unwrap().unwrap();
    assert_eq!(cid, ContentId::of_content(b"test - data"));

    let (mut stream, _ty) = fe.pull_stream(&cid, &cancel).unwrap().unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).unwrap();
    assert_eq!(out, b"test - data");
}

#[test]
fn s5_secret_wrapper_frames_bytes_at_rest_while_frontend_sees_plaintext() {
    let raw = Arc::new(MemoryBackend::new());
    let wrapped = SecretWrapper::new(raw.clone(), "hunter2", "some-salt");
    let fe = Frontend::new(wrapped);
    let cancel = Cancel::new();

    assert!(fe.set("k", b"secret", MimeType::text_plain(), None, &cancel).unwrap());

    // The pushed content blob is stored under the SHA-512 of the plaintext;
    // inspecting the raw backend directly must reveal the `SKE:` frame.
    let content_cid = ContentId::of_content(b"secret");
    let raw_bytes = raw.read(&content_cid, &cancel).unwrap().unwrap().bytes;
    assert!(raw_bytes.starts_with(b"SKE:"));

    assert_eq!(fe.get("k", &cancel).unwrap().unwrap(), b"secret");
}

#[test]
fn s6_copy_points_at_same_content_under_a_new_name() {
    let fe = Frontend::new(MemoryBackend::new());
    let cancel = Cancel::new();

    assert!(fe.set("doc", b"v1", MimeType::text_plain(), None, &cancel).unwrap());
    assert!(fe.copy("doc", "alias", None, &cancel).unwrap());

    assert!(fe.has("alias", &cancel).unwrap());
    assert_eq!(fe.tag("alias", &cancel).unwrap().unwrap().cid, fe.tag("doc", &cancel).unwrap().unwrap().cid);
    assert_eq!(fe.tag("alias", &cancel).unwrap().unwrap().name, "alias");
}
