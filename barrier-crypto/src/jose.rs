//! Compact JWE wire format (spec §4.1, §6).
//!
//! Hand-rolled rather than pulled from an external JOSE crate, in the style
//! of a hand-rolled wire module: fixed algorithm set (`dir`/`A256GCMKW` +
//! `A256GCM`), five base64url segments, a protected header that always
//! carries `alg`, `enc`, `kid`, `typ`. `alg=A256GCMKW` additionally carries
//! `iv`/`tag` header params for the key-wrap step, matching RFC 7518 §4.7.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::BarrierError;

pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

/// Symmetric wrapping or content-encryption key (spec §3 "Unseal JWK set").
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Jwk {
    #[zeroize(skip)]
    pub kid: String,
    #[zeroize(skip)]
    pub alg: JweAlg,
    key: [u8; KEY_LEN],
}

impl Jwk {
    pub fn new(kid: impl Into<String>, alg: JweAlg, key: [u8; KEY_LEN]) -> Self {
        Self { kid: kid.into(), alg, key }
    }

    /// Generate a fresh key with random material (content keys, CEKs).
    pub fn generate(kid: impl Into<String>, alg: JweAlg) -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self::new(kid, alg, key)
    }

    pub fn key_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }
}

impl std::fmt::Debug for Jwk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Jwk").field("kid", &self.kid).field("alg", &self.alg).finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JweAlg {
    #[serde(rename = "dir")]
    Dir,
    #[serde(rename = "A256GCMKW")]
    A256GcmKw,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct JweHeader {
    alg: JweAlg,
    enc: &'static str,
    kid: String,
    typ: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    iv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tag: Option<String>,
}

const ENC_A256GCM: &str = "A256GCM";

/// A parsed or to-be-serialized compact JWE: five base64url segments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompactJwe(String);

impl CompactJwe {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn parse(s: impl Into<String>) -> Result<Self, BarrierError> {
        let s = s.into();
        if s.split('.').count() != 5 {
            return Err(BarrierError::invalid("malformed compact JWE: expected 5 segments"));
        }
        Ok(Self(s))
    }

    /// Read the `kid` named in the protected header without decrypting.
    pub fn peek_kid(&self) -> Result<String, BarrierError> {
        let header = self.header()?;
        Ok(header.kid)
    }

    fn segments(&self) -> Vec<&str> {
        self.0.split('.').collect()
    }

    fn header(&self) -> Result<JweHeader, BarrierError> {
        let segs = self.segments();
        let raw = b64_decode(segs[0])?;
        serde_json::from_slice(&raw).map_err(|e| BarrierError::invalid(format!("bad protected header: {}", e)))
    }
}

impl std::fmt::Display for CompactJwe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn b64_encode(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

fn b64_decode(s: &str) -> Result<Vec<u8>, BarrierError> {
    URL_SAFE_NO_PAD.decode(s).map_err(|e| BarrierError::invalid(format!("bad base64url: {}", e)))
}

fn aead_encrypt(key: &[u8; KEY_LEN], iv: &[u8; IV_LEN], aad: &[u8], plaintext: &[u8]) -> (Vec<u8>, [u8; TAG_LEN]) {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(iv);
    let mut out = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .expect("AES-256-GCM encryption is infallible for valid key/nonce sizes");
    let tag_start = out.len() - TAG_LEN;
    let tag_vec = out.split_off(tag_start);
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&tag_vec);
    (out, tag)
}

fn aead_decrypt(
    key: &[u8; KEY_LEN],
    iv: &[u8; IV_LEN],
    aad: &[u8],
    ciphertext: &[u8],
    tag: &[u8; TAG_LEN],
) -> Result<Vec<u8>, BarrierError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(iv);
    let mut combined = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(tag);
    cipher
        .decrypt(nonce, Payload { msg: &combined, aad })
        .map_err(|_| BarrierError::corruption("AEAD tag mismatch"))
}

fn random_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// Encrypt `plaintext` directly under a content key (`dir`/`A256GCM`).
pub fn encrypt_direct(content_key: &Jwk, plaintext: &[u8]) -> Result<CompactJwe, BarrierError> {
    if content_key.alg != JweAlg::Dir {
        return Err(BarrierError::invalid("encrypt_direct requires a `dir` key"));
    }
    let header = JweHeader {
        alg: JweAlg::Dir,
        enc: ENC_A256GCM,
        kid: content_key.kid.clone(),
        typ: "JWE",
        iv: None,
        tag: None,
    };
    let protected = b64_encode(&serde_json::to_vec(&header).expect("header serializes"));
    let iv = random_iv();
    let (ciphertext, tag) = aead_encrypt(content_key.key_bytes(), &iv, protected.as_bytes(), plaintext);
    Ok(CompactJwe(format!(
        "{}..{}.{}.{}",
        protected,
        b64_encode(&iv),
        b64_encode(&ciphertext),
        b64_encode(&tag)
    )))
}

/// Decrypt a `dir`/`A256GCM` compact JWE with the given content key.
///
/// The caller is responsible for looking up `content_key` by the kid
/// returned from [`CompactJwe::peek_kid`] (spec §4.1 "Decryption").
pub fn decrypt_direct(content_key: &Jwk, jwe: &CompactJwe) -> Result<Vec<u8>, BarrierError> {
    let header = jwe.header()?;
    if header.alg != JweAlg::Dir || header.enc != ENC_A256GCM {
        return Err(BarrierError::invalid("unexpected alg/enc for direct decryption"));
    }
    let segs = jwe.segments();
    let iv: [u8; IV_LEN] = b64_decode(segs[2])?
        .try_into()
        .map_err(|_| BarrierError::invalid("bad IV length"))?;
    let ciphertext = b64_decode(segs[3])?;
    let tag: [u8; TAG_LEN] = b64_decode(segs[4])?
        .try_into()
        .map_err(|_| BarrierError::invalid("bad tag length"))?;
    aead_decrypt(content_key.key_bytes(), &iv, segs[0].as_bytes(), &ciphertext, &tag)
}

/// Wrap `child_key_bytes` under a single parent key (`A256GCMKW`/`A256GCM`).
///
/// Used for root→intermediate and intermediate→content wrapping (spec §4.1).
/// The protected header's `kid` names the *parent* key, per the invariant
/// that a row's header always points at its wrapping key one tier up.
pub fn wrap_key(parent: &Jwk, child_key_bytes: &[u8; KEY_LEN]) -> Result<CompactJwe, BarrierError> {
    if parent.alg != JweAlg::A256GcmKw {
        return Err(BarrierError::invalid("wrap_key requires an A256GCMKW parent key"));
    }
    let cek = {
        let mut k = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut k);
        k
    };
    let kw_iv = random_iv();
    let (wrapped_cek, kw_tag) = aead_encrypt(parent.key_bytes(), &kw_iv, &[], &cek);

    let header = JweHeader {
        alg: JweAlg::A256GcmKw,
        enc: ENC_A256GCM,
        kid: parent.kid.clone(),
        typ: "JWE",
        iv: Some(b64_encode(&kw_iv)),
        tag: Some(b64_encode(&kw_tag)),
    };
    let protected = b64_encode(&serde_json::to_vec(&header).expect("header serializes"));

    let content_iv = random_iv();
    let (ciphertext, tag) = aead_encrypt(&cek, &content_iv, protected.as_bytes(), child_key_bytes);

    Ok(CompactJwe(format!(
        "{}.{}.{}.{}.{}",
        protected,
        b64_encode(&wrapped_cek),
        b64_encode(&content_iv),
        b64_encode(&ciphertext),
        b64_encode(&tag)
    )))
}

/// Unwrap a single-recipient `A256GCMKW` JWE with the given parent key.
pub fn unwrap_key(parent: &Jwk, jwe: &CompactJwe) -> Result<[u8; KEY_LEN], BarrierError> {
    let header = jwe.header()?;
    if header.alg != JweAlg::A256GcmKw || header.enc != ENC_A256GCM {
        return Err(BarrierError::invalid("unexpected alg/enc for key unwrap"));
    }
    let kw_iv: [u8; IV_LEN] = b64_decode(header.iv.as_deref().unwrap_or_default())?
        .try_into()
        .map_err(|_| BarrierError::invalid("bad wrap IV length"))?;
    let kw_tag: [u8; TAG_LEN] = b64_decode(header.tag.as_deref().unwrap_or_default())?
        .try_into()
        .map_err(|_| BarrierError::invalid("bad wrap tag length"))?;

    let segs = jwe.segments();
    let wrapped_cek = b64_decode(segs[1])?;
    let cek_bytes = aead_decrypt(parent.key_bytes(), &kw_iv, &[], &wrapped_cek, &kw_tag)?;
    let cek: [u8; KEY_LEN] = cek_bytes.try_into().map_err(|_| BarrierError::corruption("bad CEK length"))?;

    let content_iv: [u8; IV_LEN] = b64_decode(segs[2])?
        .try_into()
        .map_err(|_| BarrierError::invalid("bad content IV length"))?;
    let ciphertext = b64_decode(segs[3])?;
    let tag: [u8; TAG_LEN] = b64_decode(segs[4])?
        .try_into()
        .map_err(|_| BarrierError::invalid("bad tag length"))?;
    let plaintext = aead_decrypt(&cek, &content_iv, segs[0].as_bytes(), &ciphertext, &tag)?;
    plaintext.try_into().map_err(|_| BarrierError::corruption("unwrapped key has unexpected length"))
}

/// A root key wrapped to every currently-loaded unseal key (spec §4.1: "any
/// single Uᵢ suffices to decrypt R"). Compact JWE has exactly one recipient,
/// so the multi-recipient case is a small JSON envelope of independent
/// compact JWEs, each self-describing via its own protected header `kid`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MultiRecipientJwe {
    recipients: Vec<String>,
}

impl MultiRecipientJwe {
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("envelope serializes")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BarrierError> {
        serde_json::from_slice(bytes).map_err(|e| BarrierError::invalid(format!("bad multi-recipient envelope: {}", e)))
    }

    pub fn recipient_kids(&self) -> Result<Vec<String>, BarrierError> {
        self.recipients.iter().map(|s| CompactJwe::parse(s.clone())?.peek_kid()).collect()
    }
}

/// Wrap `child_key_bytes` to every key in `parents` independently.
pub fn wrap_key_multi(parents: &[Jwk], child_key_bytes: &[u8; KEY_LEN]) -> Result<MultiRecipientJwe, BarrierError> {
    if parents.is_empty() {
        return Err(BarrierError::invalid("at least one unseal key is required to wrap a root key"));
    }
    let recipients = parents
        .iter()
        .map(|p| wrap_key(p, child_key_bytes).map(|j| j.into_string()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(MultiRecipientJwe { recipients })
}

/// Try every available unseal key against a multi-recipient envelope until
/// one unwraps. Returns `Sealed` if none succeed (spec §4.1 failure modes).
pub fn unwrap_key_multi_any(available: &[Jwk], envelope: &MultiRecipientJwe) -> Result<[u8; KEY_LEN], BarrierError> {
    for recipient in &envelope.recipients {
        let jwe = CompactJwe::parse(recipient.clone())?;
        let kid = match jwe.peek_kid() {
            Ok(k) => k,
            Err(_) => continue,
        };
        if let Some(key) = available.iter().find(|k| k.kid == kid) {
            if let Ok(plaintext) = unwrap_key(key, &jwe) {
                return Ok(plaintext);
            }
        }
    }
    Err(BarrierError::sealed("no available unseal key could open the active root"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_round_trip() {
        let key = Jwk::generate("content-1", JweAlg::Dir);
        for plaintext in [&b""[..], b"x", &[7u8; 1024][..], &[9u8; 65536][..]] {
            let jwe = encrypt_direct(&key, plaintext).unwrap();
            assert_eq!(jwe.peek_kid().unwrap(), "content-1");
            let out = decrypt_direct(&key, &jwe).unwrap();
            assert_eq!(out, plaintext);
        }
    }

    #[test]
    fn direct_decrypt_detects_corruption() {
        let key = Jwk::generate("content-1", JweAlg::Dir);
        let jwe = encrypt_direct(&key, b"hello").unwrap();
        let mut raw = jwe.into_string();
        raw.push('A');
        raw.truncate(raw.len() - 1);
        let tampered = CompactJwe::parse(raw).unwrap();
        assert!(matches!(decrypt_direct(&key, &tampered), Err(BarrierError::Corruption(_))));
    }

    #[test]
    fn wrap_unwrap_round_trip() {
        let parent = Jwk::generate("root-1", JweAlg::A256GcmKw);
        let child_bytes = [42u8; KEY_LEN];
        let jwe = wrap_key(&parent, &child_bytes).unwrap();
        assert_eq!(jwe.peek_kid().unwrap(), "root-1");
        let unwrapped = unwrap_key(&parent, &jwe).unwrap();
        assert_eq!(unwrapped, child_bytes);
    }

    #[test]
    fn multi_recipient_any_unseal_key_opens_it() {
        let u1 = Jwk::generate("u1", JweAlg::A256GcmKw);
        let u2 = Jwk::generate("u2", JweAlg::A256GcmKw);
        let child_bytes = [7u8; KEY_LEN];
        let envelope = wrap_key_multi(&[u1.clone(), u2.clone()], &child_bytes).unwrap();

        assert_eq!(unwrap_key_multi_any(&[u2], &envelope).unwrap(), child_bytes);

        let disjoint = Jwk::generate("u3", JweAlg::A256GcmKw);
        assert!(matches!(unwrap_key_multi_any(&[disjoint], &envelope), Err(BarrierError::Sealed(_))));
    }
}
