//! Asymmetric payload codec.
//!
//! A record is serialized to canonical JSON, prefixed with the memo sentinel,
//! and sealed with XChaCha20-Poly1305 under a symmetric key derived by ECDH
//! over secp256k1. The ciphertext header carries both parties' compressed
//! public keys, so either the sender or the recipient can decrypt with only
//! its own private key by recovering the counterpart key from the header and
//! computing the same shared secret from the opposite side.
//!
//! The sentinel character is a protocol contract of the ledger's memo
//! encryption convention, not an implementation detail: every encrypted
//! payload decrypts to `#<json>`.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::{Error, Result};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

/// Sentinel prepended to the serialized record before encryption.
pub const MEMO_SENTINEL: char = '#';

const PUBKEY_LEN: usize = 33; // SEC1 compressed
const NONCE_LEN: usize = 24; // XChaCha20
const TAG_LEN: usize = 16; // Poly1305
const HEADER_LEN: usize = 2 * PUBKEY_LEN + NONCE_LEN;

/// secp256k1 private scalar, hex-encoded at rest. Zeroized on drop by the
/// underlying field element.
#[derive(Clone)]
pub struct PrivateKey {
    inner: k256::SecretKey,
}

impl PrivateKey {
    /// Parse hex key material. A blank string is a missing key, anything
    /// else that fails to parse is invalid key material.
    pub fn from_hex(s: &str, which: &'static str) -> Result<Self> {
        if s.trim().is_empty() {
            return Err(Error::MissingKey(which));
        }
        let bytes = hex::decode(s.trim()).map_err(|e| Error::InvalidKey {
            which,
            reason: e.to_string(),
        })?;
        let inner = k256::SecretKey::from_slice(&bytes).map_err(|e| Error::InvalidKey {
            which,
            reason: e.to_string(),
        })?;
        Ok(Self { inner })
    }

    pub fn generate() -> Self {
        Self {
            inner: k256::SecretKey::random(&mut rand::rngs::OsRng),
        }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.inner.to_bytes())
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: self.inner.public_key(),
        }
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never leak scalar material through logs
        f.write_str("PrivateKey(..)")
    }
}

/// secp256k1 public key, SEC1-compressed hex at rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    inner: k256::PublicKey,
}

impl PublicKey {
    pub fn from_hex(s: &str, which: &'static str) -> Result<Self> {
        if s.trim().is_empty() {
            return Err(Error::MissingKey(which));
        }
        let bytes = hex::decode(s.trim()).map_err(|e| Error::InvalidKey {
            which,
            reason: e.to_string(),
        })?;
        let inner = k256::PublicKey::from_sec1_bytes(&bytes).map_err(|e| Error::InvalidKey {
            which,
            reason: e.to_string(),
        })?;
        Ok(Self { inner })
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.compressed())
    }

    fn compressed(&self) -> Vec<u8> {
        self.inner.to_encoded_point(true).as_bytes().to_vec()
    }
}

/// ECDH key agreement followed by a SHA-256 KDF. Computing this from
/// (A.priv, B.pub) and from (B.priv, A.pub) yields the same key, which is
/// what makes the scheme bidirectional.
fn shared_key(private: &PrivateKey, public: &PublicKey) -> [u8; 32] {
    let shared = k256::ecdh::diffie_hellman(
        private.inner.to_nonzero_scalar(),
        public.inner.as_affine(),
    );
    let mut hasher = Sha256::new();
    hasher.update(shared.raw_secret_bytes());
    hasher.finalize().into()
}

/// Encrypt a record for exactly two parties. Output is fresh-random per call.
pub fn encrypt<T: Serialize>(
    record: &T,
    sender_private: &PrivateKey,
    recipient_public: &PublicKey,
) -> Result<String> {
    let json = serde_json::to_string(record).map_err(|e| Error::MalformedRecord(e.to_string()))?;
    if json == "null" {
        return Err(Error::MalformedRecord("record must not be null".to_string()));
    }
    let plaintext = format!("{MEMO_SENTINEL}{json}");

    let mut key = shared_key(sender_private, recipient_public);
    let cipher = XChaCha20Poly1305::new((&key).into());
    let mut nonce = [0u8; NONCE_LEN];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut nonce);

    let sealed = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext.as_bytes())
        .map_err(|e| Error::Crypto(format!("encryption failed: {e}")));
    key.zeroize();
    let sealed = sealed?;

    let mut out = Vec::with_capacity(HEADER_LEN + sealed.len());
    out.extend_from_slice(&sender_private.public_key().compressed());
    out.extend_from_slice(&recipient_public.compressed());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(BASE64.encode(out))
}

/// Decrypt a ciphertext produced by [`encrypt`] with either party's private
/// key. Everything other than missing/invalid key material fails with the
/// umbrella crypto error.
pub fn decrypt<T: DeserializeOwned>(ciphertext: &str, own_private: &PrivateKey) -> Result<T> {
    let raw = BASE64
        .decode(ciphertext.trim())
        .map_err(|_| Error::Crypto("ciphertext is not valid base64".to_string()))?;
    if raw.len() < HEADER_LEN + TAG_LEN {
        return Err(Error::Crypto("ciphertext too short".to_string()));
    }

    let sender = k256::PublicKey::from_sec1_bytes(&raw[..PUBKEY_LEN])
        .map_err(|_| Error::Crypto("malformed sender key in ciphertext header".to_string()))?;
    let recipient = k256::PublicKey::from_sec1_bytes(&raw[PUBKEY_LEN..2 * PUBKEY_LEN])
        .map_err(|_| Error::Crypto("malformed recipient key in ciphertext header".to_string()))?;

    let own_public = own_private.public_key().inner;
    let counterpart = if own_public == sender {
        PublicKey { inner: recipient }
    } else if own_public == recipient {
        PublicKey { inner: sender }
    } else {
        return Err(Error::Crypto(
            "key does not belong to either party of this ciphertext".to_string(),
        ));
    };

    let mut key = shared_key(own_private, &counterpart);
    let cipher = XChaCha20Poly1305::new((&key).into());
    let nonce = XNonce::from_slice(&raw[2 * PUBKEY_LEN..HEADER_LEN]);
    let opened = cipher
        .decrypt(nonce, &raw[HEADER_LEN..])
        .map_err(|_| Error::Crypto("decryption failed".to_string()));
    key.zeroize();
    let opened = opened?;

    let plaintext = String::from_utf8(opened)
        .map_err(|_| Error::Crypto("decrypted payload is not utf-8".to_string()))?;
    let json = plaintext
        .strip_prefix(MEMO_SENTINEL)
        .ok_or_else(|| Error::Crypto("missing memo sentinel".to_string()))?;
    serde_json::from_str(json).map_err(|e| Error::Crypto(format!("record parse failed: {e}")))
}

/// Exact predicted ciphertext length for a candidate record, so callers can
/// pre-flight against ledger payload-size ceilings before broadcasting.
pub fn estimate_ciphertext_len<T: Serialize>(record: &T) -> Result<usize> {
    let json = serde_json::to_string(record).map_err(|e| Error::MalformedRecord(e.to_string()))?;
    let raw = HEADER_LEN + MEMO_SENTINEL.len_utf8() + json.len() + TAG_LEN;
    Ok(raw.div_ceil(3) * 4)
}
