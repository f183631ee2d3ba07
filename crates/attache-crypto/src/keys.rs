//! Per-object key material: symmetric key, signing keypair, object nonce

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::CodecError;
use crate::{KEY_SIZE, NONCE_SIZE};

/// A 256-bit symmetric encryption key. Zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey {
    bytes: [u8; KEY_SIZE],
}

impl SecretKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Everything needed to seal one object.
///
/// Must be fresh for every distinct plaintext: chunk nonces are derived from
/// the object nonce and the chunk index only, so sealing two different
/// plaintexts under one context repeats (key, nonce) pairs.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "EncodedContext", into = "EncodedContext")]
pub struct EncryptionContext {
    enc_key: SecretKey,
    sign_key: SigningKey,
    nonce: [u8; NONCE_SIZE],
}

impl EncryptionContext {
    /// Generate a fresh random context.
    pub fn generate() -> Self {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        Self {
            enc_key: SecretKey::generate(),
            sign_key: SigningKey::generate(&mut OsRng),
            nonce,
        }
    }

    /// Rebuild a context from raw secrets (e.g. loaded from the upload stash).
    pub fn from_parts(
        enc_key: [u8; KEY_SIZE],
        sign_seed: [u8; KEY_SIZE],
        nonce: [u8; NONCE_SIZE],
    ) -> Self {
        Self {
            enc_key: SecretKey::from_bytes(enc_key),
            sign_key: SigningKey::from_bytes(&sign_seed),
            nonce,
        }
    }

    pub fn enc_key(&self) -> &SecretKey {
        &self.enc_key
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.sign_key
    }

    pub fn verify_key(&self) -> VerifyingKey {
        self.sign_key.verifying_key()
    }

    pub fn nonce(&self) -> &[u8; NONCE_SIZE] {
        &self.nonce
    }

    /// The public half a recipient needs to open the object.
    pub fn decryption_keys(&self) -> DecryptionKeys {
        DecryptionKeys {
            enc_key: self.enc_key.clone(),
            verify_key: self.verify_key(),
            nonce: self.nonce,
        }
    }
}

impl std::fmt::Debug for EncryptionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionContext")
            .field("enc_key", &self.enc_key)
            .field("verify_key", &self.verify_key())
            .field("nonce", &"[REDACTED]")
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct EncodedContext {
    enc_key: String,
    sign_key: String,
    nonce: String,
}

impl From<EncryptionContext> for EncodedContext {
    fn from(ctx: EncryptionContext) -> Self {
        let mut seed = ctx.sign_key.to_bytes();
        let encoded = EncodedContext {
            enc_key: B64.encode(ctx.enc_key.as_bytes()),
            sign_key: B64.encode(seed),
            nonce: B64.encode(ctx.nonce),
        };
        seed.zeroize();
        encoded
    }
}

impl TryFrom<EncodedContext> for EncryptionContext {
    type Error = CodecError;

    fn try_from(enc: EncodedContext) -> Result<Self, Self::Error> {
        let mut enc_key = decode_fixed::<KEY_SIZE>("enc_key", &enc.enc_key)?;
        let mut seed = decode_fixed::<KEY_SIZE>("sign_key", &enc.sign_key)?;
        let nonce = decode_fixed::<NONCE_SIZE>("nonce", &enc.nonce)?;
        let ctx = EncryptionContext::from_parts(enc_key, seed, nonce);
        enc_key.zeroize();
        seed.zeroize();
        Ok(ctx)
    }
}

/// Key material needed to open (but not forge) an object.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "EncodedKeys", into = "EncodedKeys")]
pub struct DecryptionKeys {
    enc_key: SecretKey,
    verify_key: VerifyingKey,
    nonce: [u8; NONCE_SIZE],
}

impl DecryptionKeys {
    pub fn new(enc_key: SecretKey, verify_key: VerifyingKey, nonce: [u8; NONCE_SIZE]) -> Self {
        Self {
            enc_key,
            verify_key,
            nonce,
        }
    }

    pub fn enc_key(&self) -> &SecretKey {
        &self.enc_key
    }

    pub fn verify_key(&self) -> &VerifyingKey {
        &self.verify_key
    }

    pub fn nonce(&self) -> &[u8; NONCE_SIZE] {
        &self.nonce
    }
}

impl std::fmt::Debug for DecryptionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptionKeys")
            .field("enc_key", &self.enc_key)
            .field("verify_key", &self.verify_key)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize)]
struct EncodedKeys {
    enc_key: String,
    verify_key: String,
    nonce: String,
}

impl From<DecryptionKeys> for EncodedKeys {
    fn from(keys: DecryptionKeys) -> Self {
        EncodedKeys {
            enc_key: B64.encode(keys.enc_key.as_bytes()),
            verify_key: B64.encode(keys.verify_key.as_bytes()),
            nonce: B64.encode(keys.nonce),
        }
    }
}

impl TryFrom<EncodedKeys> for DecryptionKeys {
    type Error = CodecError;

    fn try_from(enc: EncodedKeys) -> Result<Self, Self::Error> {
        let mut enc_key = decode_fixed::<KEY_SIZE>("enc_key", &enc.enc_key)?;
        let verify = decode_fixed::<KEY_SIZE>("verify_key", &enc.verify_key)?;
        let nonce = decode_fixed::<NONCE_SIZE>("nonce", &enc.nonce)?;
        let verify_key = VerifyingKey::from_bytes(&verify)
            .map_err(|e| CodecError::InvalidKey(format!("verify_key: {e}")))?;
        let keys = DecryptionKeys::new(SecretKey::from_bytes(enc_key), verify_key, nonce);
        enc_key.zeroize();
        Ok(keys)
    }
}

fn decode_fixed<const N: usize>(field: &str, s: &str) -> Result<[u8; N], CodecError> {
    let mut raw = B64
        .decode(s)
        .map_err(|e| CodecError::InvalidKey(format!("{field}: {e}")))?;
    if raw.len() != N {
        let len = raw.len();
        raw.zeroize();
        return Err(CodecError::InvalidKey(format!(
            "{field}: {len} bytes (expected {N})"
        )));
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&raw);
    raw.zeroize();
    Ok(out)
}

/// ASCII signature context string. Signed payloads are `prefix || 0x00 || ...`,
/// which keeps attachment signatures apart from anything else the same
/// signing key signs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SignaturePrefix(String);

impl SignaturePrefix {
    pub fn new(prefix: impl Into<String>) -> Result<Self, CodecError> {
        let prefix = prefix.into();
        if !prefix.is_ascii() || prefix.as_bytes().contains(&0) {
            return Err(CodecError::InvalidPrefix(prefix));
        }
        Ok(Self(prefix))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SignaturePrefix {
    type Error = CodecError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<SignaturePrefix> for String {
    fn from(p: SignaturePrefix) -> Self {
        p.0
    }
}
