//! Streaming sign-then-encrypt codec
//!
//! Sealed chunk format (binary):
//! ```text
//! XChaCha20-Poly1305(key = enc_key, nonce = chunk_nonce)(
//!     [64 bytes: Ed25519 signature][N bytes: plaintext]
//! )  => [64 + N bytes: ciphertext][16 bytes: Poly1305 tag]
//! ```
//!
//! The signature covers the encryption key and the chunk nonce, so a sealed
//! chunk cannot be moved to another position, another object, or re-sealed
//! under a different key without failing verification.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use sha2::{Digest, Sha512};
use std::io::{self, Read};

use crate::error::CodecError;
use crate::keys::{DecryptionKeys, EncryptionContext, SecretKey, SignaturePrefix};
use crate::{packet_len, CHUNK_LEN, CHUNK_NONCE_SIZE, NONCE_SIZE, SIGNATURE_SIZE};

/// `object_nonce || BE64(chunk_num)`
fn make_chunk_nonce(nonce: &[u8; NONCE_SIZE], chunk_num: u64) -> [u8; CHUNK_NONCE_SIZE] {
    let mut out = [0u8; CHUNK_NONCE_SIZE];
    out[..NONCE_SIZE].copy_from_slice(nonce);
    out[NONCE_SIZE..].copy_from_slice(&chunk_num.to_be_bytes());
    out
}

/// `prefix || 0x00 || enc_key || chunk_nonce || SHA512(plaintext)`
fn make_signature_input(
    plaintext: &[u8],
    enc_key: &SecretKey,
    prefix: &SignaturePrefix,
    chunk_nonce: &[u8; CHUNK_NONCE_SIZE],
) -> Vec<u8> {
    let chunk_hash = Sha512::digest(plaintext);
    let mut input = Vec::with_capacity(prefix.as_bytes().len() + 1 + 32 + CHUNK_NONCE_SIZE + 64);
    input.extend_from_slice(prefix.as_bytes());
    input.push(0x00);
    input.extend_from_slice(enc_key.as_bytes());
    input.extend_from_slice(chunk_nonce);
    input.extend_from_slice(&chunk_hash);
    input
}

fn seal_packet(
    cipher: &XChaCha20Poly1305,
    plaintext: &[u8],
    enc_key: &SecretKey,
    sign_key: &SigningKey,
    prefix: &SignaturePrefix,
    chunk_num: u64,
    chunk_nonce: &[u8; CHUNK_NONCE_SIZE],
) -> Result<Vec<u8>, CodecError> {
    let input = make_signature_input(plaintext, enc_key, prefix, chunk_nonce);
    let signature = sign_key.sign(&input);

    let mut signed = Vec::with_capacity(SIGNATURE_SIZE + plaintext.len());
    signed.extend_from_slice(&signature.to_bytes());
    signed.extend_from_slice(plaintext);

    cipher
        .encrypt(XNonce::from_slice(chunk_nonce), signed.as_slice())
        .map_err(|_| CodecError::SealFailed { chunk: chunk_num })
}

fn open_packet(
    cipher: &XChaCha20Poly1305,
    packet: &[u8],
    enc_key: &SecretKey,
    verify_key: &VerifyingKey,
    prefix: &SignaturePrefix,
    chunk_num: u64,
    chunk_nonce: &[u8; CHUNK_NONCE_SIZE],
) -> Result<Vec<u8>, CodecError> {
    let mut signed = cipher
        .decrypt(XNonce::from_slice(chunk_nonce), packet)
        .map_err(|_| CodecError::BadSecretbox { chunk: chunk_num })?;
    if signed.len() < SIGNATURE_SIZE {
        return Err(CodecError::ShortSignature { chunk: chunk_num });
    }

    let mut sig_bytes = [0u8; SIGNATURE_SIZE];
    sig_bytes.copy_from_slice(&signed[..SIGNATURE_SIZE]);
    let signature = Signature::from_bytes(&sig_bytes);
    let plaintext = signed.split_off(SIGNATURE_SIZE);

    let input = make_signature_input(&plaintext, enc_key, prefix, chunk_nonce);
    verify_key
        .verify_strict(&input, &signature)
        .map_err(|_| CodecError::BadSignature { chunk: chunk_num })?;
    Ok(plaintext)
}

// ── Incremental encoder ──────────────────────────────────────────────────────

/// Incremental encoder. Feed plaintext with [`Encoder::write`], then call
/// [`Encoder::finish`] exactly once to emit the terminal chunk. Skipping
/// `finish` loses the tail and makes the output undecodable.
pub struct Encoder {
    cipher: XChaCha20Poly1305,
    enc_key: SecretKey,
    sign_key: SigningKey,
    prefix: SignaturePrefix,
    nonce: [u8; NONCE_SIZE],
    buf: Vec<u8>,
    chunk_num: u64,
    chunk_len: usize,
}

impl Encoder {
    pub fn new(ctx: &EncryptionContext, prefix: &SignaturePrefix) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(ctx.enc_key().as_bytes().into()),
            enc_key: ctx.enc_key().clone(),
            sign_key: ctx.signing_key().clone(),
            prefix: prefix.clone(),
            nonce: *ctx.nonce(),
            buf: Vec::new(),
            chunk_num: 0,
            chunk_len: CHUNK_LEN,
        }
    }

    /// Override the plaintext chunk length. Output produced this way is not
    /// readable by a default [`Decoder`]; intended for tests.
    pub fn with_chunk_len(mut self, chunk_len: usize) -> Self {
        self.chunk_len = chunk_len.max(1);
        self
    }

    /// Number of chunks sealed so far.
    pub fn chunks_sealed(&self) -> u64 {
        self.chunk_num
    }

    fn seal_one(&mut self, len: usize) -> Result<Vec<u8>, CodecError> {
        let chunk_nonce = make_chunk_nonce(&self.nonce, self.chunk_num);
        let packet = seal_packet(
            &self.cipher,
            &self.buf[..len],
            &self.enc_key,
            &self.sign_key,
            &self.prefix,
            self.chunk_num,
            &chunk_nonce,
        )?;
        self.buf.drain(..len);
        self.chunk_num += 1;
        Ok(packet)
    }

    /// Buffer `plaintext` and return every chunk that is now complete.
    pub fn write(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
        self.buf.extend_from_slice(plaintext);
        let mut output = Vec::new();
        while self.buf.len() >= self.chunk_len {
            let packet = self.seal_one(self.chunk_len)?;
            output.extend_from_slice(&packet);
        }
        Ok(output)
    }

    /// Seal whatever is buffered (possibly nothing) as the terminal chunk.
    pub fn finish(&mut self) -> Result<Vec<u8>, CodecError> {
        debug_assert!(self.buf.len() < self.chunk_len);
        let len = self.buf.len();
        self.seal_one(len)
    }
}

// ── Incremental decoder ──────────────────────────────────────────────────────

/// Incremental decoder. Every chunk except the last is assumed to be a full
/// packet; [`Decoder::finish`] opens the remainder as the terminal chunk and
/// thereby detects truncation.
///
/// The first error is sticky: all later calls return it again.
pub struct Decoder {
    cipher: XChaCha20Poly1305,
    enc_key: SecretKey,
    verify_key: VerifyingKey,
    prefix: SignaturePrefix,
    nonce: [u8; NONCE_SIZE],
    buf: Vec<u8>,
    chunk_num: u64,
    err: Option<CodecError>,
    packet_len: usize,
}

impl Decoder {
    pub fn new(keys: &DecryptionKeys, prefix: &SignaturePrefix) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(keys.enc_key().as_bytes().into()),
            enc_key: keys.enc_key().clone(),
            verify_key: *keys.verify_key(),
            prefix: prefix.clone(),
            nonce: *keys.nonce(),
            buf: Vec::new(),
            chunk_num: 0,
            err: None,
            packet_len: packet_len(CHUNK_LEN),
        }
    }

    /// Counterpart of [`Encoder::with_chunk_len`].
    pub fn with_chunk_len(mut self, chunk_len: usize) -> Self {
        self.packet_len = packet_len(chunk_len.max(1));
        self
    }

    /// Start decoding at chunk `num` instead of 0 (random access).
    pub fn set_chunk_num(&mut self, num: u64) {
        self.chunk_num = num;
    }

    pub fn chunk_num(&self) -> u64 {
        self.chunk_num
    }

    fn fail(&mut self, err: CodecError) -> CodecError {
        tracing::debug!(chunk = self.chunk_num, error = %err, "chunk rejected");
        self.err = Some(err.clone());
        err
    }

    fn open_one(&mut self, packet: &[u8]) -> Result<Vec<u8>, CodecError> {
        let chunk_nonce = make_chunk_nonce(&self.nonce, self.chunk_num);
        let plaintext = open_packet(
            &self.cipher,
            packet,
            &self.enc_key,
            &self.verify_key,
            &self.prefix,
            self.chunk_num,
            &chunk_nonce,
        )?;
        self.chunk_num += 1;
        Ok(plaintext)
    }

    /// Buffer ciphertext and return the plaintext of every full packet opened.
    pub fn write(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CodecError> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        self.buf.extend_from_slice(ciphertext);
        let mut output = Vec::new();
        let mut consumed = 0;
        while self.buf.len() - consumed >= self.packet_len {
            let end = consumed + self.packet_len;
            let packet = self.buf[consumed..end].to_vec();
            match self.open_one(&packet) {
                Ok(plaintext) => output.extend_from_slice(&plaintext),
                Err(e) => return Err(self.fail(e)),
            }
            consumed = end;
        }
        self.buf.drain(..consumed);
        Ok(output)
    }

    /// Open the buffered remainder as the terminal chunk. Call once.
    pub fn finish(&mut self) -> Result<Vec<u8>, CodecError> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        let packet = std::mem::take(&mut self.buf);
        match self.open_one(&packet) {
            Ok(plaintext) => Ok(plaintext),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Open a contiguous run of sealed chunks, starting at the current chunk
    /// number, returning one plaintext per chunk. Only the last packet may be
    /// short. Does not require (or check for) a terminal chunk.
    pub fn open_chunks(&mut self, ciphertext: &[u8]) -> Result<Vec<Vec<u8>>, CodecError> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        let mut chunks = Vec::with_capacity(ciphertext.len().div_ceil(self.packet_len));
        for packet in ciphertext.chunks(self.packet_len) {
            match self.open_one(packet) {
                Ok(plaintext) => chunks.push(plaintext),
                Err(e) => return Err(self.fail(e)),
            }
        }
        Ok(chunks)
    }
}

// ── Read adapters ────────────────────────────────────────────────────────────

trait Codec {
    fn write(&mut self, input: &[u8]) -> Result<Vec<u8>, CodecError>;
    fn finish(&mut self) -> Result<Vec<u8>, CodecError>;
}

impl Codec for Encoder {
    fn write(&mut self, input: &[u8]) -> Result<Vec<u8>, CodecError> {
        Encoder::write(self, input)
    }
    fn finish(&mut self) -> Result<Vec<u8>, CodecError> {
        Encoder::finish(self)
    }
}

impl Codec for Decoder {
    fn write(&mut self, input: &[u8]) -> Result<Vec<u8>, CodecError> {
        Decoder::write(self, input)
    }
    fn finish(&mut self) -> Result<Vec<u8>, CodecError> {
        Decoder::finish(self)
    }
}

const READ_BUF_SIZE: usize = 64 * 1024;

/// Drives a codec from an inner reader. Codec errors are permanent; I/O
/// errors from the inner reader are passed through and the read may be retried.
struct CodecReader<C, R> {
    codec: C,
    inner: R,
    read_buf: Vec<u8>,
    pending: Vec<u8>,
    pending_pos: usize,
    codec_err: Option<CodecError>,
    inner_eof: bool,
}

impl<C: Codec, R: Read> CodecReader<C, R> {
    fn new(codec: C, inner: R) -> Self {
        Self {
            codec,
            inner,
            read_buf: vec![0u8; READ_BUF_SIZE],
            pending: Vec::new(),
            pending_pos: 0,
            codec_err: None,
            inner_eof: false,
        }
    }

    fn codec_failure(&mut self, err: CodecError) -> io::Error {
        self.codec_err = Some(err.clone());
        io::Error::new(io::ErrorKind::InvalidData, err)
    }

    fn read_inner(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if let Some(err) = &self.codec_err {
            return Err(io::Error::new(io::ErrorKind::InvalidData, err.clone()));
        }
        while !self.inner_eof && self.pending_pos == self.pending.len() {
            self.pending.clear();
            self.pending_pos = 0;
            let n = match self.inner.read(&mut self.read_buf) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            let produced = if n == 0 {
                self.inner_eof = true;
                self.codec.finish()
            } else {
                self.codec.write(&self.read_buf[..n])
            };
            match produced {
                Ok(bytes) => self.pending = bytes,
                Err(e) => return Err(self.codec_failure(e)),
            }
        }
        let available = &self.pending[self.pending_pos..];
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.pending_pos += n;
        Ok(n)
    }
}

/// `Read` adapter producing sealed bytes from a plaintext reader.
pub struct EncodingReader<R> {
    inner: CodecReader<Encoder, R>,
}

impl<R: Read> EncodingReader<R> {
    pub fn new(ctx: &EncryptionContext, prefix: &SignaturePrefix, plaintext: R) -> Self {
        Self {
            inner: CodecReader::new(Encoder::new(ctx, prefix), plaintext),
        }
    }
}

impl<R: Read> Read for EncodingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read_inner(buf)
    }
}

/// `Read` adapter producing verified plaintext from a sealed reader. A
/// [`CodecError`] surfaces as `io::ErrorKind::InvalidData` with the codec
/// error as its source.
pub struct DecodingReader<R> {
    inner: CodecReader<Decoder, R>,
}

impl<R: Read> DecodingReader<R> {
    pub fn new(keys: &DecryptionKeys, prefix: &SignaturePrefix, sealed: R) -> Self {
        Self {
            inner: CodecReader::new(Decoder::new(keys, prefix), sealed),
        }
    }
}

impl<R: Read> Read for DecodingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read_inner(buf)
    }
}

// ── All-at-once helpers ──────────────────────────────────────────────────────

/// Seal a whole plaintext in memory.
pub fn seal_whole(
    plaintext: &[u8],
    ctx: &EncryptionContext,
    prefix: &SignaturePrefix,
) -> Result<Vec<u8>, CodecError> {
    let mut encoder = Encoder::new(ctx, prefix);
    let mut output = encoder.write(plaintext)?;
    output.extend_from_slice(&encoder.finish()?);
    Ok(output)
}

/// Open a whole sealed object in memory.
pub fn open_whole(
    sealed: &[u8],
    keys: &DecryptionKeys,
    prefix: &SignaturePrefix,
) -> Result<Vec<u8>, CodecError> {
    let mut decoder = Decoder::new(keys, prefix);
    let mut output = decoder.write(sealed)?;
    output.extend_from_slice(&decoder.finish()?);
    Ok(output)
}

/// Open sealed chunks `first_index..` from a ciphertext range that starts on
/// a chunk boundary. Returns one plaintext per chunk.
pub fn open_chunk_range(
    keys: &DecryptionKeys,
    prefix: &SignaturePrefix,
    first_index: u64,
    ciphertext: &[u8],
) -> Result<Vec<Vec<u8>>, CodecError> {
    let mut decoder = Decoder::new(keys, prefix);
    decoder.set_chunk_num(first_index);
    decoder.open_chunks(ciphertext)
}
