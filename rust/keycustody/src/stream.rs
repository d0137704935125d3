//! Chunked AES-GCM encryption of byte streams.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! header  := "KCS1" || chunk_size:u32 || base_nonce:[u8; 12]
//! frame   := len:u32 || ciphertext[len]          (chunk plaintext + 16-byte tag)
//! stream  := header || frame* || last_frame
//! ```
//!
//! Every frame but the last carries exactly `chunk_size` plaintext bytes. The last
//! carries fewer, possibly none, and is sealed with AAD `[1]` instead of `[0]`, so
//! dropping trailing frames is detected. Chunk `i` is sealed under the base nonce
//! with its last four bytes XOR-ed with `i`.

use crate::error::{Error, Result};
use crate::key::KeyMaterial;
use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes128Gcm, Aes256Gcm, Nonce,
};
use log::debug;
use securepool::SecureCell;
use std::io::{ErrorKind, Read, Write};
use zeroize::Zeroizing;

/// Stream magic
pub const MAGIC: &[u8; 4] = b"KCS1";

/// Header length: magic, chunk size, base nonce.
pub const HEADER_LEN: usize = MAGIC.len() + 4 + NONCE_LEN;

/// GCM nonce size
pub const NONCE_LEN: usize = 12;

/// GCM tag size
pub const TAG_LEN: usize = 16;

/// Frame length prefix size
const FRAME_PREFIX_LEN: usize = 4;

/// Default plaintext bytes per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Largest chunk size accepted when encrypting or decrypting.
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

const AAD_MIDDLE: [u8; 1] = [0];
const AAD_LAST: [u8; 1] = [1];

/// AES-GCM keyed by the key's length.
enum ChunkCipher {
    Aes128(Aes128Gcm),
    Aes256(Aes256Gcm),
}

impl ChunkCipher {
    fn new(key: &[u8]) -> Result<Self> {
        match key.len() {
            16 => Aes128Gcm::new_from_slice(key)
                .map(Self::Aes128)
                .map_err(|e| Error::Cipher(format!("Invalid AES-128 key: {}", e))),
            32 => Aes256Gcm::new_from_slice(key)
                .map(Self::Aes256)
                .map_err(|e| Error::Cipher(format!("Invalid AES-256 key: {}", e))),
            n => Err(Error::Cipher(format!(
                "No AES-GCM variant for a {n}-byte key (use 16 or 32)"
            ))),
        }
    }

    fn seal(&self, nonce: &[u8; NONCE_LEN], aad: &[u8], buf: &mut Vec<u8>) -> Result<()> {
        let nonce = Nonce::from_slice(nonce);
        let sealed = match self {
            Self::Aes128(c) => c.encrypt_in_place(nonce, aad, buf),
            Self::Aes256(c) => c.encrypt_in_place(nonce, aad, buf),
        };
        sealed.map_err(|e| Error::Cipher(format!("Encryption failed: {}", e)))
    }

    fn open(&self, nonce: &[u8; NONCE_LEN], aad: &[u8], buf: &mut Vec<u8>) -> Result<()> {
        let nonce = Nonce::from_slice(nonce);
        let opened = match self {
            Self::Aes128(c) => c.decrypt_in_place(nonce, aad, buf),
            Self::Aes256(c) => c.decrypt_in_place(nonce, aad, buf),
        };
        opened.map_err(|_| Error::Cipher("Chunk authentication failed".into()))
    }
}

fn chunk_nonce(base: &[u8; NONCE_LEN], index: u32) -> [u8; NONCE_LEN] {
    let mut nonce = *base;
    for (b, c) in nonce[NONCE_LEN - 4..].iter_mut().zip(index.to_be_bytes()) {
        *b ^= c;
    }
    nonce
}

fn check_chunk_size(chunk_size: usize) -> Result<u32> {
    if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
        return Err(Error::Cipher(format!(
            "Chunk size {chunk_size} outside 1..={MAX_CHUNK_SIZE}"
        )));
    }
    u32::try_from(chunk_size).map_err(|_| Error::Cipher(format!("Chunk size {chunk_size} too large")))
}

fn io_error(what: &str, e: std::io::Error) -> Error {
    Error::Cipher(format!("{what}: {e}"))
}

/// Reads until `buf` is full or the input ends. Returns the byte count.
fn read_up_to<R: Read + ?Sized>(input: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(io_error("Failed to read input", e)),
        }
    }
    Ok(filled)
}

fn read_exact_or<R: Read + ?Sized>(input: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    let n = read_up_to(input, buf)?;
    if n != buf.len() {
        return Err(Error::Cipher(format!("Truncated stream: incomplete {what}")));
    }
    Ok(())
}

/// The expanded key schedule for one stream.
///
/// For keys in locked memory the schedule is placed in the key's own
/// allocator, since the round keys reveal the key.
enum Schedule {
    Plain(ChunkCipher),
    Locked(SecureCell<ChunkCipher>),
}

impl Schedule {
    fn seal(&self, nonce: &[u8; NONCE_LEN], aad: &[u8], buf: &mut Vec<u8>) -> Result<()> {
        match self {
            Self::Plain(c) => c.seal(nonce, aad, buf),
            Self::Locked(cell) => cell.with(|c| c.seal(nonce, aad, buf))?,
        }
    }

    fn open(&self, nonce: &[u8; NONCE_LEN], aad: &[u8], buf: &mut Vec<u8>) -> Result<()> {
        match self {
            Self::Plain(c) => c.open(nonce, aad, buf),
            Self::Locked(cell) => cell.with(|c| c.open(nonce, aad, buf))?,
        }
    }
}

/// Builds the cipher from the key bytes without copying them out of the buffer.
fn cipher_for(key: &KeyMaterial) -> Result<Schedule> {
    key.with_bytes(|bytes| {
        let cipher = ChunkCipher::new(bytes)?;
        if key.is_secure() {
            Ok(Schedule::Locked(SecureCell::new(key.allocator(), cipher)?))
        } else {
            Ok(Schedule::Plain(cipher))
        }
    })?
}

/// Encrypts `input` to `output` under `key`.
///
/// `base_nonce` must never repeat for the same key. Returns the number of
/// plaintext bytes consumed. On error, whatever was written to `output` is
/// invalid.
pub fn encrypt_stream<R, W>(
    key: &KeyMaterial,
    chunk_size: usize,
    base_nonce: [u8; NONCE_LEN],
    input: &mut R,
    output: &mut W,
) -> Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let chunk_size_u32 = check_chunk_size(chunk_size)?;
    let cipher = cipher_for(key)?;

    let mut header = [0_u8; HEADER_LEN];
    header[..4].copy_from_slice(MAGIC);
    header[4..8].copy_from_slice(&chunk_size_u32.to_be_bytes());
    header[8..].copy_from_slice(&base_nonce);
    output
        .write_all(&header)
        .map_err(|e| io_error("Failed to write header", e))?;

    // Sized for the largest sealed chunk so the tag never forces a reallocation
    let mut buf = Zeroizing::new(Vec::with_capacity(chunk_size + TAG_LEN));
    let mut total: u64 = 0;
    let mut index: u32 = 0;

    loop {
        buf.clear();
        buf.resize(chunk_size, 0);
        let n = read_up_to(input, &mut buf[..])?;
        buf.truncate(n);
        let last = n < chunk_size;

        let aad = if last { &AAD_LAST } else { &AAD_MIDDLE };
        cipher.seal(&chunk_nonce(&base_nonce, index), aad, &mut buf)?;

        let frame_len = u32::try_from(buf.len())
            .map_err(|_| Error::Cipher("Frame exceeds u32 length".into()))?;
        output
            .write_all(&frame_len.to_be_bytes())
            .and_then(|()| output.write_all(&buf))
            .map_err(|e| io_error("Failed to write output", e))?;

        total += n as u64;
        if last {
            break;
        }
        index = index
            .checked_add(1)
            .ok_or_else(|| Error::Cipher("Stream exceeds the chunk counter".into()))?;
    }

    output
        .flush()
        .map_err(|e| io_error("Failed to flush output", e))?;
    debug!(
        "Encrypted {} bytes in {} chunks with {}",
        total,
        u64::from(index) + 1,
        key.id()
    );
    Ok(total)
}

/// Decrypts a stream produced by [`encrypt_stream`].
///
/// Returns the number of plaintext bytes written. Plaintext is written chunk
/// by chunk as each one authenticates, so on error the output must be
/// discarded.
pub fn decrypt_stream<R, W>(key: &KeyMaterial, input: &mut R, output: &mut W) -> Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let cipher = cipher_for(key)?;

    let mut header = [0_u8; HEADER_LEN];
    read_exact_or(input, &mut header, "header")?;
    if &header[..4] != MAGIC {
        return Err(Error::Cipher("Not a keycustody stream (bad magic)".into()));
    }
    let mut size_bytes = [0_u8; 4];
    size_bytes.copy_from_slice(&header[4..8]);
    let chunk_size = u32::from_be_bytes(size_bytes) as usize;
    check_chunk_size(chunk_size)?;
    let mut base_nonce = [0_u8; NONCE_LEN];
    base_nonce.copy_from_slice(&header[8..]);

    let max_frame = chunk_size + TAG_LEN;
    let mut buf = Zeroizing::new(Vec::with_capacity(max_frame));
    let mut total: u64 = 0;
    let mut index: u32 = 0;

    loop {
        let mut prefix = [0_u8; FRAME_PREFIX_LEN];
        match read_up_to(input, &mut prefix)? {
            0 => return Err(Error::Cipher("Truncated stream: missing final chunk".into())),
            FRAME_PREFIX_LEN => {}
            _ => return Err(Error::Cipher("Truncated stream: incomplete frame length".into())),
        }
        let frame_len = u32::from_be_bytes(prefix) as usize;
        if !(TAG_LEN..=max_frame).contains(&frame_len) {
            return Err(Error::Cipher(format!(
                "Frame length {frame_len} outside {TAG_LEN}..={max_frame}"
            )));
        }

        buf.clear();
        buf.resize(frame_len, 0);
        read_exact_or(input, &mut buf[..], "frame")?;

        let last = frame_len < max_frame;
        let aad = if last { &AAD_LAST } else { &AAD_MIDDLE };
        cipher.open(&chunk_nonce(&base_nonce, index), aad, &mut buf)?;

        output
            .write_all(&buf)
            .map_err(|e| io_error("Failed to write output", e))?;
        total += buf.len() as u64;

        if last {
            break;
        }
        index = index
            .checked_add(1)
            .ok_or_else(|| Error::Cipher("Stream exceeds the chunk counter".into()))?;
    }

    let mut trailing = [0_u8; 1];
    if read_up_to(input, &mut trailing)? != 0 {
        return Err(Error::Cipher("Trailing data after final chunk".into()));
    }

    output
        .flush()
        .map_err(|e| io_error("Failed to flush output", e))?;
    debug!("Decrypted {} bytes with {}", total, key.id());
    Ok(total)
}
