// pbak_common is the main pbak library implementing the backup core logic.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use crate::config;
use crate::LocalError;

use std::collections::VecDeque;
use std::fs;
use std::io::{self, BufRead, Read, Write};
use std::path::Path;

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::stream::{DecryptorBE32, EncryptorBE32};
use aes_gcm::{Aes256Gcm, Key};
use argon2::Argon2;
use rand::rngs::OsRng;
use rand::RngCore;

/// The size of data chunks to encrypt or decrypt at a time in bytes (4096 KiB).
pub const CHUNKSIZE: usize = 4096 * 1024;

/// The signature every envelope starts with: the format magic
/// followed by the format version. Remote verification inspects
/// exactly these bytes.
pub const ENVELOPE_MAGIC: [u8; 5] = *b"PBAK\x01";

/// The length of the envelope header: signature, key derivation salt
/// and stream nonce.
const HEADER_LEN: usize = ENVELOPE_MAGIC.len() + SALT_LEN + NONCE_LEN;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 7;

/// Reads the encryption passphrase from the configured file,
/// refusing files that other users may access.
/// A single trailing newline is not part of the passphrase.
pub fn read_passphrase(path: &Path) -> Result<Vec<u8>, LocalError> {
    config::check_secret_perms(path)?;

    let mut passphrase = fs::read(path)?;
    if passphrase.last() == Some(&b'\n') {
        passphrase.pop();
        if passphrase.last() == Some(&b'\r') {
            passphrase.pop();
        }
    }

    Ok(passphrase)
}

/// Performs an Argon2id hash computation.
fn hash_argon2id<P: AsRef<[u8]>>(
    okm: &mut [u8],
    salt: &[u8],
    passphrase: P,
) -> Result<(), LocalError> {
    Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::default(),
        argon2::Params::new(65536, 3, 4, Some(32))?,
    )
    .hash_password_into(passphrase.as_ref(), salt, okm)?;

    Ok(())
}

/// A `SealingStream` is a wrapper around a producer byte stream
/// that maps the stream to its encrypted envelope form:
/// the envelope signature and key derivation parameters
/// followed by authenticated ciphertext chunks.
pub struct SealingStream<B: BufRead> {
    inner: B,
    // The purpose of the `Option` is to allow `cipher` to be moved
    // when calling `encrypt_last` on it with just a mutable reference
    // to the `SealingStream` (so that `BufRead::fill_buf`
    // can be called multiple times).
    cipher: Option<EncryptorBE32<Aes256Gcm>>,
    buf: Vec<u8>,
}

impl<B: BufRead> SealingStream<B> {
    /// Returns a new `SealingStream` wrapping the provided producer,
    /// deriving a fresh key from the passphrase and a random salt.
    pub fn new<P: AsRef<[u8]>>(inner: B, passphrase: P) -> Result<Self, LocalError> {
        let mut salt = [0; SALT_LEN];
        let mut nonce = [0; NONCE_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce);

        let mut key_array = [0; 32];
        hash_argon2id(&mut key_array, &salt, passphrase)?;
        let key = Key::<Aes256Gcm>::from_slice(&key_array);
        let cipher = EncryptorBE32::new(key, GenericArray::from_slice(&nonce));

        // Accomodate authentication tag (16 bytes).
        let mut buf = Vec::with_capacity(HEADER_LEN + 16 + CHUNKSIZE);
        buf.extend(ENVELOPE_MAGIC);
        buf.extend(salt);
        buf.extend(nonce);

        Ok(Self {
            inner,
            cipher: Some(cipher),
            buf,
        })
    }
}

impl<B: BufRead> Read for SealingStream<B> {
    fn read(&mut self, mut buf: &mut [u8]) -> io::Result<usize> {
        let tmp = self.fill_buf()?;

        let n = buf.write(tmp)?;
        self.consume(n);

        Ok(n)
    }
}

impl<B: BufRead> BufRead for SealingStream<B> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        // Stable version of [`BufRead::has_data_left`] (tracking issue: #86423).
        if self.buf.is_empty() && self.inner.fill_buf().map(|b| !b.is_empty())? {
            let mut chunk = Vec::with_capacity(CHUNKSIZE);
            self.inner
                .by_ref()
                .take(CHUNKSIZE as u64)
                .read_to_end(&mut chunk)?;

            // Stable version of [`BufRead::has_data_left`] (tracking issue: #86423).
            if self.inner.fill_buf().map(|b| !b.is_empty())? {
                self.buf.extend(
                    self.cipher
                        .as_mut()
                        .unwrap()
                        .encrypt_next(chunk.as_slice())
                        .map_err(io::Error::other)?,
                );
            } else {
                self.buf.extend(
                    self.cipher
                        .take()
                        .unwrap()
                        .encrypt_last(chunk.as_slice())
                        .map_err(io::Error::other)?,
                );
            }
        }

        Ok(&self.buf)
    }

    fn consume(&mut self, amt: usize) {
        // It's okay to panic if amt > self.buf.len()
        // since [`BufRead::consume`] requires the caller to pass in
        // amt <= self.buf.len() and silently clamping amt is probably bad
        // behavior.
        self.buf.drain(..amt);
    }
}

/// An `OpeningStream` is a wrapper around a consumer byte stream
/// that maps an encrypted envelope back to the producer bytes,
/// dropping the envelope header.
///
/// Dropping an `OpeningStream` flushes the last chunk to the underlying
/// [`Write`] ignoring any errors. You should handle errors where applicable
/// by calling [`OpeningStream::close`] manually before dropping the stream.
pub struct OpeningStream<W: Write, P: AsRef<[u8]>> {
    inner: W,
    passphrase: P,
    closed: bool,
    // The purpose of the `Option` is to allow `cipher` to be moved
    // when calling `decrypt_last` on it with just a mutable reference
    // to the `OpeningStream` (so that `Write::write`
    // can be called multiple times).
    cipher: Option<DecryptorBE32<Aes256Gcm>>,
    buf: VecDeque<u8>,
}

impl<W: Write, P: AsRef<[u8]>> OpeningStream<W, P> {
    /// Returns a new `OpeningStream` decrypting into the provided
    /// [`Write`] using the provided passphrase.
    pub fn new(inner: W, passphrase: P) -> Self {
        Self {
            inner,
            passphrase,
            closed: false,
            cipher: None,
            buf: VecDeque::with_capacity(HEADER_LEN + 16 + CHUNKSIZE),
        }
    }

    /// Reports whether the `OpeningStream` is closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Closes the `OpeningStream`, writing all pending data to the
    /// underlying [`Write`]. Fails with a 'broken pipe' error
    /// if the `OpeningStream` is already closed.
    ///
    /// Further writes will return 'broken pipe' errors.
    ///
    /// This method is automatically called without error handling
    /// when the `OpeningStream` is dropped.
    pub fn close(&mut self) -> Result<(), LocalError> {
        if self.is_closed() {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe).into());
        }

        self.closed = true;

        self.buf.make_contiguous();

        // Read the authentication tag (16 bytes) too, otherwise decryption fails.
        let mut chunk = vec![0; 16 + CHUNKSIZE];
        let n = self.buf.read(&mut chunk)?;
        chunk.truncate(n);

        if let Some(cipher) = self.cipher.take() {
            let plain = cipher.decrypt_last(chunk.as_slice())?;
            self.inner.write_all(&plain)?;
        } else if n > 0 {
            // The envelope ended before its header was complete.
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }

        self.inner.flush()?;
        Ok(())
    }

    fn init_cipher(&mut self) -> io::Result<()> {
        let mut header = [0; HEADER_LEN];
        self.buf.read_exact(&mut header)?;

        if header[..ENVELOPE_MAGIC.len()] != ENVELOPE_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "missing envelope signature",
            ));
        }

        let salt = &header[ENVELOPE_MAGIC.len()..ENVELOPE_MAGIC.len() + SALT_LEN];
        let nonce = &header[ENVELOPE_MAGIC.len() + SALT_LEN..];

        let mut key_array = [0; 32];
        hash_argon2id(&mut key_array, salt, &self.passphrase).map_err(io::Error::other)?;
        let key = Key::<Aes256Gcm>::from_slice(&key_array);

        self.cipher = Some(DecryptorBE32::new(key, GenericArray::from_slice(nonce)));
        Ok(())
    }
}

impl<W: Write, P: AsRef<[u8]>> Write for OpeningStream<W, P> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }

        for byte in buf {
            if let Some(cipher) = &mut self.cipher {
                // Read the authentication tag (16 bytes) too, otherwise decryption fails.
                if self.buf.len() >= 16 + CHUNKSIZE {
                    let mut chunk = vec![0; 16 + CHUNKSIZE];
                    self.buf.read_exact(&mut chunk)?;

                    let plain = cipher
                        .decrypt_next(chunk.as_slice())
                        .map_err(io::Error::other)?;
                    self.inner.write_all(&plain)?;
                }
            } else if self.buf.len() >= HEADER_LEN {
                self.init_cipher()?;
            }

            self.buf.push_back(*byte);
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<W: Write, P: AsRef<[u8]>> Drop for OpeningStream<W, P> {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.close().ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::BufReader;
    use std::os::unix::fs::PermissionsExt;

    use flate2::bufread::GzEncoder;
    use flate2::write::GzDecoder;
    use flate2::Compression;

    const PASSPHRASE: &[u8] = b"correct horse battery staple";

    fn producer_bytes() -> Vec<u8> {
        // Large enough to be compressible, small enough for fast tests.
        (0..64 * 1024u32).flat_map(|i| i.to_le_bytes()).collect()
    }

    fn seal(data: &[u8], passphrase: &[u8]) -> Vec<u8> {
        let mut stream = SealingStream::new(data, passphrase).unwrap();

        let mut sealed = Vec::new();
        stream.read_to_end(&mut sealed).unwrap();
        sealed
    }

    fn open(sealed: &[u8], passphrase: &[u8]) -> Result<Vec<u8>, LocalError> {
        let mut plain = Vec::new();

        let mut stream = OpeningStream::new(&mut plain, passphrase);
        stream.write_all(sealed)?;
        stream.close()?;
        drop(stream);

        Ok(plain)
    }

    #[test]
    fn envelope_round_trip() {
        let data = producer_bytes();

        let sealed = seal(&data, PASSPHRASE);
        assert!(sealed.starts_with(&ENVELOPE_MAGIC));
        assert_ne!(sealed.len(), data.len());

        assert_eq!(open(&sealed, PASSPHRASE).unwrap(), data);
    }

    #[test]
    fn composes_with_gzip_like_the_pipelines() {
        let data = producer_bytes();

        let gz = BufReader::new(GzEncoder::new(&data[..], Compression::default()));
        let mut sealing = SealingStream::new(gz, PASSPHRASE).unwrap();
        let mut sealed = Vec::new();
        sealing.read_to_end(&mut sealed).unwrap();

        let mut plain = Vec::new();
        let mut opening = OpeningStream::new(GzDecoder::new(&mut plain), PASSPHRASE);
        opening.write_all(&sealed).unwrap();
        opening.close().unwrap();
        drop(opening);

        assert_eq!(plain, data);
    }

    #[test]
    fn multi_chunk_round_trip() {
        // Crosses the chunk boundary so both the intermediate and the
        // final chunk paths run.
        let data = vec![0x5a; CHUNKSIZE + CHUNKSIZE / 4];

        let sealed = seal(&data, PASSPHRASE);
        assert_eq!(open(&sealed, PASSPHRASE).unwrap(), data);
    }

    #[test]
    fn tampering_fails_authentication() {
        let mut sealed = seal(&producer_bytes(), PASSPHRASE);

        let middle = sealed.len() / 2;
        sealed[middle] ^= 0x01;

        assert!(open(&sealed, PASSPHRASE).is_err());
    }

    #[test]
    fn wrong_passphrase_fails() {
        let sealed = seal(&producer_bytes(), PASSPHRASE);

        assert!(open(&sealed, b"not the passphrase").is_err());
    }

    #[test]
    fn rejects_missing_signature() {
        let mut sealed = seal(&producer_bytes(), PASSPHRASE);
        sealed[0] = b'X';

        assert!(open(&sealed, PASSPHRASE).is_err());
    }

    #[test]
    fn passphrase_file_must_be_private() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup-encryption.key");
        fs::write(&path, "secret\n").unwrap();

        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        assert!(matches!(
            read_passphrase(&path),
            Err(LocalError::InsecurePerms(_))
        ));

        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();
        assert_eq!(read_passphrase(&path).unwrap(), b"secret");
    }
}
