//! The encrypted-at-rest file format.
//!
//! Objects are sealed with a segmented streaming AEAD so they can be
//! decrypted from any offset without touching the whole ciphertext:
//!
//! ```text
//! [len: u8 = 40][salt: 32][nonce prefix: 7]   header
//! [segment 0: 4096 plaintext + 16 tag]
//! [segment 1: 4096 plaintext + 16 tag]
//! ...
//! [segment n-1: 1..=4096 plaintext + 16 tag]  sealed with the final flag
//! ```
//!
//! The per-file key is derived with HKDF-SHA256 from the master key, the
//! file's random salt, and the object's name as info: moving or renaming a
//! ciphertext to stand in for another object makes every tag fail. Each
//! segment's nonce is the file's random prefix, the big-endian segment index
//! and a final-segment flag; reordering, truncating at a segment boundary, or
//! extending the file is therefore as detectable as flipping a byte inside
//! one segment.
//!
//! Failures surface as [`EncryptionError`]; the security category is never
//! collapsed into a generic io error before the provider seam, and a
//! corrupted object never yields garbled plaintext.

use crate::prelude::*;
use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::{Aead, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use std::fs::{File, OpenOptions};

/// Master and derived key length in bytes.
pub const KEY_LEN: usize = 32;
/// Plaintext bytes per segment.
const SEGMENT: usize = 4096;
/// AEAD tag length.
const TAG: usize = 16;
/// Ciphertext bytes per full segment.
const SEALED_SEGMENT: usize = SEGMENT + TAG;
/// Salt length in the header.
const SALT: usize = 32;
/// Nonce prefix length; the remaining 5 nonce bytes are the segment counter
/// and the final flag.
const NONCE_PREFIX: usize = 7;
/// Total header length, also the value of the leading length byte.
const HEADER: usize = 1 + SALT + NONCE_PREFIX;

/// The security/setup error category.
#[derive(Debug)]
pub enum EncryptionError {
    /// Underlying file IO failed.
    Io(io::Error),
    /// The file does not start with a valid format header.
    MalformedHeader,
    /// The ciphertext is shorter than its own structure requires.
    Truncated,
    /// A segment failed authentication: wrong key, wrong object name, or a
    /// modified ciphertext.
    Corrupted,
}
impl From<io::Error> for EncryptionError {
    fn from(error: io::Error) -> Self {
        Self::Io(error)
    }
}
impl From<EncryptionError> for io::Error {
    fn from(error: EncryptionError) -> Self {
        match error {
            EncryptionError::Io(io) => io,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
impl Display for EncryptionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(error) => write!(f, "io failure: {error}"),
            Self::MalformedHeader => f.write_str("malformed encryption header"),
            Self::Truncated => f.write_str("ciphertext shorter than its structure requires"),
            Self::Corrupted => f.write_str("segment failed authentication"),
        }
    }
}
impl std::error::Error for EncryptionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(error) => Some(error),
            _ => None,
        }
    }
}

fn derive_cipher(master: &[u8; KEY_LEN], salt: &[u8], name: &[u8]) -> ChaCha20Poly1305 {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), master);
    let mut key = [0; KEY_LEN];
    // UNWRAP: 32 bytes is a valid HKDF-SHA256 output length.
    hkdf.expand(name, &mut key).unwrap();
    ChaCha20Poly1305::new(GenericArray::from_slice(&key))
}

fn segment_nonce(prefix: &[u8; NONCE_PREFIX], index: u32, last: bool) -> Nonce {
    let mut nonce = [0; 12];
    nonce[..NONCE_PREFIX].copy_from_slice(prefix);
    nonce[NONCE_PREFIX..11].copy_from_slice(&index.to_be_bytes());
    nonce[11] = u8::from(last);
    *Nonce::from_slice(&nonce)
}

/// An encrypted object on disk, addressed by path and keyed by the master
/// key plus the object's file name.
#[derive(Clone)]
pub struct EncryptedFile {
    path: PathBuf,
    master: [u8; KEY_LEN],
}
impl EncryptedFile {
    /// Binds `path` to `master` without touching the file system.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, master: [u8; KEY_LEN]) -> Self {
        Self {
            path: path.into(),
            master,
        }
    }

    /// The object name used as key-derivation info.
    fn name(&self) -> Vec<u8> {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned().into_bytes())
            .unwrap_or_default()
    }

    /// Creates (or truncates) the file and returns an encrypting sink.
    ///
    /// The returned writer *must* be [`finish`](EncryptingWriter::finish)ed;
    /// dropping it seals the final segment best-effort but swallows errors.
    ///
    /// # Errors
    ///
    /// File creation and header-write failures.
    pub fn create(&self) -> Result<EncryptingWriter<File>, EncryptionError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        EncryptingWriter::new(file, &self.master, &self.name())
    }

    /// Opens a decrypting seekable channel over the plaintext.
    ///
    /// # Errors
    ///
    /// Open/read failures and [`EncryptionError::MalformedHeader`] /
    /// [`EncryptionError::Truncated`] for files this format never produced.
    pub fn open_channel(&self) -> Result<DecryptingChannel<File>, EncryptionError> {
        DecryptingChannel::new(File::open(&self.path)?, &self.master, &self.name())
    }

    /// Opens a sequential decrypting reader from plaintext position 0.
    ///
    /// # Errors
    ///
    /// Same as [`Self::open_channel`].
    pub fn open_reader(&self) -> Result<impl Read, EncryptionError> {
        self.open_channel()
    }

    /// The modification time of the backing file.
    ///
    /// # Errors
    ///
    /// Metadata failures (missing file, permissions).
    pub fn modified(&self) -> io::Result<SystemTime> {
        self.path.metadata()?.modified()
    }
}
impl Debug for EncryptedFile {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedFile")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// An encrypting sink; plaintext in, sealed segments out.
pub struct EncryptingWriter<W: Write> {
    inner: W,
    cipher: ChaCha20Poly1305,
    prefix: [u8; NONCE_PREFIX],
    buffer: Vec<u8>,
    index: u32,
    finished: bool,
}
impl<W: Write> EncryptingWriter<W> {
    /// Writes the format header to `inner` and prepares the per-file key.
    ///
    /// # Errors
    ///
    /// Header-write failures.
    pub fn new(
        mut inner: W,
        master: &[u8; KEY_LEN],
        name: &[u8],
    ) -> Result<Self, EncryptionError> {
        use chacha20poly1305::aead::rand_core::RngCore;
        let mut salt = [0; SALT];
        let mut prefix = [0; NONCE_PREFIX];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut prefix);

        let mut header = [0; HEADER];
        header[0] = HEADER as u8;
        header[1..=SALT].copy_from_slice(&salt);
        header[1 + SALT..].copy_from_slice(&prefix);
        inner.write_all(&header)?;

        Ok(Self {
            inner,
            cipher: derive_cipher(master, &salt, name),
            prefix,
            buffer: Vec::with_capacity(SEGMENT),
            index: 0,
            finished: false,
        })
    }

    fn seal_buffer(&mut self, last: bool) -> Result<(), EncryptionError> {
        let nonce = segment_nonce(&self.prefix, self.index, last);
        let sealed = self
            .cipher
            .encrypt(&nonce, self.buffer.as_slice())
            .map_err(|_| EncryptionError::Corrupted)?;
        self.inner.write_all(&sealed)?;
        self.buffer.clear();
        self.index += 1;
        Ok(())
    }

    /// Seals the final segment (possibly empty) and flushes.
    ///
    /// # Errors
    ///
    /// Seal and write failures. Calling twice is a no-op.
    pub fn finish(&mut self) -> Result<(), EncryptionError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.seal_buffer(true)?;
        self.inner.flush()?;
        Ok(())
    }
}
impl<W: Write> Write for EncryptingWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.finished {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "writer already finished",
            ));
        }
        let mut remaining = data;
        while !remaining.is_empty() {
            // A full buffer is only sealed once more plaintext arrives, so
            // the very last segment (full or not) carries the final flag.
            if self.buffer.len() == SEGMENT {
                self.seal_buffer(false).map_err(io::Error::from)?;
            }
            let take = cmp::min(SEGMENT - self.buffer.len(), remaining.len());
            self.buffer.extend_from_slice(&remaining[..take]);
            remaining = &remaining[take..];
        }
        Ok(data.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        // Buffered plaintext cannot be pushed down without sealing a short
        // segment; only the inner sink is flushed here.
        self.inner.flush()
    }
}
impl<W: Write> Drop for EncryptingWriter<W> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(error) = self.finish() {
                error!("unfinished encrypting writer failed to seal: {error}");
            }
        }
    }
}
impl<W: Write> Debug for EncryptingWriter<W> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptingWriter")
            .field("index", &self.index)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

/// A decrypting seekable source over the plaintext of a sealed file.
///
/// Implements [`Read`] and [`Seek`] in *plaintext* positions;
/// `SeekFrom::End(0)` reports the logical size. At most one decrypted
/// segment is buffered.
pub struct DecryptingChannel<R: Read + Seek> {
    inner: R,
    cipher: ChaCha20Poly1305,
    prefix: [u8; NONCE_PREFIX],
    segments: u64,
    plaintext_len: u64,
    position: u64,
    segment: Vec<u8>,
    segment_index: Option<u64>,
}
impl<R: Read + Seek> DecryptingChannel<R> {
    /// Reads and validates the header and derives the file key.
    ///
    /// # Errors
    ///
    /// IO failures, [`EncryptionError::MalformedHeader`] and
    /// [`EncryptionError::Truncated`].
    pub fn new(
        mut inner: R,
        master: &[u8; KEY_LEN],
        name: &[u8],
    ) -> Result<Self, EncryptionError> {
        let mut header = [0; HEADER];
        inner
            .read_exact(&mut header)
            .map_err(|_| EncryptionError::MalformedHeader)?;
        if header[0] as usize != HEADER {
            return Err(EncryptionError::MalformedHeader);
        }
        let salt = &header[1..=SALT];
        let mut prefix = [0; NONCE_PREFIX];
        prefix.copy_from_slice(&header[1 + SALT..]);

        let total = inner.seek(io::SeekFrom::End(0))?;
        let body = total - HEADER as u64;
        // A finished file always ends in a final segment, tag included.
        if body < TAG as u64 {
            return Err(EncryptionError::Truncated);
        }
        let segments = body.div_ceil(SEALED_SEGMENT as u64);
        let last = body - (segments - 1) * SEALED_SEGMENT as u64;
        if last < TAG as u64 {
            return Err(EncryptionError::Truncated);
        }
        let plaintext_len = body - segments * TAG as u64;

        Ok(Self {
            inner,
            cipher: derive_cipher(master, salt, name),
            prefix,
            segments,
            plaintext_len,
            position: 0,
            segment: Vec::new(),
            segment_index: None,
        })
    }

    /// The logical (plaintext) length.
    #[must_use]
    pub fn plaintext_len(&self) -> u64 {
        self.plaintext_len
    }

    fn load_segment(&mut self, index: u64) -> Result<(), EncryptionError> {
        if self.segment_index == Some(index) {
            return Ok(());
        }
        let last = index == self.segments - 1;
        let sealed_len = if last {
            (self.plaintext_len - index * SEGMENT as u64) as usize + TAG
        } else {
            SEALED_SEGMENT
        };
        self.inner.seek(io::SeekFrom::Start(
            HEADER as u64 + index * SEALED_SEGMENT as u64,
        ))?;
        let mut sealed = vec![0; sealed_len];
        self.inner.read_exact(&mut sealed)?;

        // The counter fits: files long enough to overflow u32 segments are
        // beyond the format's addressable size and fail here instead.
        let counter = u32::try_from(index).map_err(|_| EncryptionError::Truncated)?;
        let nonce = segment_nonce(&self.prefix, counter, last);
        self.segment = self
            .cipher
            .decrypt(&nonce, sealed.as_slice())
            .map_err(|_| EncryptionError::Corrupted)?;
        self.segment_index = Some(index);
        Ok(())
    }
}
impl<R: Read + Seek> Read for DecryptingChannel<R> {
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.plaintext_len || buffer.is_empty() {
            return Ok(0);
        }
        let index = self.position / SEGMENT as u64;
        self.load_segment(index).map_err(io::Error::from)?;
        let offset = (self.position % SEGMENT as u64) as usize;
        let take = cmp::min(buffer.len(), self.segment.len().saturating_sub(offset));
        buffer[..take].copy_from_slice(&self.segment[offset..offset + take]);
        self.position += take as u64;
        Ok(take)
    }
}
impl<R: Read + Seek> Seek for DecryptingChannel<R> {
    fn seek(&mut self, target: io::SeekFrom) -> io::Result<u64> {
        let next = match target {
            io::SeekFrom::Start(position) => Some(position),
            io::SeekFrom::End(delta) => self.plaintext_len.checked_add_signed(delta),
            io::SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        let Some(next) = next else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek outside the plaintext",
            ));
        };
        // Seeking past the end is allowed; reads there return 0.
        self.position = next;
        Ok(next)
    }
}
impl<R: Read + Seek> Debug for DecryptingChannel<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptingChannel")
            .field("plaintext_len", &self.plaintext_len)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use io::Cursor;

    const MASTER: [u8; KEY_LEN] = [7; KEY_LEN];

    fn seal(payload: &[u8], name: &[u8]) -> Vec<u8> {
        let mut sealed = Vec::new();
        let mut writer = EncryptingWriter::new(&mut sealed, &MASTER, name).unwrap();
        writer.write_all(payload).unwrap();
        writer.finish().unwrap();
        drop(writer);
        sealed
    }
    fn open(sealed: Vec<u8>, name: &[u8]) -> Result<DecryptingChannel<Cursor<Vec<u8>>>, EncryptionError> {
        DecryptingChannel::new(Cursor::new(sealed), &MASTER, name)
    }

    #[test]
    fn round_trip() {
        for len in [1_usize, 100, SEGMENT - 1, SEGMENT, SEGMENT + 1, 3 * SEGMENT + 17] {
            let payload: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
            let mut channel = open(seal(&payload, b"clip.mp4"), b"clip.mp4").unwrap();
            assert_eq!(channel.plaintext_len(), len as u64);
            let mut recovered = Vec::new();
            channel.read_to_end(&mut recovered).unwrap();
            assert_eq!(recovered, payload, "length {len}");
        }
    }

    #[test]
    fn empty_payload_round_trips() {
        let mut channel = open(seal(b"", b"empty"), b"empty").unwrap();
        assert_eq!(channel.plaintext_len(), 0);
        let mut recovered = Vec::new();
        channel.read_to_end(&mut recovered).unwrap();
        assert!(recovered.is_empty());
    }

    #[test]
    fn seeks_address_plaintext() {
        let payload: Vec<u8> = (0..10_000_u32).map(|i| (i % 256) as u8).collect();
        let mut channel = open(seal(&payload, b"n"), b"n").unwrap();
        assert_eq!(channel.seek(io::SeekFrom::End(0)).unwrap(), 10_000);
        channel.seek(io::SeekFrom::Start(5_000)).unwrap();
        let mut tail = Vec::new();
        channel.read_to_end(&mut tail).unwrap();
        assert_eq!(tail, &payload[5_000..]);
        // Cross-segment backwards seek.
        channel.seek(io::SeekFrom::Start(100)).unwrap();
        let mut buffer = [0; 64];
        channel.read_exact(&mut buffer).unwrap();
        assert_eq!(&buffer[..], &payload[100..164]);
    }

    #[test]
    fn tampering_is_detected() {
        let mut sealed = seal(b"sensitive media bytes", b"n");
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        let mut channel = open(sealed, b"n").unwrap();
        let mut sink = Vec::new();
        let error = channel.read_to_end(&mut sink).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncation_is_detected() {
        let payload = vec![0xAB; 2 * SEGMENT];
        let sealed = seal(&payload, b"n");

        // Mid-segment cut: structurally invalid.
        assert!(matches!(
            open(sealed[..HEADER + TAG - 1].to_vec(), b"n"),
            Err(EncryptionError::Truncated)
        ));

        // Cut at a segment boundary: structurally plausible, cryptographically
        // rejected because the now-final segment lacks the final flag.
        let cut = sealed[..HEADER + SEALED_SEGMENT].to_vec();
        let mut channel = open(cut, b"n").unwrap();
        let mut sink = Vec::new();
        assert!(channel.read_to_end(&mut sink).is_err());
    }

    #[test]
    fn name_binds_the_ciphertext() {
        let sealed = seal(b"payload", b"a.mp4");
        let mut channel = open(sealed, b"b.mp4").unwrap();
        let mut sink = Vec::new();
        assert!(channel.read_to_end(&mut sink).is_err());
    }

    #[test]
    fn wrong_master_key_is_rejected() {
        let sealed = seal(b"payload", b"n");
        let mut channel =
            DecryptingChannel::new(Cursor::new(sealed), &[8; KEY_LEN], b"n").unwrap();
        let mut sink = Vec::new();
        assert!(channel.read_to_end(&mut sink).is_err());
    }

    #[test]
    fn header_is_validated() {
        assert!(matches!(
            open(vec![0; 10], b"n"),
            Err(EncryptionError::MalformedHeader)
        ));
        let mut bad = seal(b"x", b"n");
        bad[0] = 39;
        assert!(matches!(
            open(bad, b"n"),
            Err(EncryptionError::MalformedHeader)
        ));
    }
}
