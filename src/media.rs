//! Position-based reads over a sequential decrypting source.
//!
//! Playback components ask for bytes at arbitrary offsets; the decrypting
//! source underneath only supports seek-then-read. [`MediaChannel`] bridges
//! the two: every operation takes one internal lock, so a seek and the read
//! that depends on it are atomic as a unit, and the probe used to learn the
//! logical size never disturbs a cursor another call relies on.

use crate::prelude::*;

/// A decrypting seekable source a [`MediaChannel`] can serve from.
///
/// Seeks address *plaintext* positions; `SeekFrom::End(0)` reports the
/// logical (plaintext) size.
pub trait MediaSource: Read + Seek + Send {}
impl<T: Read + Seek + Send> MediaSource for T {}

/// Resolves a request's file identifier to an open channel.
///
/// Supplied by the surrounding application; called from any worker thread,
/// repeatedly, once per request.
pub trait MediaProvider: Send + Sync {
    /// Opens the object identified by `identifier`.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown identifiers; cipher setup failures surface as
    /// `InvalidData`.
    fn open(&self, identifier: &str) -> io::Result<MediaChannel>;
}

/// An encrypted object exposed through position-based reads.
///
/// Owned by the single worker task serving a request; the internal lock
/// protects against accidental misuse within that task, not cross-task
/// sharing. Closed on drop.
pub struct MediaChannel {
    source: Mutex<Box<dyn MediaSource>>,
}

impl MediaChannel {
    /// Wraps a decrypting seekable source.
    #[must_use]
    pub fn new(source: impl MediaSource + 'static) -> Self {
        Self {
            source: Mutex::new(Box::new(source)),
        }
    }

    /// Repositions to `position` and performs one read into `buffer`.
    ///
    /// Returns the read count verbatim; `Ok(0)` means end of stream.
    ///
    /// # Errors
    ///
    /// Forwards seek and read failures from the decrypting source.
    pub fn read_at(&self, position: u64, buffer: &mut [u8]) -> io::Result<usize> {
        let mut source = self.lock();
        source.seek(io::SeekFrom::Start(position))?;
        source.read(buffer)
    }

    /// The logical size of the object.
    ///
    /// Determined by probing: a one-byte read at the very start that hits end
    /// of stream means the object is empty; otherwise the source reports its
    /// size. The cursor is restored afterwards, so the externally visible
    /// position is unaffected and the call is idempotent.
    ///
    /// # Errors
    ///
    /// Forwards seek and read failures from the decrypting source.
    pub fn size(&self) -> io::Result<u64> {
        let mut source = self.lock();
        let cursor = source.stream_position()?;
        let result = (|| {
            source.seek(io::SeekFrom::Start(0))?;
            let mut probe = [0];
            if source.read(&mut probe)? == 0 {
                return Ok(0);
            }
            source.seek(io::SeekFrom::End(0))
        })();
        // Restore the pre-probe cursor on success and failure alike.
        let restored = source.seek(io::SeekFrom::Start(cursor));
        let size = result?;
        restored?;
        Ok(size)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Box<dyn MediaSource>> {
        // A poisoned lock means a panic mid-read; the cursor state is still
        // coherent since every operation repositions first.
        match self.source.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Debug for MediaChannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaChannel").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use io::Cursor;

    #[test]
    fn read_at_is_position_based() {
        let channel = MediaChannel::new(Cursor::new(b"0123456789".to_vec()));
        let mut buffer = [0; 4];
        assert_eq!(channel.read_at(3, &mut buffer).unwrap(), 4);
        assert_eq!(&buffer, b"3456");
        // Backwards is fine; the cursor is explicit.
        assert_eq!(channel.read_at(0, &mut buffer).unwrap(), 4);
        assert_eq!(&buffer, b"0123");
        // Past the end reads nothing.
        assert_eq!(channel.read_at(10, &mut buffer).unwrap(), 0);
    }

    #[test]
    fn size_probe_is_invisible() {
        let channel = MediaChannel::new(Cursor::new(b"0123456789".to_vec()));
        let mut buffer = [0; 2];
        assert_eq!(channel.read_at(4, &mut buffer).unwrap(), 2);
        assert_eq!(channel.size().unwrap(), 10);
        assert_eq!(channel.size().unwrap(), 10);
        // A sequential read after the probe continues where read_at left the
        // cursor.
        let mut source = channel.lock();
        let mut next = [0; 2];
        source.read_exact(&mut next).unwrap();
        assert_eq!(&next, b"67");
    }

    #[test]
    fn empty_object_sizes_to_zero() {
        let channel = MediaChannel::new(Cursor::new(Vec::new()));
        assert_eq!(channel.size().unwrap(), 0);
        let mut buffer = [0; 4];
        assert_eq!(channel.read_at(0, &mut buffer).unwrap(), 0);
    }
}
