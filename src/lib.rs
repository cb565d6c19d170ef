//! # strombox
//!
//! Store media encrypted at rest, and still hand it to playback components
//! that only understand random access or HTTP byte ranges.
//!
//! Two coupled problems are solved here:
//!
//! 1. **Arbitrary-offset reads over a sequential cipher.** Objects are
//!    sealed with a segmented streaming AEAD ([`encryption`]), and
//!    [`media::MediaChannel`] adapts the decrypting source to atomic
//!    position-based reads with a probed logical size.
//! 2. **Loopback is not a perimeter.** The stream server ([`server`])
//!    listens on `127.0.0.1`, which any local process can reach, so every
//!    accepted connection is first attributed to its owning process through
//!    the kernel's connection tables ([`owner`]). Connections not owned by
//!    this process are closed without a response.
//!
//! The easiest entry point is the [`Strombox`] facade:
//!
//! ```no_run
//! use std::io::Write;
//! use strombox::{MasterKey, Strombox};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let vault = Strombox::install(MasterKey::random());
//!
//! // Seal a clip.
//! let mut writer = vault.open_writer("/data/media/clip.mp4")?;
//! writer.write_all(b"...mp4 bytes...")?;
//! writer.finish()?;
//!
//! // Hand the player a URL only this process can actually use.
//! let url = vault.stream_url("/data/media/clip.mp4")?;
//! # let _ = url;
//! # Ok(())
//! # }
//! ```
//!
//! The wire protocol is a deliberate HTTP/1.x subset: one request per
//! connection, `GET`-shaped, a single `file` query parameter, `Range`
//! honored for its lower bound. This is not a general web server.

#![warn(missing_docs, missing_debug_implementations)]

pub mod addr;
pub mod encryption;
pub mod media;
pub mod owner;
pub mod parse;
pub mod prelude;
pub mod response;
pub mod server;
pub mod threading;

use crate::encryption::{EncryptedFile, EncryptingWriter, EncryptionError, KEY_LEN};
use crate::prelude::*;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use std::fs::File;
use std::sync::OnceLock;

pub use media::{MediaChannel, MediaProvider, MediaSource};
pub use owner::Authenticator;
pub use server::StreamServer;

/// Characters escaped when a path is embedded as a query value.
const QUERY_VALUE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'%')
    .add(b'&')
    .add(b'+')
    .add(b'=')
    .add(b'?');

/// The root key media objects are sealed under.
///
/// Per-object keys are derived from it; it never leaves the process. How it
/// is provisioned (OS keystore, KDF from credentials, …) is the embedder's
/// concern.
#[derive(Clone)]
pub struct MasterKey([u8; KEY_LEN]);
impl MasterKey {
    /// Wraps existing key material.
    #[must_use]
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
    /// A fresh random key from the OS generator.
    #[must_use]
    pub fn random() -> Self {
        use chacha20poly1305::aead::rand_core::RngCore;
        let mut bytes = [0; KEY_LEN];
        chacha20poly1305::aead::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }
}
impl From<[u8; KEY_LEN]> for MasterKey {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self::new(bytes)
    }
}
impl Debug for MasterKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey([redacted])")
    }
}

/// The facade: sealed storage, decrypting channels, and loopback stream
/// URLs, all under one master key.
///
/// The embedded [`StreamServer`] is created and started lazily on the first
/// [`Self::stream_url`] call. One instance per object namespace; most
/// applications use the process-wide one from [`Self::install`].
#[derive(Debug)]
pub struct Strombox {
    master: [u8; KEY_LEN],
    server: OnceLock<StreamServer>,
}

static GLOBAL: OnceLock<Strombox> = OnceLock::new();

impl Strombox {
    /// Creates a standalone instance.
    #[must_use]
    pub fn new(key: MasterKey) -> Self {
        Self {
            master: key.0,
            server: OnceLock::new(),
        }
    }

    /// Installs (or returns) the process-wide instance.
    ///
    /// The first call decides the key; later calls get the existing instance
    /// and their key argument is ignored (with a warning when it differs).
    pub fn install(key: MasterKey) -> &'static Self {
        let installed = GLOBAL.get_or_init(|| Self::new(key.clone()));
        if installed.master != key.0 {
            warn!("Strombox::install called again with a different key; keeping the first");
        }
        installed
    }

    /// The process-wide instance, if [`Self::install`] has run.
    #[must_use]
    pub fn global() -> Option<&'static Self> {
        GLOBAL.get()
    }

    fn file(&self, path: impl Into<PathBuf>) -> EncryptedFile {
        EncryptedFile::new(path, self.master)
    }

    /// Opens an encrypting sink that seals plaintext into `path`.
    ///
    /// # Errors
    ///
    /// [`EncryptionError`] on create/header failures.
    pub fn open_writer(
        &self,
        path: impl Into<PathBuf>,
    ) -> Result<EncryptingWriter<File>, EncryptionError> {
        self.file(path).create()
    }

    /// Opens a sequential decrypting reader over `path`.
    ///
    /// # Errors
    ///
    /// [`EncryptionError`] on open/format failures.
    pub fn open_reader(&self, path: impl Into<PathBuf>) -> Result<impl Read, EncryptionError> {
        self.file(path).open_reader()
    }

    /// Opens a random-access decrypting channel over `path`.
    ///
    /// # Errors
    ///
    /// [`EncryptionError`] on open/format failures.
    pub fn open_channel(&self, path: impl Into<PathBuf>) -> Result<MediaChannel, EncryptionError> {
        Ok(MediaChannel::new(self.file(path).open_channel()?))
    }

    /// Publishes `path` as a loopback URL this process can stream from.
    ///
    /// Lazily starts the stream server on first use. The path must exist: it
    /// is canonicalized so the URL and the provider agree on the identifier.
    ///
    /// # Errors
    ///
    /// Canonicalization and server-bind failures.
    pub fn stream_url(&self, path: impl AsRef<Path>) -> io::Result<Uri> {
        let canonical = std::fs::canonicalize(path)?;
        let server = self.server()?;
        let encoded = utf8_percent_encode(&canonical.to_string_lossy(), QUERY_VALUE).to_string();
        let url = format!("http://localhost:{}/?file={}", server.port(), encoded);
        url.parse::<Uri>()
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidInput, error))
    }

    /// The embedded server, created and started on first use.
    ///
    /// # Errors
    ///
    /// Bind failures.
    pub fn server(&self) -> io::Result<&StreamServer> {
        if let Some(server) = self.server.get() {
            server.start();
            return Ok(server);
        }
        let created = StreamServer::new(Arc::new(VaultProvider {
            master: self.master,
        }))?;
        // On a lost race the duplicate is dropped, which stops it cleanly.
        let server = self.server.get_or_init(move || created);
        server.start();
        Ok(server)
    }
}

impl MediaProvider for Strombox {
    fn open(&self, identifier: &str) -> io::Result<MediaChannel> {
        self.open_channel(identifier).map_err(io::Error::from)
    }
}

/// The provider handed to the embedded server; holds only the key material
/// so the server does not borrow the facade.
struct VaultProvider {
    master: [u8; KEY_LEN],
}
impl MediaProvider for VaultProvider {
    fn open(&self, identifier: &str) -> io::Result<MediaChannel> {
        let channel = EncryptedFile::new(identifier, self.master)
            .open_channel()
            .map_err(io::Error::from)?;
        Ok(MediaChannel::new(channel))
    }
}
