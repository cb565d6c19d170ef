//! The loopback HTTP-range server.
//!
//! One instance owns a loopback-only listening socket on an OS-assigned
//! port, a dedicated dispatcher thread blocking in `accept`, and the bounded
//! worker pool. Every accepted connection is authenticated against the
//! kernel's view of who owns the peer socket before a single byte of the
//! request is read; anything that is not loopback-local and owned by this
//! process is closed without a response, indistinguishable from a refusal.
//!
//! The dispatcher and every worker run at background scheduling priority:
//! media serving must not compete with the application's foreground work.

use crate::owner::Proto;
use crate::prelude::threading_types::*;
use crate::prelude::*;
use crate::threading::WorkerPool;

/// Reusable buffer size for the body write loop.
const STREAM_BUFFER: usize = 16 * 1024;

/// A loopback HTTP-range server bound to an ephemeral port.
///
/// `start` is idempotent while running; `stop` interrupts the dispatcher and
/// joins it. A stopped server is not restartable; create a new instance
/// (and get a new port) instead.
pub struct StreamServer {
    port: u16,
    state: Mutex<State>,
    stopped: AtomicBool,
    shared: Arc<Shared>,
}

/// Lifecycle state guarded by one lock: the owned listening socket (dropped
/// on stop to release the port) and the dispatcher handle.
struct State {
    listener: Option<TcpListener>,
    dispatcher: Option<JoinHandle<()>>,
}

struct Shared {
    provider: Arc<dyn MediaProvider>,
    authenticator: Authenticator,
    pool: WorkerPool,
    running: AtomicBool,
}

impl StreamServer {
    /// Binds the listening socket and prepares the worker pool.
    ///
    /// The port is available through [`Self::port`] immediately; no thread
    /// runs until [`Self::start`].
    ///
    /// # Errors
    ///
    /// Bind failures.
    pub fn new(provider: Arc<dyn MediaProvider>) -> io::Result<Self> {
        Self::with_authenticator(provider, Authenticator::new())
    }

    /// [`Self::new`] with a caller-supplied [`Authenticator`].
    ///
    /// The seam tests use to drive the rejection path with real connections.
    ///
    /// # Errors
    ///
    /// Bind failures.
    pub fn with_authenticator(
        provider: Arc<dyn MediaProvider>,
        authenticator: Authenticator,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
        let port = listener.local_addr()?.port();
        Ok(Self {
            port,
            state: Mutex::new(State {
                listener: Some(listener),
                dispatcher: None,
            }),
            stopped: AtomicBool::new(false),
            shared: Arc::new(Shared {
                provider,
                authenticator,
                pool: WorkerPool::new("strombox", threading::pool_size()),
                running: AtomicBool::new(false),
            }),
        })
    }

    /// The bound port, for constructing callback URLs.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the dispatcher is running.
    #[must_use]
    pub fn running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Spawns the dispatcher thread if none is running.
    ///
    /// A no-op while running, and (with a warning) after [`Self::stop`].
    pub fn start(&self) {
        let mut state = lock(&self.state);
        if self.stopped.load(Ordering::Acquire) {
            warn!("start() after stop(); create a new server for a new port");
            return;
        }
        if state.dispatcher.is_some() {
            return;
        }
        let listener = match state.listener.as_ref().map(TcpListener::try_clone) {
            Some(Ok(listener)) => listener,
            Some(Err(error)) => {
                error!("cannot clone listening socket: {error}");
                return;
            }
            None => return,
        };
        self.shared.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("strombox_dispatcher".into())
            .spawn(move || accept_loop(&listener, &shared));
        match handle {
            Ok(handle) => {
                info!("media stream server listening on 127.0.0.1:{}", self.port);
                state.dispatcher = Some(handle);
            }
            Err(error) => {
                self.shared.running.store(false, Ordering::Release);
                error!("cannot spawn dispatcher: {error}");
            }
        }
    }

    /// Signals the dispatcher to exit, wakes its blocking `accept`, and
    /// joins it.
    ///
    /// In-flight workers are not forcibly cancelled; they observe the
    /// cleared running flag or socket errors and unwind through their own
    /// cleanup.
    pub fn stop(&self) {
        let mut state = lock(&self.state);
        self.stopped.store(true, Ordering::Release);
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = state.dispatcher.take() {
            // The dispatcher blocks in accept; a throwaway connection wakes
            // it so it can observe the flag.
            let _ = TcpStream::connect((Ipv4Addr::LOCALHOST, self.port));
            if handle.join().is_err() {
                error!("dispatcher panicked");
            }
            info!("media stream server on port {} stopped", self.port);
        }
        // Dropping the listener releases the port; the dispatcher's clone
        // died with the join above.
        state.listener = None;
    }
}
impl Debug for StreamServer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamServer")
            .field("port", &self.port)
            .field("running", &self.running())
            .finish_non_exhaustive()
    }
}
impl Drop for StreamServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn accept_loop(listener: &TcpListener, shared: &Arc<Shared>) {
    lower_priority();
    while shared.running.load(Ordering::Acquire) {
        let (socket, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::Interrupted
                        | io::ErrorKind::WouldBlock
                        | io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(error) => {
                error!("listening socket failed: {error}");
                break;
            }
        };
        if !shared.running.load(Ordering::Acquire) {
            // stop() woke us; the throwaway connection dies here.
            break;
        }
        debug!("client connected from {peer}");
        let _ = socket.set_nodelay(true);
        let _ = socket2::SockRef::from(&socket).set_keepalive(true);

        let task_shared = Arc::clone(shared);
        if let Err(rejected) = shared.pool.execute(move || serve(&socket, &task_shared)) {
            // Dropping the rejected task drops the socket it owns, closing
            // the connection instead of leaking the descriptor.
            info!("worker pool saturated; refusing connection from {peer}");
            drop(rejected);
        }
    }
    debug!("dispatcher exiting");
}

/// One connection, start to finish. Runs on a pool worker.
fn serve(socket: &TcpStream, shared: &Shared) {
    lower_priority();
    if let Err(error) = handle_connection(socket, shared) {
        debug!("closing connection: {error}");
    }
    // Unconditional: every path through a connection ends here.
    let _ = socket.shutdown(Shutdown::Both);
}

fn handle_connection(socket: &TcpStream, shared: &Shared) -> io::Result<()> {
    let local = socket.local_addr()?;
    let peer = socket.peer_addr()?;

    if !owner::is_loopback_addr(peer.ip()) || !owner::is_loopback_addr(local.ip()) {
        info!("rejecting non-loopback peer {peer}");
        return Ok(());
    }
    // The tuple is queried from the client socket's perspective: its local
    // endpoint is our peer.
    let owner = shared.authenticator.owner_of(Proto::Tcp, peer, local);
    if !shared.authenticator.authorized(owner) {
        info!(
            "rejecting peer {peer}: owned by {owner}, expected {}",
            shared.authenticator.expected_owner()
        );
        return Ok(());
    }

    let block = parse::read_header_block(&mut (&*socket))?;
    let request = parse::request(&block);
    let Some(file) = parse::query_param(request.uri(), "file").filter(|file| !file.is_empty())
    else {
        debug!("request without a file identifier; closing");
        return Ok(());
    };
    let requested_skip = response::range_offset(request.headers());

    let channel = shared.provider.open(&file)?;
    let size = channel.size()?;
    // An offset at or past the end degenerates to an empty tail rather than
    // an arithmetic underflow in the head.
    let mut cursor = cmp::min(requested_skip.unwrap_or(0), size);
    let modified = std::fs::metadata(&file)
        .and_then(|metadata| metadata.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let head = response::stream_head(size, cursor, modified);
    let mut writer = socket;
    writer.write_all(&head)?;

    let mut buffer = [0; STREAM_BUFFER];
    while shared.running.load(Ordering::Acquire) {
        let read = channel.read_at(cursor, &mut buffer)?;
        if read == 0 {
            break;
        }
        writer.write_all(&buffer[..read])?;
        cursor += read as u64;
    }
    Ok(())
}

#[cfg(unix)]
fn lower_priority() {
    // Background-class scheduling for the calling thread; absolute so the
    // per-connection call is idempotent. Best-effort.
    unsafe {
        libc::setpriority(libc::PRIO_PROCESS, 0, 10);
    }
}
#[cfg(not(unix))]
fn lower_priority() {}

#[cfg(test)]
mod tests {
    use super::*;
    use io::Cursor;

    struct StaticProvider(Vec<u8>);
    impl MediaProvider for StaticProvider {
        fn open(&self, _identifier: &str) -> io::Result<MediaChannel> {
            Ok(MediaChannel::new(Cursor::new(self.0.clone())))
        }
    }

    #[test]
    fn lifecycle() {
        let server =
            StreamServer::new(Arc::new(StaticProvider(b"media".to_vec()))).unwrap();
        assert!(!server.running());
        assert_ne!(server.port(), 0);

        server.start();
        assert!(server.running());
        // Idempotent while running.
        server.start();
        assert!(server.running());

        server.stop();
        assert!(!server.running());
        // Stopped servers refuse to restart.
        server.start();
        assert!(!server.running());
    }

    #[test]
    fn stop_without_start_is_fine() {
        let server =
            StreamServer::new(Arc::new(StaticProvider(Vec::new()))).unwrap();
        server.stop();
        server.stop();
    }
}
