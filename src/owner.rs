//! Connection ownership authentication.
//!
//! A loopback listener is reachable by every process on the host, so before a
//! single response byte is written the server asks: *which process owns the
//! other end of this TCP connection?* Two strategies answer that, selected
//! once at startup by a capability probe:
//!
//! - **Diag**: an exact-tuple netlink `sock_diag` query, the direct kernel API.
//! - **ProcTable**: scanning the textual `/proc/net/<proto>` tables and
//!   matching both endpoints, for environments where netlink is unavailable
//!   (sandboxes, old kernels without `CONFIG_INET_DIAG`).
//!
//! Ownership is reported as a uid. Failure to determine the owner yields
//! [`UNKNOWN_OWNER`] and is deliberately treated as authenticated: the
//! loopback-only bind plus the per-process ephemeral port is the primary
//! perimeter, and a lookup that breaks on some kernel must not break playback.

use crate::prelude::*;

/// Owner id reported when neither strategy can name the owning process.
pub const UNKNOWN_OWNER: i64 = -1;

/// The protocols with kernel connection tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    /// TCP, tables `tcp` and `tcp6`.
    Tcp,
    /// UDP, tables `udp` and `udp6`.
    Udp,
    /// Raw sockets, tables `raw` and `raw6`.
    Raw,
}
impl Proto {
    fn table(self) -> &'static str {
        match self {
            Proto::Tcp => "tcp",
            Proto::Udp => "udp",
            Proto::Raw => "raw",
        }
    }
    #[cfg(unix)]
    fn number(self) -> u8 {
        match self {
            Proto::Tcp => libc::IPPROTO_TCP as u8,
            Proto::Udp => libc::IPPROTO_UDP as u8,
            Proto::Raw => libc::IPPROTO_RAW as u8,
        }
    }
}

/// One data row of a kernel connection table.
///
/// Ephemeral: recomputed on every lookup. Ownership changes as sockets are
/// opened and closed, so only address parsing is cached, never records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRecord {
    /// Owning uid, or [`UNKNOWN_OWNER`].
    pub owner: i64,
    /// The local endpoint, from the row owner's perspective.
    pub local: SocketAddr,
    /// The remote endpoint.
    pub remote: SocketAddr,
}

/// Is `ip` a loopback address, seeing through IPv4-mapped IPv6?
#[must_use]
pub fn is_loopback_addr(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback())
        }
    }
}

/// Is `host` this machine?
///
/// True for the literal `localhost` and for numeric loopback addresses.
#[must_use]
pub fn is_local_host(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
        || host.parse::<IpAddr>().is_ok_and(is_loopback_addr)
}

/// Loopback-aware endpoint equality.
///
/// Dual-stack kernels report the same loopback connection as `127.0.0.1`,
/// `::1` or `::ffff:127.0.0.1` depending on which table the row sits in; two
/// loopback endpoints with equal ports are therefore considered equal
/// regardless of representation. Everything else compares exactly.
#[must_use]
pub fn endpoint_eq(left: SocketAddr, right: SocketAddr) -> bool {
    if is_loopback_addr(left.ip()) && is_loopback_addr(right.ip()) && left.port() == right.port()
    {
        return true;
    }
    left == right
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    /// Netlink `sock_diag` exact queries.
    Diag,
    /// `/proc/net/<proto>` table scans.
    ProcTable,
}

/// Decides whether a connection may be served.
///
/// Construct once per server; the owning uid of this process is computed at
/// construction and read-only afterwards, safe to share across workers.
#[derive(Debug)]
pub struct Authenticator {
    my_uid: i64,
    strategy: Strategy,
    cache: addr::AddrCache,
}

impl Authenticator {
    /// Creates an authenticator, probing platform capability once.
    #[must_use]
    pub fn new() -> Self {
        let strategy = if diag::available() {
            Strategy::Diag
        } else {
            Strategy::ProcTable
        };
        debug!("connection owner lookup strategy: {:?}", strategy);
        Self {
            my_uid: process_uid(),
            strategy,
            cache: addr::AddrCache::new(),
        }
    }

    /// Forces the expected owner id, bypassing the own-uid computation.
    ///
    /// Lets tests and embedders exercise the rejection path with real
    /// connections.
    #[must_use]
    pub fn expecting_owner(owner: i64) -> Self {
        let mut this = Self::new();
        this.my_uid = owner;
        this
    }

    /// The uid connections are expected to belong to.
    #[must_use]
    pub fn expected_owner(&self) -> i64 {
        self.my_uid
    }

    /// Finds the uid owning the socket whose endpoints are `local` and
    /// `remote` (from the owner's perspective).
    ///
    /// Never errors: any failure is [`UNKNOWN_OWNER`].
    #[must_use]
    pub fn owner_of(&self, proto: Proto, local: SocketAddr, remote: SocketAddr) -> i64 {
        match self.strategy {
            Strategy::Diag => diag::owner_of(proto, local, remote),
            Strategy::ProcTable => self.scan_tables(proto, local, remote),
        }
    }

    /// The admission policy: the owner is this process, or could not be
    /// determined.
    ///
    /// Fail-open on the sentinel is a deliberate trade-off; see module docs.
    #[must_use]
    pub fn authorized(&self, owner: i64) -> bool {
        if owner == UNKNOWN_OWNER {
            debug!("connection owner unknown, admitting");
            return true;
        }
        owner == self.my_uid
    }

    fn scan_tables(&self, proto: Proto, local: SocketAddr, remote: SocketAddr) -> i64 {
        let table = proto.table();
        for suffix in ["", "6"] {
            let path = format!("/proc/net/{table}{suffix}");
            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(err) => {
                    debug!("cannot read {path}: {err}");
                    continue;
                }
            };
            for line in content.lines().skip(1) {
                let Some(record) = self.parse_row(line) else {
                    continue;
                };
                if endpoint_eq(record.local, local) && endpoint_eq(record.remote, remote) {
                    return record.owner;
                }
            }
        }
        UNKNOWN_OWNER
    }

    /// Parses one data row of a connection table.
    ///
    /// Row shape (header skipped by the caller):
    /// `sl local_address rem_address st tx_queue:rx_queue tr:tm->when retrnsmt uid ...`
    fn parse_row(&self, line: &str) -> Option<ConnectionRecord> {
        let mut fields = line.split_whitespace();
        let _slot = fields.next()?;
        let local = self.cache.resolve(fields.next()?)?;
        let remote = self.cache.resolve(fields.next()?)?;
        let owner = fields.nth(4)?.parse().ok()?;
        Some(ConnectionRecord {
            owner,
            local,
            remote,
        })
    }
}
impl Default for Authenticator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn process_uid() -> i64 {
    i64::from(unsafe { libc::getuid() })
}
#[cfg(not(unix))]
fn process_uid() -> i64 {
    UNKNOWN_OWNER
}

/// Netlink `sock_diag` exact-tuple owner queries.
#[cfg(all(unix, target_os = "linux"))]
mod diag {
    use super::{Proto, UNKNOWN_OWNER};
    use crate::prelude::*;
    use std::mem;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    const SOCK_DIAG_BY_FAMILY: u16 = 20;
    const NLMSG_ERROR: u16 = 2;
    const NLMSG_DONE: u16 = 3;
    /// `INET_DIAG_NOCOOKIE` in both cookie words.
    const NO_COOKIE: u32 = !0;
    /// All TCP states.
    const ALL_STATES: u32 = !0;

    // Written for the kernel, never read back field-by-field.
    #[allow(dead_code)]
    #[repr(C)]
    #[derive(Clone, Copy)]
    struct SockId {
        sport: u16,
        dport: u16,
        src: [u8; 16],
        dst: [u8; 16],
        interface: u32,
        cookie: [u32; 2],
    }
    #[repr(C)]
    struct Request {
        // struct nlmsghdr
        len: u32,
        kind: u16,
        flags: u16,
        seq: u32,
        pid: u32,
        // struct inet_diag_req_v2
        family: u8,
        protocol: u8,
        ext: u8,
        pad: u8,
        states: u32,
        id: SockId,
    }
    // Only `uid` is consulted; the rest mirrors the kernel struct layout.
    #[allow(dead_code)]
    #[repr(C)]
    #[derive(Clone, Copy)]
    struct DiagMsg {
        family: u8,
        state: u8,
        timer: u8,
        retrans: u8,
        id: SockId,
        expires: u32,
        rqueue: u32,
        wqueue: u32,
        uid: u32,
        inode: u32,
    }

    fn open() -> Option<OwnedFd> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
                libc::NETLINK_SOCK_DIAG,
            )
        };
        if fd < 0 {
            return None;
        }
        Some(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// Capability probe, run once at [`Authenticator`](super::Authenticator)
    /// construction.
    pub(super) fn available() -> bool {
        open().is_some()
    }

    fn sock_id(local: SocketAddr, remote: SocketAddr) -> SockId {
        let mut id = SockId {
            sport: local.port().to_be(),
            dport: remote.port().to_be(),
            src: [0; 16],
            dst: [0; 16],
            interface: 0,
            cookie: [NO_COOKIE; 2],
        };
        match (local.ip(), remote.ip()) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => {
                id.src[..4].copy_from_slice(&src.octets());
                id.dst[..4].copy_from_slice(&dst.octets());
            }
            (src, dst) => {
                id.src = to_v6(src).octets();
                id.dst = to_v6(dst).octets();
            }
        }
        id
    }
    fn to_v6(ip: IpAddr) -> Ipv6Addr {
        match ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        }
    }

    /// One exact query; every failure mode collapses to the sentinel.
    pub(super) fn owner_of(proto: Proto, local: SocketAddr, remote: SocketAddr) -> i64 {
        let Some(fd) = open() else {
            return UNKNOWN_OWNER;
        };
        let family = if local.is_ipv4() && remote.is_ipv4() {
            libc::AF_INET as u8
        } else {
            libc::AF_INET6 as u8
        };
        let request = Request {
            len: mem::size_of::<Request>() as u32,
            kind: SOCK_DIAG_BY_FAMILY,
            flags: libc::NLM_F_REQUEST as u16,
            seq: 1,
            pid: 0,
            family,
            protocol: proto.number(),
            ext: 0,
            pad: 0,
            states: ALL_STATES,
            id: sock_id(local, remote),
        };
        let sent = unsafe {
            libc::send(
                fd.as_raw_fd(),
                (&request as *const Request).cast(),
                mem::size_of::<Request>(),
                0,
            )
        };
        if sent != mem::size_of::<Request>() as isize {
            debug!("sock_diag send failed: {}", io::Error::last_os_error());
            return UNKNOWN_OWNER;
        }
        let mut buffer = [0_u8; 8192];
        let received = unsafe {
            libc::recv(
                fd.as_raw_fd(),
                buffer.as_mut_ptr().cast(),
                buffer.len(),
                0,
            )
        };
        if received <= 0 {
            debug!("sock_diag recv failed: {}", io::Error::last_os_error());
            return UNKNOWN_OWNER;
        }
        parse_reply(&buffer[..received as usize])
    }

    fn parse_reply(mut reply: &[u8]) -> i64 {
        const HEADER: usize = 16;
        while reply.len() >= HEADER {
            let len = u32::from_ne_bytes([reply[0], reply[1], reply[2], reply[3]]) as usize;
            let kind = u16::from_ne_bytes([reply[4], reply[5]]);
            if len < HEADER || len > reply.len() {
                break;
            }
            match kind {
                NLMSG_ERROR | NLMSG_DONE => break,
                SOCK_DIAG_BY_FAMILY if len >= HEADER + mem::size_of::<DiagMsg>() => {
                    // The payload is repr(C) inet_diag_msg; uid sits at a fixed
                    // offset but reading the whole struct keeps the layout in
                    // one place.
                    let message = unsafe {
                        reply[HEADER..]
                            .as_ptr()
                            .cast::<DiagMsg>()
                            .read_unaligned()
                    };
                    return i64::from(message.uid);
                }
                _ => {}
            }
            // Netlink messages are 4-byte aligned.
            let aligned = (len + 3) & !3;
            if aligned >= reply.len() {
                break;
            }
            reply = &reply[aligned..];
        }
        UNKNOWN_OWNER
    }
}
#[cfg(not(all(unix, target_os = "linux")))]
mod diag {
    use super::{Proto, UNKNOWN_OWNER};
    use crate::prelude::*;

    pub(super) fn available() -> bool {
        false
    }
    pub(super) fn owner_of(_proto: Proto, _local: SocketAddr, _remote: SocketAddr) -> i64 {
        UNKNOWN_OWNER
    }
}
