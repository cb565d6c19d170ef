//! Decoding of the hex `address:port` tokens used by the kernel's
//! per-protocol connection tables.
//!
//! The kernel prints each address as a sequence of native-endian 32-bit words
//! rendered in hex, followed by a colon and a hex port. Parsing is cheap but
//! runs for every table row on the authentication hot path, so successful
//! parses go through a small [`AddrCache`].

use crate::prelude::*;

/// Number of distinct tokens kept by [`AddrCache`].
///
/// Connection tables on a busy host rotate, but the loopback tuples we care
/// about repeat almost verbatim between lookups.
const CACHE_CAPACITY: u64 = 512;

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 0x0a),
        b'A'..=b'F' => Some(b - b'A' + 0x0a),
        _ => None,
    }
}

fn decode_hex(encoded: &str) -> Option<Vec<u8>> {
    let encoded = encoded.as_bytes();
    // Permit an odd number of digits; the first digit is then the low nibble
    // of the first byte. Kernel tables are always even-width, but the format
    // allows it.
    let mut bytes = Vec::with_capacity((encoded.len() + 1) / 2);
    let rest = if encoded.len() % 2 != 0 {
        bytes.push(hex_value(encoded[0])?);
        &encoded[1..]
    } else {
        encoded
    };
    for pair in rest.chunks_exact(2) {
        bytes.push((hex_value(pair[0])? << 4) | hex_value(pair[1])?);
    }
    Some(bytes)
}

/// Reorders hex-decoded address bytes to network byte order.
///
/// Each 32-bit word was printed by the kernel in native endianness.
fn to_network_order(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    for word in bytes.chunks_exact(4) {
        let native = u32::from_ne_bytes([word[0], word[1], word[2], word[3]]);
        out.extend_from_slice(&native.to_be_bytes());
    }
    out
}

/// Parses a kernel-table `address:port` token into a [`SocketAddr`].
///
/// The split happens at the *last* colon; the address half must decode to
/// 4 bytes (IPv4) or 16 bytes (IPv6). Returns `None` on any malformed input
/// rather than erroring: a bad row in the table must never fail a lookup.
#[must_use]
pub fn parse_hex_token(token: &str) -> Option<SocketAddr> {
    let (address, port) = token.rsplit_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;
    let bytes = to_network_order(&decode_hex(address)?);
    let ip = match bytes.len() {
        4 => IpAddr::V4(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])),
        16 => {
            let mut octets = [0; 16];
            octets.copy_from_slice(&bytes);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

/// A cache of parsed `address:port` tokens.
///
/// Only successful parses are cached; a token that fails to parse is retried
/// on the next occurrence (and occurs rarely enough not to matter).
#[derive(Debug, Clone)]
pub struct AddrCache {
    cache: moka::sync::Cache<String, SocketAddr>,
}
impl AddrCache {
    /// Creates an empty cache with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cache: moka::sync::Cache::new(CACHE_CAPACITY),
        }
    }
    /// [`parse_hex_token`], memoized.
    #[must_use]
    pub fn resolve(&self, token: &str) -> Option<SocketAddr> {
        if let Some(addr) = self.cache.get(token) {
            return Some(addr);
        }
        let addr = parse_hex_token(token)?;
        self.cache.insert(token.to_owned(), addr);
        Some(addr)
    }
}
impl Default for AddrCache {
    fn default() -> Self {
        Self::new()
    }
}
