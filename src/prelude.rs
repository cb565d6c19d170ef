//! ## **The strombox prelude**
//!
//! The purpose of this module is to *simplify*, *make module dependencies obvious*,
//! and *keep consistency* across the crate.
//!
//! A niche threading prelude can be found as a submodule.

// External commonly used dependencies
pub use bytes::{Bytes, BytesMut};
pub use http;
pub use http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
pub use log::*;
pub use std::cmp;
pub use std::fmt::{self, Debug, Display, Formatter};
pub use std::io::{self, prelude::*};
pub use std::net::{
    self, IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream,
};
pub use std::path::{Path, PathBuf};
pub use std::str;
pub use std::sync::{Arc, Mutex};
pub use std::time::{Duration, SystemTime};

// Modules
pub use crate::addr;
pub use crate::encryption;
pub use crate::media;
pub use crate::owner;
pub use crate::parse;
pub use crate::response;
pub use crate::server;
pub use crate::threading;

// Crate types
pub use crate::media::{MediaChannel, MediaProvider};
pub use crate::owner::Authenticator;
pub use crate::server::StreamServer;
pub use crate::{MasterKey, Strombox};

/// ## **The strombox *threading* prelude**
///
/// The purpose of this module is to expose common threading types
/// used by the dispatcher and the worker pool.
pub mod threading_types {
    pub use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    pub use std::sync::mpsc;
    pub use std::thread::{self, JoinHandle};
}
