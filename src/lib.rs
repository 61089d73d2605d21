//! A multi-threaded forwarding HTTP/1.x proxy with opportunistic link
//! prefetching.
//!
//! The proxy accepts browser connections, forwards `GET` requests to origin
//! servers and answers from an in-memory page cache when it can. `CONNECT`
//! requests become transparent byte tunnels. Whenever a `200 OK` HTML page
//! enters the page cache, a background [`Prefetcher`] scans it for `href`
//! links and warms the cache with them.

/// Blocked hostnames and IPv4 addresses, loaded once at startup.
pub mod blacklist;
/// Concurrent TTL caches for pages and resolved addresses.
pub mod cache;
mod connection;
mod error;
mod parse;
/// Background warming of the page cache from HTML links.
pub mod prefetch;
/// The per-client worker: request loop and CONNECT tunnel.
pub mod proxy;

pub use blacklist::Blacklist;
pub use cache::{AddrCache, AddrInfo, Cache, PageCache};
pub use connection::Connection;
pub use error::ProxyError;
pub use parse::{Headers, HttpRequest, HttpResponse, ProxyUri, parse_uri};
pub use prefetch::Prefetcher;
pub use proxy::ProxyConnection;

/// How much data to read for a request or response header section before
/// it's considered invalid. 8KB should be plenty.
pub(crate) const HEADER_SECTION_MAX_LENGTH: usize = 8192;

/// Upper bound for a single socket read while draining message bodies.
pub(crate) const READ_CHUNK_SIZE: usize = 8192;

/// Relay buffer size for CONNECT tunnels.
pub(crate) const TUNNEL_BUF_SIZE: usize = 65536;

/// First index of `needle` in `haystack`.
pub(crate) fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
