use std::{net::SocketAddr, time::Duration};

use bytes::BytesMut;
use n0_error::anyerr;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, lookup_host},
};
use tokio_util::{future::FutureExt, sync::CancellationToken};
use tracing::{debug, trace};

use crate::{
    HEADER_SECTION_MAX_LENGTH, READ_CHUNK_SIZE,
    cache::{AddrCache, AddrInfo},
    error::ProxyError,
    find_subsequence,
    parse::{HttpResponse, ProxyUri},
};

/// Bound on socket reads while hunting for a header or chunk-size
/// terminator, so a peer trickling garbage can't pin the worker.
const MAX_FRAMING_READS: usize = 100;

/// How long an in-flight read may keep running after shutdown is signalled.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// One TCP socket with HTTP-aware reads and cache-backed connects.
///
/// All reads funnel through an internal buffer, so framing code can look
/// ahead (header terminators, chunk-size lines) without losing bytes that
/// belong to the next message. Fatal read or write errors close the socket
/// and surface the original error.
///
/// Every read loop observes the shutdown token once per iteration and
/// surfaces [`ProxyError::Cancelled`] when it is set; the read in flight at
/// that moment gets a short grace to finish first. Writes are never
/// interrupted, so a response that started going out always goes out whole.
#[derive(Debug, Default)]
pub struct Connection {
    stream: Option<TcpStream>,
    buf: BytesMut,
    shutdown: CancellationToken,
}

impl Connection {
    /// Creates a connection with no socket; use [`connect`](Self::connect).
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an already-accepted socket.
    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream: Some(stream),
            ..Self::default()
        }
    }

    /// Attaches the process-wide shutdown token observed by reads and idle
    /// waits. Without it the connection never cancels cooperatively.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|stream| stream.peer_addr().ok())
    }

    /// Closes the socket and discards any buffered bytes.
    pub fn close(&mut self) {
        self.stream = None;
        self.buf.clear();
    }

    /// Connects to the target named by `uri`, consulting the address cache.
    ///
    /// A cached address is tried first; if it no longer answers, the entry
    /// is evicted and the hostname resolved again. The first candidate that
    /// accepts is stored in the cache, and the peer IP is written back into
    /// `uri.resolved_ip` either way.
    pub async fn connect(&mut self, uri: &mut ProxyUri, cache: &AddrCache) -> Result<(), ProxyError> {
        self.close();
        let key = uri.authority();

        if let Some(info) = cache.get(&key) {
            match TcpStream::connect(info.addr).await {
                Ok(stream) => {
                    trace!(%key, addr = %info.addr, "connected via cached address");
                    uri.resolved_ip = Some(info.addr.ip());
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(err) => {
                    debug!(%key, addr = %info.addr, "cached address is stale ({err}), resolving again");
                    cache.remove(&key);
                }
            }
        }

        let candidates = lookup_host(&key)
            .await
            .map_err(|err| ProxyError::not_found(anyerr!("resolving {key}: {err}")))?;
        let mut last_err = None;
        for addr in candidates {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    trace!(%key, %addr, "connected");
                    cache.put(key.clone(), AddrInfo::from(addr));
                    uri.resolved_ip = Some(addr.ip());
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(ProxyError::not_found(match last_err {
            Some(err) => anyerr!("connecting to {key}: {err}"),
            None => anyerr!("no addresses found for {key}"),
        }))
    }

    /// Writes all of `bytes`, closing the socket on failure.
    pub async fn send_all(&mut self, bytes: &[u8]) -> Result<(), ProxyError> {
        let result = match self.stream.as_mut() {
            None => return Err(ProxyError::peer_closed()),
            Some(stream) => stream.write_all(bytes).await,
        };
        result.map_err(|err| {
            self.close();
            err.into()
        })
    }

    /// Reads more bytes into the internal buffer.
    ///
    /// A zero-byte read means the peer closed; the socket is closed and
    /// [`ProxyError::PeerClosed`] returned. A shutdown signalled while the
    /// read is in flight gives it `SHUTDOWN_GRACE` to finish, then bails
    /// with [`ProxyError::Cancelled`].
    async fn fill_buf(&mut self) -> Result<usize, ProxyError> {
        let result = {
            let Some(stream) = self.stream.as_mut() else {
                return Err(ProxyError::peer_closed());
            };
            let mut read = std::pin::pin!(stream.read_buf(&mut self.buf));
            match read.as_mut().with_cancellation_token(&self.shutdown).await {
                Some(result) => result,
                None => match tokio::time::timeout(SHUTDOWN_GRACE, read).await {
                    Ok(result) => result,
                    Err(_) => return Err(ProxyError::cancelled()),
                },
            }
        };
        match result {
            Ok(0) => {
                self.close();
                Err(ProxyError::peer_closed())
            }
            Ok(n) => Ok(n),
            Err(err) => {
                self.close();
                Err(err.into())
            }
        }
    }

    /// Waits up to `wait` for request bytes to become available.
    ///
    /// Buffered bytes from a pipelined request count as ready. A peer that
    /// closes while we wait surfaces as [`ProxyError::PeerClosed`], an
    /// exhausted wait as [`ProxyError::Timeout`], and a shutdown as
    /// [`ProxyError::Cancelled`] without any grace, since no exchange is in
    /// flight while idling.
    pub async fn ready(&mut self, wait: Duration) -> Result<(), ProxyError> {
        if !self.buf.is_empty() {
            return Ok(());
        }
        let result = {
            let Some(stream) = self.stream.as_mut() else {
                return Err(ProxyError::peer_closed());
            };
            let mut probe = [0u8; 1];
            match tokio::time::timeout(wait, stream.peek(&mut probe))
                .with_cancellation_token(&self.shutdown)
                .await
            {
                None => return Err(ProxyError::cancelled()),
                Some(Err(_)) => return Err(ProxyError::timeout()),
                Some(Ok(result)) => result,
            }
        };
        match result {
            Ok(0) => {
                self.close();
                Err(ProxyError::peer_closed())
            }
            Ok(_) => Ok(()),
            Err(err) => {
                self.close();
                Err(err.into())
            }
        }
    }

    /// Reads one complete header section, up to and including the blank
    /// line, and consumes exactly those bytes.
    pub async fn read_http_header(&mut self) -> Result<Vec<u8>, ProxyError> {
        for _ in 0..MAX_FRAMING_READS {
            if self.shutdown.is_cancelled() {
                return Err(ProxyError::cancelled());
            }
            if let Some(idx) = find_subsequence(&self.buf, b"\r\n\r\n") {
                return Ok(self.buf.split_to(idx + 4).to_vec());
            }
            if self.buf.len() >= HEADER_SECTION_MAX_LENGTH {
                self.close();
                return Err(ProxyError::parse(anyerr!(
                    "header section exceeds {HEADER_SECTION_MAX_LENGTH} bytes"
                )));
            }
            self.fill_buf().await?;
        }
        self.close();
        Err(ProxyError::parse(anyerr!(
            "no header terminator after {MAX_FRAMING_READS} reads"
        )))
    }

    /// Reads a full HTTP response: header section plus content-length or
    /// chunked body. Chunked bodies are decoded; the returned response
    /// re-serializes with a single `Content-Length`.
    pub async fn read_http_response(&mut self, uri: ProxyUri) -> Result<HttpResponse, ProxyError> {
        let header = self.read_http_header().await?;
        let mut response = HttpResponse::parse(&header, uri)?;
        let result = if response.chunked {
            self.read_body_chunked(&mut response).await
        } else {
            self.read_body_sized(&mut response).await
        };
        if let Err(err) = result {
            self.close();
            return Err(err);
        }
        Ok(response)
    }

    async fn read_body_sized(&mut self, response: &mut HttpResponse) -> Result<(), ProxyError> {
        while (response.body.len() as u64) < response.content_length {
            if self.shutdown.is_cancelled() {
                return Err(ProxyError::cancelled());
            }
            if self.buf.is_empty() {
                self.fill_buf().await?;
            }
            let remaining = (response.content_length - response.body.len() as u64) as usize;
            let take = remaining.min(self.buf.len()).min(READ_CHUNK_SIZE);
            let data = self.buf.split_to(take);
            response.append_body(&data);
        }
        Ok(())
    }

    async fn read_body_chunked(&mut self, response: &mut HttpResponse) -> Result<(), ProxyError> {
        loop {
            if self.shutdown.is_cancelled() {
                return Err(ProxyError::cancelled());
            }
            let line = self.read_line().await?;
            let size_field = match line.iter().position(|&b| b == b';') {
                // Chunk extensions are discarded.
                Some(idx) => &line[..idx],
                None => &line[..],
            };
            let size_str = std::str::from_utf8(size_field)
                .map_err(|err| ProxyError::parse(anyerr!("chunk size is not UTF-8: {err}")))?
                .trim();
            let chunk_size = u64::from_str_radix(size_str, 16)
                .map_err(|err| ProxyError::parse(anyerr!("invalid chunk size {size_str:?}: {err}")))?;

            if chunk_size == 0 {
                // Closing CRLF after the last-chunk line.
                self.consume(2).await?;
                return Ok(());
            }

            // Consume the chunk plus its trailing CRLF in bounded steps; a
            // chunk is allowed to be larger than any single read.
            let total = chunk_size + 2;
            let mut consumed = 0u64;
            while consumed < total {
                if self.shutdown.is_cancelled() {
                    return Err(ProxyError::cancelled());
                }
                if self.buf.is_empty() {
                    self.fill_buf().await?;
                }
                let take = ((total - consumed) as usize).min(self.buf.len()).min(READ_CHUNK_SIZE);
                let data = self.buf.split_to(take);
                let payload = (chunk_size.saturating_sub(consumed) as usize).min(take);
                response.append_body(&data[..payload]);
                consumed += take as u64;
            }
            trace!(chunk_size, "appended chunk to body");
        }
    }

    /// Reads one CRLF-terminated line, consuming the terminator but not
    /// returning it.
    async fn read_line(&mut self) -> Result<Vec<u8>, ProxyError> {
        for _ in 0..MAX_FRAMING_READS {
            if self.shutdown.is_cancelled() {
                return Err(ProxyError::cancelled());
            }
            if let Some(idx) = find_subsequence(&self.buf, b"\r\n") {
                let line = self.buf.split_to(idx + 2);
                return Ok(line[..idx].to_vec());
            }
            if self.buf.len() >= HEADER_SECTION_MAX_LENGTH {
                return Err(ProxyError::parse(anyerr!("line exceeds buffer limit")));
            }
            self.fill_buf().await?;
        }
        Err(ProxyError::parse(anyerr!(
            "no line terminator after {MAX_FRAMING_READS} reads"
        )))
    }

    async fn consume(&mut self, n: usize) -> Result<(), ProxyError> {
        let mut remaining = n;
        while remaining > 0 {
            if self.shutdown.is_cancelled() {
                return Err(ProxyError::cancelled());
            }
            if self.buf.is_empty() {
                self.fill_buf().await?;
            }
            let take = remaining.min(self.buf.len());
            let _ = self.buf.split_to(take);
            remaining -= take;
        }
        Ok(())
    }

    /// Splits the connection into its buffered remainder and raw socket for
    /// tunnel relaying. Returns `None` when disconnected.
    pub(crate) fn into_parts(mut self) -> Option<(BytesMut, TcpStream)> {
        let stream = self.stream.take()?;
        Some((std::mem::take(&mut self.buf), stream))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{io::AsyncWriteExt, net::TcpListener};

    use super::*;
    use crate::parse::parse_uri;

    async fn listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    fn uri_for(addr: SocketAddr) -> ProxyUri {
        parse_uri(&format!("http://{addr}/"), None)
    }

    #[tokio::test]
    async fn header_read_spans_partial_writes() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"HTTP/1.1 200 OK\r\nContent-").await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            stream.write_all(b"Length: 2\r\n\r\nokNEXT").await.unwrap();
        });

        let mut uri = uri_for(addr);
        let cache = AddrCache::new();
        let mut conn = Connection::new();
        conn.connect(&mut uri, &cache).await.unwrap();
        let header = conn.read_http_header().await.unwrap();
        assert!(header.ends_with(b"\r\n\r\n"));
        assert!(header.starts_with(b"HTTP/1.1 200 OK"));
        // Body bytes stay buffered for the next read.
        assert_eq!(&conn.buf[..], b"okNEXT");
    }

    #[tokio::test]
    async fn reads_sized_response_body() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
                .await
                .unwrap();
        });

        let mut uri = uri_for(addr);
        let cache = AddrCache::new();
        let mut conn = Connection::new();
        conn.connect(&mut uri, &cache).await.unwrap();
        let response = conn.read_http_response(uri).await.unwrap();
        assert_eq!(response.body, b"hello");
        assert_eq!(response.content_length, 5);
    }

    #[tokio::test]
    async fn decodes_chunked_response_body() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                      5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\n\r\n",
                )
                .await
                .unwrap();
        });

        let mut uri = uri_for(addr);
        let cache = AddrCache::new();
        let mut conn = Connection::new();
        conn.connect(&mut uri, &cache).await.unwrap();
        let response = conn.read_http_response(uri).await.unwrap();
        assert_eq!(response.body, b"hello world");
        assert_eq!(response.content_length, 11);
        let dump = String::from_utf8(response.dump()).unwrap();
        assert!(dump.contains("Content-Length: 11\r\n"));
        assert!(!dump.contains("Transfer-Encoding"));
    }

    #[tokio::test]
    async fn decodes_chunk_larger_than_read_size() {
        let (listener, addr) = listener().await;
        let big = vec![b'x'; READ_CHUNK_SIZE * 2 + 17];
        let expected = big.clone();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut message = format!(
                "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n{:x}\r\n",
                big.len()
            )
            .into_bytes();
            message.extend_from_slice(&big);
            message.extend_from_slice(b"\r\n0\r\n\r\n");
            stream.write_all(&message).await.unwrap();
        });

        let mut uri = uri_for(addr);
        let cache = AddrCache::new();
        let mut conn = Connection::new();
        conn.connect(&mut uri, &cache).await.unwrap();
        let response = conn.read_http_response(uri).await.unwrap();
        assert_eq!(response.body, expected);
    }

    #[tokio::test]
    async fn truncated_body_fails_and_closes() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nhal")
                .await
                .unwrap();
            // Close without delivering the rest.
        });

        let mut uri = uri_for(addr);
        let cache = AddrCache::new();
        let mut conn = Connection::new();
        conn.connect(&mut uri, &cache).await.unwrap();
        let err = conn.read_http_response(uri).await.unwrap_err();
        assert!(err.is_peer_closed());
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn connect_populates_and_reuses_address_cache() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let cache = AddrCache::new();
        let mut uri = uri_for(addr);
        let key = uri.authority();

        let mut conn = Connection::new();
        conn.connect(&mut uri, &cache).await.unwrap();
        assert_eq!(uri.resolved_ip, Some(addr.ip()));
        assert_eq!(cache.get(&key).map(|info| info.addr), Some(addr));

        // Second connect takes the cached-address fast path.
        let mut conn2 = Connection::new();
        conn2.connect(&mut uri, &cache).await.unwrap();
        assert!(conn2.is_connected());
    }

    #[tokio::test]
    async fn failed_connect_evicts_stale_cache_entry() {
        // A listener we immediately drop leaves a port nobody answers on.
        let (listener, dead_addr) = listener().await;
        drop(listener);

        let cache = AddrCache::new();
        let mut uri = uri_for(dead_addr);
        let key = uri.authority();
        cache.put(key.clone(), AddrInfo::from(dead_addr));

        let mut conn = Connection::new();
        let err = conn.connect(&mut uri, &cache).await.unwrap_err();
        assert_eq!(err.response_status(), Some(http::StatusCode::NOT_FOUND));
        assert!(!cache.contains(&key));
    }

    #[tokio::test]
    async fn ready_times_out_on_silent_peer() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut uri = uri_for(addr);
        let cache = AddrCache::new();
        let mut conn = Connection::new();
        conn.connect(&mut uri, &cache).await.unwrap();
        let err = conn.ready(Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err.response_status(), Some(http::StatusCode::GATEWAY_TIMEOUT));
    }

    #[tokio::test]
    async fn ready_aborts_promptly_on_shutdown() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let shutdown = CancellationToken::new();
        let mut uri = uri_for(addr);
        let cache = AddrCache::new();
        let mut conn = Connection::new().with_shutdown(shutdown.clone());
        conn.connect(&mut uri, &cache).await.unwrap();

        let wait = tokio::spawn(async move { conn.ready(Duration::from_secs(30)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let start = tokio::time::Instant::now();
        shutdown.cancel();
        let err = wait.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        // The idle wait gets no grace.
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn header_read_aborts_on_shutdown_after_grace() {
        // Origin sends a partial header and then stalls.
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"HTTP/1.1 200 OK\r\nContent-").await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let shutdown = CancellationToken::new();
        let mut uri = uri_for(addr);
        let cache = AddrCache::new();
        let mut conn = Connection::new().with_shutdown(shutdown.clone());
        conn.connect(&mut uri, &cache).await.unwrap();

        let read = tokio::spawn(async move { conn.read_http_header().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let start = tokio::time::Instant::now();
        shutdown.cancel();
        let err = read.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        // The stalled read ran out its grace before the abort.
        assert!(start.elapsed() < Duration::from_secs(3));
    }
}
