use std::{sync::Arc, time::Duration};

use http::{Method, StatusCode};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    TUNNEL_BUF_SIZE,
    blacklist::Blacklist,
    cache::{AddrCache, PageCache},
    connection::Connection,
    error::ProxyError,
    parse::{HttpRequest, HttpResponse, ProxyUri},
};

/// Idle time between requests before a kept-alive client is dropped.
pub const DEFAULT_PROXY_TIMEOUT: Duration = Duration::from_secs(20);

/// A CONNECT tunnel with no traffic in either direction for this long is
/// torn down.
const TUNNEL_IDLE_CAP: Duration = Duration::from_secs(50);

/// Granularity of the tunnel's idle check.
const TUNNEL_POLL_QUANTUM: Duration = Duration::from_millis(200);

/// Worker serving one accepted client socket.
///
/// Runs the request/response loop: pipelined requests on the client socket
/// are served strictly in order, the upstream connection is reused while
/// consecutive requests target the same `host:port`, and every exchange
/// ends with either an origin response, a cached response, or a synthesized
/// error status.
///
/// The shutdown token is checked once per request cycle and inside every
/// blocking read, so the worker winds down on its own: an exchange already
/// in flight is answered with a 500 before the socket closes, never cut off
/// mid-response.
#[derive(Debug)]
pub struct ProxyConnection {
    id: u64,
    client: Connection,
    upstream: Connection,
    last_uri: Option<ProxyUri>,
    addr_cache: Arc<AddrCache>,
    page_cache: Arc<PageCache>,
    blacklist: Arc<Blacklist>,
    proxy_timeout: Duration,
    gateway_timeout: Duration,
    shutdown: CancellationToken,
}

impl ProxyConnection {
    pub fn new(
        id: u64,
        client: TcpStream,
        addr_cache: Arc<AddrCache>,
        page_cache: Arc<PageCache>,
        blacklist: Arc<Blacklist>,
        proxy_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            client: Connection::from_stream(client).with_shutdown(shutdown.clone()),
            upstream: Connection::new().with_shutdown(shutdown.clone()),
            last_uri: None,
            addr_cache,
            page_cache,
            blacklist,
            proxy_timeout,
            gateway_timeout: gateway_timeout(proxy_timeout),
            shutdown,
        }
    }

    /// Serves the client until it idles out, closes, errors, or finishes a
    /// CONNECT tunnel. Both sockets are closed on exit.
    pub async fn run(mut self) {
        let started = Instant::now();
        debug!(id = self.id, peer = ?self.client.peer_addr(), "starting proxy connection");
        let mut served = 0usize;
        let reason = match self.serve(&mut served).await {
            Ok(reason) => reason.to_string(),
            Err(err) => format!("{err:#}"),
        };
        self.client.close();
        self.upstream.close();
        debug!(
            id = self.id,
            served,
            elapsed = ?started.elapsed(),
            "closing proxy connection: {reason}"
        );
    }

    async fn serve(&mut self, served: &mut usize) -> Result<&'static str, ProxyError> {
        loop {
            if self.shutdown.is_cancelled() {
                return Ok("shutting down");
            }

            // Wait for the next request on the kept-alive socket.
            match self.client.ready(self.proxy_timeout).await {
                Ok(()) => {}
                Err(err) if err.is_cancelled() => return Ok("shutting down"),
                Err(err) if err.is_timeout() => return Ok("idle timeout"),
                Err(err) if err.is_peer_closed() => return Ok("client closed"),
                Err(err) => return Err(err),
            }

            // A cancelled request read has sent nothing yet, so the worker
            // can just leave.
            let header = match self.client.read_http_header().await {
                Ok(header) => header,
                Err(err) if err.is_cancelled() => return Ok("shutting down"),
                Err(err) => return Err(err),
            };
            let request = match HttpRequest::parse(&header) {
                Ok(request) => request,
                Err(err) => {
                    // A malformed request poisons the framing; answer 400
                    // and end the session.
                    let response = HttpResponse::synthesize_bare(StatusCode::BAD_REQUEST);
                    self.client.send_all(&response.dump()).await.ok();
                    return Err(err);
                }
            };
            *served += 1;
            trace!(method = %request.method, uri = %request.uri, "received request");

            if !self.blacklist.allowed(&request.uri.host) {
                debug!(host = %request.uri.host, "host is blacklisted");
                self.reply(StatusCode::FORBIDDEN, &request).await?;
                continue;
            }

            // CONNECT ends the worker whether or not the tunnel opened.
            if request.method == Method::CONNECT {
                return self.finish_connect(request).await;
            }

            match self.process(&request).await {
                Ok(()) => {}
                Err(err) => match err.response_status() {
                    Some(status) => {
                        debug!(uri = %request.uri, "request failed: {err:#}");
                        self.reply(status, &request).await?;
                    }
                    None => return Err(err),
                },
            }
        }
    }

    /// Handles one non-CONNECT exchange; errors carrying a status code are
    /// reported to the client by the caller.
    async fn process(&mut self, request: &HttpRequest) -> Result<(), ProxyError> {
        if request.method != Method::GET {
            return Err(ProxyError::bad_method(request.method.clone()));
        }

        if let Some(cached) = self.page_cache.get(&request.uri) {
            debug!(uri = %request.uri, "serving cached response");
            return self.client.send_all(&cached.dump()).await;
        }

        self.forward(request).await
    }

    /// Obtains one response from the origin and delivers it, reconnecting
    /// after upstream failures until `gateway_timeout` has elapsed.
    async fn forward(&mut self, request: &HttpRequest) -> Result<(), ProxyError> {
        let deadline = Instant::now() + self.gateway_timeout;
        let mut uri = request.uri.clone();
        let dump = request.dump();

        loop {
            if self.shutdown.is_cancelled() {
                self.upstream.close();
                return Err(ProxyError::cancelled());
            }
            if Instant::now() >= deadline {
                self.upstream.close();
                return Err(ProxyError::timeout());
            }

            let reusable = self.upstream.is_connected()
                && self
                    .last_uri
                    .as_ref()
                    .is_some_and(|last| last.same_origin(&uri));
            if !reusable {
                self.upstream.close();
                self.upstream.connect(&mut uri, &self.addr_cache).await?;
                if let Some(ip) = uri.resolved_ip
                    && !self.blacklist.allowed(&ip.to_string())
                {
                    self.upstream.close();
                    return Err(ProxyError::blocked(ip.to_string()));
                }
                self.last_uri = Some(uri.clone());
            }

            if let Err(err) = self.upstream.send_all(&dump).await {
                debug!("upstream write failed ({err:#}), reconnecting");
                self.upstream.close();
                continue;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let response = match tokio::time::timeout(
                remaining,
                self.upstream.read_http_response(uri.clone()),
            )
            .await
            {
                Err(_) => {
                    self.upstream.close();
                    return Err(ProxyError::timeout());
                }
                // Shutdown interrupted the exchange; no point reconnecting.
                Ok(Err(err)) if err.is_cancelled() => {
                    self.upstream.close();
                    return Err(err);
                }
                Ok(Err(err)) => {
                    debug!("upstream read failed ({err:#}), reconnecting");
                    self.upstream.close();
                    continue;
                }
                Ok(Ok(response)) => response,
            };

            trace!(status = %response.status, uri = %response.uri, "forwarding origin response");
            let sent = self.client.send_all(&response.dump()).await;
            if response.status == StatusCode::OK {
                self.page_cache.put(response.uri.clone(), response);
            }
            return sent;
        }
    }

    async fn finish_connect(&mut self, request: HttpRequest) -> Result<&'static str, ProxyError> {
        match self.tunnel(&request).await {
            Ok(()) => Ok("tunnel complete"),
            Err(err) => match err.response_status() {
                Some(status) => {
                    debug!(uri = %request.uri, "tunnel refused: {err:#}");
                    self.reply(status, &request).await?;
                    Ok("tunnel refused")
                }
                None => Err(err),
            },
        }
    }

    /// Establishes a CONNECT tunnel and relays raw bytes both ways until
    /// either side closes or the idle cap elapses.
    async fn tunnel(&mut self, request: &HttpRequest) -> Result<(), ProxyError> {
        let mut uri = request.uri.clone();
        self.upstream.connect(&mut uri, &self.addr_cache).await?;
        if let Some(ip) = uri.resolved_ip
            && !self.blacklist.allowed(&ip.to_string())
        {
            self.upstream.close();
            return Err(ProxyError::blocked(ip.to_string()));
        }

        self.client.send_all(b"HTTP/1.1 200 OK\r\n\r\n").await?;

        let client = std::mem::take(&mut self.client);
        let upstream = std::mem::take(&mut self.upstream);
        let (Some((leftover, client_stream)), Some((_, mut upstream_stream))) =
            (client.into_parts(), upstream.into_parts())
        else {
            return Err(ProxyError::peer_closed());
        };
        // Bytes the client pipelined behind the CONNECT header belong to
        // the tunnel payload.
        if !leftover.is_empty() {
            upstream_stream.write_all(&leftover).await?;
        }

        debug!(id = self.id, uri = %uri, "entering tunneling mode");
        let (to_upstream, to_client) = relay(client_stream, upstream_stream, &self.shutdown).await;
        debug!(id = self.id, to_upstream, to_client, "exiting tunneling mode");
        Ok(())
    }

    async fn reply(&mut self, status: StatusCode, request: &HttpRequest) -> Result<(), ProxyError> {
        let response = HttpResponse::synthesize(status, request);
        debug!(%status, "sending proxy response");
        self.client.send_all(&response.dump()).await
    }
}

pub(crate) fn gateway_timeout(proxy_timeout: Duration) -> Duration {
    (proxy_timeout / 4).max(Duration::from_secs(1))
}

/// Relays bytes between the client and origin sockets.
///
/// Any EOF or error on either side ends the tunnel, as does the shutdown
/// flag; both sockets close on return, and forwarded bytes reset the idle
/// clock.
async fn relay(
    mut client: TcpStream,
    mut upstream: TcpStream,
    shutdown: &CancellationToken,
) -> (u64, u64) {
    let (mut client_read, mut client_write) = client.split();
    let (mut upstream_read, mut upstream_write) = upstream.split();
    let mut client_buf = vec![0u8; TUNNEL_BUF_SIZE];
    let mut upstream_buf = vec![0u8; TUNNEL_BUF_SIZE];
    let mut to_upstream = 0u64;
    let mut to_client = 0u64;
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            res = client_read.read(&mut client_buf) => match res {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if upstream_write.write_all(&client_buf[..n]).await.is_err() {
                        break;
                    }
                    to_upstream += n as u64;
                    last_activity = Instant::now();
                }
            },
            res = upstream_read.read(&mut upstream_buf) => match res {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if client_write.write_all(&upstream_buf[..n]).await.is_err() {
                        break;
                    }
                    to_client += n as u64;
                    last_activity = Instant::now();
                }
            },
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(TUNNEL_POLL_QUANTUM) => {
                if last_activity.elapsed() >= TUNNEL_IDLE_CAP {
                    break;
                }
            }
        }
    }
    (to_upstream, to_client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_timeout_is_a_quarter_with_floor() {
        assert_eq!(gateway_timeout(Duration::from_secs(20)), Duration::from_secs(5));
        assert_eq!(gateway_timeout(Duration::from_secs(2)), Duration::from_secs(1));
        assert_eq!(gateway_timeout(Duration::from_secs(0)), Duration::from_secs(1));
    }
}
