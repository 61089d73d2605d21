use std::{sync::Arc, time::Duration};

use http::StatusCode;
use tokio_util::{sync::CancellationToken, task::TaskTracker, time::FutureExt};
use tracing::{debug, trace};

use crate::{
    cache::{AddrCache, PageCache},
    connection::Connection,
    find_subsequence,
    parse::{HttpResponse, ProxyUri, parse_uri},
};

/// Default wall-clock budget for one page's prefetch fan-out.
pub const DEFAULT_PREFETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Speculatively fetches an HTML page's `href` targets to warm the page
/// cache.
///
/// Spawned from the page cache's insertion callback whenever a `200 OK`
/// `text/html` response is stored. Each link is fetched on its own task;
/// fetches still in flight when the budget elapses are abandoned, which is
/// harmless because insertion is idempotent and already-cached links are
/// skipped up front. Every per-fetch failure is swallowed.
#[derive(Debug, Clone)]
pub struct Prefetcher {
    addr_cache: Arc<AddrCache>,
    page_cache: Arc<PageCache>,
    prefetch_timeout: Duration,
    shutdown: CancellationToken,
}

impl Prefetcher {
    pub fn new(
        addr_cache: Arc<AddrCache>,
        page_cache: Arc<PageCache>,
        prefetch_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            addr_cache,
            page_cache,
            prefetch_timeout,
            shutdown,
        }
    }

    /// Scans `response` and fetches its links, waiting at most the
    /// configured budget.
    pub async fn run(self, response: HttpResponse) {
        let links = parse_links(&response, &self.page_cache);
        if links.is_empty() {
            return;
        }
        debug!(count = links.len(), base = %response.uri, "prefetching links");

        let tracker = TaskTracker::new();
        for link in links {
            let this = self.clone();
            let shutdown = self.shutdown.clone();
            tracker.spawn(shutdown.run_until_cancelled_owned(async move {
                this.fetch(link).await;
            }));
        }
        tracker.close();
        match tracker.wait().timeout(self.prefetch_timeout).await {
            Ok(()) => trace!("all prefetch tasks finished"),
            Err(_) => debug!("prefetch budget elapsed with fetches still in flight"),
        }
    }

    async fn fetch(&self, mut link: ProxyUri) {
        if self.page_cache.contains(&link) {
            trace!(uri = %link, "prefetch target already cached");
            return;
        }
        let mut server = Connection::new().with_shutdown(self.shutdown.clone());
        if let Err(err) = server.connect(&mut link, &self.addr_cache).await {
            debug!(uri = %link, "prefetch connect failed: {err:#}");
            return;
        }
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}:{}\r\n\r\n",
            link.path, link.host, link.port
        );
        if let Err(err) = server.send_all(request.as_bytes()).await {
            debug!(uri = %link, "prefetch request failed: {err:#}");
            return;
        }
        match server.read_http_response(link.clone()).await {
            Ok(response) if response.status == StatusCode::OK => {
                trace!(uri = %link, "prefetched");
                self.page_cache.put(link, response);
            }
            Ok(response) => {
                debug!(uri = %link, status = %response.status, "not caching non-200 prefetch");
            }
            Err(err) => debug!(uri = %link, "prefetch failed: {err:#}"),
        }
    }
}

/// Scans an HTML body for `href="…"` values.
///
/// Relative links resolve against the response's own URI. Links containing
/// `https://` are skipped (the proxy cannot cache what it cannot read), as
/// are links already present in the page cache.
fn parse_links(response: &HttpResponse, page_cache: &PageCache) -> Vec<ProxyUri> {
    if response.content_type != "text/html" {
        return Vec::new();
    }
    let body = &response.body;
    let mut links = Vec::new();
    let mut pos = 0;
    while let Some(idx) = find_subsequence(&body[pos..], b"href=\"") {
        let value_start = pos + idx + 6;
        let Some(quote) = body[value_start..].iter().position(|&b| b == b'"') else {
            break;
        };
        let raw = &body[value_start..value_start + quote];
        pos = value_start + quote + 1;

        let Ok(link) = std::str::from_utf8(raw) else {
            continue;
        };
        if link.contains("https://") {
            continue;
        }
        let uri = parse_uri(link, Some(&response.uri));
        if uri.host.is_empty() || page_cache.contains(&uri) || links.contains(&uri) {
            continue;
        }
        links.push(uri);
    }
    links
}
