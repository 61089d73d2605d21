use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use n0_error::Result;
use prefetch_proxy::{
    AddrCache, Blacklist, PageCache, Prefetcher, ProxyConnection,
    prefetch::DEFAULT_PREFETCH_TIMEOUT, proxy::DEFAULT_PROXY_TIMEOUT,
};
use tokio::net::TcpListener;
use tokio_util::{sync::CancellationToken, task::TaskTracker, time::FutureExt};
use tracing::{Instrument, debug, error_span, info, warn};

/// Time allowed for live workers to finish after Ctrl-C.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about = "Forwarding HTTP/1.x proxy with link prefetching")]
struct Args {
    /// Port to listen on.
    port: u16,

    /// Page cache TTL in seconds.
    #[arg(default_value_t = 60)]
    cache_timeout: u64,

    /// Blacklist file. A missing file means nothing is blocked.
    #[arg(long, default_value = "blacklist.txt")]
    blacklist: PathBuf,

    /// Idle seconds between requests before a client is dropped.
    #[arg(long, default_value_t = DEFAULT_PROXY_TIMEOUT.as_secs())]
    proxy_timeout: u64,

    /// Budget in seconds for each page's prefetch fan-out.
    #[arg(long, default_value_t = DEFAULT_PREFETCH_TIMEOUT.as_secs())]
    prefetch_timeout: u64,

    /// Log filter when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let blacklist = Arc::new(match Blacklist::load(&args.blacklist) {
        Ok(blacklist) => blacklist,
        Err(err) => {
            debug!("no blacklist loaded: {err:#}");
            Blacklist::new()
        }
    });

    let addr_cache = Arc::new(AddrCache::new());
    let page_cache = Arc::new(PageCache::with_ttl(Duration::from_secs(args.cache_timeout)));
    let shutdown = CancellationToken::new();

    // Every fresh 200 stored in the page cache is handed to the prefetcher
    // on its own task, off the inserting worker's request path.
    {
        let prefetcher = Prefetcher::new(
            addr_cache.clone(),
            page_cache.clone(),
            Duration::from_secs(args.prefetch_timeout),
            shutdown.clone(),
        );
        let handle = tokio::runtime::Handle::current();
        page_cache.set_insertion_callback(move |_uri, response| {
            let prefetcher = prefetcher.clone();
            handle.spawn(prefetcher.run(response));
        });
    }

    let listener = TcpListener::bind(("0.0.0.0", args.port)).await?;
    info!("proxy listening on {}", listener.local_addr()?);

    // Workers wind down cooperatively via the shutdown token; this second
    // token is the last resort for any worker still alive after the drain
    // window.
    let hard_abort = CancellationToken::new();
    let workers = TaskTracker::new();
    let mut conn_id: u64 = 0;
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = tokio::signal::ctrl_c() => break,
        };
        let (stream, peer_addr) = match accepted {
            Ok(conn) => conn,
            Err(err) => {
                warn!("failed to accept connection: {err}");
                continue;
            }
        };
        debug!(%peer_addr, "accepted connection");
        let worker = ProxyConnection::new(
            conn_id,
            stream,
            addr_cache.clone(),
            page_cache.clone(),
            blacklist.clone(),
            Duration::from_secs(args.proxy_timeout),
            shutdown.clone(),
        );
        workers.spawn(
            hard_abort
                .child_token()
                .run_until_cancelled_owned(worker.run())
                .instrument(error_span!("conn", id = conn_id)),
        );
        conn_id += 1;
    }

    info!("shutting down ({} live workers)", workers.len());
    shutdown.cancel();
    workers.close();
    match workers.wait().timeout(DRAIN_TIMEOUT).await {
        Ok(()) => info!("all workers finished"),
        Err(_) => {
            warn!(remaining = workers.len(), "drain timed out, aborting remaining workers");
            hard_abort.cancel();
            workers.wait().await;
        }
    }
    Ok(())
}
