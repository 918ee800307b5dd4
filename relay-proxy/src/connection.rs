use crate::breaker::Admission;
use crate::compression;
use crate::fallback::FallbackError;
use crate::health_check;
use crate::proxy::{
    ConnPool, ProxyWorker, RESP_502, RequestResult, build_response, build_upstream_request,
};
use crate::websocket;
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::TcpStream;
use relay_core::error::ErrorCategory;
use relay_observability::Aggregator;
use relay_plugin::pipeline::PluginPipeline;
use relay_plugin::plugin::{PluginContext, PluginResult};
use relay_store::cache::{
    CachedResponse, derive_stale_while_revalidate, derive_ttl, if_modified_since_matches,
    if_none_match_matches, is_cacheable,
};
use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Best-effort HTTP error category from a status code alone, used wherever
/// the originating `FallbackError`/`RelayError` isn't in scope (static and
/// plugin-generated responses). Matches the taxonomy in spec §7.
fn category_from_status(status: u16) -> Option<ErrorCategory> {
    match status {
        0..=399 => None,
        429 => Some(ErrorCategory::Client),
        400..=499 => Some(ErrorCategory::Client),
        503 => Some(ErrorCategory::CircuitBreaker),
        504 => Some(ErrorCategory::Timeout),
        _ => Some(ErrorCategory::Server),
    }
}

fn fallback_error_category(err: &FallbackError) -> ErrorCategory {
    match err {
        FallbackError::CircuitOpen => ErrorCategory::CircuitBreaker,
        FallbackError::Timeout => ErrorCategory::Timeout,
        FallbackError::Gateway(_) => ErrorCategory::Server,
        FallbackError::Other => ErrorCategory::Other,
    }
}

/// Extract the numeric status from one of the crate's pre-built static
/// responses (`"HTTP/1.1 404 ..."`). All of them share this fixed prefix.
fn static_response_status(bytes: &[u8]) -> u16 {
    bytes
        .get(9..12)
        .and_then(|s| std::str::from_utf8(s).ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// Passive health-check thresholds used when relaying a real request, since
/// `RequestResult::Proxy` only carries a node address rather than the full
/// `ActiveHealthCheck` config for its upstream. Matches `relay_core::upstream`'s
/// own serde defaults so passive and active recording agree absent an
/// explicit override.
const PASSIVE_HEALTHY_SUCCESSES: u32 = 2;
const PASSIVE_UNHEALTHY_FAILURES: u32 = 3;
const PASSIVE_GRACE_PERIOD_MS: u64 = 5_000;

/// A response body above this size skips transforms/compression/caching and
/// is instead streamed straight through to the client — buffering multi-
/// megabyte bodies to run them through a synchronous transform/compress
/// pass would hold far too much per-connection memory on a thread-per-core
/// proxy serving thousands of concurrent connections.
const MAX_BUFFERED_BODY: usize = 16 * 1024 * 1024;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Resolve an `addr` string (e.g. `"localhost:3001"`) to a list of `SocketAddr`s.
///
/// We resolve explicitly via std's blocking `ToSocketAddrs` before passing
/// to monoio's `TcpStream::connect`.  Monoio's internal hostname-resolution
/// path can behave differently on macOS (e.g. under FusionDriver) when the
/// kernel AIO interface does not support `getaddrinfo`.  The blocking call is
/// acceptable here because it only runs when the connection pool is empty
/// (startup, first request, or after upstream failure) — it is NOT on the
/// steady-state hot path.
///
/// Returns candidates sorted IPv4-first, because on macOS `localhost` resolves
/// to both `::1` (IPv6) and `127.0.0.1` (IPv4), and `.next()` often returns
/// `::1` first.  Most upstream servers listen on IPv4-only, so we try IPv4
/// first to avoid spurious "Connection refused" on the IPv6 address.
pub(crate) fn resolve_addrs(addr: &str) -> Vec<SocketAddr> {
    // Fast path: already an IP:port literal
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return vec![sa];
    }
    // Slow path: DNS/hosts lookup (blocking — intentional, see above)
    use std::net::ToSocketAddrs;
    let all: Vec<SocketAddr> = match addr.to_socket_addrs() {
        Ok(iter) => iter.collect(),
        Err(_) => return vec![],
    };
    // Sort: IPv4 addresses before IPv6
    let mut v4: Vec<SocketAddr> = all.iter().copied().filter(|a| a.is_ipv4()).collect();
    let v6: Vec<SocketAddr> = all.iter().copied().filter(|a| a.is_ipv6()).collect();
    v4.extend(v6);
    v4
}

/// Open a new TCP connection to `addr`, trying all resolved addresses
/// (IPv4-first) and returning the first that succeeds.
pub(crate) async fn new_upstream_conn(addr: &str) -> Option<TcpStream> {
    let candidates = resolve_addrs(addr);
    if candidates.is_empty() {
        tracing::warn!(addr = %addr, "Upstream address resolve failed");
        return None;
    }
    for sa in &candidates {
        match TcpStream::connect(*sa).await {
            Ok(s) => {
                let _ = s.set_nodelay(true);
                tracing::debug!(addr = %addr, resolved = %sa, "Upstream connected");
                return Some(s);
            }
            Err(e) => {
                tracing::debug!(addr = %addr, resolved = %sa, error = %e, "Upstream candidate failed, trying next");
            }
        }
    }
    tracing::warn!(addr = %addr, tried = candidates.len(), "Upstream connect failed on all candidates");
    None
}

/// What happened when we tried to read the upstream's response.
enum UpstreamOutcome {
    /// Full status/headers/body captured for post-processing.
    Buffered {
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
        keepalive: bool,
    },
    /// Already written to the client verbatim (big/chunked/unparseable body) —
    /// no further processing possible.
    StreamedToClient { keepalive: bool },
    /// Connect/write/read failed before a usable response arrived.
    Failed,
}

/// Read one HTTP response off `upstream`. Bodies that fit under
/// `MAX_BUFFERED_BODY` and carry a plain `Content-Length` are buffered so the
/// caller can run transform/compression/cache stages; anything else (no
/// length, chunked, oversized, or unparseable) is relayed byte-for-byte as it
/// arrives, the same streaming approach this module used before response
/// post-processing existed.
async fn read_upstream_response(
    upstream: &mut TcpStream,
    client: &mut TcpStream,
    upstream_buf: &mut Vec<u8>,
) -> anyhow::Result<UpstreamOutcome> {
    let buf = std::mem::take(upstream_buf);
    let (res, buf) = upstream.read(buf).await;
    *upstream_buf = buf;
    let resp_n = match res {
        Ok(0) | Err(_) => return Ok(UpstreamOutcome::Failed),
        Ok(n) => n,
    };

    let mut resp_headers = [httparse::EMPTY_HEADER; 64];
    let mut resp = httparse::Response::new(&mut resp_headers);
    let Ok(httparse::Status::Complete(hdr_len)) = resp.parse(&upstream_buf[..resp_n]) else {
        // Unparseable — forward raw bytes as-is; treat as non-keepalive since
        // we can no longer reason about framing.
        let data = upstream_buf[..resp_n].to_vec();
        let (res, _) = client.write_all(data).await;
        res?;
        return Ok(UpstreamOutcome::StreamedToClient { keepalive: false });
    };

    let status = resp.code.unwrap_or(502);
    let mut headers: Vec<(String, String)> = Vec::with_capacity(resp.headers.len());
    let mut content_length: Option<usize> = None;
    let mut keepalive = true;
    let mut chunked = false;
    for h in resp.headers.iter() {
        if h.name.is_empty() {
            break;
        }
        let val = std::str::from_utf8(h.value).unwrap_or("").to_string();
        if h.name.eq_ignore_ascii_case("content-length") {
            content_length = val.parse().ok();
        }
        if h.name.eq_ignore_ascii_case("connection") {
            keepalive = !val.eq_ignore_ascii_case("close");
        }
        if h.name.eq_ignore_ascii_case("transfer-encoding") && val.to_ascii_lowercase().contains("chunked") {
            chunked = true;
        }
        headers.push((h.name.to_string(), val));
    }

    let body_in_first = resp_n - hdr_len;
    let too_big = content_length.map(|cl| cl > MAX_BUFFERED_BODY).unwrap_or(true);

    if chunked || too_big {
        let first_chunk = upstream_buf[..resp_n].to_vec();
        let (res, _) = client.write_all(first_chunk).await;
        res?;

        if let Some(cl) = content_length {
            let mut remaining = cl.saturating_sub(body_in_first);
            while remaining > 0 {
                let chunk_size = remaining.min(65536);
                let chunk_buf = vec![0u8; chunk_size];
                let (res, chunk_buf) = upstream.read(chunk_buf).await;
                let cn = match res {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                remaining -= cn;
                let (res, _) = client.write_all(chunk_buf[..cn].to_vec()).await;
                if res.is_err() {
                    return Ok(UpstreamOutcome::StreamedToClient { keepalive: false });
                }
            }
            return Ok(UpstreamOutcome::StreamedToClient { keepalive });
        }

        // No content-length (chunked, or a close-delimited body): relay
        // until the upstream closes, and don't offer this connection back
        // to the pool since we can't be sure where the next response starts.
        loop {
            let chunk_buf = vec![0u8; 65536];
            let (res, chunk_buf) = upstream.read(chunk_buf).await;
            let cn = match res {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let (res, _) = client.write_all(chunk_buf[..cn].to_vec()).await;
            if res.is_err() {
                break;
            }
        }
        return Ok(UpstreamOutcome::StreamedToClient { keepalive: false });
    }

    // Buffered mode: content_length is Some and within the cap.
    let cl = content_length.unwrap_or(0);
    let mut body = Vec::with_capacity(cl);
    body.extend_from_slice(&upstream_buf[hdr_len..resp_n]);
    while body.len() < cl {
        let remaining = cl - body.len();
        let chunk_size = remaining.min(65536);
        let chunk_buf = vec![0u8; chunk_size];
        let (res, chunk_buf) = upstream.read(chunk_buf).await;
        let cn = match res {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        body.extend_from_slice(&chunk_buf[..cn]);
    }

    Ok(UpstreamOutcome::Buffered {
        status,
        headers,
        body,
        keepalive,
    })
}

fn header_value<'a>(headers: &'a [(&str, &str)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| *v)
}

fn response_header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Handle a single client connection (HTTP/1.1 with keepalive).
///
/// Shares ProxyWorker and ConnPool with all other connections
/// on this thread via Rc<RefCell> — zero atomic overhead.
pub async fn handle_connection(
    mut client: TcpStream,
    peer_addr: SocketAddr,
    proxy: Rc<RefCell<ProxyWorker>>,
    conn_pool: Rc<RefCell<ConnPool>>,
) -> anyhow::Result<()> {
    let client_ip = peer_addr.ip().to_string();

    // Shared resilience fabric — stable Arcs, cloned once rather than
    // re-borrowed on every request.
    let (breaker, retry_manager, node_runtime, response_cache, fallback, compression_config, metrics) = {
        let pw = proxy.borrow();
        (
            Arc::clone(pw.breaker()),
            Arc::clone(pw.retry_manager()),
            Arc::clone(pw.node_runtime()),
            Arc::clone(pw.response_cache()),
            Arc::clone(pw.fallback()),
            Arc::clone(pw.compression_config()),
            Arc::clone(pw.metrics()),
        )
    };

    // Connection-scoped gauge: closed on every exit from this function,
    // including the early `return`s and `?` below, via `Drop`.
    struct ConnGuard(Arc<Aggregator>);
    impl Drop for ConnGuard {
        fn drop(&mut self) {
            self.0.connection_closed();
        }
    }
    metrics.connection_opened();
    let _conn_guard = ConnGuard(Arc::clone(&metrics));

    // ── All buffers allocated ONCE, reused across keepalive requests ──
    let mut read_buf = vec![0u8; 8192];
    let mut upstream_req_buf = Vec::with_capacity(2048);
    let mut resp_buf = Vec::with_capacity(4096);
    let mut upstream_buf = vec![0u8; 65536];

    loop {
        // ── Read request ──
        let (res, returned_buf) = client.read(read_buf).await;
        read_buf = returned_buf;
        let n = match res {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) => return Err(e.into()),
        };

        // ── Parse HTTP request ──
        let mut headers_raw = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers_raw);

        let req_start = Instant::now();
        match req.parse(&read_buf[..n]) {
            Ok(httparse::Status::Complete(body_offset)) => {
                let method = req.method.unwrap_or("GET").to_string();
                let path = req.path.unwrap_or("/").to_string();

                // Zero-copy header extraction (references into read_buf)
                let mut headers: Vec<(&str, &str)> = Vec::with_capacity(16);
                let mut host: Option<&str> = None;
                let mut keep_alive = true;

                for h in req.headers.iter() {
                    if h.name.is_empty() {
                        break;
                    }
                    let val = std::str::from_utf8(h.value).unwrap_or("");
                    headers.push((h.name, val));
                    if h.name.eq_ignore_ascii_case("host") {
                        host = Some(val);
                    } else if h.name.eq_ignore_ascii_case("connection") {
                        keep_alive = !val.eq_ignore_ascii_case("close");
                    }
                }

                // ── Process request (brief RefCell borrow, NO await) ──
                let (result, ws_ping_interval_ms, request_timeout_ms) = {
                    let mut pw = proxy.borrow_mut();
                    let result = pw.handle_request(&method, &path, host, &headers, &client_ip);
                    (
                        result,
                        pw.config().proxy.websocket_ping_interval_ms,
                        pw.config().proxy.request_timeout_ms,
                    )
                };
                // Borrow dropped here — safe to do async I/O

                match result {
                    RequestResult::Proxy {
                        route_id,
                        upstream_addr,
                        upstream_path,
                        max_retries,
                        pipeline,
                        ctx,
                    } => {
                        let body_data = read_buf[body_offset..n].to_vec();

                        if websocket::is_upgrade_request(&headers) {
                            handle_websocket_upgrade(
                                client,
                                &method,
                                &upstream_path,
                                &headers,
                                &body_data,
                                &upstream_addr,
                                &mut upstream_req_buf,
                                std::time::Duration::from_millis(ws_ping_interval_ms),
                            )
                            .await?;
                            return Ok(());
                        }

                        let outcome = proxy_and_relay(
                            &mut client,
                            &conn_pool,
                            &proxy,
                            &breaker,
                            &retry_manager,
                            &node_runtime,
                            &response_cache,
                            &fallback,
                            &compression_config,
                            &metrics,
                            &client_ip,
                            &route_id,
                            upstream_addr,
                            &upstream_path,
                            &method,
                            &headers,
                            &body_data,
                            max_retries,
                            pipeline,
                            ctx,
                            &mut upstream_req_buf,
                            &mut upstream_buf,
                            &mut resp_buf,
                            req_start,
                            request_timeout_ms,
                        )
                        .await?;

                        if !outcome {
                            return Ok(());
                        }
                    }

                    RequestResult::Static(resp_bytes) => {
                        let (res, _) = client.write_all(resp_bytes.to_vec()).await;
                        res?;
                        let status = static_response_status(resp_bytes);
                        metrics.record_request(
                            "unmatched",
                            None,
                            &method,
                            status,
                            req_start.elapsed().as_millis() as u64,
                            n as u64,
                            resp_bytes.len() as u64,
                            category_from_status(status),
                        );
                    }

                    RequestResult::PluginResponse {
                        ref route_id,
                        status,
                        ref headers,
                        ref body,
                    } => {
                        build_response(&mut resp_buf, status, headers, body);
                        let data = resp_buf.clone();
                        let bytes_out = data.len() as u64;
                        let (res, _) = client.write_all(data).await;
                        res?;
                        metrics.record_request(
                            route_id,
                            None,
                            &method,
                            status,
                            req_start.elapsed().as_millis() as u64,
                            n as u64,
                            bytes_out,
                            category_from_status(status),
                        );
                    }
                }

                if !keep_alive {
                    return Ok(());
                }
            }
            Ok(httparse::Status::Partial) => {
                let resp =
                    b"HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
                let (res, _) = client.write_all(resp.to_vec()).await;
                res?;
                return Ok(());
            }
            Err(e) => {
                tracing::debug!(error = %e, "HTTP parse error");
                let resp =
                    b"HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
                let (res, _) = client.write_all(resp.to_vec()).await;
                res?;
                return Ok(());
            }
        }
    }
}

/// Handshake a WebSocket upgrade with the upstream and, once accepted,
/// consume `client` into a bidirectional byte splice (spec §4.14). Hop-by-hop
/// headers (`Connection`, `Upgrade`) must reach the upstream unmodified here,
/// unlike the ordinary proxy path, so the request is built without
/// `build_upstream_request`'s stripping.
async fn handle_websocket_upgrade(
    mut client: TcpStream,
    method: &str,
    upstream_path: &str,
    headers: &[(&str, &str)],
    body_data: &[u8],
    upstream_addr: &str,
    upstream_req_buf: &mut Vec<u8>,
    ws_ping_interval: std::time::Duration,
) -> anyhow::Result<()> {
    upstream_req_buf.clear();
    upstream_req_buf.extend_from_slice(method.as_bytes());
    upstream_req_buf.push(b' ');
    upstream_req_buf.extend_from_slice(upstream_path.as_bytes());
    upstream_req_buf.extend_from_slice(b" HTTP/1.1\r\n");
    for (name, value) in headers {
        upstream_req_buf.extend_from_slice(name.as_bytes());
        upstream_req_buf.extend_from_slice(b": ");
        upstream_req_buf.extend_from_slice(value.as_bytes());
        upstream_req_buf.extend_from_slice(b"\r\n");
    }
    upstream_req_buf.extend_from_slice(b"\r\n");
    if !body_data.is_empty() {
        upstream_req_buf.extend_from_slice(body_data);
    }

    let mut upstream = match new_upstream_conn(upstream_addr).await {
        Some(s) => s,
        None => {
            let (res, _) = client.write_all(RESP_502.to_vec()).await;
            return res.map_err(Into::into);
        }
    };

    let req_data = upstream_req_buf.clone();
    let (res, _) = upstream.write_all(req_data).await;
    res?;

    let mut buf = vec![0u8; 8192];
    let (res, buf) = upstream.read(buf).await;
    let n = match res {
        Ok(n) if n > 0 => n,
        _ => {
            let (res, _) = client.write_all(RESP_502.to_vec()).await;
            return res.map_err(Into::into);
        }
    };

    let mut resp_headers = [httparse::EMPTY_HEADER; 64];
    let mut resp = httparse::Response::new(&mut resp_headers);
    let accepted = matches!(resp.parse(&buf[..n]), Ok(httparse::Status::Complete(_)))
        && websocket::is_upgrade_response(resp.code.unwrap_or(0));

    let first_chunk = buf[..n].to_vec();
    let (res, _) = client.write_all(first_chunk).await;
    res?;

    if accepted {
        let stats = websocket::splice_bidirectional(client, upstream, ws_ping_interval).await;
        tracing::debug!(
            upstream = %upstream_addr,
            duration_ms = stats.started_at().elapsed().as_millis() as u64,
            bytes_sent = stats.bytes_sent.load(std::sync::atomic::Ordering::Relaxed),
            bytes_received = stats.bytes_received.load(std::sync::atomic::Ordering::Relaxed),
            messages_sent = stats.messages_sent.load(std::sync::atomic::Ordering::Relaxed),
            messages_received = stats.messages_received.load(std::sync::atomic::Ordering::Relaxed),
            "WebSocket bridge closed"
        );
    }
    Ok(())
}

/// Cache lookup, breaker-gated retry loop, upstream call, response-phase
/// plugin execution, compression, and cache admission for one ordinary
/// (non-WebSocket) request. Returns whether the client connection should
/// stay open for another request.
#[allow(clippy::too_many_arguments)]
async fn proxy_and_relay(
    client: &mut TcpStream,
    conn_pool: &Rc<RefCell<ConnPool>>,
    proxy: &Rc<RefCell<ProxyWorker>>,
    breaker: &Arc<crate::breaker::CircuitBreaker>,
    retry_manager: &Arc<crate::retry::RetryManager>,
    node_runtime: &Arc<relay_core::upstream::NodeRuntimeTable>,
    response_cache: &Arc<relay_store::cache::ResponseCache>,
    fallback: &Arc<crate::fallback::FallbackHandler>,
    compression_config: &Arc<compression::CompressionConfig>,
    metrics: &Arc<Aggregator>,
    client_ip: &str,
    route_id: &str,
    mut upstream_addr: String,
    upstream_path: &str,
    method: &str,
    headers: &[(&str, &str)],
    body_data: &[u8],
    max_retries: u32,
    pipeline: Option<Arc<PluginPipeline>>,
    mut ctx: Option<Box<PluginContext>>,
    upstream_req_buf: &mut Vec<u8>,
    upstream_buf: &mut Vec<u8>,
    resp_buf: &mut Vec<u8>,
    req_start: Instant,
    request_timeout_ms: u64,
) -> anyhow::Result<bool> {
    let bytes_in = body_data.len() as u64;
    let cacheable_method = matches!(method.to_ascii_uppercase().as_str(), "GET" | "HEAD");
    let cache_key = cacheable_method
        .then(|| relay_store::cache::ResponseCache::generate_key(method, &format!("{route_id}:{upstream_path}"), &[]));

    if let Some(ref key) = cache_key
        && let Some(entry) = response_cache.get(key, now_ms())
    {
        if let Some(etag) = entry.etag.as_deref()
            && let Some(inm) = header_value(headers, "if-none-match")
            && if_none_match_matches(inm, etag)
        {
            build_response(resp_buf, 304, &[], b"");
            let data = resp_buf.clone();
            let (res, _) = client.write_all(data).await;
            res?;
            metrics.record_request(
                route_id,
                None,
                method,
                304,
                req_start.elapsed().as_millis() as u64,
                bytes_in,
                data.len() as u64,
                None,
            );
            return Ok(true);
        }
        if let Some(lm) = entry.last_modified.as_deref()
            && let Some(ims) = header_value(headers, "if-modified-since")
            && if_modified_since_matches(ims, lm)
        {
            build_response(resp_buf, 304, &[], b"");
            let data = resp_buf.clone();
            let (res, _) = client.write_all(data).await;
            res?;
            metrics.record_request(
                route_id,
                None,
                method,
                304,
                req_start.elapsed().as_millis() as u64,
                bytes_in,
                data.len() as u64,
                None,
            );
            return Ok(true);
        }

        let mut resp_headers = entry.headers.clone();
        resp_headers.push(("x-cache".to_string(), "HIT".to_string()));
        let age_secs = response_cache.age_ms(key, now_ms()).unwrap_or(0) / 1000;
        resp_headers.push(("age".to_string(), age_secs.to_string()));
        build_response(resp_buf, entry.status, &resp_headers, &entry.body);
        let data = resp_buf.clone();
        let (res, _) = client.write_all(data).await;
        res?;
        metrics.record_request(
            route_id,
            None,
            method,
            entry.status,
            req_start.elapsed().as_millis() as u64,
            bytes_in,
            data.len() as u64,
            category_from_status(entry.status),
        );
        return Ok(true);
    }

    // ── Breaker-gated retry loop ──
    let mut attempt: u32 = 1;
    let outcome: Result<(u16, Vec<(String, String)>, Vec<u8>), FallbackError> = loop {
        let state = node_runtime.get_or_init(&upstream_addr);
        let admission = breaker.admit(&state, now_ms() as u32);
        if admission == Admission::Reject {
            break Err(FallbackError::CircuitOpen);
        }

        build_upstream_request(upstream_req_buf, method, upstream_path, headers, body_data);

        let maybe_conn = conn_pool.borrow_mut().take(&upstream_addr);
        let mut upstream = match maybe_conn {
            Some(s) => s,
            None => match new_upstream_conn(&upstream_addr).await {
                Some(s) => s,
                None => {
                    record_failure(breaker, &state, route_id, &upstream_addr, admission);
                    if !retry_manager.should_retry(method, attempt, true) {
                        break Err(FallbackError::Gateway(502));
                    }
                    let remaining = match crate::retry::remaining_budget(req_start, request_timeout_ms) {
                        Some(r) => r,
                        None => break Err(FallbackError::Timeout),
                    };
                    monoio::time::sleep(retry_manager.backoff(attempt).min(remaining)).await;
                    attempt += 1;
                    if let Some(next) = proxy.borrow_mut().select_upstream_node(route_id, client_ip) {
                        upstream_addr = next;
                    }
                    continue;
                }
            },
        };

        let req_data = upstream_req_buf.clone();
        let (res, _) = upstream.write_all(req_data).await;
        if res.is_err() {
            record_failure(breaker, &state, route_id, &upstream_addr, admission);
            if !retry_manager.should_retry(method, attempt, true) {
                break Err(FallbackError::Gateway(502));
            }
            let remaining = match crate::retry::remaining_budget(req_start, request_timeout_ms) {
                Some(r) => r,
                None => break Err(FallbackError::Timeout),
            };
            monoio::time::sleep(retry_manager.backoff(attempt).min(remaining)).await;
            attempt += 1;
            if let Some(next) = proxy.borrow_mut().select_upstream_node(route_id, client_ip) {
                upstream_addr = next;
            }
            continue;
        }

        match read_upstream_response(&mut upstream, client, upstream_buf).await? {
            UpstreamOutcome::Buffered { status, headers, body, keepalive } => {
                record_success(breaker, &state, route_id, &upstream_addr);
                if attempt == 1 {
                    retry_manager.record_clean_success();
                }
                if keepalive {
                    conn_pool.borrow_mut().put(upstream_addr.clone(), upstream);
                }
                break Ok((status, headers, body));
            }
            UpstreamOutcome::StreamedToClient { keepalive } => {
                // Already written straight to the client: no post-processing
                // possible, but still a successful upstream exchange.
                record_success(breaker, &state, route_id, &upstream_addr);
                if attempt == 1 {
                    retry_manager.record_clean_success();
                }
                if keepalive {
                    conn_pool.borrow_mut().put(upstream_addr.clone(), upstream);
                }
                metrics.record_request(
                    route_id,
                    Some(upstream_addr.as_str()),
                    method,
                    200,
                    req_start.elapsed().as_millis() as u64,
                    bytes_in,
                    0,
                    None,
                );
                return Ok(true);
            }
            UpstreamOutcome::Failed => {
                record_failure(breaker, &state, route_id, &upstream_addr, admission);
                if !retry_manager.should_retry(method, attempt, true) {
                    break Err(FallbackError::Timeout);
                }
                let remaining = match crate::retry::remaining_budget(req_start, request_timeout_ms) {
                    Some(r) => r,
                    None => break Err(FallbackError::Timeout),
                };
                monoio::time::sleep(retry_manager.backoff(attempt).min(remaining)).await;
                attempt += 1;
                if let Some(next) = proxy.borrow_mut().select_upstream_node(route_id, client_ip) {
                    upstream_addr = next;
                }
                continue;
            }
        }
    };

    let (status, mut resp_headers, mut body) = match outcome {
        Ok(v) => v,
        Err(err) => {
            let category = fallback_error_category(&err);
            let resp = fallback.get_fallback(route_id, Some(upstream_addr.as_str()), err, now_ms());
            build_response(resp_buf, resp.status, &resp.headers, &resp.body);
            let data = resp_buf.clone();
            let (res, _) = client.write_all(data).await;
            res?;
            metrics.record_request(
                route_id,
                Some(upstream_addr.as_str()),
                method,
                resp.status,
                req_start.elapsed().as_millis() as u64,
                bytes_in,
                data.len() as u64,
                Some(category),
            );
            return Ok(true);
        }
    };

    // ── Response-phase plugins (HeaderFilter, BodyFilter) ──
    if let (Some(pipeline), Some(mut pctx)) = (pipeline, ctx.take()) {
        pctx.response_status = Some(status);
        pctx.response_headers = resp_headers
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.clone()))
            .collect();
        pctx.response_body = Some(body.clone());

        match pipeline.execute_response_phases(&mut pctx) {
            PluginResult::Continue => {
                resp_headers = pctx.response_headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                body = pctx.response_body.clone().unwrap_or(body);
            }
            PluginResult::Response { status: s, headers: h, body: b } => {
                build_response(resp_buf, s, &h, &b.unwrap_or_default());
                let data = resp_buf.clone();
                let (res, _) = client.write_all(data).await;
                res?;
                pipeline.execute_log_phase(&mut pctx);
                metrics.record_request(
                    route_id,
                    Some(upstream_addr.as_str()),
                    method,
                    s,
                    req_start.elapsed().as_millis() as u64,
                    bytes_in,
                    data.len() as u64,
                    category_from_status(s),
                );
                return Ok(true);
            }
            PluginResult::Error(_) => {
                let (res, _) = client.write_all(RESP_502.to_vec()).await;
                res?;
                pipeline.execute_log_phase(&mut pctx);
                metrics.record_request(
                    route_id,
                    Some(upstream_addr.as_str()),
                    method,
                    502,
                    req_start.elapsed().as_millis() as u64,
                    bytes_in,
                    RESP_502.len() as u64,
                    Some(ErrorCategory::Server),
                );
                return Ok(true);
            }
        }

        let final_status = pctx.response_status.unwrap_or(status);
        let content_type = response_header_value(&resp_headers, "content-type").unwrap_or("").to_string();
        let accept_encoding = header_value(headers, "accept-encoding").unwrap_or("");
        apply_compression_and_write(
            client,
            resp_buf,
            compression_config,
            accept_encoding,
            &content_type,
            final_status,
            resp_headers.clone(),
            body.clone(),
        )
        .await?;

        pipeline.execute_log_phase(&mut pctx);

        maybe_cache_response(
            response_cache,
            fallback,
            cache_key,
            route_id,
            &upstream_addr,
            method,
            final_status,
            &resp_headers,
            &body,
        );
        metrics.record_request(
            route_id,
            Some(upstream_addr.as_str()),
            method,
            final_status,
            req_start.elapsed().as_millis() as u64,
            bytes_in,
            resp_buf.len() as u64,
            category_from_status(final_status),
        );
        return Ok(true);
    }

    let content_type = response_header_value(&resp_headers, "content-type").unwrap_or("").to_string();
    let accept_encoding = header_value(headers, "accept-encoding").unwrap_or("");
    apply_compression_and_write(
        client,
        resp_buf,
        compression_config,
        accept_encoding,
        &content_type,
        status,
        resp_headers.clone(),
        body.clone(),
    )
    .await?;

    maybe_cache_response(
        response_cache,
        fallback,
        cache_key,
        route_id,
        &upstream_addr,
        method,
        status,
        &resp_headers,
        &body,
    );

    metrics.record_request(
        route_id,
        Some(upstream_addr.as_str()),
        method,
        status,
        req_start.elapsed().as_millis() as u64,
        bytes_in,
        resp_buf.len() as u64,
        category_from_status(status),
    );

    Ok(true)
}

fn record_success(
    breaker: &crate::breaker::CircuitBreaker,
    state: &relay_core::upstream::NodeRuntimeState,
    upstream_id: &str,
    node: &str,
) {
    breaker.on_success(state, now_ms() as u32);
    health_check::record_passive_outcome(
        upstream_id,
        node,
        state,
        true,
        PASSIVE_HEALTHY_SUCCESSES,
        PASSIVE_UNHEALTHY_FAILURES,
        PASSIVE_GRACE_PERIOD_MS,
    );
}

fn record_failure(
    breaker: &crate::breaker::CircuitBreaker,
    state: &relay_core::upstream::NodeRuntimeState,
    upstream_id: &str,
    node: &str,
    admission: Admission,
) {
    // A HALF_OPEN probe that failed to even connect/write never reached
    // `on_failure`'s HalfOpen arm via a prior `on_success`, so this is the
    // only place that reports the outcome regardless of which admission
    // path was taken.
    let _ = admission;
    breaker.on_failure(state, now_ms() as u32);
    health_check::record_passive_outcome(
        upstream_id,
        node,
        state,
        false,
        PASSIVE_HEALTHY_SUCCESSES,
        PASSIVE_UNHEALTHY_FAILURES,
        PASSIVE_GRACE_PERIOD_MS,
    );
}

/// Negotiate and apply response compression (spec §4.12), then write the
/// final response to the client.
#[allow(clippy::too_many_arguments)]
async fn apply_compression_and_write(
    client: &mut TcpStream,
    resp_buf: &mut Vec<u8>,
    compression_config: &compression::CompressionConfig,
    accept_encoding: &str,
    content_type: &str,
    status: u16,
    mut headers: Vec<(String, String)>,
    mut body: Vec<u8>,
) -> anyhow::Result<()> {
    let encoding = compression::negotiate(accept_encoding);
    if encoding != compression::Encoding::Identity
        && compression::should_compress(compression_config, content_type, body.len())
        && let Ok(compressed) = compression::compress(encoding, &body)
    {
        body = compressed;
        headers.retain(|(k, _)| !k.eq_ignore_ascii_case("content-encoding"));
        if let Some(enc_name) = encoding.as_header_value() {
            headers.push(("content-encoding".to_string(), enc_name.to_string()));
        }
        if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("vary")) {
            headers.push(("vary".to_string(), "Accept-Encoding".to_string()));
        }
    }

    build_response(resp_buf, status, &headers, &body);
    let data = resp_buf.clone();
    let (res, _) = client.write_all(data).await;
    res?;
    Ok(())
}

/// Admit a successful response into the response cache (spec §4.10) and
/// record it as the fallback handler's last-known-good response (spec
/// §4.8), independent of strict HTTP cacheability since the fallback's
/// purpose is "serve something" rather than correctness under `Cache-Control`.
#[allow(clippy::too_many_arguments)]
fn maybe_cache_response(
    response_cache: &relay_store::cache::ResponseCache,
    fallback: &crate::fallback::FallbackHandler,
    cache_key: Option<String>,
    route_id: &str,
    upstream_addr: &str,
    method: &str,
    status: u16,
    headers: &[(String, String)],
    body: &[u8],
) {
    let cache_control = response_header_value(headers, "cache-control");
    if status == 200 {
        fallback.cache_response(
            route_id,
            Some(upstream_addr),
            status,
            headers.to_vec(),
            body.to_vec(),
            now_ms(),
            300_000,
        );
    }

    let Some(key) = cache_key else { return };
    if !is_cacheable(method, status, cache_control) {
        return;
    }
    let ttl = derive_ttl(cache_control, 60);
    let swr = derive_stale_while_revalidate(cache_control);
    let entry = CachedResponse::new(status, headers.to_vec(), body.to_vec(), now_ms(), ttl, swr);
    response_cache.set(key, entry);
}
