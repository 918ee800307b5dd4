//! WebSocket upgrade relay (spec §4.14): detect the handshake, let it pass
//! through like any other request/response, then splice raw bytes in both
//! directions once the upstream confirms the upgrade. A heartbeat task
//! pings the upstream at a configured interval and per-connection counters
//! track bytes, messages, start-time and last-activity.
//!
//! Grounded on `connection.rs`'s raw-byte-buffer idioms (manual buffer
//! reuse, `monoio::io::{AsyncReadRent, AsyncWriteRentExt}`) — the splice
//! loop here is the same read/write-all pattern, just without HTTP parsing
//! once the tunnel is established. The shared write handle for heartbeat +
//! data pump follows the same `Rc<RefCell<_>>` single-thread sharing
//! `worker.rs`/`proxy.rs` already use for per-core state, since monoio tasks
//! are not `Send` and never need to be.

use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::TcpStream;
use monoio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Per-connection counters for a spliced WebSocket bridge (spec §4.14).
/// Cheap to share across the two pump tasks and the heartbeat task via
/// `Rc` since all three run on the same monoio thread.
pub struct ConnectionStats {
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    started_at: Instant,
    last_activity_ms: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            started_at: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        })
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(self.started_at.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Elapsed time since the last byte moved in either direction.
    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        self.started_at.elapsed().saturating_sub(Duration::from_millis(last))
    }
}

/// Does this request ask to switch protocols to a WebSocket?
pub fn is_upgrade_request(headers: &[(&str, &str)]) -> bool {
    let mut connection_upgrade = false;
    let mut upgrade_websocket = false;
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("connection") {
            connection_upgrade = value
                .split(',')
                .any(|tok| tok.trim().eq_ignore_ascii_case("upgrade"));
        } else if name.eq_ignore_ascii_case("upgrade") {
            upgrade_websocket = value.eq_ignore_ascii_case("websocket");
        }
    }
    connection_upgrade && upgrade_websocket
}

/// Did the upstream accept the protocol switch?
pub fn is_upgrade_response(status: u16) -> bool {
    status == 101
}

/// A minimal WS ping frame: FIN=1, opcode=0x9 (ping), zero-length payload,
/// masked. Frames sent by a WebSocket client must be masked per RFC 6455
/// §5.1; this gateway is the client from the upstream's point of view since
/// it initiated the connection, so the heartbeat frame needs a mask key
/// even though an empty payload makes the masking a no-op.
fn build_ping_frame() -> [u8; 6] {
    let mask: [u8; 4] = rand::random();
    [0x89, 0x80, mask[0], mask[1], mask[2], mask[3]]
}

/// Copy bytes from `src` to `dst` until EOF or error, accumulating byte and
/// message counts into `stats` (directionally: `client_to_upstream` picks
/// `bytes_received`/`messages_received`, the other direction picks
/// `bytes_sent`/`messages_sent` — "sent"/"received" are from the client's
/// point of view). This gateway never parses WS frame boundaries, so a
/// "message" here is one read syscall's worth of bytes, which in practice
/// lines up with one frame for the small control/text frames a heartbeat or
/// chat-style payload produces. Sets `closed` on exit so the heartbeat task
/// knows to stop. One half of a bidirectional splice; run two of these
/// concurrently.
async fn pump(
    mut src: OwnedReadHalf,
    dst: Rc<RefCell<OwnedWriteHalf>>,
    stats: Rc<ConnectionStats>,
    closed: Rc<Cell<bool>>,
    client_to_upstream: bool,
) {
    let mut buf = vec![0u8; 16384];
    loop {
        let (res, returned) = src.read(buf).await;
        buf = returned;
        let n = match res {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if client_to_upstream {
            stats.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
            stats.messages_received.fetch_add(1, Ordering::Relaxed);
        } else {
            stats.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
            stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        }
        stats.touch();
        let chunk = buf[..n].to_vec();
        let (res, _) = dst.borrow_mut().write_all(chunk).await;
        if res.is_err() {
            break;
        }
    }
    let _ = dst.borrow_mut().shutdown().await;
    closed.set(true);
}

/// Send a ping frame to `upstream_w` every `interval` until a write fails or
/// `closed` is set by a data pump, at which point the bridge is done.
async fn heartbeat(upstream_w: Rc<RefCell<OwnedWriteHalf>>, interval: Duration, closed: Rc<Cell<bool>>) {
    if interval.is_zero() {
        return;
    }
    loop {
        monoio::time::sleep(interval).await;
        if closed.get() {
            break;
        }
        let (res, _) = upstream_w.borrow_mut().write_all(build_ping_frame().to_vec()).await;
        if res.is_err() {
            closed.set(true);
            break;
        }
    }
}

/// Once both sides have completed the HTTP upgrade handshake, hand the raw
/// sockets here: it splices bytes in both directions until either side
/// closes, with no further HTTP parsing, while a heartbeat task pings the
/// upstream and the returned stats accumulate per-connection counters.
pub async fn splice_bidirectional(client: TcpStream, upstream: TcpStream, ping_interval: Duration) -> Rc<ConnectionStats> {
    let stats = ConnectionStats::new();
    let closed = Rc::new(Cell::new(false));
    let (client_r, client_w) = client.into_split();
    let (upstream_r, upstream_w) = upstream.into_split();

    let client_w = Rc::new(RefCell::new(client_w));
    let upstream_w = Rc::new(RefCell::new(upstream_w));

    let client_to_upstream = monoio::spawn(pump(
        client_r,
        upstream_w.clone(),
        stats.clone(),
        closed.clone(),
        true,
    ));
    let upstream_to_client = monoio::spawn(pump(upstream_r, client_w, stats.clone(), closed.clone(), false));
    monoio::spawn(heartbeat(upstream_w, ping_interval, closed.clone()));

    let _ = client_to_upstream.await;
    let _ = upstream_to_client.await;
    closed.set(true);
    stats
}
