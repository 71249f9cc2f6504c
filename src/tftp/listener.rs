//! Write-only TFTP listener bound to one local address.
//!
//! Each accepted WRQ is served on a fresh socket (new TID) bound to the same
//! IP, buffered fully in memory and then handed to the [`BufferStore`] under
//! the requested filename. Read requests are refused.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::packet::{
    ErrorCode, Mode, Packet, PacketError, Request, DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE,
    MAX_PACKET_SIZE, MIN_BLOCK_SIZE,
};
use crate::store::BufferStore;

#[derive(Debug, Clone)]
pub struct ListenerSettings {
    /// Port every listener binds (default: 69)
    pub port: u16,

    /// Wait for each DATA packet before re-sending the last ACK
    pub timeout: Duration,

    /// Re-sends before a transfer is abandoned
    pub retries: u32,

    /// Largest accepted file; bigger uploads get a "disk full" error
    pub max_file_size: usize,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            port: 69,
            timeout: Duration::from_secs(5),
            retries: 5,
            max_file_size: 16 * 1024 * 1024,
        }
    }
}

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("could not bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("receive failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("bad packet: {0}")]
    Packet(#[from] PacketError),
    #[error("no DATA for block {block} after {attempts} attempts")]
    Timeout { block: u16, attempts: u32 },
    #[error("file exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("client sent error {code:?}: {message}")]
    Remote { code: ErrorCode, message: String },
    #[error("unexpected {0}")]
    Unexpected(String),
}

pub struct Listener {
    socket: UdpSocket,
    store: BufferStore,
    settings: ListenerSettings,
    shutdown: CancellationToken,
}

impl Listener {
    pub async fn bind(
        addr: SocketAddr,
        store: BufferStore,
        settings: ListenerSettings,
        shutdown: CancellationToken,
    ) -> Result<Self, ListenerError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| ListenerError::Bind { addr, source })?;
        Ok(Self {
            socket,
            store,
            settings,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serves requests until the shutdown token fires.
    ///
    /// Transfers already in progress keep running after this returns.
    pub async fn run(self) -> Result<(), ListenerError> {
        let local = self.socket.local_addr()?;
        info!(address = %local, "TFTP listener started");

        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            let received = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!(address = %local, "TFTP listener stopped");
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buf) => received,
            };
            let (len, peer) = match received {
                Ok(r) => r,
                // ICMP unreachable from an earlier reply can surface here
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e.into()),
            };

            match Packet::parse(&buf[..len]) {
                Ok(Packet::Wrq(request)) => {
                    debug!(%peer, filename = %request.filename, mode = request.mode.as_str(), "WRQ");
                    let store = self.store.clone();
                    let settings = self.settings.clone();
                    tokio::spawn(async move {
                        let filename = request.filename.clone();
                        match receive_file(local.ip(), peer, request, store, settings).await {
                            Ok(size) => info!(%peer, %filename, size, "Received file"),
                            Err(e) => warn!(%peer, %filename, error = %e, "Transfer failed"),
                        }
                    });
                }
                Ok(Packet::Rrq(request)) => {
                    debug!(%peer, filename = %request.filename, "Refusing RRQ");
                    let reply = Packet::error(ErrorCode::AccessViolation, "reads are not served");
                    self.reply(&reply, peer).await;
                }
                Ok(other) => {
                    debug!(%peer, opcode = ?other.opcode(), "Ignoring packet without transfer");
                }
                Err(e) => {
                    debug!(%peer, error = %e, "Malformed request");
                    self.reply(&Packet::error(ErrorCode::IllegalOperation, e.to_string()), peer)
                        .await;
                }
            }
        }
    }

    async fn reply(&self, packet: &Packet, peer: SocketAddr) {
        if let Err(e) = self.socket.send_to(&packet.encode(), peer).await {
            debug!(%peer, error = %e, "Could not send reply");
        }
    }
}

struct Negotiated {
    block_size: usize,
    transfer_size: Option<u64>,
    /// Options echoed in the OACK; empty means plain ACK 0
    accepted: Vec<(String, String)>,
}

/// Accepts `blksize` and `tsize`; anything else is left out of the OACK.
fn negotiate(options: &[(String, String)]) -> Negotiated {
    let mut negotiated = Negotiated {
        block_size: DEFAULT_BLOCK_SIZE,
        transfer_size: None,
        accepted: Vec::new(),
    };
    for (name, value) in options {
        match name.as_str() {
            "blksize" => {
                if let Ok(size) = value.parse::<usize>() {
                    if size >= MIN_BLOCK_SIZE {
                        let size = size.min(MAX_BLOCK_SIZE);
                        negotiated.block_size = size;
                        negotiated.accepted.push((name.clone(), size.to_string()));
                    }
                }
            }
            "tsize" => {
                if let Ok(size) = value.parse::<u64>() {
                    negotiated.transfer_size = Some(size);
                    negotiated.accepted.push((name.clone(), size.to_string()));
                }
            }
            _ => {}
        }
    }
    negotiated
}

async fn receive_file(
    local_ip: IpAddr,
    peer: SocketAddr,
    request: Request,
    store: BufferStore,
    settings: ListenerSettings,
) -> Result<usize, TransferError> {
    let socket = UdpSocket::bind(SocketAddr::new(local_ip, 0)).await?;
    socket.connect(peer).await?;

    let negotiated = negotiate(&request.options);
    if let Some(size) = negotiated.transfer_size {
        if size > settings.max_file_size as u64 {
            abort(&socket, ErrorCode::DiskFull, "file too large").await;
            return Err(TransferError::TooLarge {
                limit: settings.max_file_size,
            });
        }
    }

    let block_size = negotiated.block_size;
    let first = if negotiated.accepted.is_empty() {
        Packet::Ack { block: 0 }
    } else {
        Packet::Oack {
            options: negotiated.accepted,
        }
    };
    let mut last = first.encode();
    socket.send(&last).await?;

    let mut data = Vec::new();
    let mut expected: u16 = 1;
    let mut attempts = 0u32;
    let mut buf = vec![0u8; block_size + 4];

    loop {
        let len = match timeout(settings.timeout, socket.recv(&mut buf)).await {
            Ok(received) => received?,
            Err(_) => {
                attempts += 1;
                if attempts > settings.retries {
                    return Err(TransferError::Timeout {
                        block: expected,
                        attempts,
                    });
                }
                socket.send(&last).await?;
                continue;
            }
        };

        match Packet::parse(&buf[..len])? {
            Packet::Data { block, payload } if block == expected => {
                attempts = 0;
                if data.len() + payload.len() > settings.max_file_size {
                    abort(&socket, ErrorCode::DiskFull, "file too large").await;
                    return Err(TransferError::TooLarge {
                        limit: settings.max_file_size,
                    });
                }
                data.extend_from_slice(&payload);
                last = Packet::Ack { block }.encode();
                if payload.len() < block_size {
                    break;
                }
                socket.send(&last).await?;
                expected = expected.wrapping_add(1);
            }
            Packet::Data { block, .. } if block == expected.wrapping_sub(1) => {
                // Our ACK was lost
                socket.send(&Packet::Ack { block }.encode()).await?;
            }
            Packet::Data { block, .. } => {
                abort(&socket, ErrorCode::IllegalOperation, "out of order block").await;
                return Err(TransferError::Unexpected(format!(
                    "block {block}, expected {expected}"
                )));
            }
            Packet::Error { code, message } => {
                return Err(TransferError::Remote { code, message });
            }
            other => {
                abort(&socket, ErrorCode::IllegalOperation, "expected DATA").await;
                return Err(TransferError::Unexpected(format!("{:?}", other.opcode())));
            }
        }
    }

    if request.mode == Mode::Netascii {
        data = netascii_decode(&data);
    }
    let size = data.len();
    store.put(request.filename, data);
    // The final ACK goes out only once the payload is visible in the store.
    socket.send(&last).await?;
    dally(&socket, &mut buf, &last, expected, settings.timeout).await;
    Ok(size)
}

/// Keeps the transfer socket open for one timeout after the final ACK and
/// answers a repeated final block, in case that ACK was lost.
async fn dally(
    socket: &UdpSocket,
    buf: &mut [u8],
    ack: &[u8],
    final_block: u16,
    wait: Duration,
) {
    let deadline = Instant::now() + wait;
    while let Ok(received) = timeout_at(deadline, socket.recv(buf)).await {
        let len = match received {
            Ok(len) => len,
            Err(e) => {
                debug!(error = %e, "Receive failed while dallying");
                return;
            }
        };
        if let Ok(Packet::Data { block, .. }) = Packet::parse(&buf[..len]) {
            if block == final_block {
                debug!(block, "Final block repeated, re-sending ACK");
                if let Err(e) = socket.send(ack).await {
                    debug!(error = %e, "Could not re-send final ACK");
                    return;
                }
            }
        }
    }
}

async fn abort(socket: &UdpSocket, code: ErrorCode, message: &str) {
    if let Err(e) = socket.send(&Packet::error(code, message).encode()).await {
        debug!(error = %e, "Could not send error packet");
    }
}

/// Converts netascii line endings: CR LF becomes LF and CR NUL becomes CR.
fn netascii_decode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter().copied().peekable();
    while let Some(byte) = iter.next() {
        if byte == b'\r' {
            match iter.peek() {
                Some(b'\n') => {
                    iter.next();
                    out.push(b'\n');
                    continue;
                }
                Some(0) => {
                    iter.next();
                }
                _ => {}
            }
        }
        out.push(byte);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tftp::testing::{push, PushOptions};

    async fn spawn_listener(
        settings: ListenerSettings,
    ) -> (SocketAddr, BufferStore, CancellationToken) {
        let store = BufferStore::new();
        let shutdown = CancellationToken::new();
        let listener = Listener::bind(
            "127.0.0.1:0".parse().unwrap(),
            store.clone(),
            settings,
            shutdown.clone(),
        )
        .await
        .unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(listener.run());
        (addr, store, shutdown)
    }

    async fn wait_for(store: &BufferStore, key: &str) -> Option<Vec<u8>> {
        for _ in 0..100 {
            if let Some(buf) = store.snapshot().remove(key) {
                return Some(buf);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    #[tokio::test]
    async fn test_receives_multi_block_file() {
        let (addr, store, shutdown) = spawn_listener(ListenerSettings::default()).await;
        let payload: Vec<u8> = (0..1300u32).map(|i| (i % 251) as u8).collect();

        push(addr, "abc", &payload, PushOptions::default()).await.unwrap();

        assert_eq!(wait_for(&store, "abc").await.unwrap(), payload);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_block_multiple_needs_empty_final_block() {
        let (addr, store, shutdown) = spawn_listener(ListenerSettings::default()).await;
        let payload = vec![7u8; 1024];

        push(addr, "even", &payload, PushOptions::default()).await.unwrap();

        assert_eq!(wait_for(&store, "even").await.unwrap().len(), 1024);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_negotiates_block_size() {
        let (addr, store, shutdown) = spawn_listener(ListenerSettings::default()).await;
        let payload = vec![1u8; 3000];
        let options = PushOptions {
            block_size: Some(1024),
            ..PushOptions::default()
        };

        let negotiated = push(addr, "big", &payload, options).await.unwrap();

        assert_eq!(negotiated, 1024);
        assert_eq!(wait_for(&store, "big").await.unwrap(), payload);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_netascii_line_endings() {
        let (addr, store, shutdown) = spawn_listener(ListenerSettings::default()).await;
        let options = PushOptions {
            mode: Mode::Netascii,
            ..PushOptions::default()
        };

        push(addr, "text", b"a\r\nb\r\0c\r\n", options).await.unwrap();

        assert_eq!(wait_for(&store, "text").await.unwrap(), b"a\nb\rc\n");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_rejects_oversized_file() {
        let settings = ListenerSettings {
            max_file_size: 600,
            ..ListenerSettings::default()
        };
        let (addr, store, shutdown) = spawn_listener(settings).await;

        let err = push(addr, "huge", &vec![0u8; 2000], PushOptions::default())
            .await
            .unwrap_err();

        assert!(err.contains("DiskFull"), "{err}");
        assert!(store.is_empty());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_refuses_read_requests() {
        let (addr, _store, shutdown) = spawn_listener(ListenerSettings::default()).await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let rrq = Packet::Rrq(Request {
            filename: "startup-config".to_string(),
            mode: Mode::Octet,
            options: Vec::new(),
        });
        socket.send_to(&rrq.encode(), addr).await.unwrap();

        let mut buf = [0u8; 512];
        let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            Packet::parse(&buf[..len]).unwrap(),
            Packet::Error {
                code: ErrorCode::AccessViolation,
                ..
            }
        ));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_run_returns_on_shutdown() {
        let shutdown = CancellationToken::new();
        let listener = Listener::bind(
            "127.0.0.1:0".parse().unwrap(),
            BufferStore::new(),
            ListenerSettings::default(),
            shutdown.clone(),
        )
        .await
        .unwrap();
        let handle = tokio::spawn(listener.run());

        shutdown.cancel();

        let result = timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_repeated_final_block_is_acked_again() {
        let settings = ListenerSettings {
            timeout: Duration::from_millis(500),
            ..ListenerSettings::default()
        };
        let (addr, store, shutdown) = spawn_listener(settings).await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut buf = [0u8; 512];

        let wrq = Packet::Wrq(Request {
            filename: "lost-ack".to_string(),
            mode: Mode::Octet,
            options: Vec::new(),
        });
        socket.send_to(&wrq.encode(), addr).await.unwrap();
        let (len, tid) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Packet::parse(&buf[..len]).unwrap(), Packet::Ack { block: 0 });

        let data = Packet::Data {
            block: 1,
            payload: bytes::Bytes::from_static(b"hostname sw1\n"),
        }
        .encode();
        // The device never saw the first ACK 1 and sends the block again
        for _ in 0..2 {
            socket.send_to(&data, tid).await.unwrap();
            let (len, from) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(from, tid);
            assert_eq!(Packet::parse(&buf[..len]).unwrap(), Packet::Ack { block: 1 });
        }

        assert_eq!(wait_for(&store, "lost-ack").await.unwrap(), b"hostname sw1\n");
        shutdown.cancel();
    }

    #[test]
    fn test_negotiate_clamps_and_filters() {
        let options = vec![
            ("blksize".to_string(), "100000".to_string()),
            ("timeout".to_string(), "3".to_string()),
            ("tsize".to_string(), "42".to_string()),
        ];
        let n = negotiate(&options);
        assert_eq!(n.block_size, MAX_BLOCK_SIZE);
        assert_eq!(n.transfer_size, Some(42));
        assert_eq!(n.accepted.len(), 2);

        let n = negotiate(&[("blksize".to_string(), "4".to_string())]);
        assert_eq!(n.block_size, DEFAULT_BLOCK_SIZE);
        assert!(n.accepted.is_empty());
    }
}
