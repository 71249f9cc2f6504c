//! Minimal TFTP write client used by tests to play the device side.

use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use super::packet::{Mode, Packet, Request, DEFAULT_BLOCK_SIZE};

#[derive(Debug, Clone)]
pub struct PushOptions {
    pub mode: Mode,
    pub block_size: Option<usize>,
}

impl Default for PushOptions {
    fn default() -> Self {
        Self {
            mode: Mode::Octet,
            block_size: None,
        }
    }
}

/// Uploads `data` as `filename` and returns the block size that was used.
pub async fn push(
    server: SocketAddr,
    filename: &str,
    data: &[u8],
    options: PushOptions,
) -> Result<usize, String> {
    let socket = UdpSocket::bind(SocketAddr::new(server.ip(), 0))
        .await
        .map_err(|e| e.to_string())?;

    let mut request_options = Vec::new();
    if let Some(size) = options.block_size {
        request_options.push(("blksize".to_string(), size.to_string()));
    }
    let wrq = Packet::Wrq(Request {
        filename: filename.to_string(),
        mode: options.mode,
        options: request_options,
    })
    .encode();

    let mut buf = vec![0u8; 65536];
    let mut first = None;
    // The listener may still be binding; keep re-sending the WRQ.
    for _ in 0..50 {
        socket.send_to(&wrq, server).await.map_err(|e| e.to_string())?;
        if let Ok(Ok((len, tid))) =
            timeout(Duration::from_millis(100), socket.recv_from(&mut buf)).await
        {
            let reply = Packet::parse(&buf[..len]).map_err(|e| e.to_string())?;
            first = Some((reply, tid));
            break;
        }
    }
    let (reply, tid) = first.ok_or_else(|| "no reply to WRQ".to_string())?;

    let block_size = match reply {
        Packet::Ack { block: 0 } => DEFAULT_BLOCK_SIZE,
        Packet::Oack { options } => options
            .iter()
            .find(|(name, _)| name == "blksize")
            .and_then(|(_, value)| value.parse().ok())
            .unwrap_or(DEFAULT_BLOCK_SIZE),
        Packet::Error { code, message } => return Err(format!("{code:?}: {message}")),
        other => return Err(format!("unexpected reply {other:?}")),
    };
    socket.connect(tid).await.map_err(|e| e.to_string())?;

    let mut block: u16 = 1;
    let mut offset = 0;
    loop {
        let end = (offset + block_size).min(data.len());
        let chunk = &data[offset..end];
        let packet = Packet::Data {
            block,
            payload: Bytes::copy_from_slice(chunk),
        };
        socket.send(&packet.encode()).await.map_err(|e| e.to_string())?;

        let len = timeout(Duration::from_secs(2), socket.recv(&mut buf))
            .await
            .map_err(|_| format!("no ACK for block {block}"))?
            .map_err(|e| e.to_string())?;
        match Packet::parse(&buf[..len]).map_err(|e| e.to_string())? {
            Packet::Ack { block: acked } if acked == block => {}
            Packet::Error { code, message } => return Err(format!("{code:?}: {message}")),
            other => return Err(format!("unexpected reply {other:?}")),
        }

        offset = end;
        if chunk.len() < block_size {
            return Ok(block_size);
        }
        block = block.wrapping_add(1);
    }
}
