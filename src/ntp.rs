use crate::clock::{NetworkTimeSource, TimeSourceError};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const NTP_PACKET_LEN: usize = 48;
/// Seconds from 1900-01-01 (NTP era 0) to 1970-01-01.
pub const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

const LI_VN_MODE_CLIENT: u8 = 0x23; // LI 0, version 4, mode 3
const MODE_SERVER: u8 = 4;
const TRANSMIT_OFFSET: usize = 40;

pub fn encode_request() -> [u8; NTP_PACKET_LEN] {
    let mut packet = [0u8; NTP_PACKET_LEN];
    packet[0] = LI_VN_MODE_CLIENT;
    packet
}

/// Unix seconds carried in the transmit timestamp of a server reply.
pub fn decode_reply(packet: &[u8]) -> Result<u64, TimeSourceError> {
    if packet.len() < NTP_PACKET_LEN {
        return Err(TimeSourceError::Malformed("short packet"));
    }
    if packet[0] & 0x07 != MODE_SERVER {
        return Err(TimeSourceError::Malformed("not a server reply"));
    }
    if packet[1] == 0 {
        return Err(TimeSourceError::Malformed("kiss-o'-death"));
    }
    let seconds = u32::from_be_bytes([
        packet[TRANSMIT_OFFSET],
        packet[TRANSMIT_OFFSET + 1],
        packet[TRANSMIT_OFFSET + 2],
        packet[TRANSMIT_OFFSET + 3],
    ]);
    u64::from(seconds)
        .checked_sub(NTP_UNIX_OFFSET)
        .filter(|unix| *unix > 0)
        .ok_or(TimeSourceError::Malformed("transmit timestamp before 1970"))
}

/// Shift a UTC epoch to local time; out-of-range results clamp to zero so the
/// range check rejects them.
pub fn to_local(utc: u64, utc_offset_s: i64) -> u64 {
    utc.checked_add_signed(utc_offset_s).unwrap_or(0)
}

async fn query(server: &str, timeout: Duration) -> Result<u64, TimeSourceError> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| TimeSourceError::Io(e.to_string()))?;
    socket
        .connect(server)
        .await
        .map_err(|e| TimeSourceError::Io(e.to_string()))?;
    socket
        .send(&encode_request())
        .await
        .map_err(|e| TimeSourceError::Io(e.to_string()))?;
    let mut buf = [0u8; NTP_PACKET_LEN];
    let len = tokio::time::timeout(timeout, socket.recv(&mut buf))
        .await
        .map_err(|_| TimeSourceError::NoReply)?
        .map_err(|e| TimeSourceError::Io(e.to_string()))?;
    decode_reply(&buf[..len])
}

/// Network time source backed by a UDP worker task. Each request carries a
/// sequence number that the worker echoes; replies to superseded requests are
/// dropped.
#[derive(Debug)]
pub struct SntpClient {
    requests: mpsc::UnboundedSender<u32>,
    replies: mpsc::UnboundedReceiver<(u32, Result<u64, TimeSourceError>)>,
    current: Option<u32>,
    next_sequence: u32,
    utc_offset_s: i64,
}

impl SntpClient {
    pub fn spawn(server: String, timeout: Duration, utc_offset_s: i64) -> (Self, JoinHandle<()>) {
        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<u32>();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(async move {
            while let Some(sequence) = request_rx.recv().await {
                let reply = query(&server, timeout).await;
                match &reply {
                    Ok(unix) => debug!("{} answered {} (request {})", server, unix, sequence),
                    Err(e) => warn!("time query {} to {} failed: {}", sequence, server, e),
                }
                if reply_tx.send((sequence, reply)).is_err() {
                    break;
                }
            }
        });
        let client = Self {
            requests: request_tx,
            replies: reply_rx,
            current: None,
            next_sequence: 0,
            utc_offset_s,
        };
        (client, worker)
    }
}

impl NetworkTimeSource for SntpClient {
    fn request(&mut self) -> Result<(), TimeSourceError> {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.current = Some(sequence);
        self.requests
            .send(sequence)
            .map_err(|_| TimeSourceError::Unavailable)
    }

    fn poll(&mut self) -> nb::Result<u64, TimeSourceError> {
        loop {
            match self.replies.try_recv() {
                Ok((sequence, reply)) => {
                    if self.current != Some(sequence) {
                        debug!("dropping reply to superseded time request {}", sequence);
                        continue;
                    }
                    self.current = None;
                    return match reply {
                        Ok(utc) => Ok(to_local(utc, self.utc_offset_s)),
                        Err(e) => Err(nb::Error::Other(e)),
                    };
                }
                Err(mpsc::error::TryRecvError::Empty) => return Err(nb::Error::WouldBlock),
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return Err(nb::Error::Other(TimeSourceError::Unavailable))
                }
            }
        }
    }
}
