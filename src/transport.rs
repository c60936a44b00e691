//! # Transport Layer
//!
//! Every physical link the drive is reachable over (RTU serial ports, the
//! Ethernet/TCP peer, CAN or USB framers) presents the same contract to the
//! dispatcher: hand over a received PDU together with the context needed to
//! address the reply, and accept a reply PDU for that context.
//!
//! ## Supported Transports
//!
//! - [`crate::rtu::RtuPort`]: silence-timed RTU framing with CRC16
//! - [`crate::tcp::TcpPeer`]: Modbus TCP (MBAP header) over a socket listener
//! - [`ChannelTransport`]: in-memory PDU queue, used for packet-oriented links
//!   whose own framing already delimits PDUs
//!
//! ## Usage Example
//!
//! ```rust
//! use servo_modbus::transport::{ChannelTransport, Transport, TransportId};
//!
//! let (mut transport, mut peer) = ChannelTransport::pair(TransportId::USB);
//! peer.send_request(vec![0x03, 0x00, 0x00, 0x00, 0x01]).unwrap();
//!
//! let received = transport.receive().expect("queued request");
//! transport.send(&received.context, &[0x83, 0x03]).unwrap();
//! assert_eq!(peer.try_recv_reply().unwrap().1, vec![0x83, 0x03]);
//! ```

use std::fmt;
use tokio::sync::mpsc;
use tracing::info;

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{SlaveId, MAX_PDU_SIZE};

/// Format raw bytes as hex string for packet logging
pub(crate) fn format_hex_packet(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Log packet with direction and format
pub(crate) fn log_packet(direction: &str, data: &[u8], protocol: &str, unit_id: Option<u8>) {
    let hex_string = format_hex_packet(data);
    match unit_id {
        Some(id) => info!("[MODBUS-{}] {} unit:{} {}", protocol, direction, id, hex_string),
        None => info!("[MODBUS-{}] {} {}", protocol, direction, hex_string),
    }
}

/// Identity of a transport, one bit of the enable mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportId(u8);

impl TransportId {
    /// First RTU serial port
    pub const RTU0: TransportId = TransportId(0x01);
    /// Second RTU serial port
    pub const RTU1: TransportId = TransportId(0x02);
    /// Ethernet (Modbus TCP)
    pub const ETHERNET: TransportId = TransportId(0x04);
    /// CAN framer
    pub const CAN: TransportId = TransportId(0x08);
    /// USB framer
    pub const USB: TransportId = TransportId(0x10);

    /// RTU port id by index (0 or 1)
    pub fn rtu(index: usize) -> Option<TransportId> {
        match index {
            0 => Some(Self::RTU0),
            1 => Some(Self::RTU1),
            _ => None,
        }
    }

    /// Bit of this transport in the enable mask
    pub fn bit(self) -> u8 {
        self.0
    }

    /// Short name used in logs
    pub fn name(self) -> &'static str {
        match self.0 {
            0x01 => "RTU0",
            0x02 => "RTU1",
            0x04 => "ETH",
            0x08 => "CAN",
            0x10 => "USB",
            _ => "UNKNOWN",
        }
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-request state needed to address the reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportContext {
    /// Transport the request arrived on; the reply goes back through it only
    pub transport: TransportId,
    /// Slave/unit address exactly as received
    pub unit_id: SlaveId,
    /// Request was addressed to the broadcast address
    pub broadcast: bool,
    /// Transport-specific correlation value (TCP connection and transaction id)
    pub tag: u64,
}

/// A validated PDU handed to the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPdu {
    pub pdu: Vec<u8>,
    pub context: TransportContext,
}

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub frames_received: u64,
    pub replies_sent: u64,
    pub crc_errors: u64,
    pub address_mismatches: u64,
    pub framing_errors: u64,
    pub overruns: u64,
    pub broadcasts_suppressed: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

/// Receive/send PDU contract shared by every transport
///
/// Both methods are called from the single polling task; implementations that
/// receive in interrupt or async context hand frames over through their own
/// mailbox.
pub trait Transport: Send {
    /// Identity (enable-mask bit) of this transport
    fn id(&self) -> TransportId;

    /// Lowest board revision this transport exists on
    fn min_hardware_revision(&self) -> u8 {
        0
    }

    /// Take the next complete, validated request PDU if one is ready
    fn receive(&mut self) -> Option<ReceivedPdu>;

    /// Send a reply PDU for a request received on this transport
    fn send(&mut self, context: &TransportContext, pdu: &[u8]) -> ModbusResult<()>;

    /// Snapshot of the transport counters
    fn stats(&self) -> TransportStats;
}

/// In-memory transport for links that already deliver whole PDUs
pub struct ChannelTransport {
    id: TransportId,
    requests: mpsc::UnboundedReceiver<Vec<u8>>,
    replies: mpsc::UnboundedSender<(u64, Vec<u8>)>,
    sequence: u64,
    stats: TransportStats,
}

/// Master-side handle of a [`ChannelTransport`]
pub struct ChannelPeer {
    requests: mpsc::UnboundedSender<Vec<u8>>,
    replies: mpsc::UnboundedReceiver<(u64, Vec<u8>)>,
}

impl ChannelTransport {
    /// Create a transport and the peer handle that feeds it
    pub fn pair(id: TransportId) -> (ChannelTransport, ChannelPeer) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let transport = ChannelTransport {
            id,
            requests: request_rx,
            replies: reply_tx,
            sequence: 0,
            stats: TransportStats::default(),
        };
        let peer = ChannelPeer { requests: request_tx, replies: reply_rx };
        (transport, peer)
    }
}

impl Transport for ChannelTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn receive(&mut self) -> Option<ReceivedPdu> {
        loop {
            let pdu = self.requests.try_recv().ok()?;
            if pdu.is_empty() || pdu.len() > MAX_PDU_SIZE {
                self.stats.framing_errors += 1;
                continue;
            }
            self.stats.frames_received += 1;
            self.stats.bytes_received += pdu.len() as u64;
            self.sequence = self.sequence.wrapping_add(1);
            let context = TransportContext {
                transport: self.id,
                unit_id: 0,
                broadcast: false,
                tag: self.sequence,
            };
            return Some(ReceivedPdu { pdu, context });
        }
    }

    fn send(&mut self, context: &TransportContext, pdu: &[u8]) -> ModbusResult<()> {
        self.replies
            .send((context.tag, pdu.to_vec()))
            .map_err(|_| ModbusError::connection(format!("{} peer closed", self.id)))?;
        self.stats.replies_sent += 1;
        self.stats.bytes_sent += pdu.len() as u64;
        Ok(())
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

impl ChannelPeer {
    /// Queue a request PDU
    pub fn send_request(&self, pdu: Vec<u8>) -> ModbusResult<()> {
        self.requests
            .send(pdu)
            .map_err(|_| ModbusError::connection("Channel transport dropped"))
    }

    /// Take a reply `(sequence, pdu)` if one is ready
    pub fn try_recv_reply(&mut self) -> Option<(u64, Vec<u8>)> {
        self.replies.try_recv().ok()
    }

    /// Wait for the next reply
    pub async fn recv_reply(&mut self) -> Option<(u64, Vec<u8>)> {
        self.replies.recv().await
    }
}
