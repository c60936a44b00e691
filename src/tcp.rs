//! Modbus TCP peer (Ethernet transport).
//!
//! Accepts master connections on a socket listener and turns every MBAP
//! framed request into a [`ReceivedPdu`] for the polling dispatcher. Replies
//! are routed back to the connection and transaction they answer through the
//! context tag: `(connection_id << 16) | transaction_id`.
//!
//! MBAP header: `[transaction:2][protocol:2 = 0][length:2][unit:1]`, where
//! `length` counts the unit byte and the PDU.

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::TcpPeerConfig;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::MAX_PDU_SIZE;
use crate::transport::{log_packet, ReceivedPdu, Transport, TransportContext, TransportId, TransportStats};

/// MBAP header size including the unit identifier
pub const MBAP_HEADER_SIZE: usize = 7;

/// Largest Modbus TCP frame
pub const MAX_TCP_FRAME_SIZE: usize = MBAP_HEADER_SIZE + MAX_PDU_SIZE;

/// How long a closing connection waits for replies to requests it already forwarded
pub const REPLY_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

struct Inbound {
    connection: u64,
    transaction_id: u16,
    unit_id: u8,
    pdu: Vec<u8>,
}

#[derive(Default)]
struct PeerCounters {
    connections: AtomicU64,
    frames_received: AtomicU64,
    framing_errors: AtomicU64,
    replies_sent: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

type ConnectionMap = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<Vec<u8>>>>>;

/// Build an MBAP frame around a PDU
pub fn encode_frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(MBAP_HEADER_SIZE + pdu.len());
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes());
    frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
    frame.push(unit_id);
    frame.extend_from_slice(pdu);
    frame
}

/// Ethernet transport serving Modbus TCP masters
pub struct TcpPeer {
    config: TcpPeerConfig,
    local_addr: SocketAddr,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    connections: ConnectionMap,
    counters: Arc<PeerCounters>,
    shutdown_tx: broadcast::Sender<()>,
    accept_task: Option<JoinHandle<()>>,
    packet_logging: bool,
}

impl TcpPeer {
    /// Bind the listener and start accepting connections
    pub async fn bind(config: &TcpPeerConfig, packet_logging: bool) -> ModbusResult<Self> {
        let listener = TcpListener::bind(config.bind_address)
            .await
            .map_err(|e| ModbusError::connection(format!("Failed to bind to {}: {}", config.bind_address, e)))?;
        let local_addr = listener.local_addr()?;

        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);
        let connections: ConnectionMap = Arc::new(Mutex::new(HashMap::new()));
        let counters = Arc::new(PeerCounters::default());

        info!(
            "Modbus TCP peer listening on {} (max {} connections, timeout {:?})",
            local_addr,
            config.max_connections,
            config.request_timeout()
        );

        let accept_task = tokio::spawn(accept_loop(
            listener,
            inbound_tx,
            connections.clone(),
            counters.clone(),
            shutdown_tx.clone(),
            config.max_connections,
            config.request_timeout(),
            packet_logging,
        ));

        Ok(Self {
            config: config.clone(),
            local_addr,
            inbound,
            connections,
            counters,
            shutdown_tx,
            accept_task: Some(accept_task),
            packet_logging,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of open master connections
    pub fn connection_count(&self) -> usize {
        self.connections.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Stop accepting and close every connection
    pub fn close(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        if let Ok(mut connections) = self.connections.lock() {
            connections.clear();
        }
    }
}

impl Drop for TcpPeer {
    fn drop(&mut self) {
        self.close();
    }
}

impl Transport for TcpPeer {
    fn id(&self) -> TransportId {
        TransportId::ETHERNET
    }

    fn min_hardware_revision(&self) -> u8 {
        self.config.min_hardware_revision
    }

    fn receive(&mut self) -> Option<ReceivedPdu> {
        let inbound = self.inbound.try_recv().ok()?;
        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
        let context = TransportContext {
            transport: TransportId::ETHERNET,
            unit_id: inbound.unit_id,
            broadcast: false,
            tag: (inbound.connection << 16) | u64::from(inbound.transaction_id),
        };
        Some(ReceivedPdu { pdu: inbound.pdu, context })
    }

    fn send(&mut self, context: &TransportContext, pdu: &[u8]) -> ModbusResult<()> {
        let connection = context.tag >> 16;
        let frame = encode_frame(context.tag as u16, context.unit_id, pdu);
        if self.packet_logging {
            log_packet("send", &frame, "TCP", Some(context.unit_id));
        }

        let connections = self
            .connections
            .lock()
            .map_err(|_| ModbusError::internal("TCP connection map poisoned"))?;
        let writer = connections
            .get(&connection)
            .ok_or_else(|| ModbusError::connection(format!("Connection {} closed before reply", connection)))?;
        let len = frame.len();
        writer
            .send(frame)
            .map_err(|_| ModbusError::connection(format!("Connection {} writer stopped", connection)))?;
        self.counters.replies_sent.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
        Ok(())
    }

    fn stats(&self) -> TransportStats {
        let c = &self.counters;
        TransportStats {
            frames_received: c.frames_received.load(Ordering::Relaxed),
            replies_sent: c.replies_sent.load(Ordering::Relaxed),
            framing_errors: c.framing_errors.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            ..Default::default()
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    listener: TcpListener,
    inbound: mpsc::UnboundedSender<Inbound>,
    connections: ConnectionMap,
    counters: Arc<PeerCounters>,
    shutdown_tx: broadcast::Sender<()>,
    max_connections: usize,
    request_timeout: Duration,
    packet_logging: bool,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let open = connections.lock().map(|c| c.len()).unwrap_or(usize::MAX);
                        if open >= max_connections {
                            warn!("Rejecting {}: {} connections already open", addr, open);
                            continue;
                        }
                        let id = counters.connections.fetch_add(1, Ordering::Relaxed) + 1;
                        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
                        if let Ok(mut map) = connections.lock() {
                            map.insert(id, reply_tx);
                        }
                        debug!("Accepted connection {} from {}", id, addr);
                        tokio::spawn(handle_connection(
                            id,
                            stream,
                            addr,
                            reply_rx,
                            inbound.clone(),
                            connections.clone(),
                            counters.clone(),
                            shutdown_tx.subscribe(),
                            request_timeout,
                            packet_logging,
                        ));
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, Modbus TCP peer stops accepting");
                break;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_connection(
    id: u64,
    stream: TcpStream,
    addr: SocketAddr,
    mut replies: mpsc::UnboundedReceiver<Vec<u8>>,
    inbound: mpsc::UnboundedSender<Inbound>,
    connections: ConnectionMap,
    counters: Arc<PeerCounters>,
    mut shutdown_rx: broadcast::Receiver<()>,
    request_timeout: Duration,
    packet_logging: bool,
) {
    let (mut reader, mut writer) = stream.into_split();

    // number of replies the writer owes once reading has stopped
    let (owed_tx, mut owed_rx) = watch::channel(None::<u64>);
    let mut writer_task = tokio::spawn(async move {
        let mut written = 0u64;
        loop {
            if matches!(*owed_rx.borrow(), Some(owed) if written >= owed) {
                break;
            }
            tokio::select! {
                frame = replies.recv() => {
                    let Some(frame) = frame else { break };
                    if let Err(e) = writer.write_all(&frame).await {
                        error!("Failed to send reply to {}: {}", addr, e);
                        break;
                    }
                    written += 1;
                }
                changed = owed_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut forwarded = 0u64;
    let mut drain = false;
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Shutdown signal received for connection {}", id);
                break;
            }
            result = timeout(request_timeout, read_frame(&mut reader)) => {
                match result {
                    Ok(Ok(Some(request))) => {
                        counters.bytes_received.fetch_add((MBAP_HEADER_SIZE + request.pdu.len()) as u64, Ordering::Relaxed);
                        if packet_logging {
                            let frame = encode_frame(request.transaction_id, request.unit_id, &request.pdu);
                            log_packet("receive", &frame, "TCP", Some(request.unit_id));
                        }
                        let request = Inbound { connection: id, ..request };
                        if inbound.send(request).is_err() {
                            break;
                        }
                        forwarded += 1;
                    }
                    Ok(Ok(None)) => {
                        debug!("Client {} disconnected", addr);
                        drain = true;
                        break;
                    }
                    Ok(Err(e)) => {
                        if e.is_framing_error() {
                            counters.framing_errors.fetch_add(1, Ordering::Relaxed);
                        }
                        warn!("Dropping connection {}: {}", addr, e);
                        break;
                    }
                    Err(_) => {
                        warn!("Read timeout from {}", addr);
                        drain = true;
                        break;
                    }
                }
            }
        }
    }

    // the connection stays routable until the engine has answered what it was given
    let _ = owed_tx.send(Some(if drain { forwarded } else { 0 }));
    if timeout(REPLY_DRAIN_TIMEOUT, &mut writer_task).await.is_err() {
        warn!("Connection {} closed with replies still pending", id);
        writer_task.abort();
    }

    if let Ok(mut map) = connections.lock() {
        map.remove(&id);
    }
    debug!("Connection {} from {} closed", id, addr);
}

/// Read one MBAP frame; `None` on a clean end of stream
async fn read_frame(reader: &mut OwnedReadHalf) -> ModbusResult<Option<Inbound>> {
    let mut header = [0u8; MBAP_HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let transaction_id = u16::from_be_bytes([header[0], header[1]]);
    let protocol_id = u16::from_be_bytes([header[2], header[3]]);
    let length = u16::from_be_bytes([header[4], header[5]]) as usize;
    let unit_id = header[6];

    if protocol_id != 0 {
        return Err(ModbusError::frame(format!("Invalid protocol ID {}", protocol_id)));
    }
    if length < 2 || length > MAX_PDU_SIZE + 1 {
        return Err(ModbusError::frame(format!("Invalid MBAP length {}", length)));
    }

    let mut pdu = vec![0u8; length - 1];
    reader.read_exact(&mut pdu).await?;
    Ok(Some(Inbound { connection: 0, transaction_id, unit_id, pdu }))
}
