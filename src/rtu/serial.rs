//! tokio-serial driver for an [`RtuPort`].
//!
//! On the drive the framer runs from UART and timer-compare interrupts. On a
//! host, three tasks play those roles: a reader feeding every received byte to
//! [`RtuLine::on_byte`], a periodic ticker calling [`RtuLine::on_timer_tick`],
//! and a writer draining the replies the port transmits.

use log::{error, info};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::port::{RtuLine, RtuPort, SerialTx};
use crate::config::RtuPortConfig;
use crate::error::{ModbusError, ModbusResult};
use crate::transport::TransportId;

struct ChannelTx {
    frames: mpsc::UnboundedSender<Vec<u8>>,
}

impl SerialTx for ChannelTx {
    fn transmit(&mut self, frame: &[u8]) -> ModbusResult<()> {
        self.frames
            .send(frame.to_vec())
            .map_err(|_| ModbusError::io("Serial writer task stopped"))
    }
}

/// Background tasks driving one serial port
pub struct SerialLink {
    device: String,
    tasks: Vec<JoinHandle<()>>,
}

impl SerialLink {
    /// Open the serial device and start the reader, ticker and writer tasks
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(
        id: TransportId,
        config: &RtuPortConfig,
        tick_us: u32,
        packet_logging: bool,
    ) -> ModbusResult<(RtuPort, SerialLink)> {
        let stop_bits = match config.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };
        let builder = tokio_serial::new(&config.device, config.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(stop_bits)
            .parity(config.parity.into());
        let stream = tokio_serial::SerialStream::open(&builder).map_err(|e| {
            ModbusError::connection(format!("Failed to open serial port {}: {}", config.device, e))
        })?;
        let (reader, writer) = tokio::io::split(stream);

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let mut port = RtuPort::new(id, config, tick_us, Box::new(ChannelTx { frames: frames_tx }));
        port.set_packet_logging(packet_logging);
        let line = port.line();

        let tasks = vec![
            tokio::spawn(read_loop(reader, line.clone(), config.device.clone())),
            tokio::spawn(tick_loop(line, tick_us)),
            tokio::spawn(write_loop(writer, frames_rx, config.device.clone())),
        ];

        info!("{} opened on {} at {} baud", id, config.device, config.baud_rate);
        Ok((port, SerialLink { device: config.device.clone(), tasks }))
    }

    /// Device path this link runs on
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Stop all background tasks
    pub fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop<R>(mut reader: R, line: std::sync::Arc<RtuLine>, device: String)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = [0u8; 64];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => {
                info!("Serial port {} closed", device);
                break;
            }
            Ok(n) => {
                for &byte in &buffer[..n] {
                    line.on_byte(byte);
                }
            }
            Err(e) => {
                error!("Serial read error on {}: {}", device, e);
                break;
            }
        }
    }
}

async fn tick_loop(line: std::sync::Arc<RtuLine>, tick_us: u32) {
    let mut interval = tokio::time::interval(Duration::from_micros(u64::from(tick_us.max(1))));
    interval.set_missed_tick_behavior(MissedTickBehavior::Burst);
    loop {
        interval.tick().await;
        line.on_timer_tick();
    }
}

async fn write_loop<W>(mut writer: W, mut frames: mpsc::UnboundedReceiver<Vec<u8>>, device: String)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            error!("Serial write error on {}: {}", device, e);
            continue;
        }
        if let Err(e) = writer.flush().await {
            error!("Serial flush error on {}: {}", device, e);
        }
    }
}
