//! Modbus RTU serial framing.
//!
//! - [`timing`]: t1.5 / t3.5 silence thresholds per baud rate
//! - [`framer`]: interrupt-side state machine recovering frame boundaries
//! - [`port`]: poll-side validation, addressing and reply transmission
//! - [`serial`]: tokio-serial driver feeding a port from async tasks

pub mod framer;
pub mod port;
pub mod serial;
pub mod timing;

pub use framer::{ByteEvent, FramerState, RtuFramer, MAX_RTU_FRAME_SIZE};
pub use port::{CaptureTx, RtuLine, RtuPort, SerialTx};
pub use serial::SerialLink;
pub use timing::RtuTiming;
