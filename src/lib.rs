//! Read telemetry from JBD-style LiFePO4 Battery Management Systems
//!
//! JBD boards (sold under many names, including "xiaoxiang" and Overkill Solar) speak a
//! simple request-response protocol over a serial link, usually bridged to Bluetooth Low
//! Energy through a Nordic UART service. Frames look like:
//!
//! Offset | Meaning
//! 0      | Start marker 0xDD
//! 1      | Register on replies; 0xA5 (read) or 0x5A (write) on requests
//! 2      | Status on replies; register on requests
//! 3      | Payload length N
//! 4..4+N | Payload
//! +2     | Checksum, big endian, `0x10000 - sum` of the bytes from offset 1
//! +1     | End marker 0x77
//!
//! Replies carry only the register they answer, so at most one request per register is
//! outstanding at a time.
//!
//! This crate provides the protocol core, independent of the radio:
//!
//! - [`codec`]: building request frames and checking reply frames
//! - [`RingBuffer`] and [`PacketStateMachine`]: two ways to reassemble replies that arrive
//!   fragmented, duplicated or corrupted across notifications
//! - [`ResponseCorrelator`]: matching replies to requests, with deadlines
//! - [`CircuitBreaker`]: stop hammering a peripheral that does not answer
//! - [`MtuNegotiator`]: settle on the largest write the link allows
//! - [`ValidationPipeline`]: sanity checks before a sample is acted on
//! - [`BmsSession`]: all of the above wired together for one peripheral
//!
//! With the `ble` feature, [`BleTransport`] connects to a peripheral with `bluest`.
//!
//! # Example
//!
//! ```rust,no_run
//! # #[cfg(feature = "ble")]
//! # #[tokio::main(flavor = "current_thread")]
//! # pub async fn main() -> anyhow::Result<()> {
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let transport = Arc::new(jbdread::BleTransport::connect("xiaoxiang BMS").await?);
//! let session = jbdread::BmsSession::new(transport.clone(), Default::default());
//! let notifications = transport.notifications().await?;
//!
//! let poll = async {
//!     loop {
//!         match session.fetch_telemetry().await {
//!             Ok(telemetry) => println!("{:?}", telemetry.sample),
//!             Err(err) => println!("{err}"),
//!         }
//!         tokio::time::sleep(Duration::from_secs(5)).await;
//!     }
//! };
//! tokio::select! {
//!     result = session.pump(notifications) => result?,
//!     _ = poll => {}
//! }
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "ble"))]
//! # fn main() {}
//! ```

#[cfg(feature = "ble")]
mod ble;
pub mod circuit_breaker;
pub mod codec;
pub mod correlator;
mod error;
pub mod message;
pub mod mtu;
mod packet;
pub mod registers;
pub mod ring_buffer;
pub mod session;
pub mod state_machine;
mod telemetry;
pub mod transport;
pub mod validation;

#[cfg(feature = "ble")]
pub use ble::BleTransport;
pub use circuit_breaker::{BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitState, Outcome};
pub use correlator::{CorrelatorConfig, PendingPolicy, ResponseCorrelator};
pub use error::{DecodeError, FrameError, ProtocolStatus, RequestError, TransportError};
pub use mtu::{MtuCache, MtuConfig, MtuNegotiationOutcome, MtuNegotiator};
pub use packet::Packet;
pub use ring_buffer::RingBuffer;
pub use session::{BmsSession, FramerKind, SessionConfig, SessionEvent, ValidatedSample};
pub use state_machine::{PacketStateMachine, ResyncPolicy};
pub use telemetry::TelemetrySample;
pub use transport::{MtuExchange, Transport};
pub use validation::{
    Severity, ValidationFinding, ValidationMode, ValidationPipeline, ValidationReport,
    ValidationThresholds,
};
