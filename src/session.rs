//! One connected peripheral: the inbound byte path, outbound requests and everything that
//! sits between them.
//!
//! A session owns its framer, correlator, breakers, MTU negotiator and validation pipeline.
//! Nothing is process-global, so several sessions to several peripherals can run side by
//! side.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use futures_util::{Stream, StreamExt};
use tokio::sync::broadcast;

use crate::circuit_breaker::{BreakerRegistry, CircuitBreakerConfig, CircuitError, Outcome};
use crate::codec;
use crate::correlator::{CorrelatorConfig, Delivery, PendingPolicy, ResponseCorrelator};
use crate::error::{DecodeError, FrameError, RequestError};
use crate::message::{BasicInfoMessage, CellVoltagesMessage, HardwareVersionMessage};
use crate::mtu::{MtuConfig, MtuNegotiationOutcome, MtuNegotiator};
use crate::packet::Packet;
use crate::registers::{self, Parameter, REG_BASIC_INFO, REG_CELL_VOLTAGES, REG_ENTER_FACTORY, REG_EXIT_FACTORY, REG_HARDWARE_VERSION};
use crate::ring_buffer::{Extract, RingBuffer};
use crate::state_machine::{PacketStateMachine, ResyncPolicy};
use crate::telemetry::TelemetrySample;
use crate::transport::{MtuExchange, Transport};
use crate::validation::{
    ValidationFinding, ValidationMode, ValidationPipeline, ValidationReport, ValidationThresholds,
};

/// Breaker names, one per kind of operation
pub const BREAKER_READ: &str = "read";
pub const BREAKER_PARAMETER: &str = "parameter";
pub const BREAKER_WRITE: &str = "write";
pub const BREAKER_FACTORY: &str = "factory";

/// How inbound bytes are reassembled into packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FramerKind {
    /// Scan a ring buffer for whole frames after every chunk
    #[default]
    RingBuffer,
    /// Step a state machine byte by byte
    StateMachine,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub framer: FramerKind,
    pub ring_capacity: usize,
    pub resync: ResyncPolicy,
    pub correlator: CorrelatorConfig,
    pub breaker: CircuitBreakerConfig,
    pub mtu: MtuConfig,
    pub thresholds: ValidationThresholds,
    pub validation_mode: ValidationMode,
    /// Consecutive frame errors before one is reported to subscribers
    pub frame_error_threshold: u32,
    pub event_capacity: usize,
}

impl SessionConfig {
    pub const DEFAULT_FRAME_ERROR_THRESHOLD: u32 = 3;
    pub const DEFAULT_EVENT_CAPACITY: usize = 64;
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            framer: FramerKind::default(),
            ring_capacity: RingBuffer::DEFAULT_CAPACITY,
            resync: ResyncPolicy::default(),
            correlator: CorrelatorConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            mtu: MtuConfig::default(),
            thresholds: ValidationThresholds::default(),
            validation_mode: ValidationMode::default(),
            frame_error_threshold: Self::DEFAULT_FRAME_ERROR_THRESHOLD,
            event_capacity: Self::DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Published to every subscriber.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A sample that passed validation
    Telemetry(TelemetrySample),
    /// Every finding from validating one sample
    Findings(Vec<ValidationFinding>),
    /// A sample that failed a safety-critical check; do not act on it
    SampleRejected {
        sample: TelemetrySample,
        findings: Vec<ValidationFinding>,
    },
    /// Frame errors kept recurring
    DecodeError(FrameError),
    TransportError(String),
}

/// A sample with the verdict of the validation pipeline.
#[derive(Debug, Clone)]
pub struct ValidatedSample {
    pub sample: TelemetrySample,
    pub report: ValidationReport,
}

impl ValidatedSample {
    pub fn is_rejected(&self) -> bool {
        self.report.rejected
    }
}

enum Framer {
    Ring(RingBuffer),
    Machine(PacketStateMachine),
}

impl Framer {
    fn new(config: &SessionConfig) -> Self {
        match config.framer {
            FramerKind::RingBuffer => Framer::Ring(RingBuffer::new(config.ring_capacity)),
            FramerKind::StateMachine => {
                Framer::Machine(PacketStateMachine::with_policy(config.resync))
            }
        }
    }

    /// Consume a chunk; return the checksum-valid packets and the frame errors it produced,
    /// in arrival order.
    fn push(&mut self, chunk: &[u8]) -> Vec<Result<Packet, FrameError>> {
        match self {
            Framer::Ring(buffer) => {
                buffer.append(chunk);
                let mut out = Vec::new();
                loop {
                    match buffer.try_extract_packet() {
                        Extract::Frame(frame) => out.push(Self::check(&frame)),
                        Extract::Corrupt(end) => out.push(Err(FrameError::BadEnd(end))),
                        Extract::Incomplete => break,
                    }
                }
                out
            }
            Framer::Machine(machine) => machine.feed_ordered(chunk),
        }
    }

    fn check(frame: &[u8]) -> Result<Packet, FrameError> {
        codec::verify_frame(frame)?;
        codec::parse_frame(frame)
    }
}

pub struct BmsSession<T> {
    config: SessionConfig,
    framer: Mutex<Framer>,
    correlator: ResponseCorrelator<T>,
    breakers: BreakerRegistry,
    mtu: MtuNegotiator,
    pipeline: Mutex<ValidationPipeline>,
    events: broadcast::Sender<SessionEvent>,
    frame_errors: AtomicU32,
}

impl<T: Transport> BmsSession<T> {
    pub fn new(transport: T, config: SessionConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            framer: Mutex::new(Framer::new(&config)),
            correlator: ResponseCorrelator::new(transport, config.correlator.clone()),
            breakers: BreakerRegistry::new(config.breaker.clone()),
            mtu: MtuNegotiator::new(config.mtu.clone()),
            pipeline: Mutex::new(ValidationPipeline::new(&config.thresholds)),
            events,
            frame_errors: AtomicU32::new(0),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn correlator(&self) -> &ResponseCorrelator<T> {
        &self.correlator
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn mtu(&self) -> &MtuNegotiator {
        &self.mtu
    }

    /// Hand the session a chunk of inbound bytes, in arrival order.
    ///
    /// Returns the number of packets that resolved a pending request.
    pub fn feed(&self, chunk: &[u8]) -> usize {
        log::debug!("RX: {}", hex::encode(chunk));
        let results = lock(&self.framer).push(chunk);

        let mut resolved = 0;
        for result in results {
            match result {
                Ok(packet) => {
                    self.frame_errors.store(0, Ordering::Relaxed);
                    match self.correlator.on_packet(packet) {
                        Delivery::Resolved => resolved += 1,
                        Delivery::Unmatched | Delivery::Invalid => {}
                    }
                }
                Err(err) => self.frame_error(err),
            }
        }
        resolved
    }

    /// Feed every chunk of a notification stream into the session until it ends.
    pub async fn pump<S, E>(&self, mut chunks: S) -> anyhow::Result<()>
    where
        S: Stream<Item = Result<Vec<u8>, E>> + Unpin,
        E: std::error::Error + Send + Sync + 'static,
    {
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(data) => {
                    self.feed(&data);
                }
                Err(err) => {
                    log::warn!("Notification error: {err}");
                    self.publish(SessionEvent::TransportError(err.to_string()));
                    return Err(err.into());
                }
            }
        }
        log::info!("End of notification stream");
        Ok(())
    }

    fn frame_error(&self, err: FrameError) {
        let count = self.frame_errors.fetch_add(1, Ordering::Relaxed) + 1;
        log::debug!("Frame error {count}: {err}");
        if count >= self.config.frame_error_threshold {
            self.frame_errors.store(0, Ordering::Relaxed);
            self.publish(SessionEvent::DecodeError(err));
        }
    }

    /// Send `frame` and wait for the reply on `register`, guarded by the breaker `breaker`.
    ///
    /// Timeouts and transport failures count against the breaker. A protocol error status
    /// counts as success: the peripheral answered. A request refused because the register
    /// is busy never reaches the breaker.
    pub async fn request(
        &self,
        breaker: &str,
        register: u8,
        frame: &[u8],
    ) -> Result<Vec<u8>, RequestError> {
        if self.correlator.config().policy == PendingPolicy::Reject
            && self.correlator.is_pending(register)
        {
            return Err(RequestError::RegisterBusy(register));
        }

        let result = self
            .breakers
            .breaker(breaker)
            .execute_classified(|| self.roundtrip(register, frame), breaker_outcome)
            .await;

        match result {
            Ok(payload) => Ok(payload),
            Err(CircuitError::Open(name)) => Err(RequestError::CircuitOpen(name)),
            Err(CircuitError::Inner(err)) => {
                if let RequestError::Transport(transport) = &err {
                    self.publish(SessionEvent::TransportError(transport.to_string()));
                }
                Err(err)
            }
        }
    }

    async fn roundtrip(&self, register: u8, frame: &[u8]) -> Result<Vec<u8>, RequestError> {
        let handle = self.correlator.send(register, frame).await?;
        handle.await
    }

    pub async fn read_register(&self, register: u8) -> Result<Vec<u8>, RequestError> {
        let descriptor =
            registers::lookup(register).ok_or(DecodeError::UnknownRegister(register))?;
        if !descriptor.readable {
            return Err(DecodeError::NotReadable(register).into());
        }
        self.request(BREAKER_READ, register, &codec::read_register(register))
            .await
    }

    pub async fn read_parameter(&self, parameter: Parameter) -> Result<Vec<u8>, RequestError> {
        self.request(
            BREAKER_PARAMETER,
            codec::REG_PARAMETER,
            &codec::read_parameter(parameter),
        )
        .await
    }

    /// Write a configuration register. The peripheral answers 0x81 unless it is in factory
    /// mode; see [`Self::enter_factory_mode`].
    pub async fn write_register(&self, register: u8, data: &[u8]) -> Result<(), RequestError> {
        let frame = codec::write_register(register, data)?;
        self.request(BREAKER_WRITE, register, &frame).await?;
        Ok(())
    }

    pub async fn enter_factory_mode(&self) -> Result<(), RequestError> {
        self.request(BREAKER_FACTORY, REG_ENTER_FACTORY, &codec::ENTER_FACTORY_MODE)
            .await?;
        Ok(())
    }

    pub async fn exit_factory_mode(&self) -> Result<(), RequestError> {
        self.request(BREAKER_FACTORY, REG_EXIT_FACTORY, &codec::EXIT_FACTORY_MODE)
            .await?;
        Ok(())
    }

    pub async fn fetch_basic_info(&self) -> Result<BasicInfoMessage, RequestError> {
        let payload = self.read_register(REG_BASIC_INFO).await?;
        Ok(BasicInfoMessage::new(payload)?)
    }

    pub async fn fetch_cell_voltages(&self) -> Result<CellVoltagesMessage, RequestError> {
        let payload = self.read_register(REG_CELL_VOLTAGES).await?;
        Ok(CellVoltagesMessage::new(payload)?)
    }

    pub async fn fetch_hardware_version(&self) -> Result<HardwareVersionMessage, RequestError> {
        let payload = self.read_register(REG_HARDWARE_VERSION).await?;
        Ok(HardwareVersionMessage::new(payload))
    }

    /// Read basic info and cell voltages, then validate and publish the sample.
    pub async fn fetch_telemetry(&self) -> Result<ValidatedSample, RequestError> {
        let info = self.fetch_basic_info().await?;
        let cells = self.fetch_cell_voltages().await?;
        let sample = TelemetrySample::from_basic_info(&info).with_cells(&cells);
        Ok(self.validate(sample))
    }

    /// Run the validation pipeline over `sample` and publish the outcome.
    pub fn validate(&self, sample: TelemetrySample) -> ValidatedSample {
        let report = lock(&self.pipeline).run(&sample, self.config.validation_mode);

        if !report.findings.is_empty() {
            self.publish(SessionEvent::Findings(report.findings.clone()));
        }
        if report.rejected {
            log::warn!("Sample rejected: {} errors", report.errors().count());
            self.publish(SessionEvent::SampleRejected {
                sample: sample.clone(),
                findings: report.findings.clone(),
            });
        } else {
            self.publish(SessionEvent::Telemetry(sample.clone()));
        }
        ValidatedSample { sample, report }
    }

    /// Negotiate the MTU with `peer` and chunk future writes to fit it.
    pub async fn negotiate_mtu<X: MtuExchange>(
        &self,
        peer: &str,
        exchange: &X,
    ) -> MtuNegotiationOutcome {
        let outcome = self.mtu.negotiate(peer, exchange).await;
        self.correlator
            .set_chunk_size(Some(self.mtu.optimal_packet_size(outcome.mtu)));
        outcome
    }

    fn publish(&self, event: SessionEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

fn breaker_outcome(err: &RequestError) -> Outcome {
    match err {
        RequestError::Timeout(_) | RequestError::Transport(_) => Outcome::Failure,
        // refused or withdrawn locally
        RequestError::RegisterBusy(_) | RequestError::Superseded(_) | RequestError::Cancelled(_) => {
            Outcome::Neutral
        }
        RequestError::Protocol { .. } | RequestError::CircuitOpen(_) | RequestError::Decode(_) => {
            Outcome::Success
        }
    }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures_util::stream;
    use tokio::time::Duration;

    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::error::{ProtocolStatus, TransportError};
    use crate::mtu::MIN_MTU;
    use crate::transport::mock::MockTransport;
    use crate::validation::Severity;

    fn reply(register: u8, status: u8, payload: &[u8]) -> Vec<u8> {
        let mut body = vec![register, status, payload.len() as u8];
        body.extend_from_slice(payload);
        let mut frame = vec![codec::START_MARKER];
        frame.extend_from_slice(&body);
        frame.extend_from_slice(&codec::checksum(&body).to_be_bytes());
        frame.push(codec::END_MARKER);
        frame
    }

    fn session(config: SessionConfig) -> Arc<BmsSession<Arc<MockTransport>>> {
        Arc::new(BmsSession::new(Arc::new(MockTransport::default()), config))
    }

    /// Wait until the session has written `n` frames.
    async fn written(session: &BmsSession<Arc<MockTransport>>, n: usize) {
        while session.correlator().transport().written().len() < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_basic_info_end_to_end() {
        // 3.00V is a single cell; the default pack bounds assume 4 to 8 cells
        let single_cell = ValidationThresholds { pack_min_v: 2.5, pack_low_warning_v: 2.8, ..Default::default() };
        let config = SessionConfig { thresholds: single_cell, ..Default::default() };
        let session = session(config);
        let mut events = session.subscribe();

        let request = tokio::spawn({
            let session = session.clone();
            async move { session.fetch_basic_info().await }
        });
        written(&session, 1).await;
        assert_eq!(
            session.correlator().transport().written()[0],
            codec::read_register(REG_BASIC_INFO)
        );

        let frame = hex::decode("dd030002012cffce77").unwrap();
        assert_eq!(frame, reply(0x03, 0x00, &[0x01, 0x2c]));
        assert_eq!(session.feed(&frame), 1);

        let info = request.await.unwrap().unwrap();
        assert_eq!(info.pack_voltage_v(), Some(3.0));

        let validated = session.validate(TelemetrySample::from_basic_info(&info));
        assert!(!validated.report.has_errors());
        assert!(!validated.is_rejected());
        assert!(matches!(events.recv().await.unwrap(), SessionEvent::Telemetry(_)));

        // the same reading is out of bounds for a default multi-cell pack
        let mut pipeline = ValidationPipeline::default();
        let report = pipeline.run_full(&TelemetrySample::from_basic_info(&info));
        let errors: Vec<_> = report.errors().map(|f| f.validator_name).collect();
        assert_eq!(errors, vec!["voltage_range"]);
        assert!(report.rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_telemetry_over_fragmented_replies() {
        for framer in [FramerKind::RingBuffer, FramerKind::StateMachine] {
            let session = session(SessionConfig { framer, ..Default::default() });
            let request = tokio::spawn({
                let session = session.clone();
                async move { session.fetch_telemetry().await }
            });

            let info = hex::decode("0530ff6a1f402710000c2eb100000000000010500304020ba50bb4").unwrap();
            let cells = hex::decode("0ce40ce50cdf0ce6").unwrap();

            written(&session, 1).await;
            // junk, then the reply split across notifications
            let mut bytes = vec![0x00, 0x42];
            bytes.extend(reply(REG_BASIC_INFO, 0x00, &info));
            for chunk in bytes.chunks(5) {
                session.feed(chunk);
            }

            written(&session, 2).await;
            for chunk in reply(REG_CELL_VOLTAGES, 0x00, &cells).chunks(3) {
                session.feed(chunk);
            }

            let validated = request.await.unwrap().unwrap();
            assert_eq!(validated.sample.pack_voltage_v, Some(13.28));
            assert_eq!(validated.sample.cell_voltages_v.len(), 4);
            assert!(!validated.is_rejected(), "{framer:?}: {:?}", validated.report);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_sample_is_signalled() {
        let session = session(SessionConfig {
            validation_mode: ValidationMode::Fast,
            ..Default::default()
        });
        let mut events = session.subscribe();

        let sample = TelemetrySample { pack_voltage_v: Some(5.0), ..TelemetrySample::empty() };
        let validated = session.validate(sample);
        assert!(validated.is_rejected());
        assert_eq!(validated.report.findings[0].severity, Severity::Error);

        assert!(matches!(events.recv().await.unwrap(), SessionEvent::Findings(_)));
        assert!(matches!(events.recv().await.unwrap(), SessionEvent::SampleRejected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_protocol_error_does_not_trip_breaker() {
        let session = session(SessionConfig {
            breaker: CircuitBreakerConfig { failure_threshold: 1, reset_timeout: Duration::from_secs(5) },
            ..Default::default()
        });
        let request = tokio::spawn({
            let session = session.clone();
            async move { session.write_register(0x10, &[0x27, 0x10]).await }
        });
        written(&session, 1).await;
        session.feed(&reply(0x10, 0x81, &[]));

        assert_eq!(
            request.await.unwrap(),
            Err(RequestError::Protocol { register: 0x10, status: ProtocolStatus::InvalidOperation })
        );
        assert_eq!(session.breakers().breaker(BREAKER_WRITE).state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_open_the_breaker() {
        let session = session(SessionConfig {
            breaker: CircuitBreakerConfig { failure_threshold: 2, reset_timeout: Duration::from_secs(30) },
            ..Default::default()
        });

        for _ in 0..2 {
            assert_eq!(session.read_register(0x03).await, Err(RequestError::Timeout(0x03)));
        }
        assert_eq!(
            session.read_register(0x04).await,
            Err(RequestError::CircuitOpen(BREAKER_READ.to_string()))
        );
        // rejected without a write
        assert_eq!(session.correlator().transport().written().len(), 2);

        // other operation categories are unaffected
        assert_eq!(
            session.breakers().breaker(BREAKER_PARAMETER).state(),
            CircuitState::Closed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_register_is_refused_locally() {
        let session = session(SessionConfig::default());
        assert_eq!(
            session.read_register(REG_ENTER_FACTORY).await,
            Err(RequestError::Decode(DecodeError::NotReadable(REG_ENTER_FACTORY)))
        );
        assert_eq!(
            session.read_register(0x99).await,
            Err(RequestError::Decode(DecodeError::UnknownRegister(0x99)))
        );
        assert!(session.correlator().transport().written().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recurring_frame_errors_are_reported() {
        let session = session(SessionConfig { frame_error_threshold: 2, ..Default::default() });
        let mut events = session.subscribe();

        let mut corrupt = reply(0x03, 0x00, &[0x01, 0x2c]);
        corrupt[4] ^= 0x01;
        session.feed(&corrupt);
        assert!(events.try_recv().is_err());
        session.feed(&corrupt);
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::DecodeError(FrameError::ChecksumMismatch { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_valid_packet_between_frame_errors_resets_the_count() {
        for framer in [FramerKind::RingBuffer, FramerKind::StateMachine] {
            let session = session(SessionConfig { framer, frame_error_threshold: 2, ..Default::default() });
            let mut events = session.subscribe();

            let good = reply(0x03, 0x00, &[0x01, 0x2c]);
            let mut corrupt = good.clone();
            corrupt[4] ^= 0x01;
            let mut bytes = corrupt.clone();
            bytes.extend(&good);
            bytes.extend(&corrupt);

            session.feed(&bytes);
            assert!(events.try_recv().is_err(), "{framer:?}");
            session.feed(&corrupt);
            assert!(
                matches!(events.try_recv(), Ok(SessionEvent::DecodeError(_))),
                "{framer:?}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_register_is_not_counted_by_breaker() {
        let session = session(SessionConfig {
            breaker: CircuitBreakerConfig { failure_threshold: 2, reset_timeout: Duration::from_secs(30) },
            ..Default::default()
        });

        for round in 0..2 {
            let first = tokio::spawn({
                let session = session.clone();
                async move { session.read_register(0x03).await }
            });
            written(&session, round + 1).await;
            assert_eq!(session.read_register(0x03).await, Err(RequestError::RegisterBusy(0x03)));
            assert_eq!(first.await.unwrap(), Err(RequestError::Timeout(0x03)));
        }

        let breaker = session.breakers().breaker(BREAKER_READ);
        assert_eq!(breaker.state(), CircuitState::Open);
        let stats = breaker.stats();
        assert_eq!((stats.total, stats.successes, stats.failures), (2, 0, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_request_is_neutral_for_breaker() {
        let session = session(SessionConfig {
            correlator: CorrelatorConfig { policy: PendingPolicy::Supersede, ..Default::default() },
            breaker: CircuitBreakerConfig { failure_threshold: 2, reset_timeout: Duration::from_secs(30) },
            ..Default::default()
        });

        let first = tokio::spawn({
            let session = session.clone();
            async move { session.read_register(0x03).await }
        });
        written(&session, 1).await;
        let second = tokio::spawn({
            let session = session.clone();
            async move { session.read_register(0x03).await }
        });
        written(&session, 2).await;
        assert_eq!(first.await.unwrap(), Err(RequestError::Superseded(0x03)));
        assert_eq!(second.await.unwrap(), Err(RequestError::Timeout(0x03)));

        let stats = session.breakers().breaker(BREAKER_READ).stats();
        assert_eq!((stats.successes, stats.failures, stats.neutral), (0, 1, 1));
        assert_eq!(session.breakers().breaker(BREAKER_READ).record().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pump_feeds_stream_and_reports_errors() {
        let session = session(SessionConfig::default());
        let mut events = session.subscribe();
        let request = tokio::spawn({
            let session = session.clone();
            async move { session.read_parameter(Parameter::SerialNumber).await }
        });
        written(&session, 1).await;

        let frame = reply(codec::REG_PARAMETER, 0x00, &[0x00, 0x2a]);
        let (head, tail) = frame.split_at(4);
        let chunks = stream::iter(vec![
            Ok(head.to_vec()),
            Ok(tail.to_vec()),
            Err(TransportError::Disconnected),
        ]);
        assert!(session.pump(chunks).await.is_err());
        assert_eq!(request.await.unwrap(), Ok(vec![0x00, 0x2a]));
        assert!(matches!(events.recv().await.unwrap(), SessionEvent::TransportError(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiated_mtu_chunks_writes() {
        struct Stubborn;
        impl MtuExchange for Stubborn {
            async fn request_mtu(&self, _: u16) -> Result<u16, TransportError> {
                Err(TransportError::MtuExchange("no".into()))
            }
        }

        let session = session(SessionConfig::default());
        let outcome = session.negotiate_mtu("peer", &Stubborn).await;
        assert_eq!(outcome.mtu, MIN_MTU);

        session.correlator().write(&[0u8; 40]).await.unwrap();
        let sizes: Vec<usize> = session
            .correlator()
            .transport()
            .written()
            .iter()
            .map(Vec::len)
            .collect();
        assert_eq!(sizes, vec![18, 18, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_factory_mode_frames() {
        let session = session(SessionConfig::default());
        let request = tokio::spawn({
            let session = session.clone();
            async move { session.enter_factory_mode().await }
        });
        written(&session, 1).await;
        session.feed(&reply(REG_ENTER_FACTORY, 0x00, &[]));
        assert_eq!(request.await.unwrap(), Ok(()));
        assert_eq!(
            session.correlator().transport().written()[0],
            codec::ENTER_FACTORY_MODE.to_vec()
        );
    }
}
