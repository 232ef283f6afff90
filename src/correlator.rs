//! Matches reply packets to outstanding requests.
//!
//! Replies carry no request identifier, only the register they concern, so at most one
//! request per register may be outstanding. Every request has a deadline; whichever of the
//! reply and the deadline comes first completes it, and the other is ignored.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures_util::FutureExt;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::{Duration, Instant};

use crate::error::{ProtocolStatus, RequestError, TransportError};
use crate::packet::Packet;
use crate::transport::Transport;

type Reply = Result<Vec<u8>, RequestError>;

/// What happens when a request is sent for a register that already has one outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PendingPolicy {
    /// Refuse the new request with [`RequestError::RegisterBusy`].
    #[default]
    Reject,
    /// Complete the earlier request with [`RequestError::Superseded`] and replace it.
    Supersede,
}

#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    pub timeout: Duration,
    pub policy: PendingPolicy,
}

impl CorrelatorConfig {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            timeout: Self::DEFAULT_TIMEOUT,
            policy: PendingPolicy::default(),
        }
    }
}

/// What became of a packet handed to [`ResponseCorrelator::on_packet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Completed the pending request for its register
    Resolved,
    /// No request was waiting for this register; the packet was dropped
    Unmatched,
    /// The packet failed its checksum and was not delivered
    Invalid,
}

struct PendingRequest {
    id: u64,
    deadline: Instant,
    slot: oneshot::Sender<Reply>,
    timer: Option<AbortHandle>,
}

type PendingMap = Arc<Mutex<HashMap<u8, PendingRequest>>>;

/// Resolves to the reply payload or the reason there is none.
pub struct ResponseHandle {
    register: u8,
    deadline: Instant,
    rx: oneshot::Receiver<Reply>,
}

impl ResponseHandle {
    pub fn register(&self) -> u8 {
        self.register
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl Future for ResponseHandle {
    type Output = Reply;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let register = self.register;
        self.rx
            .poll_unpin(cx)
            .map(|received| received.unwrap_or(Err(RequestError::Cancelled(register))))
    }
}

pub struct ResponseCorrelator<T> {
    transport: T,
    config: CorrelatorConfig,
    pending: PendingMap,
    next_id: AtomicU64,
    /// One write in flight per connection
    write_lock: tokio::sync::Mutex<()>,
    chunk_size: Mutex<Option<usize>>,
}

impl<T: Transport> ResponseCorrelator<T> {
    pub fn new(transport: T, config: CorrelatorConfig) -> Self {
        Self {
            transport,
            config,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            write_lock: tokio::sync::Mutex::new(()),
            chunk_size: Mutex::new(None),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    /// Split future writes into pieces of at most `size` bytes. `None` writes whole frames.
    pub fn set_chunk_size(&self, size: Option<usize>) {
        *lock(&self.chunk_size) = size.map(|s| s.max(1));
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_pending(&self, register: u8) -> bool {
        lock(&self.pending).contains_key(&register)
    }

    /// When the request outstanding on `register` times out.
    pub fn deadline(&self, register: u8) -> Option<Instant> {
        lock(&self.pending).get(&register).map(|entry| entry.deadline)
    }

    /// Send `frame` and start waiting for a reply on `register`.
    ///
    /// The returned handle resolves when a checksum-valid reply for `register` arrives or
    /// the deadline passes. Must be called within a tokio runtime.
    pub async fn send(&self, register: u8, frame: &[u8]) -> Result<ResponseHandle, RequestError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + self.config.timeout;
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = lock(&self.pending);
            if let Some(previous) = pending.remove(&register) {
                match self.config.policy {
                    PendingPolicy::Reject => {
                        pending.insert(register, previous);
                        return Err(RequestError::RegisterBusy(register));
                    }
                    PendingPolicy::Supersede => {
                        log::warn!("Register 0x{register:02x}: superseding request {}", previous.id);
                        finish(previous, Err(RequestError::Superseded(register)));
                    }
                }
            }

            // Registered before the write: the reply may arrive before the write returns.
            pending.insert(
                register,
                PendingRequest { id, deadline, slot: tx, timer: None },
            );
        }

        let timer = tokio::spawn(expire(self.pending.clone(), register, id, deadline));
        if let Some(entry) = lock(&self.pending).get_mut(&register) {
            if entry.id == id {
                entry.timer = Some(timer.abort_handle());
            }
        }

        if let Err(err) = self.write(frame).await {
            log::warn!("Register 0x{register:02x}: write failed: {err}");
            complete(&self.pending, register, id, Err(err.clone().into()));
            return Err(err.into());
        }

        Ok(ResponseHandle { register, deadline, rx })
    }

    /// Write a frame to the transport, chunked if a chunk size is set.
    pub async fn write(&self, frame: &[u8]) -> Result<(), TransportError> {
        let chunk_size = *lock(&self.chunk_size);
        let _guard = self.write_lock.lock().await;
        log::debug!("TX: {}", hex::encode(frame));
        match chunk_size {
            Some(size) => {
                for chunk in frame.chunks(size) {
                    self.transport.write(chunk).await?;
                }
                Ok(())
            }
            None => self.transport.write(frame).await,
        }
    }

    /// Hand a reassembled packet to whichever request is waiting on its register.
    pub fn on_packet(&self, packet: Packet) -> Delivery {
        if !packet.checksum_valid {
            log::warn!("Register 0x{:02x}: refusing packet with bad checksum", packet.register);
            return Delivery::Invalid;
        }

        let entry = lock(&self.pending).remove(&packet.register);
        let Some(entry) = entry else {
            log::debug!(
                "Register 0x{:02x}: no request waiting, dropping {}",
                packet.register,
                hex::encode(&packet.payload)
            );
            return Delivery::Unmatched;
        };

        let reply = if packet.is_success() {
            Ok(packet.payload)
        } else {
            Err(RequestError::Protocol {
                register: packet.register,
                status: ProtocolStatus::from_status(packet.status),
            })
        };
        finish(entry, reply);
        Delivery::Resolved
    }

    /// Complete every outstanding request with [`RequestError::Cancelled`].
    pub fn cancel_all(&self) {
        let drained: Vec<(u8, PendingRequest)> = lock(&self.pending).drain().collect();
        for (register, entry) in drained {
            finish(entry, Err(RequestError::Cancelled(register)));
        }
    }
}

async fn expire(pending: PendingMap, register: u8, id: u64, deadline: Instant) {
    tokio::time::sleep_until(deadline).await;
    let entry = {
        let mut pending = lock(&pending);
        match pending.get(&register) {
            Some(entry) if entry.id == id => pending.remove(&register),
            _ => None,
        }
    };
    if let Some(mut entry) = entry {
        log::warn!("Register 0x{register:02x}: timed out");
        // this task is the timer; nothing left to cancel
        entry.timer = None;
        finish(entry, Err(RequestError::Timeout(register)));
    }
}

/// Remove and complete the request `id` on `register`, if it is still the pending one.
fn complete(pending: &PendingMap, register: u8, id: u64, reply: Reply) {
    let entry = {
        let mut pending = lock(pending);
        match pending.get(&register) {
            Some(entry) if entry.id == id => pending.remove(&register),
            _ => None,
        }
    };
    if let Some(entry) = entry {
        finish(entry, reply);
    }
}

fn finish(entry: PendingRequest, reply: Reply) {
    if let Some(timer) = entry.timer {
        timer.abort();
    }
    // the caller may have stopped waiting
    let _ = entry.slot.send(reply);
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
