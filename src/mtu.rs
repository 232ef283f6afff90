//! Work out how many bytes can be written to a peer in one transport write.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::transport::MtuExchange;

/// The ATT MTU every BLE peer must support
pub const MIN_MTU: u16 = 23;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtuReason {
    /// The transport already had the largest candidate in effect
    AlreadyOptimal,
    /// A candidate was requested and granted
    Negotiated,
    /// Answered from the cache without talking to the peer
    Cached,
    /// Every candidate failed; the protocol minimum is in effect
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MtuNegotiationOutcome {
    pub mtu: u16,
    pub accepted: bool,
    pub cached_for: String,
    pub reason: MtuReason,
}

impl MtuNegotiationOutcome {
    /// Whether negotiation fell back to the minimum
    pub fn is_degraded(&self) -> bool {
        !self.accepted
    }
}

#[derive(Debug, Clone)]
pub struct MtuConfig {
    /// Tried in order; largest first
    pub candidates: Vec<u16>,
    /// Bytes of every transport write taken by the ATT header
    pub header_overhead: u16,
    pub safety_margin: u16,
    pub max_data_per_packet: u16,
}

impl MtuConfig {
    pub const DEFAULT_CANDIDATES: [u16; 5] = [517, 247, 185, 131, 64];
    pub const DEFAULT_HEADER_OVERHEAD: u16 = 3;
    pub const DEFAULT_SAFETY_MARGIN: u16 = 2;
    pub const DEFAULT_MAX_DATA_PER_PACKET: u16 = 244;
}

impl Default for MtuConfig {
    fn default() -> Self {
        Self {
            candidates: Self::DEFAULT_CANDIDATES.to_vec(),
            header_overhead: Self::DEFAULT_HEADER_OVERHEAD,
            safety_margin: Self::DEFAULT_SAFETY_MARGIN,
            max_data_per_packet: Self::DEFAULT_MAX_DATA_PER_PACKET,
        }
    }
}

/// Negotiation results keyed by peer identity. Clones share the same cache.
#[derive(Debug, Clone, Default)]
pub struct MtuCache(Arc<Mutex<HashMap<String, MtuNegotiationOutcome>>>);

impl MtuCache {
    pub fn get(&self, peer: &str) -> Option<MtuNegotiationOutcome> {
        self.lock().get(peer).cloned()
    }

    pub fn insert(&self, outcome: MtuNegotiationOutcome) {
        self.lock().insert(outcome.cached_for.clone(), outcome);
    }

    pub fn invalidate(&self, peer: &str) -> Option<MtuNegotiationOutcome> {
        self.lock().remove(peer)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, MtuNegotiationOutcome>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct MtuNegotiator {
    config: MtuConfig,
    cache: MtuCache,
}

impl MtuNegotiator {
    pub fn new(config: MtuConfig) -> Self {
        Self::with_cache(config, MtuCache::default())
    }

    /// Share `cache` with other negotiators, e.g. one per session to the same peers.
    pub fn with_cache(config: MtuConfig, cache: MtuCache) -> Self {
        let mut config = config;
        config.candidates.sort_unstable_by(|a, b| b.cmp(a));
        config.candidates.dedup();
        Self { config, cache }
    }

    pub fn config(&self) -> &MtuConfig {
        &self.config
    }

    pub fn cache(&self) -> &MtuCache {
        &self.cache
    }

    /// Forget `peer`, so the next negotiation contacts it again.
    pub fn invalidate(&self, peer: &str) -> Option<MtuNegotiationOutcome> {
        self.cache.invalidate(peer)
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Find the largest MTU `peer` accepts.
    ///
    /// A cached result is returned without contacting the peer, including a cached fallback.
    pub async fn negotiate<X: MtuExchange>(&self, peer: &str, exchange: &X) -> MtuNegotiationOutcome {
        if let Some(cached) = self.cache.get(peer) {
            log::debug!("MTU for {peer}: {} (cached)", cached.mtu);
            return MtuNegotiationOutcome { reason: MtuReason::Cached, ..cached };
        }

        let best = self.config.candidates.first().copied().unwrap_or(MIN_MTU);
        if let Some(current) = exchange.current_mtu() {
            if current >= best {
                return self.store(peer, current, true, MtuReason::AlreadyOptimal);
            }
        }

        for &candidate in &self.config.candidates {
            match exchange.request_mtu(candidate).await {
                Ok(granted) if (MIN_MTU..=candidate).contains(&granted) => {
                    log::info!("MTU for {peer}: requested {candidate}, granted {granted}");
                    return self.store(peer, granted, true, MtuReason::Negotiated);
                }
                Ok(granted) => {
                    log::warn!("MTU for {peer}: requested {candidate}, peer answered out of range {granted}");
                }
                Err(err) => {
                    log::warn!("MTU for {peer}: request for {candidate} failed: {err}");
                }
            }
        }

        log::warn!("MTU for {peer}: every candidate failed, falling back to {MIN_MTU}");
        self.store(peer, MIN_MTU, false, MtuReason::Fallback)
    }

    fn store(&self, peer: &str, mtu: u16, accepted: bool, reason: MtuReason) -> MtuNegotiationOutcome {
        let outcome = MtuNegotiationOutcome {
            mtu,
            accepted,
            cached_for: peer.to_string(),
            reason,
        };
        self.cache.insert(outcome.clone());
        outcome
    }

    /// The largest chunk of frame data to put in one transport write at `mtu`.
    pub fn optimal_packet_size(&self, mtu: u16) -> usize {
        let usable = mtu
            .saturating_sub(self.config.header_overhead)
            .saturating_sub(self.config.safety_margin);
        usable.clamp(1, self.config.max_data_per_packet.max(1)) as usize
    }

    /// Split `frame` into writes that fit `mtu`.
    pub fn chunk<'a>(&self, frame: &'a [u8], mtu: u16) -> impl Iterator<Item = &'a [u8]> {
        frame.chunks(self.optimal_packet_size(mtu))
    }
}

impl Default for MtuNegotiator {
    fn default() -> Self {
        Self::new(MtuConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::TransportError;

    /// Grants anything up to `limit`; fails everything if `limit` is `None`.
    struct FakePeer {
        limit: Option<u16>,
        current: Option<u16>,
        attempts: AtomicUsize,
    }

    impl FakePeer {
        fn new(limit: Option<u16>) -> Self {
            Self { limit, current: None, attempts: AtomicUsize::new(0) }
        }
    }

    impl MtuExchange for FakePeer {
        fn current_mtu(&self) -> Option<u16> {
            self.current
        }

        async fn request_mtu(&self, mtu: u16) -> Result<u16, TransportError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            match self.limit {
                Some(limit) if mtu <= limit => Ok(mtu),
                _ => Err(TransportError::MtuExchange(format!("{mtu} refused"))),
            }
        }
    }

    #[tokio::test]
    async fn test_negotiates_first_accepted_candidate() {
        let negotiator = MtuNegotiator::default();
        let peer = FakePeer::new(Some(200));
        let outcome = negotiator.negotiate("aa:bb", &peer).await;
        assert_eq!(outcome.mtu, 185);
        assert_eq!(outcome.reason, MtuReason::Negotiated);
        assert!(!outcome.is_degraded());
        assert_eq!(peer.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fallback_then_cached() {
        let negotiator = MtuNegotiator::default();
        let peer = FakePeer::new(None);

        let outcome = negotiator.negotiate("aa:bb", &peer).await;
        assert_eq!(outcome.mtu, MIN_MTU);
        assert_eq!(outcome.reason, MtuReason::Fallback);
        assert!(outcome.is_degraded());
        let attempts = peer.attempts.load(Ordering::SeqCst);
        assert_eq!(attempts, MtuConfig::DEFAULT_CANDIDATES.len());

        let again = negotiator.negotiate("aa:bb", &peer).await;
        assert_eq!(again.mtu, MIN_MTU);
        assert_eq!(again.reason, MtuReason::Cached);
        assert_eq!(peer.attempts.load(Ordering::SeqCst), attempts);
    }

    #[tokio::test]
    async fn test_already_optimal() {
        let negotiator = MtuNegotiator::default();
        let mut peer = FakePeer::new(Some(517));
        peer.current = Some(517);
        let outcome = negotiator.negotiate("aa:bb", &peer).await;
        assert_eq!(outcome.reason, MtuReason::AlreadyOptimal);
        assert_eq!(peer.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_out_of_range_grant_is_refused() {
        struct Liar;
        impl MtuExchange for Liar {
            async fn request_mtu(&self, mtu: u16) -> Result<u16, TransportError> {
                Ok(mtu + 1)
            }
        }
        let outcome = MtuNegotiator::default().negotiate("liar", &Liar).await;
        assert_eq!(outcome.reason, MtuReason::Fallback);
    }

    #[tokio::test]
    async fn test_cache_is_per_peer_and_clearable() {
        let cache = MtuCache::default();
        let negotiator = MtuNegotiator::with_cache(MtuConfig::default(), cache.clone());
        negotiator.negotiate("one", &FakePeer::new(Some(247))).await;
        negotiator.negotiate("two", &FakePeer::new(Some(64))).await;
        assert_eq!(cache.get("one").unwrap().mtu, 247);
        assert_eq!(cache.get("two").unwrap().mtu, 64);

        assert!(negotiator.invalidate("one").is_some());
        assert_eq!(cache.len(), 1);
        negotiator.clear_cache();
        assert!(cache.is_empty());

        let peer = FakePeer::new(Some(517));
        let outcome = negotiator.negotiate("two", &peer).await;
        assert_eq!(outcome.reason, MtuReason::Negotiated);
        assert_eq!(outcome.mtu, 517);
    }

    #[test]
    fn test_optimal_packet_size() {
        let negotiator = MtuNegotiator::default();
        assert_eq!(negotiator.optimal_packet_size(MIN_MTU), 18);
        assert_eq!(negotiator.optimal_packet_size(185), 180);
        assert_eq!(negotiator.optimal_packet_size(517), 244);
        assert_eq!(negotiator.optimal_packet_size(2), 1);

        let frame = [0u8; 40];
        let sizes: Vec<usize> = negotiator.chunk(&frame, MIN_MTU).map(|c| c.len()).collect();
        assert_eq!(sizes, vec![18, 18, 4]);
    }
}
