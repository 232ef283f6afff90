//! The seams between the protocol core and whatever carries its bytes.

use std::future::Future;

use crate::error::TransportError;

/// A connected, byte-oriented channel to the peripheral.
///
/// Inbound bytes are not part of this trait: they are handed to
/// [`crate::BmsSession::feed`] (or [`crate::BmsSession::pump`]) in arrival order.
pub trait Transport: Send + Sync {
    /// Write bytes to the peripheral. One call is one transport write; callers chunk to the
    /// negotiated MTU before calling.
    fn write(&self, bytes: &[u8]) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// The transport's payload-size negotiation primitive.
pub trait MtuExchange: Send + Sync {
    /// The MTU currently in effect, if the transport knows it.
    fn current_mtu(&self) -> Option<u16> {
        None
    }

    /// Ask the peer for `mtu`. Returns the MTU the peer granted.
    fn request_mtu(&self, mtu: u16) -> impl Future<Output = Result<u16, TransportError>> + Send;
}

impl<T: Transport> Transport for std::sync::Arc<T> {
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.as_ref().write(bytes).await
    }
}

impl<T: MtuExchange> MtuExchange for std::sync::Arc<T> {
    fn current_mtu(&self) -> Option<u16> {
        self.as_ref().current_mtu()
    }

    async fn request_mtu(&self, mtu: u16) -> Result<u16, TransportError> {
        self.as_ref().request_mtu(mtu).await
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Records every write; can be told to fail.
    #[derive(Default)]
    pub struct MockTransport {
        pub writes: Mutex<Vec<Vec<u8>>>,
        pub fail: AtomicBool,
    }

    impl MockTransport {
        pub fn written(&self) -> Vec<Vec<u8>> {
            self.writes.lock().unwrap().clone()
        }

        pub fn set_failing(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }
    }

    impl Transport for MockTransport {
        async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::WriteFailed("mock failure".into()));
            }
            self.writes.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }
    }
}
