//! Outbound queue entries.

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::ClientError;

/// Result slot of a synchronous send.
pub type SendResult = oneshot::Receiver<Result<(), ClientError>>;

/// An outbound payload plus an optional completion signal.
#[derive(Debug)]
pub struct Envelope {
    /// Plaintext payload.
    pub payload: Bytes,
    result: Option<oneshot::Sender<Result<(), ClientError>>>,
}

impl Envelope {
    /// Fire-and-forget envelope.
    #[must_use]
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            result: None,
        }
    }

    /// Envelope whose write result is reported on the returned receiver.
    #[must_use]
    pub fn with_result(payload: impl Into<Bytes>) -> (Self, SendResult) {
        let (tx, rx) = oneshot::channel();
        let envelope = Self {
            payload: payload.into(),
            result: Some(tx),
        };
        (envelope, rx)
    }

    /// Whether a caller waits for this envelope's result.
    #[must_use]
    pub fn is_sync(&self) -> bool {
        self.result.is_some()
    }

    /// Report the write result. A caller that gave up is ignored.
    pub fn complete(&mut self, result: Result<(), ClientError>) {
        if let Some(tx) = self.result.take() {
            let _ = tx.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_result_delivered_once() {
        let (mut envelope, rx) = Envelope::with_result("hi");
        assert!(envelope.is_sync());

        envelope.complete(Ok(()));
        envelope.complete(Err(ClientError::Stopped));
        assert!(rx.await.unwrap().is_ok());
        assert!(!envelope.is_sync());
    }

    #[tokio::test]
    async fn test_dropped_envelope_closes_receiver() {
        let (envelope, rx) = Envelope::with_result("hi");
        drop(envelope);
        assert!(rx.await.is_err());
    }
}
