use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::notify::event::StatusEvent;

pub type ConnectionId = Uuid;
pub type EventReceiver = mpsc::Receiver<Arc<StatusEvent>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("outbound buffer full")]
    Full,
    #[error("connection closed")]
    Closed,
}

/// The core's side of a live client session.
///
/// Holds only the sending half of a bounded channel; the transport owns the
/// receiver and its socket. Once the receiver is dropped every send fails
/// with [`DeliveryError::Closed`]. [`ConnectionHandle::close`] asks the
/// transport to hang up.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sender: mpsc::Sender<Arc<StatusEvent>>,
    shutdown: CancellationToken,
}

impl ConnectionHandle {
    /// New connection with an outbound buffer of `capacity` events.
    pub fn channel(capacity: usize) -> (Self, EventReceiver) {
        let (sender, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: Uuid::new_v4(),
                sender,
                shutdown: CancellationToken::new(),
            },
            rx,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed() || self.shutdown.is_cancelled()
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Resolves once [`ConnectionHandle::close`] has been called on any clone.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    /// Non-blocking push.
    pub fn try_deliver(&self, event: &Arc<StatusEvent>) -> Result<(), DeliveryError> {
        if self.shutdown.is_cancelled() {
            return Err(DeliveryError::Closed);
        }
        self.sender.try_send(event.clone()).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::JobStatus;

    #[test]
    fn full_and_closed_are_distinguished() {
        let (conn, rx) = ConnectionHandle::channel(1);
        let ev = Arc::new(StatusEvent::new(Uuid::new_v4(), JobStatus::Pending));

        assert_eq!(conn.try_deliver(&ev), Ok(()));
        assert_eq!(conn.try_deliver(&ev), Err(DeliveryError::Full));

        drop(rx);
        assert!(conn.is_closed());
        assert_eq!(conn.try_deliver(&ev), Err(DeliveryError::Closed));
    }

    #[tokio::test]
    async fn close_wakes_every_clone() {
        let (conn, _rx) = ConnectionHandle::channel(1);
        let other = conn.clone();
        assert!(!other.is_closed());

        conn.close();
        tokio::time::timeout(std::time::Duration::from_millis(100), other.closed())
            .await
            .expect("closed() must resolve after close()");
        assert!(other.is_closed());
    }

    #[test]
    fn closed_handle_refuses_delivery() {
        let (conn, _rx) = ConnectionHandle::channel(1);
        let ev = Arc::new(StatusEvent::new(Uuid::new_v4(), JobStatus::Pending));
        conn.close();
        assert_eq!(conn.try_deliver(&ev), Err(DeliveryError::Closed));
    }
}
