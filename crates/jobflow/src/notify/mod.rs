pub mod broadcaster;
pub mod connection;
pub mod event;
pub mod registry;

pub use broadcaster::{BroadcastStats, Broadcaster};
pub use connection::{ConnectionHandle, ConnectionId, DeliveryError, EventReceiver};
pub use event::{StatusEvent, JOB_STATUS_EVENT};
pub use registry::SubscriptionRegistry;
