pub mod consumer;
pub mod event;

use std::future::Future;
use std::time::Duration;

pub use self::consumer::{ConsumerError, Subscription, WebsocketFirehose};
pub use self::event::{Envelope, Event, EventType};

/// Normal closure: the peer finished the stream on purpose.
pub const CLOSE_NORMAL: u16 = 1000;

/// Policy violation: the traffic controller dropped a consumer that could not
/// keep up with the stream.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Source of a firehose subscription.
pub trait Firehose: Send {
    /// Ends subscriptions when no frame arrives for `timeout`. Zero disables it.
    fn set_idle_timeout(&mut self, timeout: Duration);

    /// Opens a subscription. The returned handle owns the read side of the
    /// message and error channels.
    fn subscribe(
        &mut self,
        subscription_id: &str,
        auth_token: &str,
    ) -> impl Future<Output = anyhow::Result<Subscription>> + Send;
}
