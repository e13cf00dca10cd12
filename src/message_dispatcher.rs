use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::event::Event;
use crate::message::Message;

/// The transport below this layer. It delivers opaque frames addressed by
///  endpoint and may lose, reorder or duplicate them - that is exactly what
///  this layer compensates for.
///
/// A send is best-effort: a failure is reported but the caller must not rely
///  on it reaching the peer either way. The retransmitter takes care of
///  eventual delivery.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, msg: Message) -> anyhow::Result<()>;

    /// lifecycle / membership events traveling further down the stack
    async fn forward_event(&self, event: Event);
}

/// The protocol layer above. This trait decouples the delivery machinery from
///  whatever consumes the delivered messages.
///
/// `on_message` is invoked outside all internal locks, in seqno order per
///  peer for regular messages and immediately on arrival for OOB messages.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn on_message(&self, msg: Message);

    /// lifecycle / membership events traveling further up the stack
    async fn on_event(&self, event: Event);
}
