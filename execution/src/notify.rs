//! Fire-and-forget payout notifications.

use parlor_types::GameKind;
use tokio::sync::mpsc;
use tracing::info;

/// One credited payout, emitted after the settling transition commits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notice {
    pub participant: String,
    pub nickname: String,
    pub game: GameKind,
    pub round_id: u64,
    pub amount: u64,
}

/// Delivery is best effort: a sink must never fail the caller.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Writes each notice to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notice: Notice) {
        info!(
            participant = %notice.participant,
            game = %notice.game,
            round_id = notice.round_id,
            amount = notice.amount,
            "payout credited"
        );
    }
}

/// Forwards notices to a channel; a closed receiver drops them.
#[derive(Clone, Debug)]
pub struct ChannelNotifier {
    sender: mpsc::UnboundedSender<Notice>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notice: Notice) {
        let _ = self.sender.send(notice);
    }
}

impl<N: Notifier + ?Sized> Notifier for std::sync::Arc<N> {
    fn notify(&self, notice: Notice) {
        (**self).notify(notice)
    }
}
