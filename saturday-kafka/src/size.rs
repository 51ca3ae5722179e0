use slog::{warn, Logger};
use tokio::sync::broadcast;

use crate::config::WARNING_MESSAGE_SIZE;

/// An outgoing payload above the warning threshold or the byte ceiling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeWarning {
    pub topic: String,
    pub len: usize,
    pub ceiling: usize,
}

/// Non-fatal oversize reporting shared by both publishers. Sends always proceed.
pub(crate) struct SizeGovernor {
    ceiling: usize,
    tx: broadcast::Sender<SizeWarning>,
    logger: Logger,
}

impl SizeGovernor {
    pub(crate) fn new(ceiling: usize, logger: Logger) -> Self {
        let (tx, _) = broadcast::channel(128);
        Self { ceiling, tx, logger }
    }

    #[inline]
    pub(crate) fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SizeWarning> {
        self.tx.subscribe()
    }

    pub(crate) fn check(&self, topic: &str, len: usize) {
        if len <= WARNING_MESSAGE_SIZE && len <= self.ceiling {
            return;
        }
        warn!(self.logger, "message size exceeds the recommended limit";
            "topic" => topic, "len" => len, "ceiling" => self.ceiling);
        // no receivers is fine
        let _ = self.tx.send(SizeWarning { topic: topic.to_owned(), len, ceiling: self.ceiling });
    }
}
