//! Engine event stream.
//!
//! Workers publish events over a tokio broadcast channel; any number of
//! observers (UIs, log taps, tests) can subscribe and lag independently.

use tokio::sync::broadcast;
use uuid::Uuid;

use super::job::{GenerationRecord, StreamingState};
use super::progress::ProgressStats;

/// Capacity of the broadcast channel. Slow observers that fall further
/// behind than this lose the oldest events, never block a worker.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events emitted while a job runs.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Progress counters changed.
    Progress(ProgressStats),
    /// An in-flight item's streaming state advanced.
    Snapshot(StreamingState),
    /// One item reached a terminal record.
    ItemFinished(GenerationRecord),
    /// One item was halted by an operator; no record was produced.
    ItemHalted(Uuid),
    /// Every discovered item has been processed.
    JobFinished(ProgressStats),
}

/// Create the broadcast pair used by the engine.
pub(crate) fn channel() -> (broadcast::Sender<EngineEvent>, broadcast::Receiver<EngineEvent>) {
    broadcast::channel(EVENT_CHANNEL_CAPACITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_fan_out_to_every_subscriber() {
        let (tx, mut rx_a) = channel();
        let mut rx_b = tx.subscribe();

        tx.send(EngineEvent::ItemHalted(Uuid::nil())).expect("send");

        assert!(matches!(
            rx_a.try_recv().expect("rx_a"),
            EngineEvent::ItemHalted(_)
        ));
        assert!(matches!(
            rx_b.try_recv().expect("rx_b"),
            EngineEvent::ItemHalted(_)
        ));
    }
}
