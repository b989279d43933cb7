// src/events/bus.rs

//! In-process event fan-out with full history.
//!
//! Every published record is kept, so a subscriber can start at any offset
//! and see exactly the records from there on, in order, without gaps. A
//! `watch` channel carrying the record count wakes waiting subscribers.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use super::log::EventLog;
use super::{Event, EventRecord};

#[derive(Debug, Default)]
struct BusState {
    records: Vec<Arc<EventRecord>>,
    log: Option<EventLog>,
    closed: bool,
}

/// Ordered, multi-subscriber event stream for one run.
#[derive(Debug)]
pub struct EventBus {
    run_id: Uuid,
    state: Mutex<BusState>,
    len_tx: watch::Sender<u64>,
}

impl EventBus {
    /// Bus that only keeps events in memory.
    pub fn in_memory(run_id: Uuid) -> Arc<Self> {
        Self::build(run_id, None)
    }

    /// Bus that also appends every event to `<run_dir>/events.jsonl`.
    pub fn with_log(run_id: Uuid, run_dir: &Path) -> anyhow::Result<Arc<Self>> {
        let log = EventLog::open(run_dir)?;
        debug!(path = %log.path().display(), "event log opened");
        Ok(Self::build(run_id, Some(log)))
    }

    fn build(run_id: Uuid, log: Option<EventLog>) -> Arc<Self> {
        let (len_tx, _) = watch::channel(0);
        Arc::new(Self {
            run_id,
            state: Mutex::new(BusState {
                log,
                ..BusState::default()
            }),
            len_tx,
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        // A panic while holding the lock cannot leave the record list
        // half-written, so the data is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append `event` and wake subscribers. Returns its offset.
    ///
    /// Publishing `RunCompleted` closes the bus: later publishes are
    /// dropped and subscribers end after draining.
    pub fn publish(&self, event: Event) -> Option<u64> {
        let mut state = self.lock();
        if state.closed {
            warn!(?event, "event published after run completed; dropping");
            return None;
        }

        let offset = state.records.len() as u64;
        let record = EventRecord {
            offset,
            run_id: self.run_id,
            timestamp: Utc::now(),
            event,
        };

        if let Some(log) = state.log.as_mut() {
            if let Err(err) = log.append(&record) {
                warn!(error = %err, offset, "failed to persist event; continuing in memory");
            }
        }

        state.closed = record.event.is_terminal();
        state.records.push(Arc::new(record));
        let len = state.records.len() as u64;
        drop(state);

        self.len_tx.send_replace(len);
        Some(offset)
    }

    /// Number of records published so far.
    pub fn len(&self) -> u64 {
        self.lock().records.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Copy of every record published so far.
    pub fn history(&self) -> Vec<EventRecord> {
        self.lock().records.iter().map(|r| (**r).clone()).collect()
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let from = self.len();
        self.subscribe_from(from)
    }

    /// Subscribe starting at `offset`, replaying history first.
    pub fn subscribe_from(self: &Arc<Self>, offset: u64) -> Subscription {
        Subscription {
            bus: Arc::clone(self),
            cursor: offset,
            len_rx: self.len_tx.subscribe(),
        }
    }
}

/// A cursor over an [`EventBus`].
#[derive(Debug)]
pub struct Subscription {
    bus: Arc<EventBus>,
    cursor: u64,
    len_rx: watch::Receiver<u64>,
}

impl Subscription {
    /// Offset of the next record this subscription yields.
    pub fn position(&self) -> u64 {
        self.cursor
    }

    /// Next record, waiting for it if necessary.
    ///
    /// Returns `None` once the run has completed and every record has been
    /// yielded.
    pub async fn next(&mut self) -> Option<EventRecord> {
        loop {
            // Mark the current length as seen before looking, so a publish
            // racing with this check still wakes `changed()`.
            let _ = self.len_rx.borrow_and_update();

            {
                let state = self.bus.lock();
                if let Some(record) = state.records.get(self.cursor as usize) {
                    self.cursor += 1;
                    return Some((**record).clone());
                }
                if state.closed {
                    return None;
                }
            }

            if self.len_rx.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Records available right now, without waiting.
    pub fn drain_ready(&mut self) -> Vec<EventRecord> {
        let state = self.bus.lock();
        let start = (self.cursor as usize).min(state.records.len());
        let out: Vec<EventRecord> = state.records[start..].iter().map(|r| (**r).clone()).collect();
        self.cursor += out.len() as u64;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RunStatus;
    use std::time::Duration;

    fn dispatched(node: &str) -> Event {
        Event::StepDispatched {
            node: node.to_string(),
        }
    }

    fn completed() -> Event {
        Event::RunCompleted {
            status: RunStatus::Succeeded,
            error: None,
        }
    }

    #[tokio::test]
    async fn live_subscriber_sees_events_in_order_then_ends() {
        let bus = EventBus::in_memory(Uuid::new_v4());
        let mut sub = bus.subscribe();

        let producer = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move {
                for i in 0..5 {
                    bus.publish(dispatched(&format!("j.s{i}")));
                    tokio::task::yield_now().await;
                }
                bus.publish(completed());
            })
        };

        let mut offsets = Vec::new();
        while let Some(record) = tokio::time::timeout(Duration::from_secs(3), sub.next())
            .await
            .expect("subscription stalled")
        {
            offsets.push(record.offset);
        }
        producer.await.unwrap();

        assert_eq!(offsets, vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn subscribe_from_replays_history() {
        let bus = EventBus::in_memory(Uuid::new_v4());
        bus.publish(dispatched("j.a"));
        bus.publish(dispatched("j.b"));

        let mut late = bus.subscribe();
        let mut replay = bus.subscribe_from(1);
        bus.publish(completed());

        assert_eq!(replay.next().await.unwrap().event.node(), Some("j.b"));
        assert!(replay.next().await.unwrap().event.is_terminal());
        assert!(replay.next().await.is_none());

        assert_eq!(late.next().await.unwrap().offset, 2);
        assert!(late.next().await.is_none());
    }

    #[test]
    fn publishing_after_completion_is_dropped() {
        let bus = EventBus::in_memory(Uuid::new_v4());
        bus.publish(completed());
        assert_eq!(bus.publish(dispatched("j.a")), None);
        assert_eq!(bus.len(), 1);
        assert!(bus.is_closed());
    }

    #[test]
    fn persists_to_run_directory() {
        let dir = tempfile::tempdir().unwrap();
        let run_id = Uuid::new_v4();
        let bus = EventBus::with_log(run_id, dir.path()).unwrap();
        bus.publish(dispatched("j.a"));
        bus.publish(completed());

        let records = crate::events::replay(&dir.path().join(crate::events::EVENTS_FILE)).unwrap();
        assert_eq!(records, bus.history());
    }
}
