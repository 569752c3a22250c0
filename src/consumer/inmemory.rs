use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::{sync::Notify, time::Instant};

use crate::{
    DeliveryHeaders, Envelope, Reminder,
    consumer::{Delivery, Receiver, Settled, Settlement},
    fault::{BrokerFault, FaultKind},
    schedule,
    transport::Sender,
};

/// In-memory queue with deferred visibility and redelivery.
///
/// Stands in for a broker in tests and local runs:
/// - published messages stay invisible until their scheduled instant
/// - abandoned messages become visible again immediately
/// - every hand-out increments the message's delivery count
/// - faults can be injected into the receive stream
///
/// Clones share the same queue, so one clone can publish (it implements
/// [`Sender`]) while another is consumed (it implements [`Receiver`]).
/// Visibility is tracked on the Tokio clock.
#[derive(Clone, Default)]
pub struct InMemoryQueue {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<QueueState>,
    wake: Notify,
}

#[derive(Default)]
struct QueueState {
    next_id: u64,
    ready: Vec<Queued>,
    in_flight: HashMap<u64, InFlight>,
    faults: VecDeque<FaultKind>,
    subscribe_faults: VecDeque<FaultKind>,
    settlements: Vec<(u64, Settled)>,
    ended: bool,
    closed: bool,
}

struct Queued {
    id: u64,
    reminder: Reminder,
    visible_at: Instant,
    delivery_count: u32,
}

struct InFlight {
    message: Queued,
    lock_lost: bool,
}

impl InMemoryQueue {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a reminder that becomes visible at `scheduled_time`.
    ///
    /// Returns the message id used in [`settlements`](Self::settlements).
    pub fn publish(&self, reminder: Reminder, scheduled_time: DateTime<Utc>) -> u64 {
        let visible_at = Instant::now() + schedule::delay_until(scheduled_time, Utc::now());
        let id = {
            let mut state = self.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.ready.push(Queued {
                id,
                reminder,
                visible_at,
                delivery_count: 0,
            });
            id
        };
        self.shared.wake.notify_one();
        id
    }

    /// Report `kind` on the receive stream before any further delivery.
    pub fn inject_fault(&self, kind: FaultKind) {
        self.lock().faults.push_back(kind);
        self.shared.wake.notify_one();
    }

    /// Make one more subscribe attempt fail with `kind`. Calls queue up, so
    /// the first attempt fails with the first kind given.
    pub fn fail_subscribe(&self, kind: FaultKind) {
        self.lock().subscribe_faults.push_back(kind);
    }

    /// Invalidate every in-flight delivery; settling one of them fails with
    /// [`FaultKind::MessageLockLost`] and the message is redelivered.
    pub fn lose_locks(&self) {
        for in_flight in self.lock().in_flight.values_mut() {
            in_flight.lock_lost = true;
        }
    }

    /// End the receive stream as if the broker cancelled the subscription.
    pub fn end_stream(&self) {
        self.lock().ended = true;
        self.shared.wake.notify_one();
    }

    /// Successful settlements, in the order they happened.
    pub fn settlements(&self) -> Vec<(u64, Settled)> {
        self.lock().settlements.clone()
    }

    /// Messages waiting in the queue, visible or not.
    pub fn ready(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn settle(&self, id: u64, settled: Settled) -> Result<(), BrokerFault> {
        let result = {
            let mut state = self.lock();
            match state.in_flight.remove(&id) {
                None => Err(BrokerFault::new(FaultKind::MessageLockLost)),
                Some(InFlight {
                    mut message,
                    lock_lost,
                }) => {
                    if lock_lost || settled == Settled::Abandoned {
                        message.visible_at = Instant::now();
                        state.ready.push(message);
                    }
                    if lock_lost {
                        Err(BrokerFault::new(FaultKind::MessageLockLost))
                    } else {
                        state.settlements.push((id, settled));
                        Ok(())
                    }
                }
            }
        };
        self.shared.wake.notify_one();
        result
    }
}

/// Settlement handle for an [`InMemoryQueue`] delivery.
pub struct InMemorySettlement {
    queue: InMemoryQueue,
    id: u64,
}

#[async_trait]
impl Settlement for InMemorySettlement {
    async fn complete(self) -> Result<(), BrokerFault> {
        self.queue.settle(self.id, Settled::Completed)
    }

    async fn abandon(self) -> Result<(), BrokerFault> {
        self.queue.settle(self.id, Settled::Abandoned)
    }
}

enum Poll {
    Ready(Option<Result<Delivery<InMemorySettlement>, BrokerFault>>),
    WaitUntil(Option<Instant>),
}

impl InMemoryQueue {
    fn poll_next(&self) -> Poll {
        let mut state = self.lock();
        if state.closed || state.ended {
            return Poll::Ready(None);
        }
        if let Some(kind) = state.faults.pop_front() {
            return Poll::Ready(Some(Err(BrokerFault::new(kind))));
        }

        let now = Instant::now();
        let due = state
            .ready
            .iter()
            .enumerate()
            .filter(|(_, m)| m.visible_at <= now)
            .min_by_key(|(_, m)| m.visible_at)
            .map(|(pos, _)| pos);

        match due {
            Some(pos) => {
                let mut message = state.ready.remove(pos);
                message.delivery_count += 1;
                let delivery = Delivery::new(
                    message.reminder.to.clone(),
                    message.reminder.body.clone(),
                    message.delivery_count,
                    InMemorySettlement {
                        queue: self.clone(),
                        id: message.id,
                    },
                );
                state.in_flight.insert(
                    message.id,
                    InFlight {
                        message,
                        lock_lost: false,
                    },
                );
                Poll::Ready(Some(Ok(delivery)))
            }
            None => Poll::WaitUntil(state.ready.iter().map(|m| m.visible_at).min()),
        }
    }
}

#[async_trait]
impl Receiver for InMemoryQueue {
    type Settlement = InMemorySettlement;

    async fn subscribe(&mut self) -> Result<(), BrokerFault> {
        let fault = self.lock().subscribe_faults.pop_front();
        match fault {
            Some(kind) => Err(BrokerFault::new(kind)),
            None => Ok(()),
        }
    }

    async fn next(&mut self) -> Option<Result<Delivery<Self::Settlement>, BrokerFault>> {
        // Immediate redeliveries must not starve other tasks.
        tokio::task::yield_now().await;
        loop {
            match self.poll_next() {
                Poll::Ready(next) => return next,
                Poll::WaitUntil(Some(at)) => {
                    tokio::select! {
                        _ = self.shared.wake.notified() => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                Poll::WaitUntil(None) => self.shared.wake.notified().await,
            }
        }
    }

    async fn close(&mut self) -> Result<(), BrokerFault> {
        self.lock().closed = true;
        self.shared.wake.notify_one();
        Ok(())
    }
}

#[async_trait]
impl Sender<DeliveryHeaders, Reminder> for InMemoryQueue {
    type Error = std::io::Error;

    async fn send(&mut self, envelope: Envelope<DeliveryHeaders, Reminder>) -> Result<(), Self::Error> {
        if self.is_closed() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "in-memory queue is closed",
            ));
        }
        let id = self.publish(envelope.message, envelope.headers.scheduled_time);
        tracing::debug!(id, to = %envelope.headers.to, "Message enqueued");
        Ok(())
    }
}
