//! Scheduled delivery loop.
//!
//! Every interval the loop pulls pending items that are due, commits each one
//! through the store (message row + `sent` status in one transaction) and only
//! then hands the message to the dispatcher. A store error leaves the item
//! pending for the next tick; a refused send is terminal.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::{JoinHandle, spawn_blocking};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_db::{CancelOutcome, DeliveryOutcome, ScheduleStore};
use parley_types::codec::MAX_STRING_LEN;
use parley_types::envelope::Envelope;
use parley_types::models::{Peer, ScheduledMessage, ScheduledStatus, trim_to_micros};

use crate::dispatcher::Dispatcher;
use crate::error::SchedulerError;

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub due: usize,
    pub sent: usize,
    pub failed: usize,
    /// Resolved elsewhere (cancelled, or sent by an earlier run) before commit.
    pub skipped: usize,
    /// Store errors; those items stay pending.
    pub errors: usize,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    store: Arc<dyn ScheduleStore>,
    dispatcher: Dispatcher,
    batch_limit: usize,
    /// Held for the whole tick. Ticks never overlap.
    tick_guard: tokio::sync::Mutex<()>,
    /// Items whose commit has started.
    in_flight: Mutex<HashSet<Uuid>>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn ScheduleStore>, dispatcher: Dispatcher, batch_limit: usize) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                dispatcher,
                batch_limit: batch_limit.max(1),
                tick_guard: tokio::sync::Mutex::new(()),
                in_flight: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Persist a new `pending` item. Targets are checked at delivery time.
    pub async fn schedule(
        &self,
        author_id: Uuid,
        peer: Peer,
        body: String,
        scheduled_at: DateTime<Utc>,
    ) -> Result<ScheduledMessage, SchedulerError> {
        if body.trim().is_empty() {
            return Err(SchedulerError::Invalid("body is empty"));
        }
        if body.len() > MAX_STRING_LEN {
            return Err(SchedulerError::Invalid("body is too long"));
        }

        let item = ScheduledMessage {
            id: Uuid::new_v4(),
            author_id,
            peer,
            body,
            scheduled_at: trim_to_micros(scheduled_at),
            status: ScheduledStatus::Pending,
            sent_at: None,
        };

        let store = self.inner.store.clone();
        let row = item.clone();
        spawn_blocking(move || store.insert_scheduled(&row)).await??;

        info!(
            "scheduled message {} from {} to {} at {}",
            item.id, item.author_id, item.peer, item.scheduled_at
        );
        Ok(item)
    }

    /// Cancel a pending item owned by `author_id`. Cancelling twice is fine;
    /// anything already sent, failed or mid-commit is a conflict.
    pub async fn cancel(&self, author_id: Uuid, id: Uuid) -> Result<ScheduledMessage, SchedulerError> {
        if self.in_flight().contains(&id) {
            return Err(SchedulerError::InFlight(id));
        }

        let store = self.inner.store.clone();
        match spawn_blocking(move || store.cancel_scheduled(id, author_id)).await?? {
            CancelOutcome::Cancelled(item) => {
                info!("scheduled message {} cancelled by {}", id, author_id);
                Ok(item)
            }
            CancelOutcome::AlreadyCancelled(item) => Ok(item),
            CancelOutcome::Resolved(item) => Err(SchedulerError::Conflict {
                id,
                status: item.status,
            }),
            CancelOutcome::NotFound => Err(SchedulerError::NotFound(id)),
        }
    }

    pub async fn tick(&self) -> Result<Option<TickReport>, SchedulerError> {
        self.tick_at(Utc::now()).await
    }

    /// Run one pass as of `now`. Returns `None` when a tick is already running.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<Option<TickReport>, SchedulerError> {
        let Ok(_guard) = self.inner.tick_guard.try_lock() else {
            debug!("scheduler tick already running, skipping");
            return Ok(None);
        };
        let now = trim_to_micros(now);

        let store = self.inner.store.clone();
        let limit = self.inner.batch_limit;
        let due = spawn_blocking(move || store.due_scheduled(now, limit)).await??;

        let mut report = TickReport {
            due: due.len(),
            ..TickReport::default()
        };

        // Due order is scheduled_at ascending; keep it.
        for item in due {
            match self.deliver(item.id, now).await {
                Ok(DeliveryOutcome::Sent { item, message }) => {
                    report.sent += 1;
                    info!(
                        "scheduled message {} sent to {} as {}",
                        item.id, item.peer, message.id
                    );
                    if let Err(e) = self.inner.dispatcher.publish_message(&message) {
                        warn!("scheduled message {} stored but not pushed: {}", item.id, e);
                    }
                    self.notify_author(item);
                }
                Ok(DeliveryOutcome::Failed { item, reason }) => {
                    report.failed += 1;
                    warn!("scheduled message {} failed: {}", item.id, reason);
                    self.notify_author(item);
                }
                Ok(DeliveryOutcome::Skipped { id, status }) => {
                    report.skipped += 1;
                    debug!("scheduled message {} skipped (status {:?})", id, status);
                }
                Err(e) => {
                    report.errors += 1;
                    warn!("scheduled message {} left pending: {}", item.id, e);
                }
            }
        }

        if report.due > 0 {
            info!(
                "scheduler tick: {} due, {} sent, {} failed, {} skipped, {} errors",
                report.due, report.sent, report.failed, report.skipped, report.errors
            );
        }
        Ok(Some(report))
    }

    /// Start the polling loop. It stops after `shutdown` fires, never in the
    /// middle of a tick.
    pub fn spawn(&self, period: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("scheduler started, polling every {:?}", period);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = scheduler.tick().await {
                            warn!("scheduler tick failed: {}", e);
                        }
                    }
                }
            }

            info!("scheduler stopped");
        })
    }

    async fn deliver(&self, id: Uuid, now: DateTime<Utc>) -> Result<DeliveryOutcome, SchedulerError> {
        let _claim = InFlight::claim(&self.inner.in_flight, id);
        let store = self.inner.store.clone();
        let outcome = spawn_blocking(move || store.deliver_scheduled(id, Uuid::new_v4(), now)).await??;
        Ok(outcome)
    }

    fn notify_author(&self, item: ScheduledMessage) {
        let (id, author_id) = (item.id, item.author_id);
        if let Err(e) = self
            .inner
            .dispatcher
            .publish_to_user(author_id, &Envelope::ScheduledUpdate(item))
        {
            warn!("update for scheduled message {} not pushed: {}", id, e);
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, HashSet<Uuid>> {
        self.inner.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Marks an item as mid-commit until dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<Uuid>>,
    id: Uuid,
}

impl<'a> InFlight<'a> {
    fn claim(set: &'a Mutex<HashSet<Uuid>>, id: Uuid) -> Self {
        set.lock().unwrap_or_else(PoisonError::into_inner).insert(id);
        Self { set, id }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}
