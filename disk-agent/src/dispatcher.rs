// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-key serialized dispatch of block-device events.
//!
//! The embedding process feeds resource events into a [`WorkQueue`]; a
//! dispatcher task invokes the handler with these guarantees:
//!
//! * at most one handler runs for a given key at a time;
//! * handlers for different keys run in parallel;
//! * events arriving for a busy key coalesce into a single follow-up run;
//! * a failed handler is retried after a fixed delay.

use disk_agent_types::BlockDevice;
use futures::FutureExt;
use slog::{Logger, o, warn};
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Delay before re-running a handler that returned an error. Matches the
/// cadence at which transient store and orchestrator hiccups clear.
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// A resource event, keyed by resource name.
#[derive(Clone, Debug)]
pub enum Event {
    /// The resource was created or updated.
    Changed(String),
    /// The resource was deleted; carries the final observed state.
    Removed(Box<BlockDevice>),
}

impl Event {
    pub fn key(&self) -> &str {
        match self {
            Event::Changed(key) => key,
            Event::Removed(device) => device.name(),
        }
    }
}

/// Implemented by the controller; invoked by the dispatcher task.
pub trait EventHandler: Send + Sync + 'static {
    fn handle(
        &self,
        event: &Event,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Handle for feeding events to the dispatcher. Cloneable; the dispatcher
/// task exits once every handle is dropped and in-flight work finishes.
#[derive(Clone, Debug)]
pub struct WorkQueue {
    tx: mpsc::UnboundedSender<Event>,
}

impl WorkQueue {
    pub fn enqueue(&self, event: Event) {
        // Send only fails when the dispatcher is shutting down.
        let _ = self.tx.send(event);
    }

    /// Schedules a change event for `name` after `delay`.
    pub fn enqueue_after(&self, name: impl Into<String>, delay: Duration) {
        let tx = self.tx.clone();
        let name = name.into();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Event::Changed(name));
        });
    }
}

/// Spawns the dispatcher task for `handler`.
pub fn spawn<H: EventHandler>(handler: Arc<H>, log: &Logger) -> WorkQueue {
    spawn_with_retry_delay(handler, log, RETRY_DELAY)
}

pub fn spawn_with_retry_delay<H: EventHandler>(
    handler: Arc<H>,
    log: &Logger,
    retry_delay: Duration,
) -> WorkQueue {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = DispatchTask {
        rx,
        retry_tx: tx.downgrade(),
        retry_delay,
        handler,
        pending: BTreeMap::new(),
        order: VecDeque::new(),
        running: BTreeMap::new(),
        tasks: JoinSet::new(),
        log: log.new(o!("component" => "WorkQueue")),
    };
    tokio::spawn(task.run());
    WorkQueue { tx }
}

struct DispatchTask<H> {
    rx: mpsc::UnboundedReceiver<Event>,
    // Weak so that retries do not keep the queue alive after every
    // WorkQueue handle is gone.
    retry_tx: mpsc::WeakUnboundedSender<Event>,
    retry_delay: Duration,
    handler: Arc<H>,
    /// Latest event per key not yet running.
    pending: BTreeMap<String, Event>,
    /// FIFO among keys with a pending event.
    order: VecDeque<String>,
    /// Keys with a handler in flight, with the coalesced follow-up event
    /// if more work arrived meanwhile.
    running: BTreeMap<String, Option<Event>>,
    tasks: JoinSet<(String, Event, anyhow::Result<()>)>,
    log: Logger,
}

impl<H: EventHandler> DispatchTask<H> {
    async fn run(mut self) {
        loop {
            self.start_ready();
            tokio::select! {
                maybe_event = self.rx.recv() => {
                    match maybe_event {
                        Some(event) => self.route(event),
                        None => break,
                    }
                }
                // Resolves to `None` (disabling this branch) while no
                // handler is in flight.
                Some(joined) = self.tasks.join_next() => {
                    if let Ok(done) = joined {
                        self.finish(done);
                    }
                }
            }
        }

        // Every handle is gone; run down queued and in-flight work, then
        // exit.
        loop {
            self.start_ready();
            match self.tasks.join_next().await {
                Some(joined) => {
                    if let Ok(done) = joined {
                        self.finish(done);
                    }
                }
                None if self.pending.is_empty() => break,
                None => (),
            }
        }
    }

    fn route(&mut self, event: Event) {
        let key = event.key().to_string();
        if let Some(follow_up) = self.running.get_mut(&key) {
            *follow_up = Some(event);
        } else if self.pending.contains_key(&key) {
            self.pending.insert(key, event);
        } else {
            self.pending.insert(key.clone(), event);
            self.order.push_back(key);
        }
    }

    fn start_ready(&mut self) {
        while let Some(key) = self.order.pop_front() {
            let Some(event) = self.pending.remove(&key) else {
                continue;
            };
            let handler = Arc::clone(&self.handler);
            self.running.insert(key.clone(), None);
            self.tasks.spawn(async move {
                let result =
                    std::panic::AssertUnwindSafe(handler.handle(&event))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            Err(anyhow::anyhow!("event handler panicked"))
                        });
                (key, event, result)
            });
        }
    }

    fn finish(&mut self, done: (String, Event, anyhow::Result<()>)) {
        let (key, event, result) = done;
        if let Err(err) = result {
            warn!(
                self.log, "event handler failed, will retry";
                "key" => event.key(),
                "retry_after" => ?self.retry_delay,
                "error" => format!("{err:#}"),
            );
            if let Some(tx) = self.retry_tx.upgrade() {
                let retry_delay = self.retry_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(retry_delay).await;
                    let _ = tx.send(event);
                });
            }
        }
        if let Some(follow_up) = self.running.remove(&key).flatten() {
            self.route(follow_up);
        }
    }
}
