use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use ftpsync_core::Config;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use super::backoff::RetryPolicy;
use super::cache::{ConnectionSet, Connector};
use super::command::{CommandError, CommandId, Outcome, SyncCommand};
use super::queue::WaitQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Waiting,
    Admitted,
    Running,
    Retrying,
    Finished,
}

type Slot = Arc<tokio::sync::Mutex<Option<Arc<ConnectionSet>>>>;

struct WorkerState {
    free: VecDeque<usize>,
    admitted: HashMap<CommandId, usize>,
    waiting: WaitQueue<SyncCommand>,
    states: HashMap<CommandId, CommandState>,
}

struct WorkerInner {
    limit: usize,
    connector: Connector,
    policy: RetryPolicy,
    slots: Vec<Slot>,
    state: Mutex<WorkerState>,
    busy: watch::Sender<usize>,
    tasks: TaskTracker,
}

/// Runs commands on at most `limit` connection slots; the rest wait in
/// submission order.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    pub fn new(connector: Connector, limit: usize) -> Self {
        Self::with_policy(connector, limit, RetryPolicy::default())
    }

    pub fn with_policy(connector: Connector, limit: usize, policy: RetryPolicy) -> Self {
        let limit = limit.max(1);
        let (busy, _) = watch::channel(0);
        Self {
            inner: Arc::new(WorkerInner {
                limit,
                connector,
                policy,
                slots: (0..limit)
                    .map(|_| Arc::new(tokio::sync::Mutex::new(None)))
                    .collect(),
                state: Mutex::new(WorkerState {
                    free: (0..limit).collect(),
                    admitted: HashMap::new(),
                    waiting: WaitQueue::default(),
                    states: HashMap::new(),
                }),
                busy,
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    /// Admits the command onto a free slot, or queues it behind the others.
    pub fn add_command(&self, mut command: SyncCommand) -> CommandId {
        let id = command.id();
        command.attach_worker(self.clone());
        self.inner.busy.send_modify(|busy| *busy += 1);

        let slot = {
            let mut state = self.inner.state.lock();
            let Some(slot) = state.free.pop_front() else {
                debug!(command = %id, waiting = state.waiting.len() + 1, "queued");
                state.states.insert(id, CommandState::Waiting);
                state.waiting.enqueue(command);
                return id;
            };
            state.admitted.insert(id, slot);
            state.states.insert(id, CommandState::Admitted);
            slot
        };
        debug!(command = %id, slot, "admitted");
        self.inner.tasks.spawn(slot_task(self.clone(), slot, command));
        id
    }

    pub fn is_empty(&self) -> bool {
        let state = self.inner.state.lock();
        state.admitted.is_empty() && state.waiting.is_empty()
    }

    pub fn admitted_count(&self) -> usize {
        self.inner.state.lock().admitted.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.inner.state.lock().waiting.len()
    }

    pub fn state_of(&self, id: CommandId) -> Option<CommandState> {
        self.inner.state.lock().states.get(&id).copied()
    }

    /// Ids of queued commands, oldest first.
    pub fn waiting_ids(&self) -> Vec<CommandId> {
        self.inner
            .state
            .lock()
            .waiting
            .iter()
            .map(SyncCommand::id)
            .collect()
    }

    /// Resolves once every admitted and waiting command has finished.
    pub async fn wait_idle(&self) {
        let mut busy = self.inner.busy.subscribe();
        let _ = busy.wait_for(|busy| *busy == 0).await;
    }

    /// Drops queued commands and closes the connections of every slot.
    pub async fn shutdown(&self) {
        let abandoned: Vec<SyncCommand> = self.inner.state.lock().waiting.drain().collect();
        if !abandoned.is_empty() {
            warn!(count = abandoned.len(), "dropping queued commands");
            self.inner
                .busy
                .send_modify(|busy| *busy = busy.saturating_sub(abandoned.len()));
        }
        for slot in &self.inner.slots {
            if let Some(connections) = slot.lock().await.take() {
                connections.close().await;
            }
        }
        debug!("worker connections closed");
    }

    fn set_state(&self, id: CommandId, state: CommandState) {
        self.inner.state.lock().states.insert(id, state);
    }

    async fn run_slot(&self, slot: usize, mut command: SyncCommand) {
        loop {
            let id = command.id();
            let worker = self.clone();
            let run = AssertUnwindSafe(async move {
                let outcome = worker.drive(slot, &mut command).await;
                command.finish(outcome).await;
            });
            // The slot is released whether or not the command unwound.
            if run.catch_unwind().await.is_err() {
                error!(command = %id, slot, "command panicked");
                self.reset_slot(slot).await;
            }
            self.set_state(id, CommandState::Finished);

            let next = {
                let mut state = self.inner.state.lock();
                state.admitted.remove(&id);
                match state.waiting.dequeue() {
                    Ok(next) => {
                        state.admitted.insert(next.id(), slot);
                        state.states.insert(next.id(), CommandState::Admitted);
                        Some(next)
                    }
                    Err(_) => {
                        state.free.push_back(slot);
                        None
                    }
                }
            };
            self.inner
                .busy
                .send_modify(|busy| *busy = busy.saturating_sub(1));

            match next {
                Some(next) => {
                    debug!(command = %next.id(), slot, "admitted from queue");
                    command = next;
                }
                None => break,
            }
        }
    }

    /// Executes the command until it succeeds or the retry policy gives up.
    async fn drive(&self, slot: usize, command: &mut SyncCommand) -> Outcome {
        let id = command.id();
        let mut attempt = 1;
        loop {
            let state = if attempt == 1 {
                CommandState::Running
            } else {
                CommandState::Retrying
            };
            self.set_state(id, state);
            if let Some(config) = command.config() {
                let connections = self.prepare_slot(slot, &config).await;
                command.assign_connections(connections);
            }

            let err = match command.execute().await {
                Ok(outcome) => return outcome,
                Err(err) => err,
            };
            attempt += 1;
            let Some(delay) = self.inner.policy.delay_before(attempt) else {
                error!(command = %id, error = %err, "command failed after retries");
                return Outcome::Cancelled {
                    reason: err.to_string(),
                };
            };
            warn!(command = %id, attempt, error = %err, "retrying command");
            if matches!(err, CommandError::StaleConnection(_)) {
                self.reset_slot(slot).await;
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Connections for `config` on `slot`, reusing the slot's set while it is
    /// still valid for that config.
    async fn prepare_slot(&self, slot: usize, config: &Config) -> Arc<ConnectionSet> {
        let fingerprint = config.fingerprint();
        let mut current = self.inner.slots[slot].lock().await;
        if let Some(connections) = current.as_ref()
            && connections.fingerprint() == fingerprint
            && connections.is_valid_for(config).await
        {
            debug!(slot, "reusing slot connections");
            return Arc::clone(connections);
        }
        if let Some(outdated) = current.take() {
            outdated.close().await;
        }
        let connections = Arc::new(self.inner.connector.connect_all(&fingerprint, config).await);
        *current = Some(Arc::clone(&connections));
        connections
    }

    async fn reset_slot(&self, slot: usize) {
        if let Some(connections) = self.inner.slots[slot].lock().await.take() {
            connections.close().await;
        }
    }
}

fn slot_task(worker: Worker, slot: usize, command: SyncCommand) -> BoxFuture<'static, ()> {
    Box::pin(async move { worker.run_slot(slot, command).await })
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
