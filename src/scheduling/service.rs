//! Command scheduling service.
//!
//! The in-process core that processors talk to. It owns the processor pool,
//! a request queue and an outbound update queue per processor, and the
//! record of every submitted command. The TCP transport and the processor
//! agent both go through the [`CommandScheduling`] trait, so a processor can
//! be tested against the service directly.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::processor::{Processor, ProcessorPool, ProcessorRegistration};
use super::protocol::{CommandRequest, CommandStatus, CommandUpdate};
use super::status::ProcessorStatus;
use crate::errors::{Result, SchedulingError};
use crate::observability::sanitize_for_log;

/// RPC surface between processors and the scheduling core.
#[async_trait]
pub trait CommandScheduling: Send + Sync {
    /// Register or re-register a processor; returns the canonical record.
    async fn register_processor(&self, registration: ProcessorRegistration) -> Result<Processor>;

    /// Request payload of one submitted command.
    async fn get_command(&self, id: &str) -> Result<CommandRequest>;

    /// Every request assigned to the processor, oldest first. The stream
    /// stays open until dropped.
    async fn get_command_requests(
        &self,
        processor_id: &str,
    ) -> Result<BoxStream<'static, CommandRequest>>;

    /// Push updates for executed commands; receive updates the processor
    /// must act on, such as cancellation requests.
    async fn get_and_send_command_updates(
        &self,
        processor_id: &str,
        updates: BoxStream<'static, CommandUpdate>,
    ) -> Result<BoxStream<'static, CommandUpdate>>;
}

/// Adapt an unbounded receiver into a boxed stream.
pub fn receiver_stream<T: Send + 'static>(
    mut rx: mpsc::UnboundedReceiver<T>,
) -> BoxStream<'static, T> {
    stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed()
}

/// FIFO with an async pop.
struct WorkQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> WorkQueue<T> {
    fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn push(&self, item: T) {
        self.items.lock().push_back(item);
        self.notify.notify_one();
    }

    fn push_front(&self, item: T) {
        self.items.lock().push_front(item);
        self.notify.notify_one();
    }

    async fn pop(&self) -> T {
        loop {
            let next = self.items.lock().pop_front();
            if let Some(item) = next {
                return item;
            }
            // notify_one stores a permit when nobody waits, so a push between
            // the check and this await is not lost.
            self.notify.notified().await;
        }
    }

    fn remove_where(&self, predicate: impl Fn(&T) -> bool) -> bool {
        let mut items = self.items.lock();
        let before = items.len();
        items.retain(|item| !predicate(item));
        before != items.len()
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }
}

struct CommandRecord {
    request: CommandRequest,
    status: CommandStatus,
    watcher: Option<mpsc::UnboundedSender<CommandUpdate>>,
}

type QueueMap<T> = Mutex<HashMap<String, Arc<WorkQueue<T>>>>;

/// Final statuses kept after a command's record is dropped.
const FINISHED_HISTORY: usize = 1024;

struct ServiceState {
    processors: ProcessorPool,
    /// Commands not finished yet
    commands: RwLock<HashMap<String, CommandRecord>>,
    finished: Mutex<VecDeque<(String, CommandStatus)>>,
    requests: QueueMap<CommandRequest>,
    outbound: QueueMap<CommandUpdate>,
}

impl ServiceState {
    fn finished_status(&self, id: &str) -> Option<CommandStatus> {
        self.finished
            .lock()
            .iter()
            .rev()
            .find(|(finished, _)| finished == id)
            .map(|(_, status)| *status)
    }

    fn remember_finished(&self, id: String, status: CommandStatus) {
        let mut finished = self.finished.lock();
        if finished.len() == FINISHED_HISTORY {
            finished.pop_front();
        }
        finished.push_back((id, status));
    }
}

fn queue_for<T>(map: &QueueMap<T>, processor_id: &str) -> Arc<WorkQueue<T>> {
    map.lock()
        .entry(processor_id.to_string())
        .or_insert_with(|| Arc::new(WorkQueue::new()))
        .clone()
}

#[derive(Clone)]
pub struct SchedulingService {
    state: Arc<ServiceState>,
}

impl Default for SchedulingService {
    fn default() -> Self {
        Self::new(ProcessorPool::new())
    }
}

impl SchedulingService {
    pub fn new(processors: ProcessorPool) -> Self {
        Self {
            state: Arc::new(ServiceState {
                processors,
                commands: RwLock::new(HashMap::new()),
                finished: Mutex::new(VecDeque::new()),
                requests: Mutex::new(HashMap::new()),
                outbound: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn processors(&self) -> &ProcessorPool {
        &self.state.processors
    }

    /// Queue `request` for the processor and return the stream of updates
    /// for it.
    pub async fn submit(
        &self,
        processor_id: &str,
        mut request: CommandRequest,
    ) -> Result<mpsc::UnboundedReceiver<CommandUpdate>> {
        if self.state.processors.get(processor_id).await.is_none() {
            return Err(SchedulingError::UnknownProcessor {
                id: processor_id.to_string(),
            }
            .into());
        }
        request.processor_id = Some(processor_id.to_string());

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut commands = self.state.commands.write().await;
            commands.insert(
                request.id.clone(),
                CommandRecord {
                    request: request.clone(),
                    status: CommandStatus::Pending,
                    watcher: Some(tx),
                },
            );
        }
        self.state.processors.assign(processor_id, &request.id).await;

        info!(
            command = %sanitize_for_log(&request.name),
            id = request.id.as_str(),
            processor = processor_id,
            execution = %request.execution,
            "Command submitted"
        );
        queue_for(&self.state.requests, processor_id).push(request);
        Ok(rx)
    }

    /// Status of a running command, or the final status of a recently
    /// finished one.
    pub async fn command_status(&self, id: &str) -> Option<CommandStatus> {
        let running = self.state.commands.read().await.get(id).map(|r| r.status);
        running.or_else(|| self.state.finished_status(id))
    }

    /// Commands submitted and not finished yet.
    pub async fn active_commands(&self) -> usize {
        self.state.commands.read().await.len()
    }

    /// Keep only the delivered requests no update has been received for.
    pub async fn retain_unacknowledged(&self, delivered: &mut Vec<CommandRequest>) {
        let commands = self.state.commands.read().await;
        delivered.retain(|request| {
            commands
                .get(&request.id)
                .is_some_and(|record| record.status == CommandStatus::Pending)
        });
    }

    /// Put requests a processor never acknowledged back at the front of its
    /// queue, in their original order.
    pub async fn requeue_unacknowledged(&self, processor_id: &str, mut delivered: Vec<CommandRequest>) {
        self.retain_unacknowledged(&mut delivered).await;
        if delivered.is_empty() {
            return;
        }
        warn!(
            processor = %sanitize_for_log(processor_id),
            count = delivered.len(),
            "Requeueing requests the processor never acknowledged"
        );
        let queue = queue_for(&self.state.requests, processor_id);
        for request in delivered.into_iter().rev() {
            queue.push_front(request);
        }
    }

    /// Drop shut down processors along with their queues.
    pub async fn evict_shut_down(&self) -> Vec<String> {
        let evicted = self.state.processors.evict_shut_down().await;
        if !evicted.is_empty() {
            let mut requests = self.state.requests.lock();
            let mut outbound = self.state.outbound.lock();
            for id in &evicted {
                requests.remove(id);
                outbound.remove(id);
            }
        }
        evicted
    }

    /// Requests queued for a processor but not yet picked up.
    pub fn pending_requests(&self, processor_id: &str) -> usize {
        queue_for(&self.state.requests, processor_id).len()
    }

    /// Ask for a command to stop. A request still queued is withdrawn;
    /// otherwise the processor receives a `CancelRequested` update.
    pub async fn request_cancel(&self, command_id: &str) -> Result<()> {
        let current = {
            let commands = self.state.commands.read().await;
            commands
                .get(command_id)
                .map(|record| (record.request.clone(), record.status))
        };
        let (request, status) = match current {
            Some(current) => current,
            None if self.state.finished_status(command_id).is_some() => return Ok(()),
            None => {
                return Err(SchedulingError::UnknownCommand {
                    id: command_id.to_string(),
                }
                .into())
            }
        };
        if status.is_terminal() {
            return Ok(());
        }
        let Some(processor_id) = request.processor_id.clone() else {
            return Ok(());
        };

        let withdrawn = status == CommandStatus::Pending
            && queue_for(&self.state.requests, &processor_id)
                .remove_where(|queued| queued.id == command_id);
        if withdrawn {
            debug!(id = command_id, "Withdrew queued command");
            let update = CommandUpdate::new(&request, CommandStatus::Cancelled)
                .with_message("cancelled before it was picked up");
            self.apply_update(&processor_id, update).await;
        } else {
            info!(id = command_id, processor = processor_id.as_str(), "Requesting cancellation");
            queue_for(&self.state.outbound, &processor_id)
                .push(CommandUpdate::new(&request, CommandStatus::CancelRequested));
        }
        Ok(())
    }

    /// Record an update from a processor and forward it to the submitter.
    async fn apply_update(&self, processor_id: &str, update: CommandUpdate) {
        let finished = {
            let mut commands = self.state.commands.write().await;
            let Some(record) = commands.get_mut(&update.id) else {
                if self.state.finished_status(&update.id).is_some() {
                    debug!(id = %sanitize_for_log(&update.id), "Update after completion ignored");
                } else {
                    warn!(
                        id = %sanitize_for_log(&update.id),
                        "Update for unknown command ignored"
                    );
                }
                return;
            };
            record.status = update.status;
            let terminal = update.status.is_terminal();
            if let Some(watcher) = &record.watcher {
                let _ = watcher.send(update.clone());
            }
            if terminal {
                commands.remove(&update.id);
                self.state.remember_finished(update.id.clone(), update.status);
            }
            terminal
        };

        let processors = &self.state.processors;
        if update.status == CommandStatus::Running {
            if let Some(entry) = processors.get(processor_id).await {
                if entry.processor.status == ProcessorStatus::Idle {
                    let _ = processors
                        .set_status(processor_id, ProcessorStatus::Processing)
                        .await;
                }
            }
        }
        if finished {
            let remaining = processors.release(processor_id, &update.id).await;
            if remaining == 0 {
                if let Some(entry) = processors.get(processor_id).await {
                    if entry.processor.status == ProcessorStatus::Processing {
                        let _ = processors
                            .set_status(processor_id, ProcessorStatus::Idle)
                            .await;
                    }
                }
            }
        }
    }

    /// Periodically mark silent processors as not responding.
    pub fn spawn_liveness_monitor(
        &self,
        interval: Duration,
        deadline: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let swept = service.state.processors.sweep_unresponsive(deadline).await;
                        if !swept.is_empty() {
                            debug!(count = swept.len(), "Liveness sweep");
                        }
                        service.evict_shut_down().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl CommandScheduling for SchedulingService {
    async fn register_processor(&self, registration: ProcessorRegistration) -> Result<Processor> {
        Ok(self.state.processors.register(registration).await?)
    }

    async fn get_command(&self, id: &str) -> Result<CommandRequest> {
        let commands = self.state.commands.read().await;
        commands
            .get(id)
            .map(|record| record.request.clone())
            .ok_or_else(|| SchedulingError::UnknownCommand { id: id.to_string() }.into())
    }

    async fn get_command_requests(
        &self,
        processor_id: &str,
    ) -> Result<BoxStream<'static, CommandRequest>> {
        if self.state.processors.get(processor_id).await.is_none() {
            return Err(SchedulingError::UnknownProcessor {
                id: processor_id.to_string(),
            }
            .into());
        }
        self.state.processors.touch(processor_id).await;

        let queue = queue_for(&self.state.requests, processor_id);
        Ok(stream::unfold(queue, |queue| async move {
            let request = queue.pop().await;
            Some((request, queue))
        })
        .boxed())
    }

    async fn get_and_send_command_updates(
        &self,
        processor_id: &str,
        mut updates: BoxStream<'static, CommandUpdate>,
    ) -> Result<BoxStream<'static, CommandUpdate>> {
        if self.state.processors.get(processor_id).await.is_none() {
            return Err(SchedulingError::UnknownProcessor {
                id: processor_id.to_string(),
            }
            .into());
        }

        let service = self.clone();
        let id = processor_id.to_string();
        tokio::spawn(async move {
            while let Some(update) = updates.next().await {
                service.state.processors.touch(&id).await;
                service.apply_update(&id, update).await;
            }
            debug!(processor = id.as_str(), "Update stream closed");
        });

        let queue = queue_for(&self.state.outbound, processor_id);
        Ok(stream::unfold(queue, |queue| async move {
            let update = queue.pop().await;
            Some((update, queue))
        })
        .boxed())
    }
}
