use log::{error, info, warn};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::mpsc;

use kernel_proxy::{ExecuteReply, KernelError, KernelService};

use crate::cell::CellId;

/// Status of a queued cell
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CellQueueStatus {
    /// Waiting in queue
    Pending,
    /// Currently executing
    Executing,
}

/// A cell in the execution queue
#[derive(Debug, Clone, Serialize)]
pub struct QueuedCell {
    pub cell_id: CellId,
    pub status: CellQueueStatus,
    /// Position in queue (0 = currently executing or next)
    pub position: usize,
}

/// Snapshot of the queue for presentation
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionQueueState {
    /// Is the queue processing (has pending or executing cells)?
    pub processing: bool,
    /// Cells currently in queue (pending + executing)
    pub cells: Vec<QueuedCell>,
    /// ID of currently executing cell (if any)
    pub executing_cell_id: Option<CellId>,
}

/// A run request. The source is captured when the cell is queued, so later
/// edits do not change what runs.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedRun {
    pub cell_id: CellId,
    pub source: String,
}

/// Commands sent to the queue processor
#[derive(Debug)]
pub enum QueueCommand {
    /// Enqueue a cell for execution
    Enqueue(QueuedRun),
    /// Drop a pending cell (its cell was deleted or merged away)
    Dequeue(CellId),
    /// Interrupt current execution and clear queue
    InterruptAndClear,
    /// Abandon everything and restart the kernel
    Restart,
}

/// Events delivered back to the editing thread
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    Started { cell_id: CellId },
    Finished { cell_id: CellId, reply: ExecuteReply },
    Failed { cell_id: CellId, error: KernelError },
    /// Cells dropped from the queue without running
    Cancelled { cell_ids: Vec<CellId> },
    /// An interrupt or restart request failed
    KernelFailed { error: KernelError },
    Restarted,
}

/// The execution queue - owns the pending/executing state
#[derive(Debug, Default)]
pub struct ExecutionQueue {
    /// Pending runs (FIFO)
    pending: VecDeque<QueuedRun>,
    /// Currently executing cell ID
    executing: Option<CellId>,
}

impl ExecutionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a cell for execution
    pub fn enqueue(&mut self, run: QueuedRun) {
        self.pending.push_back(run);
    }

    /// Get next run (if queue is non-empty and nothing executing)
    pub fn dequeue(&mut self) -> Option<QueuedRun> {
        if self.executing.is_some() {
            return None;
        }
        let run = self.pending.pop_front()?;
        self.executing = Some(run.cell_id.clone());
        Some(run)
    }

    /// Mark current execution as complete
    pub fn complete(&mut self, cell_id: &CellId) {
        if self.executing.as_ref() == Some(cell_id) {
            self.executing = None;
        }
    }

    /// Clear all pending (but not currently executing)
    pub fn clear_pending(&mut self) -> Vec<CellId> {
        self.pending.drain(..).map(|run| run.cell_id).collect()
    }

    /// Remove a pending run. The executing cell is left alone.
    pub fn remove_pending(&mut self, cell_id: &CellId) -> bool {
        let before = self.pending.len();
        self.pending.retain(|run| &run.cell_id != cell_id);
        self.pending.len() != before
    }

    pub fn is_executing(&self, cell_id: &CellId) -> bool {
        self.executing.as_ref() == Some(cell_id)
    }

    /// Check if queue is empty (no pending and no executing)
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.executing.is_none()
    }

    pub fn get_state(&self) -> ExecutionQueueState {
        let mut cells = Vec::new();
        let mut position = 0;

        if let Some(ref cell_id) = self.executing {
            cells.push(QueuedCell {
                cell_id: cell_id.clone(),
                status: CellQueueStatus::Executing,
                position,
            });
            position += 1;
        }

        for run in &self.pending {
            cells.push(QueuedCell {
                cell_id: run.cell_id.clone(),
                status: CellQueueStatus::Pending,
                position,
            });
            position += 1;
        }

        ExecutionQueueState {
            processing: self.executing.is_some() || !self.pending.is_empty(),
            cells,
            executing_cell_id: self.executing.clone(),
        }
    }
}

pub type SharedExecutionQueue = Arc<StdMutex<ExecutionQueue>>;

fn lock(queue: &SharedExecutionQueue) -> MutexGuard<'_, ExecutionQueue> {
    queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The editing thread's end of a running queue processor.
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::UnboundedSender<QueueCommand>,
    queue: SharedExecutionQueue,
    kernel: Arc<dyn KernelService>,
}

impl QueueHandle {
    /// Send a command; false if the processor has stopped.
    pub fn send(&self, cmd: QueueCommand) -> bool {
        match self.tx.send(cmd) {
            Ok(()) => true,
            Err(e) => {
                error!("[queue] Queue processor is gone, dropped {:?}", e.0);
                false
            }
        }
    }

    pub fn state(&self) -> ExecutionQueueState {
        lock(&self.queue).get_state()
    }

    pub fn kernel(&self) -> &Arc<dyn KernelService> {
        &self.kernel
    }
}

fn emit(events: &mpsc::UnboundedSender<ExecutionEvent>, event: ExecutionEvent) {
    if events.send(event).is_err() {
        warn!("[queue] Event receiver dropped");
    }
}

fn emit_cells_cancelled(events: &mpsc::UnboundedSender<ExecutionEvent>, cell_ids: Vec<CellId>) {
    if cell_ids.is_empty() {
        return;
    }
    emit(events, ExecutionEvent::Cancelled { cell_ids });
}

/// What to do with the in-flight run when a command arrives.
enum Interruption {
    None,
    Restart,
    Shutdown,
}

/// Spawn the queue processor task on the current tokio runtime.
///
/// Runs are dispatched one at a time in FIFO order; the next run starts only
/// after the previous one resolved. Commands are still handled while a run is
/// in flight. Must be called from within a tokio runtime.
pub fn spawn_queue_processor(
    kernel: Arc<dyn KernelService>,
) -> (QueueHandle, mpsc::UnboundedReceiver<ExecutionEvent>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<QueueCommand>();
    let (events, events_rx) = mpsc::unbounded_channel::<ExecutionEvent>();
    let queue: SharedExecutionQueue = Arc::new(StdMutex::new(ExecutionQueue::new()));

    let handle = QueueHandle {
        tx,
        queue: queue.clone(),
        kernel: kernel.clone(),
    };

    tokio::spawn(async move {
        info!("[queue] Queue processor started");

        loop {
            // Commands sent before the last run finished apply before the
            // next one starts.
            while let Ok(cmd) = rx.try_recv() {
                handle_command(cmd, &queue, kernel.as_ref(), &events).await;
            }

            let next = lock(&queue).dequeue();

            let Some(run) = next else {
                match rx.recv().await {
                    Some(cmd) => handle_command(cmd, &queue, kernel.as_ref(), &events).await,
                    None => break,
                }
                continue;
            };

            info!("[queue] Processing cell: {}", run.cell_id);
            emit(
                &events,
                ExecutionEvent::Started {
                    cell_id: run.cell_id.clone(),
                },
            );

            let mut interruption = Interruption::None;
            let result = {
                let execution = kernel.run(&run.source);
                tokio::pin!(execution);
                loop {
                    tokio::select! {
                        result = &mut execution => break result,
                        cmd = rx.recv() => match cmd {
                            Some(QueueCommand::Restart) => {
                                interruption = Interruption::Restart;
                                break Err(KernelError::Cancelled);
                            }
                            Some(cmd) => {
                                handle_command(cmd, &queue, kernel.as_ref(), &events).await;
                            }
                            None => {
                                interruption = Interruption::Shutdown;
                                break Err(KernelError::Cancelled);
                            }
                        }
                    }
                }
            };

            lock(&queue).complete(&run.cell_id);
            match result {
                Ok(reply) => {
                    info!(
                        "[queue] Execution done: cell={}, count={:?}",
                        run.cell_id, reply.execution_count
                    );
                    emit(
                        &events,
                        ExecutionEvent::Finished {
                            cell_id: run.cell_id,
                            reply,
                        },
                    );
                }
                Err(e) => {
                    error!("[queue] Execution failed: cell={}, error={}", run.cell_id, e);
                    emit(
                        &events,
                        ExecutionEvent::Failed {
                            cell_id: run.cell_id,
                            error: e,
                        },
                    );
                }
            }

            match interruption {
                Interruption::None => {}
                Interruption::Restart => {
                    restart(&queue, kernel.as_ref(), &events).await;
                }
                Interruption::Shutdown => break,
            }
        }

        let cancelled = lock(&queue).clear_pending();
        emit_cells_cancelled(&events, cancelled);
        info!("[queue] Queue processor channel closed");
    });

    (handle, events_rx)
}

/// Apply a command. While a run is in flight `Restart` never reaches here;
/// the processor loop handles it by dropping the run first.
async fn handle_command(
    cmd: QueueCommand,
    queue: &SharedExecutionQueue,
    kernel: &dyn KernelService,
    events: &mpsc::UnboundedSender<ExecutionEvent>,
) {
    match cmd {
        QueueCommand::Enqueue(run) => {
            info!("[queue] Enqueue cell: {}", run.cell_id);
            lock(queue).enqueue(run);
        }
        QueueCommand::Dequeue(cell_id) => {
            if lock(queue).remove_pending(&cell_id) {
                info!("[queue] Dequeued cell: {}", cell_id);
                emit_cells_cancelled(events, vec![cell_id]);
            }
        }
        QueueCommand::InterruptAndClear => {
            info!("[queue] Interrupt and clear");
            if let Err(e) = kernel.interrupt().await {
                error!("[queue] Failed to interrupt kernel: {}", e);
                emit(events, ExecutionEvent::KernelFailed { error: e });
            }
            let cleared = lock(queue).clear_pending();
            emit_cells_cancelled(events, cleared);
        }
        QueueCommand::Restart => restart(queue, kernel, events).await,
    }
}

async fn restart(
    queue: &SharedExecutionQueue,
    kernel: &dyn KernelService,
    events: &mpsc::UnboundedSender<ExecutionEvent>,
) {
    info!("[queue] Restarting kernel");
    let cleared = lock(queue).clear_pending();
    emit_cells_cancelled(events, cleared);
    match kernel.restart().await {
        Ok(()) => emit(events, ExecutionEvent::Restarted),
        Err(e) => {
            error!("[queue] Failed to restart kernel: {}", e);
            emit(events, ExecutionEvent::KernelFailed { error: e });
        }
    }
}
