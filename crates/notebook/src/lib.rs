//! Notebook document model and editing engine.
//!
//! A notebook is a [`Document`]: an ordered arena of [`Cell`]s linked by
//! id. An [`EditorSession`] wraps one document together with focus, merge
//! selection, clipboard and user notices, and is the entry point for every
//! editing command. Code runs through an execution queue backed by a
//! [`kernel_proxy::KernelService`]; results come back as events applied on
//! the editing thread.

pub mod cell;
pub mod collapse;
pub mod document;
pub mod execution_queue;
pub mod format;
pub mod output;
pub mod session;
pub mod settings;

pub use cell::{Cell, CellBody, CellId, CellKind, CodeState};
pub use collapse::{CodeCollapse, CollapseState};
pub use document::{Document, NotebookMetadata, Position};
pub use execution_queue::{spawn_queue_processor, ExecutionEvent, QueueHandle};
pub use format::FormatError;
pub use output::Output;
pub use session::{CellSnapshot, EditorSession, Notice, Severity};
pub use settings::Settings;

use tokio::sync::mpsc;

/// Apply execution events to `session` until no cell is queued or running.
///
/// Returns early if the queue processor went away.
pub async fn drive_until_idle(
    session: &mut EditorSession,
    events: &mut mpsc::UnboundedReceiver<ExecutionEvent>,
) {
    while session.is_executing() {
        match events.recv().await {
            Some(event) => session.apply_event(event),
            None => {
                log::warn!("[session] Execution queue closed with cells still running");
                break;
            }
        }
    }
}
