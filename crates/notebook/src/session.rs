//! The editing session: one open notebook plus everything the user is
//! pointing at.
//!
//! Focus, the merge selection and the clipboard live here rather than in the
//! document, and every command handler goes through an [`EditorSession`].
//! Commands issued where they cannot apply (nothing focused, no neighbor,
//! fewer than two cells selected) return without effect.
//!
//! Running cells is asynchronous. The session marks cells as running and
//! hands them to the execution queue; results come back as
//! [`ExecutionEvent`]s that the owner of the session feeds into
//! [`EditorSession::apply_event`] on the editing thread.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use kernel_proxy::KernelError;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;

use crate::cell::{Cell, CellId, CellKind};
use crate::document::{Document, Position};
use crate::execution_queue::{ExecutionEvent, QueueCommand, QueueHandle, QueuedRun};
use crate::format::{self, FormatError};
use crate::output::Output;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// A user-visible message. Never fatal to the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub severity: Severity,
    pub message: String,
}

/// A copied or cut cell: its kind and its nbformat record.
#[derive(Debug, Clone, PartialEq)]
pub struct CellSnapshot {
    pub kind: CellKind,
    pub record: Value,
}

pub struct EditorSession {
    document: Document,
    focus: Option<CellId>,
    merge_selection: HashSet<CellId>,
    clipboard: Option<CellSnapshot>,
    notices: Vec<Notice>,
    path: Option<PathBuf>,
    dirty: bool,
    default_kind: CellKind,
    queue: Option<QueueHandle>,
}

impl Default for EditorSession {
    fn default() -> Self {
        Self::new(Document::new_empty())
    }
}

impl EditorSession {
    pub fn new(document: Document) -> Self {
        let focus = document.first().cloned();
        Self {
            document,
            focus,
            merge_selection: HashSet::new(),
            clipboard: None,
            notices: Vec::new(),
            path: None,
            dirty: false,
            default_kind: CellKind::Code,
            queue: None,
        }
    }

    /// Open a notebook file. Nothing is built if the file is invalid.
    pub fn open(path: &Path) -> Result<Self, FormatError> {
        let document = format::load(path)?;
        let mut session = Self::new(document);
        session.path = Some(path.to_path_buf());
        Ok(session)
    }

    pub fn with_default_kind(mut self, kind: CellKind) -> Self {
        self.default_kind = kind;
        self
    }

    /// Length of ids minted for new and pasted cells, kept across `load`.
    pub fn with_id_length(mut self, len: usize) -> Self {
        self.document.set_id_length(len);
        self
    }

    pub fn attach_queue(&mut self, queue: QueueHandle) {
        self.queue = Some(queue);
    }

    // ── State ───────────────────────────────────────────────────────

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn focus(&self) -> Option<&CellId> {
        self.focus.as_ref()
    }

    pub fn focused_cell(&self) -> Option<&Cell> {
        self.document.cell(self.focus.as_ref()?)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clipboard(&self) -> Option<&CellSnapshot> {
        self.clipboard.as_ref()
    }

    pub fn notices(&self) -> &[Notice] {
        &self.notices
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    /// Selected cells in document order.
    pub fn selection(&self) -> Vec<CellId> {
        self.document
            .iter()
            .filter(|c| self.merge_selection.contains(&c.id))
            .map(|c| c.id.clone())
            .collect()
    }

    pub fn is_selected(&self, id: &CellId) -> bool {
        self.merge_selection.contains(id)
    }

    fn notify(&mut self, severity: Severity, message: impl Into<String>) {
        let message = message.into();
        match severity {
            Severity::Info => info!("[session] {}", message),
            Severity::Warning | Severity::Error => warn!("[session] {}", message),
        }
        self.notices.push(Notice { severity, message });
    }

    fn touched(&mut self) {
        self.dirty = true;
        self.merge_selection.retain(|id| self.document.contains(id));
        let focus_valid = self
            .focus
            .as_ref()
            .map(|id| self.document.contains(id))
            .unwrap_or(false);
        if !focus_valid {
            self.focus = self.document.first().cloned();
        }
    }

    fn running_among(&self, ids: &[CellId]) -> Vec<CellId> {
        ids.iter()
            .filter(|id| self.document.cell(id).is_some_and(Cell::is_running))
            .cloned()
            .collect()
    }

    /// Take removed cells out of the execution queue so their captured
    /// source never runs.
    fn dequeue_removed(&self, removed: Vec<CellId>) {
        let Some(queue) = &self.queue else {
            return;
        };
        for id in removed {
            debug!("[session] Dequeueing removed cell {}", id);
            queue.send(QueueCommand::Dequeue(id));
        }
    }

    // ── Focus ───────────────────────────────────────────────────────

    pub fn set_focus(&mut self, id: &CellId) -> bool {
        if !self.document.contains(id) {
            return false;
        }
        self.focus = Some(id.clone());
        true
    }

    pub fn focus_prev(&mut self) -> bool {
        let Some(prev) = self.focus.as_ref().and_then(|f| self.document.prev(f)).cloned() else {
            return false;
        };
        self.focus = Some(prev);
        true
    }

    pub fn focus_next(&mut self) -> bool {
        let Some(next) = self.focus.as_ref().and_then(|f| self.document.next(f)).cloned() else {
            return false;
        };
        self.focus = Some(next);
        true
    }

    // ── Structure ───────────────────────────────────────────────────

    /// Add an empty cell next to the focused cell and focus it. With nothing
    /// focused the cell is appended.
    pub fn add_cell(&mut self, kind: CellKind, position: Position) -> CellId {
        let id = match self.focus.clone() {
            Some(focus) => self.document.insert(kind, Some(&focus), position),
            None => self.document.insert(kind, None, Position::After),
        };
        self.focus = Some(id.clone());
        self.touched();
        id
    }

    pub fn add_default_cell(&mut self, position: Position) -> CellId {
        self.add_cell(self.default_kind, position)
    }

    pub fn update_source(&mut self, id: &CellId, source: &str) -> bool {
        if !self.document.update_source(id, source) {
            return false;
        }
        self.dirty = true;
        true
    }

    /// Delete `id`; if it had focus, focus moves to its predecessor, else
    /// its successor.
    pub fn delete(&mut self, id: &CellId) -> bool {
        if !self.document.contains(id) {
            return false;
        }
        let running = self.running_among(std::slice::from_ref(id));
        let next_focus = self.document.delete(id);
        if self.focus.as_ref() == Some(id) {
            self.focus = next_focus;
        }
        self.merge_selection.remove(id);
        self.dequeue_removed(running);
        self.touched();
        true
    }

    pub fn delete_focused(&mut self) -> bool {
        match self.focus.clone() {
            Some(id) => self.delete(&id),
            None => false,
        }
    }

    pub fn move_up(&mut self) -> bool {
        let Some(id) = self.focus.clone() else {
            return false;
        };
        let moved = self.document.move_up(&id);
        if moved {
            self.touched();
        }
        moved
    }

    pub fn move_down(&mut self) -> bool {
        let Some(id) = self.focus.clone() else {
            return false;
        };
        let moved = self.document.move_down(&id);
        if moved {
            self.touched();
        }
        moved
    }

    /// Add or remove `id` from the merge selection.
    pub fn toggle_merge_selection(&mut self, id: &CellId) -> bool {
        if !self.document.contains(id) {
            return false;
        }
        if !self.merge_selection.remove(id) {
            self.merge_selection.insert(id.clone());
        }
        true
    }

    pub fn clear_selection(&mut self) {
        self.merge_selection.clear();
    }

    /// Merge every selected cell into the first selected one (document
    /// order). Needs at least two selected cells.
    pub fn merge_selected(&mut self) -> bool {
        let selected = self.selection();
        let Some((target, others)) = selected.split_first() else {
            return false;
        };
        if others.is_empty() {
            return false;
        }
        let target = target.clone();
        let running = self.running_among(others);
        if !self.document.merge(&target, others) {
            return false;
        }
        self.dequeue_removed(running);
        self.merge_selection.clear();
        self.focus = Some(target);
        self.touched();
        true
    }

    /// Merge the focused cell into its predecessor.
    pub fn join_above(&mut self) -> bool {
        let Some(focus) = self.focus.clone() else {
            return false;
        };
        let Some(prev) = self.document.prev(&focus).cloned() else {
            return false;
        };
        let merged = [focus];
        let running = self.running_among(&merged);
        if !self.document.merge(&prev, &merged) {
            return false;
        }
        self.dequeue_removed(running);
        self.focus = Some(prev);
        self.touched();
        true
    }

    /// Merge the successor into the focused cell.
    pub fn join_below(&mut self) -> bool {
        let Some(focus) = self.focus.clone() else {
            return false;
        };
        let Some(next) = self.document.next(&focus).cloned() else {
            return false;
        };
        let merged = [next];
        let running = self.running_among(&merged);
        if !self.document.merge(&focus, &merged) {
            return false;
        }
        self.dequeue_removed(running);
        self.touched();
        true
    }

    /// Split the focused cell at character `offset` and focus the new tail
    /// cell.
    pub fn split_focused(&mut self, offset: usize) -> Option<CellId> {
        let focus = self.focus.clone()?;
        let new_id = self.document.split(&focus, offset)?;
        self.focus = Some(new_id.clone());
        self.touched();
        Some(new_id)
    }

    /// Convert the focused cell to the other kind. Outputs are discarded.
    pub fn switch_focused_type(&mut self) -> Option<CellId> {
        let focus = self.focus.clone()?;
        if self.document.cell(&focus)?.is_running() {
            self.notify(Severity::Warning, "Cannot change the type of a running cell");
            return None;
        }
        let id = self.document.switch_type(&focus)?;
        self.focus = Some(id.clone());
        self.touched();
        Some(id)
    }

    // ── Clipboard ───────────────────────────────────────────────────

    pub fn copy_focused(&mut self) -> bool {
        let Some(cell) = self.focused_cell() else {
            return false;
        };
        self.clipboard = Some(CellSnapshot {
            kind: cell.kind(),
            record: format::cell_to_record(cell),
        });
        true
    }

    pub fn cut_focused(&mut self) -> bool {
        self.copy_focused() && self.delete_focused()
    }

    /// Insert a copy of the clipboard cell next to the focused cell (at the
    /// end of the document if nothing has focus) and focus it. The copy
    /// always gets a fresh id.
    pub fn paste(&mut self, position: Position) -> Option<CellId> {
        let snapshot = self.clipboard.as_ref()?;
        let mut cell = match format::cell_from_record_as(0, &snapshot.record, snapshot.kind) {
            Ok(cell) => cell,
            Err(e) => {
                self.notify(Severity::Error, format!("Cannot paste cell: {}", e));
                return None;
            }
        };
        cell.id = self.document.mint_id();
        let anchor = self.focus.clone();
        let position = if anchor.is_some() {
            position
        } else {
            Position::After
        };
        let id = self.document.insert_cell(cell, anchor.as_ref(), position);
        self.focus = Some(id.clone());
        self.touched();
        Some(id)
    }

    // ── Collapse ────────────────────────────────────────────────────

    fn with_focused_cell(&mut self, f: impl FnOnce(&mut Cell)) -> bool {
        let Some(id) = self.focus.clone() else {
            return false;
        };
        let Some(cell) = self.document.cell_mut(&id) else {
            return false;
        };
        f(cell);
        self.dirty = true;
        true
    }

    pub fn collapse_focused(&mut self) -> bool {
        self.with_focused_cell(Cell::collapse)
    }

    pub fn toggle_code_collapsed(&mut self) -> bool {
        self.with_focused_cell(Cell::toggle_code_collapsed)
    }

    pub fn toggle_output_collapsed(&mut self) -> bool {
        self.with_focused_cell(Cell::toggle_output_collapsed)
    }

    // ── Execution ───────────────────────────────────────────────────

    fn available_queue(&mut self) -> Option<QueueHandle> {
        let queue = self
            .queue
            .as_ref()
            .filter(|q| q.kernel().is_available())
            .cloned();
        if queue.is_none() {
            self.notify(Severity::Error, "Kernel unavailable: no kernel is running");
        }
        queue
    }

    /// Queue code cells in the given order. Markdown cells and cells already
    /// running are skipped. Returns how many were queued.
    pub fn run_cells(&mut self, ids: &[CellId]) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let Some(queue) = self.available_queue() else {
            return 0;
        };

        let mut queued = 0;
        for id in ids {
            let Some(cell) = self.document.cell_mut(id) else {
                continue;
            };
            let source = cell.source.clone();
            let Some(state) = cell.code_mut() else {
                continue;
            };
            if state.running {
                debug!("[session] Cell {} is already running", id);
                continue;
            }
            state.running = true;
            let sent = queue.send(QueueCommand::Enqueue(QueuedRun {
                cell_id: id.clone(),
                source,
            }));
            if !sent {
                state.running = false;
                self.notify(Severity::Error, "Kernel unavailable: execution queue stopped");
                break;
            }
            queued += 1;
        }
        queued
    }

    pub fn run_focused(&mut self) -> usize {
        match self.focus.clone() {
            Some(id) => self.run_cells(&[id]),
            None => 0,
        }
    }

    pub fn run_all(&mut self) -> usize {
        let ids = self.document.code_cells();
        self.run_cells(&ids)
    }

    /// Run the code cells strictly above the focused cell.
    pub fn run_before(&mut self) -> usize {
        let Some(focus) = self.focus.clone() else {
            return 0;
        };
        let ids = self.document.code_cells_before(&focus);
        self.run_cells(&ids)
    }

    /// Run the focused cell and every code cell below it.
    pub fn run_after(&mut self) -> usize {
        let Some(focus) = self.focus.clone() else {
            return 0;
        };
        let ids = self.document.code_cells_from(&focus);
        self.run_cells(&ids)
    }

    pub fn interrupt(&mut self) -> bool {
        match self.available_queue() {
            Some(queue) => queue.send(QueueCommand::InterruptAndClear),
            None => false,
        }
    }

    pub fn restart(&mut self) -> bool {
        match self.available_queue() {
            Some(queue) => queue.send(QueueCommand::Restart),
            None => false,
        }
    }

    /// True while any cell is queued or executing.
    pub fn is_executing(&self) -> bool {
        self.document.iter().any(Cell::is_running)
    }

    fn finish_cell(&mut self, id: &CellId) -> Option<&mut Cell> {
        let cell = self.document.cell_mut(id);
        if cell.is_none() {
            debug!("[session] Result for removed cell {} dropped", id);
        }
        let cell = cell?;
        if let Some(state) = cell.code_mut() {
            state.running = false;
        }
        Some(cell)
    }

    /// Fold an execution event into the document.
    pub fn apply_event(&mut self, event: ExecutionEvent) {
        match event {
            ExecutionEvent::Started { cell_id } => {
                debug!("[session] Cell {} started", cell_id);
            }
            ExecutionEvent::Finished { cell_id, reply } => {
                let mut rejected = 0;
                if let Some(state) = self.finish_cell(&cell_id).and_then(Cell::code_mut) {
                    state.outputs = reply
                        .outputs
                        .into_iter()
                        .filter_map(|record| match Output::from_record(record) {
                            Ok(output) => Some(output),
                            Err(e) => {
                                warn!("[session] Dropping unrecognized output: {}", e);
                                rejected += 1;
                                None
                            }
                        })
                        .collect();
                    state.execution_count = reply.execution_count;
                    self.dirty = true;
                }
                if rejected > 0 {
                    self.notify(
                        Severity::Warning,
                        format!("{} output(s) of cell {} could not be shown", rejected, cell_id),
                    );
                }
            }
            ExecutionEvent::Failed { cell_id, error } => {
                self.finish_cell(&cell_id);
                match error {
                    KernelError::Cancelled => self.notify(
                        Severity::Warning,
                        format!("Execution of cell {} was cancelled", cell_id),
                    ),
                    other => self.notify(Severity::Error, other.to_string()),
                }
            }
            ExecutionEvent::Cancelled { cell_ids } => {
                for id in &cell_ids {
                    self.finish_cell(id);
                }
                self.notify(
                    Severity::Info,
                    format!("Cancelled {} queued cell(s)", cell_ids.len()),
                );
            }
            ExecutionEvent::KernelFailed { error } => {
                self.notify(Severity::Error, error.to_string());
            }
            ExecutionEvent::Restarted => {
                self.notify(Severity::Info, "Kernel restarted");
            }
        }
    }

    // ── Files ───────────────────────────────────────────────────────

    /// Replace the open document with the notebook at `path`. On failure the
    /// current document is left untouched.
    pub fn load(&mut self, path: &Path) -> Result<(), FormatError> {
        match format::load(path) {
            Ok(mut document) => {
                document.set_id_length(self.document.id_length());
                let running = self.running_among(&self.document.ids());
                self.dequeue_removed(running);
                self.focus = document.first().cloned();
                self.document = document;
                self.merge_selection.clear();
                self.path = Some(path.to_path_buf());
                self.dirty = false;
                Ok(())
            }
            Err(e) => {
                self.notify(Severity::Error, e.to_string());
                Err(e)
            }
        }
    }

    fn write_to(&mut self, path: &Path) -> Result<(), FormatError> {
        if let Some(queue) = &self.queue {
            let description = queue.kernel().describe();
            format::refresh_kernel_metadata(&mut self.document.metadata, &description);
        }
        format::save(&self.document, path)
    }

    pub fn save(&mut self) -> Result<(), FormatError> {
        let result = match self.path.clone() {
            Some(path) => self.write_to(&path),
            None => Err(FormatError::InvalidField {
                field: "path".to_string(),
                reason: "notebook has never been saved; use save-as".to_string(),
            }),
        };
        match &result {
            Ok(()) => self.dirty = false,
            Err(e) => self.notify(Severity::Error, e.to_string()),
        }
        result
    }

    /// Save under a new path and keep using it. The path must end in
    /// `.ipynb`.
    pub fn save_as(&mut self, path: &Path) -> Result<(), FormatError> {
        let result = format::ensure_notebook_path(path).and_then(|()| self.write_to(path));
        match &result {
            Ok(()) => {
                self.path = Some(path.to_path_buf());
                self.dirty = false;
            }
            Err(e) => self.notify(Severity::Error, e.to_string()),
        }
        result
    }
}
