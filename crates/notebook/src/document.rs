//! The notebook document: an arena of cells threaded by a doubly-linked
//! neighbor relation.
//!
//! Cells live in a map keyed by [`CellId`]; `prev`/`next` are stored as ids
//! next to each cell, so nothing outside the document ever holds a pointer
//! into it. Every structural operation is local relinking plus a map insert
//! or remove. Iteration from `head` along `next` is the authoritative order
//! used by rendering and serialization.
//!
//! Invariant, checked by [`Document::check_invariants`]: for every cell `c`
//! with predecessor `p`, `p.next == c` and `c.prev == p`, the walk from
//! `head` visits every cell exactly once and ends at `tail`.
//!
//! Operations given an unknown id, or issued where they make no sense
//! (moving the first cell up, merging nothing), are no-ops.

use std::collections::{HashMap, HashSet};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cell::{Cell, CellId, CellKind, DEFAULT_ID_LENGTH};

/// Where a new cell goes relative to an anchor cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    Before,
    #[default]
    After,
}

/// Top-level notebook metadata.
///
/// The three kernel maps are recognized when they hold objects; anything
/// else (including a kernel key set to `null`) is carried in `extra` and
/// written back verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NotebookMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel_info: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel_spec: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language_info: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl<'de> Deserialize<'de> for NotebookMetadata {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let mut extra = Map::<String, Value>::deserialize(deserializer)?;
        Ok(NotebookMetadata {
            kernel_info: take_object(&mut extra, "kernel_info"),
            kernel_spec: take_object(&mut extra, "kernel_spec"),
            language_info: take_object(&mut extra, "language_info"),
            extra,
        })
    }
}

fn take_object(map: &mut Map<String, Value>, key: &str) -> Option<Map<String, Value>> {
    if !map.get(key).is_some_and(Value::is_object) {
        return None;
    }
    match map.shift_remove(key) {
        Some(Value::Object(object)) => Some(object),
        _ => None,
    }
}

#[derive(Debug, Clone)]
struct Slot {
    cell: Cell,
    prev: Option<CellId>,
    next: Option<CellId>,
}

#[derive(Debug, Clone)]
pub struct Document {
    slots: HashMap<CellId, Slot>,
    head: Option<CellId>,
    tail: Option<CellId>,
    pub metadata: NotebookMetadata,
    pub nbformat: u32,
    pub nbformat_minor: u32,
    id_length: usize,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.nbformat == other.nbformat
            && self.nbformat_minor == other.nbformat_minor
            && self.metadata == other.metadata
            && self.iter().eq(other.iter())
    }
}

impl Document {
    /// A document with no cells.
    pub fn new() -> Self {
        Document {
            slots: HashMap::new(),
            head: None,
            tail: None,
            metadata: NotebookMetadata::default(),
            nbformat: 4,
            nbformat_minor: 5,
            id_length: DEFAULT_ID_LENGTH,
        }
    }

    /// A fresh notebook: a single empty code cell.
    pub fn new_empty() -> Self {
        let mut doc = Self::new();
        doc.insert(CellKind::Code, None, Position::After);
        doc
    }

    /// Set the length of ids minted by this document.
    pub fn with_id_length(mut self, len: usize) -> Self {
        self.set_id_length(len);
        self
    }

    pub fn set_id_length(&mut self, len: usize) {
        self.id_length = len;
    }

    pub fn id_length(&self) -> usize {
        self.id_length
    }

    pub fn mint_id(&self) -> CellId {
        loop {
            let id = CellId::generate(self.id_length);
            if !self.slots.contains_key(&id) {
                return id;
            }
        }
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, id: &CellId) -> bool {
        self.slots.contains_key(id)
    }

    pub fn cell(&self, id: &CellId) -> Option<&Cell> {
        self.slots.get(id).map(|s| &s.cell)
    }

    pub fn cell_mut(&mut self, id: &CellId) -> Option<&mut Cell> {
        self.slots.get_mut(id).map(|s| &mut s.cell)
    }

    pub fn first(&self) -> Option<&CellId> {
        self.head.as_ref()
    }

    pub fn last(&self) -> Option<&CellId> {
        self.tail.as_ref()
    }

    pub fn prev(&self, id: &CellId) -> Option<&CellId> {
        self.slots.get(id)?.prev.as_ref()
    }

    pub fn next(&self, id: &CellId) -> Option<&CellId> {
        self.slots.get(id)?.next.as_ref()
    }

    /// Cells in document order.
    pub fn iter(&self) -> Cells<'_> {
        Cells {
            doc: self,
            cursor: self.head.as_ref(),
        }
    }

    /// Ids in document order.
    pub fn ids(&self) -> Vec<CellId> {
        self.iter().map(|c| c.id.clone()).collect()
    }

    pub fn position(&self, id: &CellId) -> Option<usize> {
        self.iter().position(|c| &c.id == id)
    }

    pub fn cell_at(&self, index: usize) -> Option<&Cell> {
        self.iter().nth(index)
    }

    /// Code cells strictly above `id`, in order.
    pub fn code_cells_before(&self, id: &CellId) -> Vec<CellId> {
        self.iter()
            .take_while(|c| &c.id != id)
            .filter(|c| c.kind() == CellKind::Code)
            .map(|c| c.id.clone())
            .collect()
    }

    /// Code cells from `id` (inclusive) to the end, in order.
    pub fn code_cells_from(&self, id: &CellId) -> Vec<CellId> {
        self.iter()
            .skip_while(|c| &c.id != id)
            .filter(|c| c.kind() == CellKind::Code)
            .map(|c| c.id.clone())
            .collect()
    }

    pub fn code_cells(&self) -> Vec<CellId> {
        self.iter()
            .filter(|c| c.kind() == CellKind::Code)
            .map(|c| c.id.clone())
            .collect()
    }

    // ── Splicing ────────────────────────────────────────────────────

    /// Link `cell` in next to `anchor`. A missing anchor means the start
    /// (`Before`) or end (`After`) of the document.
    fn splice(&mut self, mut cell: Cell, anchor: Option<&CellId>, position: Position) -> CellId {
        if self.slots.contains_key(&cell.id) {
            let fresh = self.mint_id();
            warn!(
                "[document] Duplicate cell id {} on insert, reassigned to {}",
                cell.id, fresh
            );
            cell.id = fresh;
        }
        let id = cell.id.clone();

        let anchor = anchor.filter(|a| self.slots.contains_key(*a)).cloned();
        let (prev, next) = match (anchor, position) {
            (Some(a), Position::After) => {
                let next = self.slots.get(&a).and_then(|s| s.next.clone());
                (Some(a), next)
            }
            (Some(a), Position::Before) => {
                let prev = self.slots.get(&a).and_then(|s| s.prev.clone());
                (prev, Some(a))
            }
            (None, Position::After) => (self.tail.clone(), None),
            (None, Position::Before) => (None, self.head.clone()),
        };

        match &prev {
            Some(p) => {
                if let Some(slot) = self.slots.get_mut(p) {
                    slot.next = Some(id.clone());
                }
            }
            None => self.head = Some(id.clone()),
        }
        match &next {
            Some(n) => {
                if let Some(slot) = self.slots.get_mut(n) {
                    slot.prev = Some(id.clone());
                }
            }
            None => self.tail = Some(id.clone()),
        }

        self.slots.insert(id.clone(), Slot { cell, prev, next });
        id
    }

    /// Unlink and drop the slot for `id`, returning the cell with no links.
    fn unsplice(&mut self, id: &CellId) -> Option<Slot> {
        let slot = self.slots.remove(id)?;

        match &slot.prev {
            Some(p) => {
                if let Some(prev) = self.slots.get_mut(p) {
                    prev.next = slot.next.clone();
                }
            }
            None => self.head = slot.next.clone(),
        }
        match &slot.next {
            Some(n) => {
                if let Some(next) = self.slots.get_mut(n) {
                    next.prev = slot.prev.clone();
                }
            }
            None => self.tail = slot.prev.clone(),
        }

        Some(slot)
    }

    // ── Structural operations ───────────────────────────────────────

    /// Create an empty cell of `kind` next to `anchor` and return its id.
    ///
    /// With no anchor (or an anchor that is not in the document) the cell
    /// goes to the start for `Before` and to the end for `After`; in an
    /// empty document it becomes the sole cell.
    pub fn insert(&mut self, kind: CellKind, anchor: Option<&CellId>, position: Position) -> CellId {
        let cell = Cell::new(kind, self.mint_id(), String::new());
        let id = self.splice(cell, anchor, position);
        debug!("[document] Inserted {} cell {}", kind, id);
        id
    }

    /// Insert an existing cell (deserialized or pasted). A colliding id is
    /// replaced with a fresh one.
    pub fn insert_cell(&mut self, cell: Cell, anchor: Option<&CellId>, position: Position) -> CellId {
        self.splice(cell, anchor, position)
    }

    /// Append at the end.
    pub fn push(&mut self, cell: Cell) -> CellId {
        self.splice(cell, None, Position::After)
    }

    /// Remove `id` and return the cell that should take focus: the
    /// predecessor, else the successor, else none.
    pub fn delete(&mut self, id: &CellId) -> Option<CellId> {
        let slot = self.unsplice(id)?;
        debug!("[document] Deleted cell {}", id);
        slot.prev.or(slot.next)
    }

    /// Remove `id` and hand back the detached cell.
    pub fn remove(&mut self, id: &CellId) -> Option<Cell> {
        self.unsplice(id).map(|slot| slot.cell)
    }

    /// Swap `id` with its predecessor. Returns false when there is none.
    pub fn move_up(&mut self, id: &CellId) -> bool {
        let Some(prev) = self.prev(id).cloned() else {
            return false;
        };
        let Some(slot) = self.unsplice(id) else {
            return false;
        };
        self.splice(slot.cell, Some(&prev), Position::Before);
        true
    }

    /// Swap `id` with its successor. Returns false when there is none.
    pub fn move_down(&mut self, id: &CellId) -> bool {
        let Some(next) = self.next(id).cloned() else {
            return false;
        };
        let Some(slot) = self.unsplice(id) else {
            return false;
        };
        self.splice(slot.cell, Some(&next), Position::After);
        true
    }

    /// Append the sources of `others` (in the given order) to `target`,
    /// newline separated, and remove `others` from the document.
    ///
    /// `target` keeps its kind. Unknown ids, duplicates and `target` itself
    /// are ignored in `others`; returns false (and changes nothing) when
    /// no cell is left to merge.
    pub fn merge(&mut self, target: &CellId, others: &[CellId]) -> bool {
        if !self.contains(target) {
            return false;
        }
        let mut seen = HashSet::new();
        let others: Vec<&CellId> = others
            .iter()
            .filter(|id| *id != target && self.contains(id) && seen.insert(*id))
            .collect();
        if others.is_empty() {
            return false;
        }

        let removed: Vec<Cell> = others.iter().filter_map(|id| self.remove(id)).collect();
        if let Some(cell) = self.cell_mut(target) {
            for other in &removed {
                cell.merge_source(&other.source);
            }
        }
        debug!("[document] Merged {} cell(s) into {}", others.len(), target);
        true
    }

    /// Split `id` at character `offset`; the tail becomes a new cell of the
    /// same kind right after it. `None` for an unknown id or an offset past
    /// the end of the source.
    pub fn split(&mut self, id: &CellId, offset: usize) -> Option<CellId> {
        let new_id = self.mint_id();
        let tail = self.cell_mut(id)?.split_off(offset, new_id)?;
        let new_id = self.splice(tail, Some(id), Position::After);
        debug!("[document] Split {} at {} into {}", id, offset, new_id);
        Some(new_id)
    }

    /// Replace `id` with a cell of the opposite kind carrying the same
    /// source. Outputs and execution count are discarded.
    pub fn switch_type(&mut self, id: &CellId) -> Option<CellId> {
        let slot = self.slots.get_mut(id)?;
        let switched = slot.cell.clone().into_switched();
        debug!("[document] Switched {} to {}", id, switched.kind());
        slot.cell = switched;
        Some(id.clone())
    }

    pub fn update_source(&mut self, id: &CellId, source: &str) -> bool {
        match self.cell_mut(id) {
            Some(cell) => {
                cell.source = source.to_string();
                true
            }
            None => false,
        }
    }

    /// Drop every cell.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.head = None;
        self.tail = None;
    }

    /// Verify the neighbor relation agrees with the walk order.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut visited = 0usize;
        let mut prev: Option<&CellId> = None;
        let mut cursor = self.head.as_ref();

        while let Some(id) = cursor {
            let slot = self
                .slots
                .get(id)
                .ok_or_else(|| format!("link to missing cell {}", id))?;
            if slot.prev.as_ref() != prev {
                return Err(format!(
                    "cell {} has prev {:?}, expected {:?}",
                    id, slot.prev, prev
                ));
            }
            if slot.cell.id != *id {
                return Err(format!("slot {} holds cell {}", id, slot.cell.id));
            }
            visited += 1;
            if visited > self.slots.len() {
                return Err("cycle in cell chain".to_string());
            }
            prev = Some(id);
            cursor = slot.next.as_ref();
        }

        if self.tail.as_ref() != prev {
            return Err(format!("tail is {:?}, walk ended at {:?}", self.tail, prev));
        }
        if visited != self.slots.len() {
            return Err(format!(
                "walk visited {} of {} cells",
                visited,
                self.slots.len()
            ));
        }
        Ok(())
    }
}

/// Iterator over cells in document order.
pub struct Cells<'a> {
    doc: &'a Document,
    cursor: Option<&'a CellId>,
}

impl<'a> Iterator for Cells<'a> {
    type Item = &'a Cell;

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.doc.slots.get(self.cursor?)?;
        self.cursor = slot.next.as_ref();
        Some(&slot.cell)
    }
}

impl<'a> IntoIterator for &'a Document {
    type Item = &'a Cell;
    type IntoIter = Cells<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sources(doc: &Document) -> Vec<String> {
        doc.iter().map(|c| c.source.clone()).collect()
    }

    fn doc_with(sources: &[&str]) -> (Document, Vec<CellId>) {
        let mut doc = Document::new();
        let ids = sources
            .iter()
            .map(|s| {
                let id = doc.insert(CellKind::Code, None, Position::After);
                doc.update_source(&id, s);
                id
            })
            .collect();
        (doc, ids)
    }

    #[test]
    fn test_new_empty_has_single_code_cell() {
        let doc = Document::new_empty();
        assert_eq!(doc.len(), 1);
        let cell = doc.cell_at(0).unwrap();
        assert_eq!(cell.kind(), CellKind::Code);
        assert!(cell.source.is_empty());
        assert_eq!((doc.nbformat, doc.nbformat_minor), (4, 5));
        doc.check_invariants().unwrap();
    }

    #[test]
    fn test_insert_after_and_delete_scenario() {
        let mut doc = Document::new_empty();
        let c0 = doc.first().cloned().unwrap();
        let c1 = doc.insert(CellKind::Code, Some(&c0), Position::After);

        assert_eq!(doc.delete(&c0), Some(c1.clone()));
        assert_eq!(doc.ids(), vec![c1.clone()]);
        assert!(doc.prev(&c1).is_none());
        assert!(doc.next(&c1).is_none());
        doc.check_invariants().unwrap();
    }

    #[test]
    fn test_insert_before_anchor() {
        let (mut doc, ids) = doc_with(&["a", "b"]);
        let new = doc.insert(CellKind::Markdown, Some(&ids[1]), Position::Before);
        assert_eq!(doc.ids(), vec![ids[0].clone(), new.clone(), ids[1].clone()]);
        assert_eq!(doc.cell(&new).unwrap().kind(), CellKind::Markdown);
        doc.check_invariants().unwrap();
    }

    #[test]
    fn test_insert_without_anchor_goes_to_ends() {
        let (mut doc, ids) = doc_with(&["a"]);
        let front = doc.insert(CellKind::Code, None, Position::Before);
        let back = doc.insert(CellKind::Code, None, Position::After);
        assert_eq!(doc.ids(), vec![front, ids[0].clone(), back]);
        doc.check_invariants().unwrap();
    }

    #[test]
    fn test_delete_focus_falls_back_to_successor() {
        let (mut doc, ids) = doc_with(&["a", "b", "c"]);
        assert_eq!(doc.delete(&ids[0]), Some(ids[1].clone()));
        assert_eq!(doc.delete(&ids[2]), Some(ids[1].clone()));
        assert_eq!(doc.delete(&ids[1]), None);
        assert!(doc.is_empty());
        assert!(doc.first().is_none() && doc.last().is_none());
        doc.check_invariants().unwrap();
    }

    #[test]
    fn test_delete_unknown_is_noop() {
        let (mut doc, _) = doc_with(&["a"]);
        assert_eq!(doc.delete(&CellId::from("nope")), None);
        assert_eq!(doc.len(), 1);
        doc.check_invariants().unwrap();
    }

    #[test]
    fn test_move_down_then_up_restores_order() {
        let (mut doc, ids) = doc_with(&["a", "b", "c"]);
        assert!(doc.move_down(&ids[1]));
        assert_eq!(sources(&doc), vec!["a", "c", "b"]);
        doc.check_invariants().unwrap();
        assert!(doc.move_up(&ids[1]));
        assert_eq!(doc.ids(), ids);
        doc.check_invariants().unwrap();
    }

    #[test]
    fn test_move_at_boundaries_is_noop() {
        let (mut doc, ids) = doc_with(&["a", "b"]);
        assert!(!doc.move_up(&ids[0]));
        assert!(!doc.move_down(&ids[1]));
        assert_eq!(doc.ids(), ids);
        doc.check_invariants().unwrap();
    }

    #[test]
    fn test_move_keeps_identity_and_updates_ends() {
        let (mut doc, ids) = doc_with(&["a", "b"]);
        assert!(doc.move_up(&ids[1]));
        assert_eq!(doc.first(), Some(&ids[1]));
        assert_eq!(doc.last(), Some(&ids[0]));
        assert_eq!(doc.cell(&ids[1]).unwrap().source, "b");
        doc.check_invariants().unwrap();
    }

    #[test]
    fn test_merge_law() {
        let (mut doc, ids) = doc_with(&["t", "a", "b", "z"]);
        assert!(doc.merge(&ids[0], &[ids[1].clone(), ids[2].clone()]));
        assert_eq!(doc.cell(&ids[0]).unwrap().source, "t\na\nb");
        assert!(!doc.contains(&ids[1]));
        assert!(!doc.contains(&ids[2]));
        assert_eq!(doc.ids(), vec![ids[0].clone(), ids[3].clone()]);
        doc.check_invariants().unwrap();
    }

    #[test]
    fn test_merge_keeps_target_kind() {
        let mut doc = Document::new();
        let a = doc.insert(CellKind::Code, None, Position::After);
        let b = doc.insert(CellKind::Markdown, None, Position::After);
        doc.update_source(&a, "1");
        doc.update_source(&b, "x");

        assert!(doc.merge(&a, &[b]));
        assert_eq!(doc.len(), 1);
        let cell = doc.cell(&a).unwrap();
        assert_eq!(cell.source, "1\nx");
        assert_eq!(cell.kind(), CellKind::Code);
    }

    #[test]
    fn test_merge_without_others_is_noop() {
        let (mut doc, ids) = doc_with(&["a", "b"]);
        assert!(!doc.merge(&ids[0], &[]));
        assert!(!doc.merge(&ids[0], &[ids[0].clone()]));
        assert!(!doc.merge(&CellId::from("nope"), &[ids[1].clone()]));
        assert_eq!(sources(&doc), vec!["a", "b"]);
        doc.check_invariants().unwrap();
    }

    #[test]
    fn test_merge_follows_given_order_not_document_order() {
        let (mut doc, ids) = doc_with(&["t", "a", "b"]);
        assert!(doc.merge(&ids[0], &[ids[2].clone(), ids[1].clone()]));
        assert_eq!(doc.cell(&ids[0]).unwrap().source, "t\nb\na");
    }

    #[test]
    fn test_split_law_for_every_offset() {
        let original = "ab\ncé";
        for k in 0..=original.chars().count() {
            let (mut doc, ids) = doc_with(&[original]);
            let new = doc.split(&ids[0], k).unwrap();
            let rejoined = format!(
                "{}{}",
                doc.cell(&ids[0]).unwrap().source,
                doc.cell(&new).unwrap().source
            );
            assert_eq!(rejoined, original, "offset {}", k);
            assert_eq!(doc.next(&ids[0]), Some(&new));
            doc.check_invariants().unwrap();
        }
    }

    #[test]
    fn test_split_out_of_range_is_noop() {
        let (mut doc, ids) = doc_with(&["abc"]);
        assert!(doc.split(&ids[0], 10).is_none());
        assert_eq!(doc.len(), 1);
        doc.check_invariants().unwrap();
    }

    #[test]
    fn test_switch_type_in_place() {
        let (mut doc, ids) = doc_with(&["a", "# b", "c"]);
        let switched = doc.switch_type(&ids[1]).unwrap();
        assert_eq!(switched, ids[1]);
        assert_eq!(doc.cell(&ids[1]).unwrap().kind(), CellKind::Markdown);
        assert_eq!(doc.position(&ids[1]), Some(1));
        doc.check_invariants().unwrap();
    }

    #[test]
    fn test_insert_cell_reassigns_duplicate_id() {
        let (mut doc, ids) = doc_with(&["a"]);
        let dup = Cell::new(CellKind::Code, ids[0].clone(), "copy");
        let new = doc.insert_cell(dup, Some(&ids[0]), Position::After);
        assert_ne!(new, ids[0]);
        assert_eq!(doc.len(), 2);
        doc.check_invariants().unwrap();
    }

    #[test]
    fn test_code_cell_ranges() {
        let mut doc = Document::new();
        let a = doc.insert(CellKind::Code, None, Position::After);
        let m = doc.insert(CellKind::Markdown, None, Position::After);
        let b = doc.insert(CellKind::Code, None, Position::After);
        let c = doc.insert(CellKind::Code, None, Position::After);

        assert_eq!(doc.code_cells_before(&b), vec![a.clone()]);
        assert_eq!(doc.code_cells_from(&m), vec![b.clone(), c.clone()]);
        assert_eq!(doc.code_cells(), vec![a, b, c]);
    }

    #[test]
    fn test_clear_empties_document() {
        let (mut doc, _) = doc_with(&["a", "b"]);
        doc.clear();
        assert!(doc.is_empty());
        assert_eq!(doc.iter().count(), 0);
        doc.check_invariants().unwrap();
    }

    #[test]
    fn test_invariants_after_interleaved_operations() {
        let (mut doc, ids) = doc_with(&["0", "1", "2", "3", "4"]);
        doc.move_up(&ids[4]);
        doc.check_invariants().unwrap();
        let s = doc.split(&ids[2], 0).unwrap();
        doc.check_invariants().unwrap();
        doc.merge(&ids[0], &[ids[3].clone(), s]);
        doc.check_invariants().unwrap();
        doc.delete(&ids[0]);
        doc.check_invariants().unwrap();
        doc.move_down(&ids[1]);
        doc.check_invariants().unwrap();
        doc.switch_type(&ids[4]);
        doc.check_invariants().unwrap();
        assert_eq!(doc.len(), 3);
    }
}
