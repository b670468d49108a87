//! Cells: the typed content units of a notebook.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::collapse::{placeholder, CodeCollapse, CollapseState};
use crate::output::Output;

/// Short ids in the style of JEP 62 (`uuid4().hex[:8]`).
pub const DEFAULT_ID_LENGTH: usize = 8;

/// Stable opaque cell identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(String);

impl CellId {
    /// Mint a fresh id of `len` lowercase hex characters (clamped to 1..=32).
    pub fn generate(len: usize) -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        let len = len.clamp(1, hex.len());
        CellId(hex[..len].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CellId {
    fn default() -> Self {
        Self::generate(DEFAULT_ID_LENGTH)
    }
}

impl From<&str> for CellId {
    fn from(s: &str) -> Self {
        CellId(s.to_string())
    }
}

impl From<String> for CellId {
    fn from(s: String) -> Self {
        CellId(s)
    }
}

impl std::fmt::Display for CellId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CellKind {
    #[default]
    Code,
    Markdown,
}

impl CellKind {
    pub fn opposite(self) -> Self {
        match self {
            CellKind::Code => CellKind::Markdown,
            CellKind::Markdown => CellKind::Code,
        }
    }
}

impl std::fmt::Display for CellKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellKind::Code => write!(f, "code"),
            CellKind::Markdown => write!(f, "markdown"),
        }
    }
}

impl std::str::FromStr for CellKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "code" => Ok(CellKind::Code),
            "markdown" | "md" => Ok(CellKind::Markdown),
            _ => Err(format!("Unknown cell type: {}", s)),
        }
    }
}

/// Execution state carried only by code cells.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CodeState {
    pub execution_count: Option<i64>,
    pub outputs: Vec<Output>,
    /// Set while a run request for this cell is in flight.
    pub running: bool,
    pub collapse: CodeCollapse,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellBody {
    Code(CodeState),
    Markdown { collapsed: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub id: CellId,
    pub source: String,
    /// Open key-value bag; unknown keys round-trip untouched.
    pub metadata: Map<String, Value>,
    pub body: CellBody,
}

impl Cell {
    pub fn new(kind: CellKind, id: CellId, source: impl Into<String>) -> Self {
        let body = match kind {
            CellKind::Code => CellBody::Code(CodeState::default()),
            CellKind::Markdown => CellBody::Markdown { collapsed: false },
        };
        Cell {
            id,
            source: source.into(),
            metadata: Map::new(),
            body,
        }
    }

    pub fn kind(&self) -> CellKind {
        match self.body {
            CellBody::Code(_) => CellKind::Code,
            CellBody::Markdown { .. } => CellKind::Markdown,
        }
    }

    pub fn code(&self) -> Option<&CodeState> {
        match &self.body {
            CellBody::Code(state) => Some(state),
            CellBody::Markdown { .. } => None,
        }
    }

    pub fn code_mut(&mut self) -> Option<&mut CodeState> {
        match &mut self.body {
            CellBody::Code(state) => Some(state),
            CellBody::Markdown { .. } => None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.code().map(|c| c.running).unwrap_or(false)
    }

    /// Read the collapse state from metadata.
    ///
    /// `collapsed` hides the whole cell. On code cells
    /// `jupyter.source_hidden` and `jupyter.outputs_hidden` override it per
    /// flag.
    pub fn sync_collapse_from_metadata(&mut self) {
        let collapsed = self
            .metadata
            .get(COLLAPSED_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let jupyter = self.metadata.get(JUPYTER_KEY).and_then(Value::as_object);
        let hidden = |key: &str| {
            jupyter
                .and_then(|j| j.get(key))
                .and_then(Value::as_bool)
                .unwrap_or(collapsed)
        };
        let code = hidden(SOURCE_HIDDEN_KEY);
        let output = hidden(OUTPUTS_HIDDEN_KEY);
        match &mut self.body {
            CellBody::Code(state) => state.collapse = CodeCollapse { code, output },
            CellBody::Markdown { collapsed: flag } => *flag = collapsed,
        }
    }

    /// Mirror the collapse state into metadata, touching only the keys
    /// whose stored value disagrees with it.
    fn write_collapse_metadata(&mut self) {
        let (code, output) = match &self.body {
            CellBody::Code(state) => (state.collapse.code, state.collapse.output),
            CellBody::Markdown { collapsed } => {
                write_flag(&mut self.metadata, COLLAPSED_KEY, *collapsed, false);
                return;
            }
        };
        let full = code && output;
        write_flag(&mut self.metadata, COLLAPSED_KEY, full, false);

        let partial = code != full || output != full;
        let has_jupyter = matches!(self.metadata.get(JUPYTER_KEY), Some(Value::Object(_)));
        if !has_jupyter {
            if !partial {
                return;
            }
            self.metadata
                .insert(JUPYTER_KEY.to_string(), Value::Object(Map::new()));
        }
        let mut emptied = false;
        if let Some(Value::Object(jupyter)) = self.metadata.get_mut(JUPYTER_KEY) {
            write_flag(jupyter, SOURCE_HIDDEN_KEY, code, full);
            write_flag(jupyter, OUTPUTS_HIDDEN_KEY, output, full);
            emptied = jupyter.is_empty();
        }
        if emptied {
            self.metadata.shift_remove(JUPYTER_KEY);
        }
    }

    /// The shared collapse command, dispatched per variant.
    pub fn collapse(&mut self) {
        match &mut self.body {
            CellBody::Code(state) => state.collapse.collapse(),
            CellBody::Markdown { collapsed } => *collapsed = !*collapsed,
        }
        self.write_collapse_metadata();
    }

    /// Fine-grained source toggle. No-op on markdown cells.
    pub fn toggle_code_collapsed(&mut self) {
        if let Some(state) = self.code_mut() {
            state.collapse.toggle_code();
            self.write_collapse_metadata();
        }
    }

    /// Fine-grained outputs toggle. No-op on markdown cells.
    pub fn toggle_output_collapsed(&mut self) {
        if let Some(state) = self.code_mut() {
            state.collapse.toggle_output();
            self.write_collapse_metadata();
        }
    }

    /// Collapse state as seen by a renderer. Markdown maps onto the two
    /// extremes.
    pub fn collapse_state(&self) -> CollapseState {
        match &self.body {
            CellBody::Code(state) => state.collapse.state(),
            CellBody::Markdown { collapsed: true } => CollapseState::BothCollapsed,
            CellBody::Markdown { collapsed: false } => CollapseState::Expanded,
        }
    }

    pub fn is_collapsed(&self) -> bool {
        self.collapse_state() != CollapseState::Expanded
    }

    /// One-line summary shown while the cell is collapsed.
    pub fn placeholder(&self) -> String {
        placeholder(&self.source)
    }

    /// Append `other` to this cell's source, newline separated.
    pub fn merge_source(&mut self, other: &str) {
        self.source.push('\n');
        self.source.push_str(other);
    }

    /// Truncate the source at character `offset` and return the tail as a
    /// new cell of the same kind. `None` if `offset` is past the end.
    pub fn split_off(&mut self, offset: usize, new_id: CellId) -> Option<Cell> {
        let byte_offset = char_to_byte_offset(&self.source, offset)?;
        let tail = self.source.split_off(byte_offset);
        Some(Cell::new(self.kind(), new_id, tail))
    }

    /// Rebuild as the opposite kind, keeping id, source and metadata.
    /// Outputs and execution count are dropped.
    pub fn into_switched(self) -> Cell {
        let mut switched = Cell::new(self.kind().opposite(), self.id, self.source);
        switched.metadata = self.metadata;
        switched.sync_collapse_from_metadata();
        switched
    }
}

const COLLAPSED_KEY: &str = "collapsed";
const JUPYTER_KEY: &str = "jupyter";
const SOURCE_HIDDEN_KEY: &str = "source_hidden";
const OUTPUTS_HIDDEN_KEY: &str = "outputs_hidden";

/// Store `value` under `key` unless it equals the value implied when the
/// key is absent; a stored boolean that contradicts `value` is removed.
fn write_flag(map: &mut Map<String, Value>, key: &str, value: bool, implied: bool) {
    if value != implied {
        map.insert(key.to_string(), Value::Bool(value));
    } else if matches!(map.get(key), Some(Value::Bool(stored)) if *stored != value) {
        map.shift_remove(key);
    }
}

fn char_to_byte_offset(s: &str, offset: usize) -> Option<usize> {
    if offset == s.chars().count() {
        return Some(s.len());
    }
    s.char_indices().nth(offset).map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id_length_and_alphabet() {
        let id = CellId::generate(DEFAULT_ID_LENGTH);
        assert_eq!(id.as_str().len(), 8);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(CellId::default(), CellId::default());
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("code".parse::<CellKind>().unwrap(), CellKind::Code);
        assert_eq!("Markdown".parse::<CellKind>().unwrap(), CellKind::Markdown);
        assert!("raw".parse::<CellKind>().is_err());
    }

    #[test]
    fn test_split_off_at_char_offset() {
        let mut cell = Cell::new(CellKind::Code, "a".into(), "héllo\nworld");
        let tail = cell.split_off(3, "b".into()).unwrap();
        assert_eq!(cell.source, "hél");
        assert_eq!(tail.source, "lo\nworld");
        assert_eq!(tail.kind(), CellKind::Code);
    }

    #[test]
    fn test_split_off_bounds() {
        let mut cell = Cell::new(CellKind::Markdown, "a".into(), "abc");
        assert!(cell.split_off(4, "b".into()).is_none());
        assert_eq!(cell.source, "abc");

        let tail = cell.split_off(3, "c".into()).unwrap();
        assert_eq!(cell.source, "abc");
        assert_eq!(tail.source, "");

        let tail = cell.split_off(0, "d".into()).unwrap();
        assert_eq!(cell.source, "");
        assert_eq!(tail.source, "abc");
    }

    #[test]
    fn test_switch_drops_outputs_and_keeps_identity() {
        let mut cell = Cell::new(CellKind::Code, "x1".into(), "# title");
        cell.metadata.insert("tags".into(), serde_json::json!(["a"]));
        if let Some(code) = cell.code_mut() {
            code.execution_count = Some(3);
            code.outputs.push(Output::stream_stdout("hi\n"));
        }

        let md = cell.into_switched();
        assert_eq!(md.kind(), CellKind::Markdown);
        assert_eq!(md.id.as_str(), "x1");
        assert_eq!(md.source, "# title");
        assert!(md.code().is_none());
        assert_eq!(md.metadata.get("tags"), Some(&serde_json::json!(["a"])));

        let code = md.into_switched();
        assert_eq!(code.code(), Some(&CodeState::default()));
    }

    #[test]
    fn test_markdown_collapse_is_plain_toggle() {
        let mut cell = Cell::new(CellKind::Markdown, "m".into(), "text");
        cell.collapse();
        assert!(cell.is_collapsed());
        assert_eq!(cell.metadata.get("collapsed"), Some(&Value::Bool(true)));
        cell.collapse();
        assert!(!cell.is_collapsed());
        assert!(cell.metadata.is_empty());
    }

    #[test]
    fn test_code_collapse_syncs_metadata() {
        let mut cell = Cell::new(CellKind::Code, "c".into(), "x");
        cell.toggle_output_collapsed();
        assert_eq!(cell.collapse_state(), CollapseState::OutputCollapsed);
        assert_eq!(cell.metadata.get("collapsed"), None);
        assert_eq!(
            cell.metadata.get("jupyter"),
            Some(&serde_json::json!({"outputs_hidden": true}))
        );

        cell.collapse();
        assert_eq!(cell.collapse_state(), CollapseState::BothCollapsed);
        assert_eq!(cell.metadata.get("collapsed"), Some(&Value::Bool(true)));
        assert_eq!(cell.metadata.get("jupyter"), None);
    }

    #[test]
    fn test_partial_collapse_survives_metadata_reload() {
        let toggles: [fn(&mut Cell); 2] = [Cell::toggle_code_collapsed, Cell::toggle_output_collapsed];
        for toggle in toggles {
            let mut cell = Cell::new(CellKind::Code, "c".into(), "x");
            toggle(&mut cell);
            let expected = cell.collapse_state();

            let mut reloaded = Cell::new(CellKind::Code, "c".into(), "x");
            reloaded.metadata = cell.metadata.clone();
            reloaded.sync_collapse_from_metadata();
            assert_eq!(reloaded.collapse_state(), expected);
        }
    }

    #[test]
    fn test_collapse_commands_leave_untouched_metadata_alone() {
        let mut cell = Cell::new(CellKind::Code, "c".into(), "x");
        cell.metadata.insert("tags".into(), serde_json::json!(["keep"]));
        let original = cell.metadata.clone();

        cell.toggle_output_collapsed();
        cell.toggle_output_collapsed();
        assert_eq!(cell.metadata, original);

        cell.collapse();
        cell.collapse();
        assert_eq!(cell.metadata, original);
    }

    #[test]
    fn test_loaded_collapsed_false_is_kept_while_expanded() {
        let mut cell = Cell::new(CellKind::Code, "c".into(), "x");
        cell.metadata.insert("collapsed".into(), Value::Bool(false));
        cell.sync_collapse_from_metadata();

        cell.toggle_code_collapsed();
        assert_eq!(cell.metadata.get("collapsed"), Some(&Value::Bool(false)));
        assert_eq!(cell.collapse_state(), CollapseState::CodeCollapsed);
    }

    #[test]
    fn test_jupyter_flags_override_collapsed() {
        let mut cell = Cell::new(CellKind::Code, "c".into(), "x");
        cell.metadata.insert("collapsed".into(), Value::Bool(true));
        cell.metadata
            .insert("jupyter".into(), serde_json::json!({"source_hidden": false}));
        cell.sync_collapse_from_metadata();
        assert_eq!(cell.collapse_state(), CollapseState::OutputCollapsed);
    }

    #[test]
    fn test_sync_collapse_from_metadata() {
        let mut cell = Cell::new(CellKind::Code, "c".into(), "x");
        cell.metadata.insert("collapsed".into(), Value::Bool(true));
        cell.sync_collapse_from_metadata();
        assert_eq!(cell.collapse_state(), CollapseState::BothCollapsed);
    }

    #[test]
    fn test_merge_source_uses_newline() {
        let mut cell = Cell::new(CellKind::Code, "c".into(), "1");
        cell.merge_source("x");
        assert_eq!(cell.source, "1\nx");
    }
}
