//! Reading and writing `.ipynb` files (nbformat v4).
//!
//! Loading is all-or-nothing: the first malformed cell record aborts the
//! load and no [`Document`] is built. Writing always produces `source` as a
//! single string and keeps every metadata key it was given.

use std::path::{Path, PathBuf};

use kernel_proxy::KernelDescription;
use log::{debug, info};
use serde_json::{json, Map, Value};

use crate::cell::{Cell, CellBody, CellId, CellKind};
use crate::document::{Document, NotebookMetadata};
use crate::output::Output;

pub const NOTEBOOK_EXTENSION: &str = "ipynb";

#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("invalid notebook JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("could not access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} is not a notebook file (expected .ipynb)", .0.display())]
    WrongExtension(PathBuf),

    #[error("cell {cell_index} is missing required key `{key}`")]
    MissingKey { cell_index: usize, key: &'static str },

    #[error("cell {cell_index} should be a {expected} cell, found `{found}`")]
    CellTypeMismatch {
        cell_index: usize,
        expected: CellKind,
        found: String,
    },

    #[error("cell {cell_index} has unsupported cell_type `{cell_type}`")]
    UnknownCellType { cell_index: usize, cell_type: String },

    #[error("invalid `{field}`: {reason}")]
    InvalidField { field: String, reason: String },
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> FormatError {
    FormatError::InvalidField {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── Document ⇄ record ───────────────────────────────────────────────

/// Serialize a document into an nbformat v4 record.
pub fn to_record(doc: &Document) -> Value {
    let cells: Vec<Value> = doc.iter().map(cell_to_record).collect();
    json!({
        "cells": cells,
        "metadata": serde_json::to_value(&doc.metadata).unwrap_or_else(|_| json!({})),
        "nbformat": doc.nbformat,
        "nbformat_minor": doc.nbformat_minor,
    })
}

/// Build a document from an nbformat v4 record.
pub fn from_record(record: &Value) -> Result<Document, FormatError> {
    let obj = record
        .as_object()
        .ok_or_else(|| invalid("notebook", "expected a JSON object"))?;

    let nbformat = obj
        .get("nbformat")
        .and_then(Value::as_u64)
        .ok_or_else(|| invalid("nbformat", "expected an integer"))?;
    if nbformat != 4 {
        return Err(invalid(
            "nbformat",
            format!("unsupported major version {}", nbformat),
        ));
    }
    let nbformat_minor = obj
        .get("nbformat_minor")
        .and_then(Value::as_u64)
        .ok_or_else(|| invalid("nbformat_minor", "expected an integer"))?;

    let metadata: NotebookMetadata = match obj.get("metadata") {
        Some(value @ Value::Object(_)) => serde_json::from_value(value.clone())?,
        Some(_) => return Err(invalid("metadata", "expected an object")),
        None => return Err(invalid("metadata", "missing")),
    };

    let records = obj
        .get("cells")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("cells", "expected an array"))?;

    let mut doc = Document::new();
    doc.metadata = metadata;
    doc.nbformat = nbformat as u32;
    doc.nbformat_minor = nbformat_minor as u32;
    for (index, record) in records.iter().enumerate() {
        let cell = cell_from_record(index, record)?;
        doc.push(cell);
    }

    debug!("[format] Parsed notebook with {} cells", doc.len());
    Ok(doc)
}

pub fn to_string(doc: &Document) -> Result<String, FormatError> {
    let mut text = serde_json::to_string_pretty(&to_record(doc))?;
    text.push('\n');
    Ok(text)
}

pub fn from_str(text: &str) -> Result<Document, FormatError> {
    let record: Value = serde_json::from_str(text)?;
    from_record(&record)
}

// ── Cells ───────────────────────────────────────────────────────────

pub fn cell_to_record(cell: &Cell) -> Value {
    match &cell.body {
        CellBody::Code(state) => json!({
            "cell_type": "code",
            "execution_count": state.execution_count,
            "id": cell.id,
            "metadata": cell.metadata,
            "outputs": state.outputs.iter().map(Output::to_record).collect::<Vec<_>>(),
            "source": cell.source,
        }),
        CellBody::Markdown { .. } => json!({
            "cell_type": "markdown",
            "id": cell.id,
            "metadata": cell.metadata,
            "source": cell.source,
        }),
    }
}

/// Parse the record of the cell at `index` (the index only labels errors).
///
/// A record without an `id` (files older than nbformat 4.5) gets a fresh one.
pub fn cell_from_record(index: usize, record: &Value) -> Result<Cell, FormatError> {
    let obj = record
        .as_object()
        .ok_or_else(|| invalid(format!("cells[{}]", index), "expected an object"))?;
    let cell_type = require(obj, index, "cell_type")?
        .as_str()
        .ok_or_else(|| invalid(format!("cells[{}].cell_type", index), "expected a string"))?;
    let kind = match cell_type {
        "code" => CellKind::Code,
        "markdown" => CellKind::Markdown,
        other => {
            return Err(FormatError::UnknownCellType {
                cell_index: index,
                cell_type: other.to_string(),
            })
        }
    };
    cell_body_from_record(index, obj, kind)
}

/// Parse a record that must be of `expected` kind.
pub fn cell_from_record_as(
    index: usize,
    record: &Value,
    expected: CellKind,
) -> Result<Cell, FormatError> {
    let found = record
        .get("cell_type")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if found != expected.to_string() {
        return Err(FormatError::CellTypeMismatch {
            cell_index: index,
            expected,
            found: found.to_string(),
        });
    }
    cell_from_record(index, record)
}

fn cell_body_from_record(
    index: usize,
    obj: &Map<String, Value>,
    kind: CellKind,
) -> Result<Cell, FormatError> {
    let source = read_multiline(
        require(obj, index, "source")?,
        &format!("cells[{}].source", index),
    )?;
    let metadata = match require(obj, index, "metadata")? {
        Value::Object(map) => map.clone(),
        _ => {
            return Err(invalid(
                format!("cells[{}].metadata", index),
                "expected an object",
            ))
        }
    };
    let id = match obj.get("id") {
        Some(Value::String(id)) if !id.is_empty() => CellId::from(id.as_str()),
        Some(_) => {
            return Err(invalid(
                format!("cells[{}].id", index),
                "expected a non-empty string",
            ))
        }
        None => CellId::default(),
    };

    let mut cell = Cell::new(kind, id, source);
    cell.metadata = metadata;

    if let Some(state) = cell.code_mut() {
        state.execution_count = match require(obj, index, "execution_count")? {
            Value::Null => None,
            value => Some(value.as_i64().ok_or_else(|| {
                invalid(
                    format!("cells[{}].execution_count", index),
                    "expected an integer or null",
                )
            })?),
        };
        let outputs = require(obj, index, "outputs")?.as_array().ok_or_else(|| {
            invalid(format!("cells[{}].outputs", index), "expected an array")
        })?;
        state.outputs = outputs
            .iter()
            .enumerate()
            .map(|(i, record)| {
                Output::from_record(record.clone()).map_err(|e| {
                    invalid(format!("cells[{}].outputs[{}]", index, i), e.to_string())
                })
            })
            .collect::<Result<_, _>>()?;
    }

    cell.sync_collapse_from_metadata();
    Ok(cell)
}

fn require<'a>(
    obj: &'a Map<String, Value>,
    cell_index: usize,
    key: &'static str,
) -> Result<&'a Value, FormatError> {
    obj.get(key)
        .ok_or(FormatError::MissingKey { cell_index, key })
}

/// A string, or a list of fragments concatenated with no separator.
fn read_multiline(value: &Value, field: &str) -> Result<String, FormatError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Array(parts) => parts
            .iter()
            .map(|p| {
                p.as_str()
                    .ok_or_else(|| invalid(field, "expected a list of strings"))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(|parts| parts.concat()),
        _ => Err(invalid(field, "expected a string or a list of strings")),
    }
}

// ── Kernel metadata ─────────────────────────────────────────────────

/// Overwrite the kernel maps with a fresh description. Empty maps mean the
/// kernel could not be asked and leave the stored value alone.
pub fn refresh_kernel_metadata(metadata: &mut NotebookMetadata, description: &KernelDescription) {
    fn to_map(flat: &std::collections::BTreeMap<String, String>) -> Option<Map<String, Value>> {
        if flat.is_empty() {
            return None;
        }
        Some(
            flat.iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        )
    }

    if let Some(map) = to_map(&description.kernel_info) {
        metadata.extra.shift_remove("kernel_info");
        metadata.kernel_info = Some(map);
    }
    if let Some(map) = to_map(&description.kernel_spec) {
        metadata.extra.shift_remove("kernel_spec");
        metadata.kernel_spec = Some(map);
    }
    if let Some(map) = to_map(&description.language_info) {
        metadata.extra.shift_remove("language_info");
        metadata.language_info = Some(map);
    }
}

// ── Files ───────────────────────────────────────────────────────────

pub fn ensure_notebook_path(path: &Path) -> Result<(), FormatError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case(NOTEBOOK_EXTENSION) => Ok(()),
        _ => Err(FormatError::WrongExtension(path.to_path_buf())),
    }
}

pub fn load(path: &Path) -> Result<Document, FormatError> {
    ensure_notebook_path(path)?;
    let text = std::fs::read_to_string(path).map_err(|source| FormatError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let doc = from_str(&text)?;
    info!("[format] Loaded {} ({} cells)", path.display(), doc.len());
    Ok(doc)
}

pub fn save(doc: &Document, path: &Path) -> Result<(), FormatError> {
    ensure_notebook_path(path)?;
    let text = to_string(doc)?;
    std::fs::write(path, text).map_err(|source| FormatError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    info!("[format] Saved {} ({} cells)", path.display(), doc.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collapse::CollapseState;
    use crate::document::Position;

    fn sample() -> Document {
        let mut doc = Document::new();
        doc.metadata
            .extra
            .insert("jupytext".into(), json!({"formats": "ipynb,py"}));
        let a = doc.insert(CellKind::Markdown, None, Position::After);
        doc.update_source(&a, "# Title\n\nSome *text*");
        let b = doc.insert(CellKind::Code, None, Position::After);
        let cell = doc.cell_mut(&b).unwrap();
        cell.source = "print('hi')\n1 + 1".into();
        cell.metadata.insert("tags".into(), json!(["slow"]));
        cell.collapse();
        let code = cell.code_mut().unwrap();
        code.execution_count = Some(7);
        code.outputs = vec![
            Output::stream_stdout("hi\n"),
            Output::from_record(json!({
                "output_type": "execute_result",
                "execution_count": 7,
                "data": {"text/plain": "2"},
                "metadata": {}
            }))
            .unwrap(),
        ];
        doc.insert(CellKind::Code, None, Position::After);
        doc
    }

    #[test]
    fn test_round_trip_preserves_document() {
        let doc = sample();
        let back = from_record(&to_record(&doc)).unwrap();
        assert_eq!(back, doc);
        assert_eq!(back.ids(), doc.ids());
        back.check_invariants().unwrap();
    }

    #[test]
    fn test_round_trip_through_text() {
        let doc = sample();
        let back = from_str(&to_string(&doc).unwrap()).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn test_source_fragments_are_concatenated() {
        let record = json!({
            "cells": [{
                "cell_type": "markdown",
                "id": "m1",
                "metadata": {},
                "source": ["# A\n", "b\n", "c"]
            }],
            "metadata": {},
            "nbformat": 4,
            "nbformat_minor": 5
        });
        let doc = from_record(&record).unwrap();
        assert_eq!(doc.cell_at(0).unwrap().source, "# A\nb\nc");
        assert_eq!(to_record(&doc)["cells"][0]["source"], json!("# A\nb\nc"));
    }

    #[test]
    fn test_missing_source_on_code_cell_fails() {
        let record = json!({
            "cells": [{
                "cell_type": "code",
                "id": "c1",
                "metadata": {},
                "execution_count": null,
                "outputs": []
            }],
            "metadata": {},
            "nbformat": 4,
            "nbformat_minor": 5
        });
        let err = from_record(&record).unwrap_err();
        assert!(matches!(
            err,
            FormatError::MissingKey {
                cell_index: 0,
                key: "source"
            }
        ));
    }

    #[test]
    fn test_code_cell_requires_outputs_and_execution_count() {
        let base = json!({"cell_type": "code", "id": "c", "metadata": {}, "source": ""});
        let err = cell_from_record(3, &base).unwrap_err();
        assert!(matches!(err, FormatError::MissingKey { cell_index: 3, .. }));
    }

    #[test]
    fn test_unknown_cell_type_fails() {
        let record = json!({"cell_type": "raw", "metadata": {}, "source": ""});
        let err = cell_from_record(0, &record).unwrap_err();
        assert!(matches!(err, FormatError::UnknownCellType { .. }));
    }

    #[test]
    fn test_cell_type_mismatch() {
        let record = json!({"cell_type": "markdown", "id": "m", "metadata": {}, "source": "x"});
        let err = cell_from_record_as(0, &record, CellKind::Code).unwrap_err();
        assert!(matches!(
            err,
            FormatError::CellTypeMismatch {
                expected: CellKind::Code,
                ..
            }
        ));
        assert!(cell_from_record_as(0, &record, CellKind::Markdown).is_ok());
    }

    #[test]
    fn test_missing_id_is_minted() {
        let record = json!({"cell_type": "markdown", "metadata": {}, "source": "x"});
        let cell = cell_from_record(0, &record).unwrap();
        assert_eq!(cell.id.as_str().len(), 8);
    }

    #[test]
    fn test_bad_execution_count_is_rejected() {
        let record = json!({
            "cell_type": "code", "id": "c", "metadata": {}, "source": "",
            "execution_count": "three", "outputs": []
        });
        assert!(matches!(
            cell_from_record(0, &record).unwrap_err(),
            FormatError::InvalidField { .. }
        ));
    }

    #[test]
    fn test_legacy_major_version_rejected() {
        let record = json!({"cells": [], "metadata": {}, "nbformat": 3, "nbformat_minor": 0});
        assert!(from_record(&record).is_err());
    }

    #[test]
    fn test_unknown_metadata_preserved() {
        let record = json!({
            "cells": [],
            "metadata": {
                "kernelspec": {"name": "python3", "display_name": "Python 3"},
                "custom": {"nested": [1, 2, 3]}
            },
            "nbformat": 4,
            "nbformat_minor": 5
        });
        let doc = from_record(&record).unwrap();
        assert_eq!(to_record(&doc)["metadata"], record["metadata"]);
    }

    #[test]
    fn test_collapsed_metadata_restores_state() {
        let record = json!({
            "cell_type": "code", "id": "c", "metadata": {"collapsed": true},
            "source": "x = 1", "execution_count": 1, "outputs": []
        });
        let cell = cell_from_record(0, &record).unwrap();
        assert_eq!(cell.collapse_state(), CollapseState::BothCollapsed);
    }

    #[test]
    fn test_partial_collapse_round_trips() {
        let mut doc = sample();
        let code_hidden = doc.insert(CellKind::Code, None, Position::After);
        doc.cell_mut(&code_hidden).unwrap().toggle_code_collapsed();
        let output_hidden = doc.insert(CellKind::Code, None, Position::After);
        doc.cell_mut(&output_hidden).unwrap().toggle_output_collapsed();

        let record = to_record(&doc);
        let back = from_record(&record).unwrap();
        assert_eq!(back, doc);
        assert_eq!(
            back.cell(&code_hidden).unwrap().collapse_state(),
            CollapseState::CodeCollapsed
        );
        assert_eq!(
            back.cell(&output_hidden).unwrap().collapse_state(),
            CollapseState::OutputCollapsed
        );
        assert_eq!(
            record["cells"][4]["metadata"],
            json!({"jupyter": {"outputs_hidden": true}})
        );
    }

    #[test]
    fn test_null_kernel_metadata_round_trips() {
        let record = json!({
            "cells": [],
            "metadata": {"kernel_info": null, "language_info": {"name": "python"}},
            "nbformat": 4,
            "nbformat_minor": 5
        });
        let mut doc = from_record(&record).unwrap();
        assert!(doc.metadata.kernel_info.is_none());
        assert_eq!(to_record(&doc)["metadata"], record["metadata"]);

        let mut desc = KernelDescription::default();
        desc.kernel_info.insert("implementation".into(), "ipython".into());
        refresh_kernel_metadata(&mut doc.metadata, &desc);
        assert_eq!(
            to_record(&doc)["metadata"]["kernel_info"],
            json!({"implementation": "ipython"})
        );
        assert!(!doc.metadata.extra.contains_key("kernel_info"));
    }

    #[test]
    fn test_refresh_kernel_metadata_keeps_other_keys() {
        let mut doc = sample();
        let mut desc = KernelDescription::default();
        desc.language_info.insert("name".into(), "python".into());
        refresh_kernel_metadata(&mut doc.metadata, &desc);

        assert_eq!(
            doc.metadata.language_info,
            json!({"name": "python"}).as_object().cloned()
        );
        assert!(doc.metadata.kernel_spec.is_none());
        assert!(doc.metadata.extra.contains_key("jupytext"));
    }

    #[test]
    fn test_wrong_extension_rejected() {
        assert!(ensure_notebook_path(Path::new("a/b.ipynb")).is_ok());
        assert!(matches!(
            ensure_notebook_path(Path::new("a/b.json")),
            Err(FormatError::WrongExtension(_))
        ));
        assert!(ensure_notebook_path(Path::new("noext")).is_err());
    }
}
