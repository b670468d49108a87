//! Collapse state for notebook cells.
//!
//! A code cell has two independent flags (source hidden, outputs hidden).
//! The shared "collapse" command is asymmetric: from any state
//! where something is still visible it hides everything, and only from the
//! fully collapsed state does it reveal everything again. Partial states are
//! reachable only through the fine-grained toggles.
//!
//! A markdown cell has a single flag with plain toggle semantics.

use serde::{Deserialize, Serialize};

/// The four states spanned by the two code-cell flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollapseState {
    Expanded,
    CodeCollapsed,
    OutputCollapsed,
    BothCollapsed,
}

impl std::fmt::Display for CollapseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollapseState::Expanded => write!(f, "expanded"),
            CollapseState::CodeCollapsed => write!(f, "code-collapsed"),
            CollapseState::OutputCollapsed => write!(f, "output-collapsed"),
            CollapseState::BothCollapsed => write!(f, "collapsed"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeCollapse {
    pub code: bool,
    pub output: bool,
}

impl CodeCollapse {
    pub fn both(collapsed: bool) -> Self {
        Self {
            code: collapsed,
            output: collapsed,
        }
    }

    /// The shared collapse command.
    pub fn collapse(&mut self) {
        if self.code && self.output {
            *self = Self::both(false);
        } else {
            *self = Self::both(true);
        }
    }

    pub fn toggle_code(&mut self) {
        self.code = !self.code;
    }

    pub fn toggle_output(&mut self) {
        self.output = !self.output;
    }

    pub fn state(&self) -> CollapseState {
        match (self.code, self.output) {
            (false, false) => CollapseState::Expanded,
            (true, false) => CollapseState::CodeCollapsed,
            (false, true) => CollapseState::OutputCollapsed,
            (true, true) => CollapseState::BothCollapsed,
        }
    }

    pub fn is_fully_collapsed(&self) -> bool {
        self.code && self.output
    }
}

/// First non-empty line of `source` followed by `...`, shown in place of a
/// collapsed cell.
pub fn placeholder(source: &str) -> String {
    let first = source
        .lines()
        .find(|line| !line.is_empty())
        .unwrap_or_default();
    format!("{}...", first)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collapse_twice_from_expanded_returns_to_expanded() {
        let mut c = CodeCollapse::default();
        c.collapse();
        assert_eq!(c.state(), CollapseState::BothCollapsed);
        c.collapse();
        assert_eq!(c.state(), CollapseState::Expanded);
    }

    #[test]
    fn test_collapse_from_partial_states_collapses_both() {
        for start in [
            CodeCollapse {
                code: true,
                output: false,
            },
            CodeCollapse {
                code: false,
                output: true,
            },
        ] {
            let mut c = start;
            c.collapse();
            assert_eq!(c.state(), CollapseState::BothCollapsed, "from {:?}", start);
        }
    }

    #[test]
    fn test_fine_grained_toggles_reach_partial_states() {
        let mut c = CodeCollapse::default();
        c.toggle_code();
        assert_eq!(c.state(), CollapseState::CodeCollapsed);
        c.toggle_code();
        c.toggle_output();
        assert_eq!(c.state(), CollapseState::OutputCollapsed);
    }

    #[test]
    fn test_repeated_collapse_never_stops_partially() {
        let mut c = CodeCollapse::default();
        for _ in 0..6 {
            c.collapse();
            assert!(matches!(
                c.state(),
                CollapseState::BothCollapsed | CollapseState::Expanded
            ));
        }
    }

    #[test]
    fn test_placeholder_skips_blank_lines() {
        assert_eq!(placeholder("\n\nimport os\nx = 1"), "import os...");
        assert_eq!(placeholder(""), "...");
    }
}
