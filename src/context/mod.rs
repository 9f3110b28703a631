// Module: Context
// Conversation state, bounded aggregation, delimiter wrapping, and the
// strict template renderer.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::CouncilError;
use crate::protocol::{
    Role, Turn, AGENT_DATA_END, AGENT_DATA_START, CONTEXT_TRUNCATION_MARKER,
};

static TEMPLATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid template regex"));

/// Ordered, append-only history of a single run.
///
/// The orchestrator is the sole writer; turns are never mutated or
/// removed once appended.
#[derive(Debug)]
pub struct CouncilState {
    turns: Vec<Turn>,
    max_context_chars: usize,
}

impl CouncilState {
    pub fn new(max_context_chars: usize) -> Self {
        Self {
            turns: Vec::new(),
            max_context_chars,
        }
    }

    /// Appends a turn at the end of the history.
    pub fn add_turn(
        &mut self,
        agent_name: impl Into<String>,
        role: Role,
        content: impl Into<String>,
        role_desc: impl Into<String>,
    ) {
        self.turns.push(Turn {
            agent_name: agent_name.into(),
            role,
            content: content.into(),
            role_desc: role_desc.into(),
        });
    }

    /// Turns in temporal order.
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Aggregated context within the state's own cap.
    pub fn full_context(&self) -> String {
        self.full_context_capped(self.max_context_chars)
    }

    /// Aggregated context within an explicit cap (steps may override
    /// the global limit).
    ///
    /// Each turn is labeled with role and agent name. When the
    /// aggregation exceeds the cap, the oldest portion is dropped and a
    /// marker line replaces the removed prefix; the retained portion is
    /// always the newest suffix.
    pub fn full_context_capped(&self, max_context_chars: usize) -> String {
        let full = self
            .turns
            .iter()
            .map(|t| {
                format!(
                    "[{} - {} ({})]:\n{}",
                    t.role.as_str(),
                    t.agent_name,
                    t.role_desc,
                    t.content
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        let total = full.chars().count();
        if total <= max_context_chars {
            return full;
        }

        let suffix: String = full.chars().skip(total - max_context_chars).collect();
        format!("{CONTEXT_TRUNCATION_MARKER}\n{suffix}")
    }
}

/// Frames untrusted inter-agent data with the delimiter protocol.
///
/// The source label is sanitized to printable ASCII so a hostile agent
/// name cannot smuggle control characters or fake markers into the
/// label line.
pub fn wrap_agent_data(label: &str, content: &str) -> String {
    format!(
        "{AGENT_DATA_START}\n[origem: {}]\n{}\n{AGENT_DATA_END}",
        sanitize_label(label),
        content
    )
}

fn sanitize_label(label: &str) -> String {
    label
        .chars()
        .map(|c| if (' '..='~').contains(&c) { c } else { '_' })
        .collect()
}

/// Renders `{name}` placeholders from the mapping.
///
/// Unknown placeholders are an error: silently leaving them in place
/// would ship template syntax to an LLM. Substituted content is copied
/// verbatim and never re-scanned, so braces inside agent output cannot
/// trigger a second substitution. Deterministic: same inputs, same
/// output.
pub fn render_template(
    template: &str,
    vars: &HashMap<String, String>,
) -> Result<String, CouncilError> {
    let mut result = String::new();
    let mut last_index = 0;

    for capture in TEMPLATE_RE.captures_iter(template) {
        let matched = capture.get(0).expect("regex match");
        let name = capture.get(1).expect("capture group").as_str();

        result.push_str(&template[last_index..matched.start()]);
        match vars.get(name) {
            Some(value) => result.push_str(value),
            None => {
                return Err(CouncilError::Config(format!(
                    "placeholder desconhecido no template: '{{{name}}}'"
                )))
            }
        }
        last_index = matched.end();
    }

    result.push_str(&template[last_index..]);
    Ok(result)
}

/// Placeholder names referenced by a template, in order of appearance.
pub fn template_placeholders(template: &str) -> Vec<String> {
    TEMPLATE_RE
        .captures_iter(template)
        .map(|c| c.get(1).expect("capture group").as_str().to_string())
        .collect()
}
