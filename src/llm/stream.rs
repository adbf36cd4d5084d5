//! Reassembly of tool calls that arrive fragmented over a completion stream.

use std::collections::BTreeMap;

use super::types::{FunctionCall, ToolCall, ToolCallFragment};
use crate::error::DbError;

/// Collects tool-call fragments keyed by stream index.
///
/// The id and function name for an index arrive once; argument text arrives
/// as a sequence of partial strings that concatenate, in arrival order, into
/// one JSON document. Nothing is parsed until the stream ends, because the
/// argument text is not valid JSON until the last fragment lands.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    calls: BTreeMap<usize, PartialCall>,
}

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: &ToolCallFragment) {
        let entry = self.calls.entry(fragment.index).or_default();
        if let Some(id) = &fragment.id {
            entry.id = Some(id.clone());
        }
        if let Some(function) = &fragment.function {
            if let Some(name) = &function.name {
                entry.name = Some(name.clone());
            }
            if let Some(args) = &function.arguments {
                entry.arguments.push_str(args);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Finalize into complete calls, in index order. A call that never
    /// received a name means the stream was truncated or malformed.
    pub fn finish(self) -> Result<Vec<ToolCall>, DbError> {
        let mut out = Vec::with_capacity(self.calls.len());
        for (index, partial) in self.calls {
            let name = partial.name.ok_or_else(|| {
                DbError::Llm(format!("tool call {} ended without a function name", index))
            })?;
            let arguments = if partial.arguments.is_empty() {
                "{}".to_string()
            } else {
                partial.arguments
            };
            out.push(ToolCall {
                id: partial.id.unwrap_or_else(|| format!("call_{}", index)),
                call_type: "function".to_string(),
                function: FunctionCall { name, arguments },
            });
        }
        Ok(out)
    }
}
