use std::collections::HashMap;
use std::sync::Arc;

use crate::code::{CodeLine, Script};

/// Name under which the register for numeric key `key` is stored.
pub fn register_name(key: u16) -> String {
    format!("#{key}")
}

/// Named integer variables of one script thread. Unset names read as 0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableStore {
    vars: HashMap<String, i32>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> i32 {
        self.vars.get(name).copied().unwrap_or(0)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: i32) {
        self.vars.insert(name.into(), value);
    }

    /// Wrapping add; returns the new value.
    pub fn add(&mut self, name: impl Into<String>, delta: i32) -> i32 {
        let slot = self.vars.entry(name.into()).or_insert(0);
        *slot = slot.wrapping_add(delta);
        *slot
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i32)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Per-thread execution state handed to every instruction step.
///
/// `code` is the instruction currently being executed. It is set by the
/// scheduler immediately before each step runs.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub id: u32,
    pub variable: VariableStore,
    pub code: Option<CodeLine>,
    pub script: Option<Arc<Script>>,
    pub eip: usize,
}

impl ExecutionContext {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            variable: VariableStore::new(),
            code: None,
            script: None,
            eip: 0,
        }
    }

    pub fn with_code(mut self, code: CodeLine) -> Self {
        self.code = Some(code);
        self
    }

    /// Offset of the current instruction, 0 before the first step.
    pub fn pos(&self) -> u32 {
        self.code.as_ref().map(|c| c.pos).unwrap_or(0)
    }

    pub fn script_name(&self) -> Option<&str> {
        self.script.as_deref().map(Script::name)
    }
}
