//! Opcode dispatch.
//!
//! An [`OperatorSet`] maps opcode ids to [`Operation`]s. Each operation
//! decodes an instruction payload once and either renders it as listing text
//! or captures the decoded parameters in a [`Step`] that can be invoked any
//! number of times. Opcodes without an entry fall back to UNDEFINE.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;

use crate::code::CodeLine;
use crate::context::ExecutionContext;
use crate::disasm::LabelMap;
use crate::error::Result;
use crate::hook::EngineHook;

pub mod luca;
pub mod title;
pub mod undefine;

pub use luca::{Baseline, LucaOperate};
pub use title::{MessageTitle, Operater};
pub use undefine::{undefine, UndefinedStep};

/// Where a script thread continues after a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer {
    /// The instruction following the current one.
    Next,
    /// An address in the current script.
    Goto(u32),
    /// An address in another script, without return.
    Jump { script: String, pos: u32 },
    /// Enter another script, resuming after the current instruction once it returns.
    Call { index: u16, script: String, pos: u32 },
    /// Return from the innermost call.
    Return,
    /// Stop the thread, or return when inside a call.
    Exit,
}

/// An instruction with its parameters already decoded.
#[async_trait]
pub trait Step: Send + Sync + Debug {
    /// Apply the instruction to `ctx`, call the hook once, and report where
    /// execution continues. Resolves only after all mutations are visible.
    async fn invoke(&self, ctx: &mut ExecutionContext, hook: &dyn EngineHook) -> Result<Transfer>;
}

pub trait Operation: Send + Sync {
    fn name(&self) -> &str;

    fn disassemble(&self, code: &CodeLine, labels: &mut LabelMap) -> Result<String>;

    fn build(&self, code: &CodeLine) -> Result<Arc<dyn Step>>;
}

/// Per-title opcode names, indexed by opcode id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpcodeTable {
    names: Vec<Option<String>>,
    ids: HashMap<String, u8>,
}

impl OpcodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from names in opcode order. Empty names leave their slot unnamed.
    /// Only the first 256 entries are used; a repeated name keeps its first id.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut table = Self::new();
        for (id, name) in names.into_iter().take(256).enumerate() {
            let name = name.as_ref().trim();
            if name.is_empty() {
                table.names.push(None);
                continue;
            }
            if table.ids.contains_key(name) {
                log::warn!("opcode name {name} repeated at 0x{id:02X}, keeping the first");
            } else {
                table.ids.insert(name.to_owned(), id as u8);
            }
            table.names.push(Some(name.to_owned()));
        }
        table
    }

    /// Parse one name per line.
    pub fn parse(text: &str) -> Self {
        Self::from_names(text.lines())
    }

    pub fn name(&self, opcode: u8) -> Option<&str> {
        self.names.get(opcode as usize).and_then(|n| n.as_deref())
    }

    pub fn opcode(&self, name: &str) -> Option<u8> {
        self.ids.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// The merged dispatch table of one title.
pub struct OperatorSet {
    table: OpcodeTable,
    ops: HashMap<u8, Arc<dyn Operation>>,
}

impl OperatorSet {
    pub fn builder(table: OpcodeTable) -> OperatorSetBuilder {
        OperatorSetBuilder::new(table)
    }

    pub fn table(&self) -> &OpcodeTable {
        &self.table
    }

    pub fn get(&self, opcode: u8) -> Option<&Arc<dyn Operation>> {
        self.ops.get(&opcode)
    }

    /// Handler name if one is registered, else the title's name for the opcode.
    pub fn name(&self, opcode: u8) -> Option<&str> {
        match self.ops.get(&opcode) {
            Some(op) => Some(op.name()),
            None => self.table.name(opcode),
        }
    }

    /// Like [`OperatorSet::name`], falling back to uppercase hex.
    pub fn display_name(&self, opcode: u8) -> String {
        match self.name(opcode) {
            Some(name) => name.to_owned(),
            None => format!("{opcode:X}"),
        }
    }

    /// Render one instruction. Unknown opcodes render through UNDEFINE and
    /// never fail; decode errors carry the instruction's address.
    pub fn disassemble(&self, code: &CodeLine, labels: &mut LabelMap) -> Result<String> {
        match self.ops.get(&code.opcode) {
            Some(op) => op
                .disassemble(code, labels)
                .map_err(|e| e.at(code.pos, op.name())),
            None => Ok(undefine(code, self.table.name(code.opcode))),
        }
    }

    /// Decode one instruction into a reusable step.
    pub fn build(&self, code: &CodeLine) -> Result<Arc<dyn Step>> {
        match self.ops.get(&code.opcode) {
            Some(op) => op.build(code).map_err(|e| e.at(code.pos, op.name())),
            None => Ok(Arc::new(UndefinedStep::new(
                code,
                self.table.name(code.opcode),
            ))),
        }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Collects baseline handlers and the title overlay; [`OperatorSetBuilder::build`]
/// merges them so that overlay entries shadow baseline ones.
pub struct OperatorSetBuilder {
    table: OpcodeTable,
    base: HashMap<u8, Arc<dyn Operation>>,
    overlay: HashMap<u8, Arc<dyn Operation>>,
}

impl OperatorSetBuilder {
    pub fn new(table: OpcodeTable) -> Self {
        Self {
            table,
            base: HashMap::new(),
            overlay: HashMap::new(),
        }
    }

    /// Register every baseline handler whose name the title's table knows.
    pub fn baseline(mut self, env: &LucaOperate) -> Self {
        for (name, op) in env.operations() {
            match self.table.opcode(name) {
                Some(id) => {
                    self.base.insert(id, op);
                }
                None => log::debug!("baseline {name} has no opcode in this title"),
            }
        }
        self
    }

    /// Register the title's own handlers by name.
    pub fn title(mut self, title: &dyn Operater, env: &LucaOperate) -> Self {
        let mut ops = vec![title.message(env)];
        ops.extend(title.extra(env));
        for op in ops {
            self = self.register(op);
        }
        self
    }

    /// Register an overlay handler under the opcode its name maps to.
    pub fn register(mut self, op: Arc<dyn Operation>) -> Self {
        match self.table.opcode(op.name()) {
            Some(id) => {
                self.overlay.insert(id, op);
            }
            None => log::debug!("handler {} has no opcode in this title", op.name()),
        }
        self
    }

    /// Register an overlay handler for an explicit opcode id.
    pub fn register_opcode(mut self, opcode: u8, op: Arc<dyn Operation>) -> Self {
        self.overlay.insert(opcode, op);
        self
    }

    pub fn build(self) -> OperatorSet {
        let mut ops = self.base;
        for (id, op) in self.overlay {
            if let Some(prev) = ops.insert(id, op) {
                log::debug!("opcode 0x{id:02X}: {} shadowed by title handler", prev.name());
            }
        }
        OperatorSet {
            table: self.table,
            ops,
        }
    }
}
