//! luca-script
//!
//! Decoding, disassembly and execution of LucaSystem script bytecode.
//!
//! A [`code::Script`] is split into [`code::CodeLine`]s; an
//! [`operator::OperatorSet`] turns each line either into a listing line
//! ([`disasm::Disassembler`]) or into a reusable [`operator::Step`] that the
//! [`scheduler::Scheduler`] invokes against a per-thread
//! [`context::ExecutionContext`].

pub mod code;
pub mod config;
pub mod context;
pub mod disasm;
pub mod error;
pub mod hook;
pub mod operator;
pub mod param;
pub mod scheduler;

pub use code::{CodeLine, Script, ScriptBuilder};
pub use config::{CharsetSpec, TitleConfig, TitleConfigBuilder};
pub use context::{ExecutionContext, VariableStore};
pub use disasm::{Disassembler, LabelMap, Listing};
pub use error::{Result, ScriptError};
pub use hook::{EngineHook, HookRegistry};
pub use operator::{OpcodeTable, Operation, OperatorSet, Step, Transfer};
pub use param::{get_param, LString, LUint16, LUint32, Param, Paramter};
pub use scheduler::{
    AbortHandle, DirScriptIo, MemoryScriptIo, Scheduler, ScriptIo, ThreadExit, ThreadHandle,
    ThreadOutcome,
};
