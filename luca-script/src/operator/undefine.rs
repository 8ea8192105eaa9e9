use async_trait::async_trait;
use itertools::Itertools;

use crate::code::CodeLine;
use crate::context::ExecutionContext;
use crate::error::Result;
use crate::hook::EngineHook;
use crate::param::{all_to_uint16, Param};

use super::{Step, Transfer};

/// Best-effort rendering for an opcode without a handler:
/// `<name or hex> (<u16>, ...[, 0x<trailing byte>])`. Never fails.
pub fn undefine(code: &CodeLine, opname: Option<&str>) -> String {
    let (words, trailing) = all_to_uint16(&code.bytes);
    let head = match opname {
        Some(name) => name.to_owned(),
        None => format!("{:X}", code.opcode),
    };
    let args = words
        .iter()
        .map(|w| w.to_string())
        .chain(trailing.map(|b| format!("0x{b:X}")))
        .join(", ");
    format!("{head} ({args})")
}

/// Executes an instruction nobody decodes: the hook sees the raw u16 words
/// and the thread falls through.
#[derive(Debug, Clone)]
pub struct UndefinedStep {
    name: String,
    params: Vec<Param>,
    text: String,
}

impl UndefinedStep {
    pub fn new(code: &CodeLine, opname: Option<&str>) -> Self {
        let (words, _) = all_to_uint16(&code.bytes);
        Self {
            name: opname
                .map(str::to_owned)
                .unwrap_or_else(|| format!("{:X}", code.opcode)),
            params: words.into_iter().map(Param::Uint16).collect(),
            text: undefine(code, opname),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Step for UndefinedStep {
    async fn invoke(&self, ctx: &mut ExecutionContext, hook: &dyn EngineHook) -> Result<Transfer> {
        log::warn!("thread {} @ {}: undefined {}", ctx.id, ctx.pos(), self.text);
        hook.call(&self.name, &self.params).await?;
        Ok(Transfer::Next)
    }
}
