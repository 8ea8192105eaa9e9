//! Title-specific handlers layered over the baseline table.

use std::sync::Arc;

use async_trait::async_trait;
use itertools::Itertools;

use crate::code::CodeLine;
use crate::context::ExecutionContext;
use crate::disasm::LabelMap;
use crate::error::Result;
use crate::hook::EngineHook;
use crate::param::{all_to_uint16, get_param, LUint16, Param};

use super::{LucaOperate, Operation, Step, Transfer};

/// What a game title customizes. MESSAGE differs between every title; any
/// further handlers come from [`Operater::extra`].
pub trait Operater: Send + Sync {
    fn message(&self, env: &LucaOperate) -> Arc<dyn Operation>;

    fn extra(&self, _env: &LucaOperate) -> Vec<Arc<dyn Operation>> {
        Vec::new()
    }
}

/// A title whose MESSAGE carries a voice id followed by one string per language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageTitle {
    pub languages: usize,
}

impl Default for MessageTitle {
    fn default() -> Self {
        Self { languages: 1 }
    }
}

impl Operater for MessageTitle {
    fn message(&self, env: &LucaOperate) -> Arc<dyn Operation> {
        Arc::new(Message {
            env: env.clone(),
            languages: self.languages,
        })
    }
}

pub struct Message {
    env: LucaOperate,
    languages: usize,
}

impl Message {
    fn decode(&self, code: &CodeLine) -> Result<MessageStep> {
        let mut voice = LUint16::default();
        let mut next = get_param(&code.bytes, &mut voice, 0)?;
        let mut texts = Vec::with_capacity(self.languages);
        for _ in 0..self.languages {
            let mut text = self.env.text();
            next = get_param(&code.bytes, &mut text, next)?;
            texts.push(text.data);
        }
        let (rest, trailing) = all_to_uint16(&code.bytes[next..]);
        Ok(MessageStep {
            voice: voice.data,
            texts,
            rest,
            trailing,
        })
    }
}

impl Operation for Message {
    fn name(&self) -> &str {
        "MESSAGE"
    }

    fn disassemble(&self, code: &CodeLine, _labels: &mut LabelMap) -> Result<String> {
        let msg = self.decode(code)?;
        let args = std::iter::once(msg.voice.to_string())
            .chain(msg.texts.iter().map(|t| format!("{t:?}")))
            .chain(msg.rest.iter().map(|w| w.to_string()))
            .chain(msg.trailing.map(|b| format!("0x{b:X}")))
            .join(", ");
        Ok(format!("{}:message ({args})", code.pos))
    }

    fn build(&self, code: &CodeLine) -> Result<Arc<dyn Step>> {
        Ok(Arc::new(self.decode(code)?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageStep {
    pub voice: u16,
    pub texts: Vec<String>,
    pub rest: Vec<u16>,
    /// Odd last payload byte.
    pub trailing: Option<u8>,
}

#[async_trait]
impl Step for MessageStep {
    async fn invoke(&self, _ctx: &mut ExecutionContext, hook: &dyn EngineHook) -> Result<Transfer> {
        let params: Vec<Param> = std::iter::once(Param::Uint16(self.voice))
            .chain(self.texts.iter().cloned().map(Param::Str))
            .collect();
        hook.call("MESSAGE", &params).await?;
        Ok(Transfer::Next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::HookRegistry;
    use luca_nls::Encoding;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    fn env() -> LucaOperate {
        LucaOperate::new(Encoding::ShiftJis.charset(), Encoding::Utf16Le.charset())
    }

    fn utf16z(s: &str) -> Vec<u8> {
        s.encode_utf16()
            .chain([0])
            .flat_map(|u| u.to_le_bytes())
            .collect()
    }

    fn payload(voice: u16, texts: &[&str], rest: &[u8]) -> Vec<u8> {
        let mut out = voice.to_le_bytes().to_vec();
        for t in texts {
            out.extend(utf16z(t));
        }
        out.extend_from_slice(rest);
        out
    }

    #[test]
    fn renders_every_language_and_tail() {
        let op = MessageTitle { languages: 2 }.message(&env());
        let code = CodeLine::new(12, 0, 0, payload(3, &["こんにちは", "Hello"], &[0x09, 0x00]));
        let mut labels = LabelMap::new();
        assert_eq!(
            op.disassemble(&code, &mut labels).unwrap(),
            "12:message (3, \"こんにちは\", \"Hello\", 9)"
        );
    }

    #[test]
    fn odd_tail_keeps_its_last_byte() {
        let op = MessageTitle::default().message(&env());
        let code = CodeLine::new(0, 0, 0, payload(3, &["H"], &[0x09, 0x00, 0xAB]));
        let mut labels = LabelMap::new();
        assert_eq!(
            op.disassemble(&code, &mut labels).unwrap(),
            "0:message (3, \"H\", 9, 0xAB)"
        );
    }

    #[test]
    fn executes_with_voice_and_texts() {
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let mut hook = HookRegistry::new();
        hook.register("MESSAGE", move |p| {
            s.lock().push(p.to_vec());
            Ok(())
        });

        let op = MessageTitle::default().message(&env());
        let step = op
            .build(&CodeLine::new(0, 0, 0, payload(0xFFFF, &["…"], &[])))
            .unwrap();
        let mut ctx = ExecutionContext::new(1);
        let next = futures::executor::block_on(step.invoke(&mut ctx, &hook)).unwrap();
        assert_eq!(next, Transfer::Next);
        assert_eq!(
            *seen.lock(),
            vec![vec![Param::Uint16(0xFFFF), Param::Str("…".into())]]
        );
    }

    #[test]
    fn missing_language_is_truncation() {
        let op = MessageTitle { languages: 2 }.message(&env());
        let code = CodeLine::new(0, 0, 0, payload(1, &["only"], &[]));
        assert!(op.build(&code).is_err());
    }
}
