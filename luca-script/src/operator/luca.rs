//! Baseline handlers shared by every LucaSystem title.

use std::sync::Arc;

use async_trait::async_trait;
use luca_nls::Charset;
use strum::IntoEnumIterator;

use crate::code::CodeLine;
use crate::context::{register_name, ExecutionContext};
use crate::disasm::LabelMap;
use crate::error::Result;
use crate::hook::EngineHook;
use crate::param::{get_param, LString, LUint16, LUint32, Param};

use super::{Operation, Step, Transfer};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Baseline {
    Equ,
    Add,
    Ifn,
    Ify,
    Goto,
    Jump,
    Farcall,
    Farreturn,
    End,
}

/// The baseline operator table.
///
/// Expressions and script names decode with `expr_charset`; dialogue text
/// belongs to title handlers and uses `text_charset`.
#[derive(Debug, Clone)]
pub struct LucaOperate {
    pub expr_charset: Arc<dyn Charset>,
    pub text_charset: Arc<dyn Charset>,
}

impl LucaOperate {
    pub fn new(expr_charset: Arc<dyn Charset>, text_charset: Arc<dyn Charset>) -> Self {
        Self {
            expr_charset,
            text_charset,
        }
    }

    pub fn op(&self, kind: Baseline) -> Arc<dyn Operation> {
        Arc::new(LucaOp {
            kind,
            env: self.clone(),
        })
    }

    pub fn operations(&self) -> impl Iterator<Item = (&'static str, Arc<dyn Operation>)> + '_ {
        Baseline::iter().map(move |kind| (kind.into(), self.op(kind)))
    }

    pub fn expr(&self) -> LString {
        LString::new(self.expr_charset.clone())
    }

    pub fn text(&self) -> LString {
        LString::new(self.text_charset.clone())
    }
}

/// A decoded baseline instruction.
trait Decoded: Step + Sized + 'static {
    fn decode(env: &LucaOperate, code: &CodeLine) -> Result<Self>;

    fn render(&self, pos: u32, labels: &mut LabelMap) -> String;
}

struct LucaOp {
    kind: Baseline,
    env: LucaOperate,
}

impl LucaOp {
    fn render<T: Decoded>(&self, code: &CodeLine, labels: &mut LabelMap) -> Result<String> {
        Ok(T::decode(&self.env, code)?.render(code.pos, labels))
    }

    fn step<T: Decoded>(&self, code: &CodeLine) -> Result<Arc<dyn Step>> {
        Ok(Arc::new(T::decode(&self.env, code)?))
    }
}

impl Operation for LucaOp {
    fn name(&self) -> &str {
        let name: &'static str = self.kind.into();
        name
    }

    fn disassemble(&self, code: &CodeLine, labels: &mut LabelMap) -> Result<String> {
        match self.kind {
            Baseline::Equ => self.render::<EquStep>(code, labels),
            Baseline::Add => self.render::<AddStep>(code, labels),
            Baseline::Ifn => self.render::<IfnStep>(code, labels),
            Baseline::Ify => self.render::<IfyStep>(code, labels),
            Baseline::Goto => self.render::<GotoStep>(code, labels),
            Baseline::Jump => self.render::<JumpStep>(code, labels),
            Baseline::Farcall => self.render::<FarCallStep>(code, labels),
            Baseline::Farreturn => self.render::<FarReturnStep>(code, labels),
            Baseline::End => self.render::<EndStep>(code, labels),
        }
    }

    fn build(&self, code: &CodeLine) -> Result<Arc<dyn Step>> {
        match self.kind {
            Baseline::Equ => self.step::<EquStep>(code),
            Baseline::Add => self.step::<AddStep>(code),
            Baseline::Ifn => self.step::<IfnStep>(code),
            Baseline::Ify => self.step::<IfyStep>(code),
            Baseline::Goto => self.step::<GotoStep>(code),
            Baseline::Jump => self.step::<JumpStep>(code),
            Baseline::Farcall => self.step::<FarCallStep>(code),
            Baseline::Farreturn => self.step::<FarReturnStep>(code),
            Baseline::End => self.step::<EndStep>(code),
        }
    }
}

/// `#key = value`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EquStep {
    pub key: u16,
    pub value: u16,
}

impl Decoded for EquStep {
    fn decode(_env: &LucaOperate, code: &CodeLine) -> Result<Self> {
        let mut key = LUint16::default();
        let mut value = LUint16::default();
        let next = get_param(&code.bytes, &mut key, 0)?;
        get_param(&code.bytes, &mut value, next)?;
        Ok(Self {
            key: key.data,
            value: value.data,
        })
    }

    fn render(&self, pos: u32, _labels: &mut LabelMap) -> String {
        format!("{pos}:equ (#{}, {})", self.key, self.value)
    }
}

#[async_trait]
impl Step for EquStep {
    async fn invoke(&self, ctx: &mut ExecutionContext, hook: &dyn EngineHook) -> Result<Transfer> {
        ctx.variable.set(register_name(self.key), self.value as i32);
        hook.call("EQU", &[Param::Uint16(self.key), Param::Uint16(self.value)])
            .await?;
        Ok(Transfer::Next)
    }
}

/// `#key += expr`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddStep {
    pub key: u16,
    pub expr: String,
}

impl Decoded for AddStep {
    fn decode(env: &LucaOperate, code: &CodeLine) -> Result<Self> {
        let mut key = LUint16::default();
        let mut expr = env.expr();
        let next = get_param(&code.bytes, &mut key, 0)?;
        get_param(&code.bytes, &mut expr, next)?;
        Ok(Self {
            key: key.data,
            expr: expr.data,
        })
    }

    fn render(&self, pos: u32, _labels: &mut LabelMap) -> String {
        format!("{pos}:add (#{}, {})", self.key, self.expr)
    }
}

#[async_trait]
impl Step for AddStep {
    async fn invoke(&self, ctx: &mut ExecutionContext, hook: &dyn EngineHook) -> Result<Transfer> {
        let delta = hook.evaluate(&self.expr, &ctx.variable)?;
        ctx.variable.add(register_name(self.key), delta);
        hook.call("ADD", &[Param::Uint16(self.key), Param::Str(self.expr.clone())])
            .await?;
        Ok(Transfer::Next)
    }
}

/// Conditional branch. IFN branches when the condition is false, IFY when it is true.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfStep<const BRANCH_WHEN: bool> {
    pub expr: String,
    pub jump: u32,
}

pub type IfnStep = IfStep<false>;
pub type IfyStep = IfStep<true>;

impl<const BRANCH_WHEN: bool> IfStep<BRANCH_WHEN> {
    fn name() -> &'static str {
        if BRANCH_WHEN {
            "IFY"
        } else {
            "IFN"
        }
    }
}

impl<const BRANCH_WHEN: bool> Decoded for IfStep<BRANCH_WHEN> {
    fn decode(env: &LucaOperate, code: &CodeLine) -> Result<Self> {
        let mut expr = env.expr();
        let mut jump = LUint32::default();
        let next = get_param(&code.bytes, &mut expr, 0)?;
        get_param(&code.bytes, &mut jump, next)?;
        Ok(Self {
            expr: expr.data,
            jump: jump.data,
        })
    }

    fn render(&self, pos: u32, labels: &mut LabelMap) -> String {
        let label = labels.label(self.jump);
        format!(
            "{pos}:{} ({}, label_{label})",
            Self::name().to_lowercase(),
            self.expr
        )
    }
}

#[async_trait]
impl<const BRANCH_WHEN: bool> Step for IfStep<BRANCH_WHEN> {
    async fn invoke(&self, ctx: &mut ExecutionContext, hook: &dyn EngineHook) -> Result<Transfer> {
        let cond = hook.evaluate(&self.expr, &ctx.variable)? != 0;
        hook.call(
            Self::name(),
            &[Param::Str(self.expr.clone()), Param::Uint32(self.jump)],
        )
        .await?;
        if cond == BRANCH_WHEN {
            Ok(Transfer::Goto(self.jump))
        } else {
            Ok(Transfer::Next)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GotoStep {
    pub jump: u32,
}

impl Decoded for GotoStep {
    fn decode(_env: &LucaOperate, code: &CodeLine) -> Result<Self> {
        let mut jump = LUint32::default();
        get_param(&code.bytes, &mut jump, 0)?;
        Ok(Self { jump: jump.data })
    }

    fn render(&self, pos: u32, labels: &mut LabelMap) -> String {
        format!("{pos}:goto (label_{})", labels.label(self.jump))
    }
}

#[async_trait]
impl Step for GotoStep {
    async fn invoke(&self, _ctx: &mut ExecutionContext, hook: &dyn EngineHook) -> Result<Transfer> {
        hook.call("GOTO", &[Param::Uint32(self.jump)]).await?;
        Ok(Transfer::Goto(self.jump))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JumpStep {
    pub file: String,
    pub jump: u32,
}

impl Decoded for JumpStep {
    fn decode(env: &LucaOperate, code: &CodeLine) -> Result<Self> {
        let mut file = env.expr();
        let mut jump = LUint32::default();
        let next = get_param(&code.bytes, &mut file, 0)?;
        get_param(&code.bytes, &mut jump, next)?;
        Ok(Self {
            file: file.data,
            jump: jump.data,
        })
    }

    fn render(&self, pos: u32, _labels: &mut LabelMap) -> String {
        format!("{pos}:jump ({}, {})", self.file, self.jump)
    }
}

#[async_trait]
impl Step for JumpStep {
    async fn invoke(&self, _ctx: &mut ExecutionContext, hook: &dyn EngineHook) -> Result<Transfer> {
        hook.call("JUMP", &[Param::Str(self.file.clone()), Param::Uint32(self.jump)])
            .await?;
        Ok(Transfer::Jump {
            script: self.file.clone(),
            pos: self.jump,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FarCallStep {
    pub index: u16,
    pub file: String,
    pub jump: u32,
}

impl Decoded for FarCallStep {
    fn decode(env: &LucaOperate, code: &CodeLine) -> Result<Self> {
        let mut index = LUint16::default();
        let mut file = env.expr();
        let mut jump = LUint32::default();
        let next = get_param(&code.bytes, &mut index, 0)?;
        let next = get_param(&code.bytes, &mut file, next)?;
        get_param(&code.bytes, &mut jump, next)?;
        Ok(Self {
            index: index.data,
            file: file.data,
            jump: jump.data,
        })
    }

    fn render(&self, pos: u32, _labels: &mut LabelMap) -> String {
        format!("{pos}:farcall ({}, {}, {})", self.index, self.file, self.jump)
    }
}

#[async_trait]
impl Step for FarCallStep {
    async fn invoke(&self, _ctx: &mut ExecutionContext, hook: &dyn EngineHook) -> Result<Transfer> {
        hook.call(
            "FARCALL",
            &[
                Param::Uint16(self.index),
                Param::Str(self.file.clone()),
                Param::Uint32(self.jump),
            ],
        )
        .await?;
        Ok(Transfer::Call {
            index: self.index,
            script: self.file.clone(),
            pos: self.jump,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FarReturnStep;

impl Decoded for FarReturnStep {
    fn decode(_env: &LucaOperate, _code: &CodeLine) -> Result<Self> {
        Ok(Self)
    }

    fn render(&self, pos: u32, _labels: &mut LabelMap) -> String {
        format!("{pos}:farreturn ()")
    }
}

#[async_trait]
impl Step for FarReturnStep {
    async fn invoke(&self, _ctx: &mut ExecutionContext, hook: &dyn EngineHook) -> Result<Transfer> {
        hook.call("FARRETURN", &[]).await?;
        Ok(Transfer::Return)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndStep;

impl Decoded for EndStep {
    fn decode(_env: &LucaOperate, _code: &CodeLine) -> Result<Self> {
        Ok(Self)
    }

    fn render(&self, pos: u32, _labels: &mut LabelMap) -> String {
        format!("{pos}:end ()")
    }
}

#[async_trait]
impl Step for EndStep {
    async fn invoke(&self, _ctx: &mut ExecutionContext, hook: &dyn EngineHook) -> Result<Transfer> {
        hook.call("END", &[]).await?;
        Ok(Transfer::Exit)
    }
}
