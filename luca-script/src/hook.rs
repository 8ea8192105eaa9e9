use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::context::VariableStore;
use crate::param::Param;

/// The engine side of script execution.
///
/// Every executed instruction calls [`EngineHook::call`] exactly once with
/// its opcode name and decoded parameters. The call may await for as long as
/// the engine needs (a text box waiting for input, an animation finishing);
/// the script thread does not advance until it returns.
#[async_trait]
pub trait EngineHook: Send + Sync {
    async fn call(&self, name: &str, params: &[Param]) -> Result<()>;

    /// Evaluate a condition or arithmetic expression embedded in a script.
    /// Conditions treat any non-zero result as true.
    fn evaluate(&self, expr: &str, vars: &VariableStore) -> Result<i32>;
}

type HookFn = Box<dyn Fn(&[Param]) -> Result<()> + Send + Sync>;
type EvalFn = Box<dyn Fn(&str, &VariableStore) -> Result<i32> + Send + Sync>;

/// A simple in-crate hook (useful for tests and tooling).
///
/// Calls to names without a registered function are accepted and ignored.
#[derive(Default)]
pub struct HookRegistry {
    fns: HashMap<String, HookFn>,
    eval: Option<EvalFn>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&[Param]) -> Result<()> + Send + Sync + 'static,
    {
        self.fns.insert(name.into(), Box::new(f));
    }

    pub fn with_evaluator<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &VariableStore) -> Result<i32> + Send + Sync + 'static,
    {
        self.eval = Some(Box::new(f));
        self
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.fns.contains_key(name)
    }
}

#[async_trait]
impl EngineHook for HookRegistry {
    async fn call(&self, name: &str, params: &[Param]) -> Result<()> {
        match self.fns.get(name) {
            Some(f) => f(params),
            None => {
                log::debug!("hook {name}: no handler for {} param(s)", params.len());
                Ok(())
            }
        }
    }

    fn evaluate(&self, expr: &str, vars: &VariableStore) -> Result<i32> {
        match &self.eval {
            Some(f) => f(expr, vars),
            None => bail!("no expression evaluator registered for {expr:?}"),
        }
    }
}
