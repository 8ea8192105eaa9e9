//! Script threads.
//!
//! Every running script is a task on a [`luca_tasks`] executor with its own
//! [`ExecutionContext`]. Scripts are loaded through a [`ScriptIo`] once and
//! shared; each instruction's step is built the first time any thread
//! reaches it and reused afterwards.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::{bail, Context as _};
use async_trait::async_trait;
use bytes::Bytes;
use luca_tasks::{yield_now, Handle, JoinHandle};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};

use crate::code::Script;
use crate::context::ExecutionContext;
use crate::error::{Result, ScriptError};
use crate::hook::EngineHook;
use crate::operator::{OperatorSet, Step, Transfer};

/// Supplies raw script bytes by logical name.
#[async_trait]
pub trait ScriptIo: Send + Sync {
    /// `Ok(None)` when no script has that name.
    async fn read_script(&self, name: &str) -> anyhow::Result<Option<Bytes>>;
}

#[derive(Debug, Default)]
pub struct MemoryScriptIo {
    scripts: RwLock<HashMap<String, Bytes>>,
}

impl MemoryScriptIo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, bytes: impl Into<Bytes>) {
        self.scripts.write().insert(name.into(), bytes.into());
    }
}

#[async_trait]
impl ScriptIo for MemoryScriptIo {
    async fn read_script(&self, name: &str) -> anyhow::Result<Option<Bytes>> {
        Ok(self.scripts.read().get(name).cloned())
    }
}

/// Scripts stored as one file per name under a directory.
#[derive(Debug)]
pub struct DirScriptIo {
    root_path: PathBuf,
}

impl DirScriptIo {
    pub fn new(root_path: impl Into<PathBuf>) -> Self {
        Self {
            root_path: root_path.into(),
        }
    }
}

#[async_trait]
impl ScriptIo for DirScriptIo {
    async fn read_script(&self, name: &str) -> anyhow::Result<Option<Bytes>> {
        let relative = Path::new(name.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            bail!("script name {:?} escapes root_path {:?}", name, self.root_path);
        }
        let full_path = self.root_path.join(relative);
        match std::fs::read(&full_path) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| {
                format!("Reading script {:?} (root_path = {:?})", name, self.root_path)
            }),
        }
    }
}

struct Compiled {
    script: Arc<Script>,
    steps: Vec<OnceCell<Arc<dyn Step>>>,
}

impl Compiled {
    fn new(script: Script) -> Self {
        let steps = (0..script.len()).map(|_| OnceCell::new()).collect();
        Self {
            script: Arc::new(script),
            steps,
        }
    }

    fn step(&self, ops: &OperatorSet, index: usize) -> Result<Arc<dyn Step>> {
        let code = &self.script.codes()[index];
        self.steps[index]
            .get_or_try_init(|| ops.build(code))
            .cloned()
    }

    fn resolve(&self, pos: u32) -> Result<usize> {
        self.script.resolve(pos)
    }
}

/// A FARCALL return point.
struct Frame {
    index: u16,
    caller: Arc<Compiled>,
    resume: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadExit {
    /// Ran off the end of its entry script or executed END outside a call.
    Finished,
    Aborted,
}

#[derive(Debug)]
pub struct ThreadOutcome {
    pub exit: ThreadExit,
    pub context: ExecutionContext,
    /// Number of steps invoked.
    pub executed: usize,
}

pub struct Scheduler {
    io: Arc<dyn ScriptIo>,
    ops: Arc<OperatorSet>,
    hook: Arc<dyn EngineHook>,
    scripts: Mutex<HashMap<String, Arc<Compiled>>>,
    next_id: AtomicU32,
    max_call_depth: usize,
}

/// FARCALL frames a thread may hold before it fails.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 256;

impl Scheduler {
    pub fn new(io: Arc<dyn ScriptIo>, ops: Arc<OperatorSet>, hook: Arc<dyn EngineHook>) -> Self {
        Self {
            io,
            ops,
            hook,
            scripts: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }

    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    pub fn operators(&self) -> &OperatorSet {
        &self.ops
    }

    /// Load (or fetch the cached) script called `name`.
    pub async fn script(&self, name: &str) -> Result<Arc<Script>> {
        Ok(self.compiled(name).await?.script.clone())
    }

    async fn compiled(&self, name: &str) -> Result<Arc<Compiled>> {
        if let Some(c) = self.scripts.lock().get(name) {
            return Ok(c.clone());
        }

        let bytes = self
            .io
            .read_script(name)
            .await?
            .ok_or_else(|| ScriptError::InvalidScriptReference {
                script: name.to_owned(),
                pos: 0,
            })?;
        let compiled = Arc::new(Compiled::new(Script::parse(name, bytes)?));

        // another thread may have loaded it meanwhile; keep the first
        let mut scripts = self.scripts.lock();
        Ok(scripts.entry(name.to_owned()).or_insert(compiled).clone())
    }

    /// Start a script thread at `pos` in `script`.
    pub fn spawn(self: &Arc<Self>, handle: &Handle, script: &str, pos: u32) -> ThreadHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let abort = Arc::new(AtomicBool::new(false));

        let this = self.clone();
        let script = script.to_owned();
        let flag = abort.clone();
        let join = handle.spawn(async move { this.execute(id, &script, pos, &flag).await });

        ThreadHandle { id, abort, join }
    }

    /// Run a script thread to completion on the current task.
    pub async fn run(&self, script: &str, pos: u32) -> Result<ThreadOutcome> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.execute(id, script, pos, &AtomicBool::new(false)).await
    }

    async fn execute(
        &self,
        id: u32,
        script: &str,
        pos: u32,
        abort: &AtomicBool,
    ) -> Result<ThreadOutcome> {
        let mut current = self.compiled(script).await?;
        let mut eip = current.resolve(pos)?;
        let mut frames: Vec<Frame> = Vec::new();
        let mut ctx = ExecutionContext::new(id);
        let mut executed = 0usize;
        log::debug!("thread {id}: start {script} @ {pos}");

        let exit = loop {
            if abort.load(Ordering::Acquire) {
                break ThreadExit::Aborted;
            }

            ctx.script = Some(current.script.clone());
            ctx.eip = eip;
            let code = match current.script.get(eip) {
                Some(code) => code.clone(),
                None => match frames.pop() {
                    Some(frame) => {
                        log::debug!(
                            "thread {id}: {} ended, return {}",
                            current.script.name(),
                            frame.index
                        );
                        current = frame.caller;
                        eip = frame.resume;
                        continue;
                    }
                    None => break ThreadExit::Finished,
                },
            };
            ctx.code = Some(code.clone());

            let step = current.step(&self.ops, eip)?;
            let transfer = step
                .invoke(&mut ctx, self.hook.as_ref())
                .await
                .map_err(|e| e.at(code.pos, self.ops.display_name(code.opcode)))?;
            executed += 1;

            match transfer {
                Transfer::Next => eip += 1,
                Transfer::Goto(pos) => eip = current.resolve(pos)?,
                Transfer::Jump { script, pos } => {
                    let target = self.compiled(&script).await?;
                    eip = target.resolve(pos)?;
                    current = target;
                }
                Transfer::Call { index, script, pos } => {
                    if frames.len() >= self.max_call_depth {
                        let err = ScriptError::CallDepth {
                            limit: self.max_call_depth,
                        };
                        return Err(err.at(code.pos, self.ops.display_name(code.opcode)));
                    }
                    let callee = self.compiled(&script).await?;
                    let entry = callee.resolve(pos)?;
                    log::debug!("thread {id}: call {index} -> {script} @ {pos}");
                    frames.push(Frame {
                        index,
                        caller: std::mem::replace(&mut current, callee),
                        resume: eip + 1,
                    });
                    eip = entry;
                }
                t @ (Transfer::Return | Transfer::Exit) => match frames.pop() {
                    Some(frame) => {
                        log::debug!("thread {id}: return {}", frame.index);
                        current = frame.caller;
                        eip = frame.resume;
                    }
                    None => {
                        if t == Transfer::Return {
                            log::warn!("thread {id}: return outside a call at {}", code.pos);
                        }
                        break ThreadExit::Finished;
                    }
                },
            }

            yield_now().await;
        };

        log::debug!("thread {id}: {exit:?} after {executed} step(s)");
        Ok(ThreadOutcome {
            exit,
            context: ctx,
            executed,
        })
    }
}

/// A running script thread. Awaiting it yields the thread's outcome.
pub struct ThreadHandle {
    id: u32,
    abort: Arc<AtomicBool>,
    join: JoinHandle<Result<ThreadOutcome>>,
}

impl ThreadHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Ask the thread to stop before its next instruction.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            flag: self.abort.clone(),
        }
    }

    /// The outcome, if the thread has already stopped.
    pub fn try_join(&mut self) -> Option<Result<ThreadOutcome>> {
        let id = self.id;
        self.join
            .try_take()
            .map(|out| out.unwrap_or(Err(ScriptError::Cancelled(id))))
    }
}

/// Aborts a thread from anywhere, e.g. from inside an engine hook.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

impl Future for ThreadHandle {
    type Output = Result<ThreadOutcome>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let id = this.id;
        Pin::new(&mut this.join)
            .poll(cx)
            .map(|out| out.unwrap_or(Err(ScriptError::Cancelled(id))))
    }
}
