use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use luca_script::operator::{Operation, Step, Transfer};
use luca_script::scheduler::AbortHandle;
use luca_script::{
    CodeLine, EngineHook, ExecutionContext, LabelMap, MemoryScriptIo, OperatorSet, Param,
    Scheduler, ScriptBuilder, ScriptError, ThreadExit, TitleConfig, VariableStore,
};
use luca_tasks::Executor;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

// opcode ids of the default title table
const EQU: u8 = 0;
const ADD: u8 = 1;
const IFN: u8 = 2;
const IFY: u8 = 3;
const GOTO: u8 = 4;
const JUMP: u8 = 5;
const FARCALL: u8 = 6;
const FARRETURN: u8 = 7;
const END: u8 = 8;

/// Records every hook call. Understands `N`, `#k` and `#k==N` expressions.
#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<(String, Vec<Param>)>>,
    abort_after_gotos: Mutex<Option<(usize, AbortHandle)>>,
}

impl Recorder {
    fn names(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(n, _)| n.clone()).collect()
    }
}

#[async_trait]
impl EngineHook for Recorder {
    async fn call(&self, name: &str, params: &[Param]) -> Result<()> {
        self.calls.lock().push((name.to_owned(), params.to_vec()));
        if name == "GOTO" {
            if let Some((left, abort)) = self.abort_after_gotos.lock().as_mut() {
                *left -= 1;
                if *left == 0 {
                    abort.abort();
                }
            }
        }
        Ok(())
    }

    fn evaluate(&self, expr: &str, vars: &VariableStore) -> Result<i32> {
        let term = |t: &str| -> Result<i32> {
            if t.starts_with('#') {
                Ok(vars.get(t))
            } else {
                t.parse().map_err(|_| anyhow!("bad term {t:?}"))
            }
        };
        match expr.split_once("==") {
            Some((l, r)) => Ok((term(l)? == term(r)?) as i32),
            None => term(expr),
        }
    }
}

fn u16le(v: u16) -> [u8; 2] {
    v.to_le_bytes()
}

fn u32le(v: u32) -> [u8; 4] {
    v.to_le_bytes()
}

fn equ(key: u16, value: u16) -> Vec<u8> {
    [u16le(key), u16le(value)].concat()
}

fn cstr(s: &str) -> Vec<u8> {
    let mut out = s.as_bytes().to_vec();
    out.push(0);
    out
}

fn with_pos(s: &str, pos: u32) -> Vec<u8> {
    [cstr(s), u32le(pos).to_vec()].concat()
}

fn farcall(index: u16, file: &str, pos: u32) -> Vec<u8> {
    [u16le(index).to_vec(), with_pos(file, pos)].concat()
}

fn scheduler(
    scripts: &[(&str, ScriptBuilder)],
    ops: OperatorSet,
) -> (Arc<Scheduler>, Arc<Recorder>) {
    let io = MemoryScriptIo::new();
    for (name, builder) in scripts {
        io.insert(*name, builder.to_bytes());
    }
    let hook = Arc::new(Recorder::default());
    let sched = Scheduler::new(Arc::new(io), Arc::new(ops), hook.clone());
    (Arc::new(sched), hook)
}

fn default_ops() -> OperatorSet {
    TitleConfig::default().operator_set().unwrap()
}

#[test]
fn counting_loop() {
    let mut main = ScriptBuilder::new();
    assert_eq!(main.push(EQU, &equ(1, 0)), 0);
    let top = main.push(ADD, &[u16le(1).to_vec(), cstr("1")].concat());
    assert_eq!(top, 8);
    assert_eq!(main.push(IFY, &with_pos("#1==3", 38)), 16);
    assert_eq!(main.push(GOTO, &u32le(top)), 30);
    assert_eq!(main.push(END, &[]), 38);

    let (sched, hook) = scheduler(&[("main", main)], default_ops());
    let out = futures::executor::block_on(sched.run("main", 0)).unwrap();

    assert_eq!(out.exit, ThreadExit::Finished);
    assert_eq!(out.context.variable.get("#1"), 3);
    assert_eq!(out.executed, 10);
    assert_eq!(out.context.pos(), 38);
    assert_eq!(hook.names().last().map(String::as_str), Some("END"));
}

#[test]
fn ifn_falls_through_when_true() {
    let mut main = ScriptBuilder::new();
    main.push(EQU, &equ(4, 1));
    main.push(IFN, &with_pos("#4", 0));
    main.push(EQU, &equ(5, 9));

    let (sched, _) = scheduler(&[("main", main)], default_ops());
    let out = futures::executor::block_on(sched.run("main", 0)).unwrap();
    assert_eq!(out.context.variable.get("#5"), 9);
    assert_eq!(out.executed, 3);
}

#[test]
fn farcall_returns_after_the_call_site() {
    let mut main = ScriptBuilder::new();
    main.push(FARCALL, &farcall(7, "sub", 0));
    main.push(EQU, &equ(2, 1));
    main.push(END, &[]);
    main.push(EQU, &equ(2, 99));

    let mut sub = ScriptBuilder::new();
    sub.push(EQU, &equ(3, 5));
    sub.push(FARRETURN, &[]);

    let (sched, hook) = scheduler(&[("main", main), ("sub", sub)], default_ops());
    let out = futures::executor::block_on(sched.run("main", 0)).unwrap();

    assert_eq!(out.context.variable.get("#3"), 5);
    assert_eq!(out.context.variable.get("#2"), 1);
    assert_eq!(hook.names(), ["FARCALL", "EQU", "FARRETURN", "EQU", "END"]);
    assert_eq!(
        hook.calls.lock()[0].1,
        vec![Param::Uint16(7), Param::Str("sub".into()), Param::Uint32(0)]
    );
}

#[test]
fn callee_running_off_its_end_returns() {
    let mut main = ScriptBuilder::new();
    main.push(FARCALL, &farcall(1, "sub", 0));
    main.push(EQU, &equ(2, 1));

    let mut sub = ScriptBuilder::new();
    sub.push(EQU, &equ(3, 5));

    let (sched, _) = scheduler(&[("main", main), ("sub", sub)], default_ops());
    let out = futures::executor::block_on(sched.run("main", 0)).unwrap();
    assert_eq!(out.exit, ThreadExit::Finished);
    assert_eq!(out.context.variable.get("#2"), 1);
    assert_eq!(out.context.script_name(), Some("main"));
}

#[test]
fn jump_switches_scripts() {
    let mut main = ScriptBuilder::new();
    main.push(JUMP, &with_pos("other", 8));
    main.push(EQU, &equ(1, 1));

    let mut other = ScriptBuilder::new();
    other.push(EQU, &equ(2, 2));
    other.push(EQU, &equ(3, 3));

    let (sched, _) = scheduler(&[("main", main), ("other", other)], default_ops());
    let out = futures::executor::block_on(sched.run("main", 0)).unwrap();
    let vars = &out.context.variable;
    assert_eq!((vars.get("#1"), vars.get("#2"), vars.get("#3")), (0, 0, 3));
    assert_eq!(out.context.script_name(), Some("other"));
}

#[test]
fn invalid_references() {
    let mut main = ScriptBuilder::new();
    main.push(GOTO, &u32le(3));
    let mut call = ScriptBuilder::new();
    call.push(FARCALL, &farcall(0, "nowhere", 0));

    let (sched, _) = scheduler(&[("main", main), ("call", call)], default_ops());

    let err = futures::executor::block_on(sched.run("main", 0)).unwrap_err();
    assert!(matches!(
        err.root(),
        ScriptError::InvalidScriptReference { pos: 3, .. }
    ));

    let err = futures::executor::block_on(sched.run("call", 0)).unwrap_err();
    assert!(matches!(
        err.root(),
        ScriptError::InvalidScriptReference { script, .. } if script == "nowhere"
    ));

    let err = futures::executor::block_on(sched.run("missing", 0)).unwrap_err();
    assert!(matches!(err, ScriptError::InvalidScriptReference { .. }));
    let err = futures::executor::block_on(sched.run("main", 2)).unwrap_err();
    assert!(matches!(err, ScriptError::InvalidScriptReference { pos: 2, .. }));
}

#[test]
fn unknown_opcode_executes_and_falls_through() {
    let mut main = ScriptBuilder::new();
    main.push(0x99, &[0x01, 0x00, 0x02, 0x00, 0xFF]);
    main.push(EQU, &equ(1, 1));

    let (sched, hook) = scheduler(&[("main", main)], default_ops());
    let out = futures::executor::block_on(sched.run("main", 0)).unwrap();
    assert_eq!(out.context.variable.get("#1"), 1);
    assert_eq!(
        hook.calls.lock()[0],
        ("99".to_string(), vec![Param::Uint16(1), Param::Uint16(2)])
    );
}

#[test]
fn hook_failure_carries_the_address() {
    struct Failing;

    #[async_trait]
    impl EngineHook for Failing {
        async fn call(&self, name: &str, _params: &[Param]) -> Result<()> {
            Err(anyhow!("{name} refused"))
        }

        fn evaluate(&self, _expr: &str, _vars: &VariableStore) -> Result<i32> {
            Ok(0)
        }
    }

    let mut main = ScriptBuilder::new();
    main.push(EQU, &equ(1, 1));
    let at = main.push(GOTO, &u32le(0));
    let io = MemoryScriptIo::new();
    io.insert("main", main.to_bytes());
    let sched = Scheduler::new(Arc::new(io), Arc::new(default_ops()), Arc::new(Failing));

    let err = futures::executor::block_on(sched.run("main", at)).unwrap_err();
    assert!(matches!(&err, ScriptError::Instruction { pos, opcode, .. } if *pos == at && opcode == "GOTO"));
    assert!(matches!(err.root(), ScriptError::External(_)));
}

#[test]
fn threads_have_separate_variables() {
    let mut a = ScriptBuilder::new();
    a.push(EQU, &equ(5, 1));
    a.push(EQU, &equ(6, 1));
    let mut b = ScriptBuilder::new();
    b.push(EQU, &equ(5, 2));

    let (sched, hook) = scheduler(&[("a", a), ("b", b)], default_ops());
    let exec = Executor::new();
    let handle = exec.handle();
    let mut ta = sched.spawn(&handle, "a", 0);
    let mut tb = sched.spawn(&handle, "b", 0);
    assert_ne!(ta.id(), tb.id());

    exec.run_until_stalled();
    let a = ta.try_join().unwrap().unwrap();
    let b = tb.try_join().unwrap().unwrap();

    assert_eq!(a.context.variable.get("#5"), 1);
    assert_eq!(b.context.variable.get("#5"), 2);
    assert!(!b.context.variable.contains("#6"));

    // one instruction per turn: a, b, a
    let keys: Vec<Param> = hook.calls.lock().iter().map(|(_, p)| p[0].clone()).collect();
    assert_eq!(keys, [Param::Uint16(5), Param::Uint16(5), Param::Uint16(6)]);
}

#[test]
fn abort_is_observed_between_instructions() {
    let mut main = ScriptBuilder::new();
    main.push(GOTO, &u32le(0));

    let (sched, hook) = scheduler(&[("main", main)], default_ops());
    let exec = Executor::new();
    let mut thread = sched.spawn(&exec.handle(), "main", 0);
    *hook.abort_after_gotos.lock() = Some((5, thread.abort_handle()));

    exec.run_until_stalled();
    let out = thread.try_join().unwrap().unwrap();
    assert_eq!(out.exit, ThreadExit::Aborted);
    assert_eq!(out.executed, 5);
}

#[test]
fn aborted_before_start() {
    let mut main = ScriptBuilder::new();
    main.push(EQU, &equ(1, 1));

    let (sched, hook) = scheduler(&[("main", main)], default_ops());
    let exec = Executor::new();
    let thread = sched.spawn(&exec.handle(), "main", 0);
    thread.abort();

    let out = exec.run_until_stalled();
    assert!(out > 0);
    let out = futures::executor::block_on(thread).unwrap();
    assert_eq!(out.exit, ThreadExit::Aborted);
    assert_eq!(out.executed, 0);
    assert!(hook.calls.lock().is_empty());
}

/// Counts how often its step is built.
struct Counted {
    builds: Arc<AtomicUsize>,
}

#[derive(Debug)]
struct CountedStep;

#[async_trait]
impl Step for CountedStep {
    async fn invoke(
        &self,
        ctx: &mut ExecutionContext,
        hook: &dyn EngineHook,
    ) -> luca_script::Result<Transfer> {
        ctx.variable.add("runs", 1);
        hook.call("COUNTED", &[]).await?;
        Ok(Transfer::Next)
    }
}

impl Operation for Counted {
    fn name(&self) -> &str {
        "COUNTED"
    }

    fn disassemble(&self, code: &CodeLine, _labels: &mut LabelMap) -> luca_script::Result<String> {
        Ok(format!("{}:counted ()", code.pos))
    }

    fn build(&self, _code: &CodeLine) -> luca_script::Result<Arc<dyn Step>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(CountedStep))
    }
}

#[test]
fn steps_are_built_once_and_shared() {
    let builds = Arc::new(AtomicUsize::new(0));
    let config = TitleConfig::default();
    let env = config.operate().unwrap();
    let ops = OperatorSet::builder(config.opcode_table().unwrap())
        .baseline(&env)
        .register_opcode(0x40, Arc::new(Counted { builds: builds.clone() }))
        .build();

    let mut main = ScriptBuilder::new();
    main.push(ADD, &[u16le(1).to_vec(), cstr("1")].concat());
    main.push(0x40, &[]);
    main.push(IFN, &with_pos("#1==3", 0));

    let (sched, _) = scheduler(&[("main", main)], ops);
    let exec = Executor::new();
    let mut first = sched.spawn(&exec.handle(), "main", 0);
    let mut second = sched.spawn(&exec.handle(), "main", 0);
    exec.run_until_stalled();

    for thread in [&mut first, &mut second] {
        let out = thread.try_join().unwrap().unwrap();
        assert_eq!(out.context.variable.get("runs"), 3);
    }
    assert_eq!(builds.load(Ordering::SeqCst), 1);
}

#[test]
fn title_overlay_wins_at_execution() {
    let config = TitleConfig::default();
    let env = config.operate().unwrap();
    let ops = OperatorSet::builder(config.opcode_table().unwrap())
        .register_opcode(EQU, Arc::new(Counted { builds: Arc::new(AtomicUsize::new(0)) }))
        .baseline(&env)
        .build();

    let mut main = ScriptBuilder::new();
    main.push(EQU, &equ(5, 42));

    let (sched, hook) = scheduler(&[("main", main)], ops);
    let out = futures::executor::block_on(sched.run("main", 0)).unwrap();
    assert_eq!(hook.names(), ["COUNTED"]);
    assert_eq!(out.context.variable.get("#5"), 0);
}

#[test]
fn farcall_then_jump_away_hits_the_depth_limit() {
    // each pass leaves a frame behind: call "sub", which jumps back to main
    let mut main = ScriptBuilder::new();
    main.push(FARCALL, &farcall(0, "sub", 0));
    let mut sub = ScriptBuilder::new();
    sub.push(JUMP, &with_pos("main", 0));

    let io = MemoryScriptIo::new();
    io.insert("main", main.to_bytes());
    io.insert("sub", sub.to_bytes());
    let sched = Scheduler::new(
        Arc::new(io),
        Arc::new(default_ops()),
        Arc::new(Recorder::default()),
    )
    .with_max_call_depth(4);

    let err = futures::executor::block_on(sched.run("main", 0)).unwrap_err();
    assert!(matches!(err, ScriptError::Instruction { pos: 0, ref opcode, .. } if opcode == "FARCALL"));
    assert!(matches!(err.root(), ScriptError::CallDepth { limit: 4 }));
}
