use luca_nls::CharsetError;

#[derive(thiserror::Error, Debug)]
pub enum ScriptError {
    #[error("truncated instruction: need {need} byte(s) at offset {offset}, payload has {len}")]
    TruncatedInstruction { offset: usize, need: usize, len: usize },

    #[error("bad instruction header at 0x{pos:X}: len={len}")]
    BadHeader { pos: u32, len: usize },

    #[error(transparent)]
    Charset(#[from] CharsetError),

    #[error("invalid script reference: {script:?} @ 0x{pos:X}")]
    InvalidScriptReference { script: String, pos: u32 },

    #[error("{opcode} at 0x{pos:X}: {source}")]
    Instruction {
        pos: u32,
        opcode: String,
        source: Box<ScriptError>,
    },

    #[error("FARCALL nesting exceeds {limit} frame(s)")]
    CallDepth { limit: usize },

    #[error("script thread {0} was cancelled before it finished")]
    Cancelled(u32),

    /// Failure reported by an engine hook or a script loader.
    #[error(transparent)]
    External(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ScriptError>;

impl ScriptError {
    /// Attach the address and opcode name of the instruction being processed.
    /// Errors that already carry a location are returned unchanged.
    pub fn at(self, pos: u32, opcode: impl Into<String>) -> Self {
        match self {
            e @ ScriptError::Instruction { .. } => e,
            e => ScriptError::Instruction {
                pos,
                opcode: opcode.into(),
                source: Box::new(e),
            },
        }
    }

    /// The innermost error, skipping location wrappers.
    pub fn root(&self) -> &ScriptError {
        match self {
            ScriptError::Instruction { source, .. } => source.root(),
            e => e,
        }
    }
}
