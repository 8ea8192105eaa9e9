use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use itertools::Itertools;

use crate::code::Script;
use crate::error::Result;
use crate::operator::{undefine, OperatorSet};

/// Synthetic labels for intra-script branch targets, numbered from 1 in the
/// order they are first referenced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelMap {
    labels: HashMap<u32, usize>,
}

impl LabelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Label number for `pos`, allocating the next one on first sight.
    pub fn label(&mut self, pos: u32) -> usize {
        let next = self.labels.len() + 1;
        *self.labels.entry(pos).or_insert(next)
    }

    pub fn get(&self, pos: u32) -> Option<usize> {
        self.labels.get(&pos).copied()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// `(pos, label)` pairs in label order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, usize)> + '_ {
        self.labels
            .iter()
            .map(|(&pos, &n)| (pos, n))
            .sorted_by_key(|&(_, n)| n)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingLine {
    pub pos: u32,
    pub opcode: u8,
    pub name: String,
    pub text: String,
    /// Decoding failed and `text` is the UNDEFINE rendering.
    pub failed: bool,
}

/// The disassembly of one script.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub script: String,
    pub lines: Vec<ListingLine>,
    pub labels: LabelMap,
}

impl Listing {
    /// One line per instruction, each labelled instruction preceded by `label_N:`.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            if let Some(n) = self.labels.get(line.pos) {
                out.push_str(&format!("label_{n}:\n"));
            }
            out.push_str(&line.text);
            out.push('\n');
        }
        out
    }

    /// Instruction count per opcode name.
    pub fn histogram(&self) -> BTreeMap<String, usize> {
        self.lines.iter().map(|l| l.name.clone()).counts().into_iter().collect()
    }

    /// Label targets that are not the address of any instruction.
    pub fn dangling_labels(&self) -> Vec<u32> {
        self.labels
            .iter()
            .map(|(pos, _)| pos)
            .filter(|pos| self.lines.binary_search_by_key(pos, |l| l.pos).is_err())
            .collect()
    }

    pub fn failures(&self) -> usize {
        self.lines.iter().filter(|l| l.failed).count()
    }
}

pub struct Disassembler {
    ops: Arc<OperatorSet>,
    keep_going: bool,
}

impl Disassembler {
    pub fn new(ops: Arc<OperatorSet>) -> Self {
        Self {
            ops,
            keep_going: false,
        }
    }

    /// Render undecodable instructions with UNDEFINE instead of failing.
    pub fn keep_going(mut self, keep_going: bool) -> Self {
        self.keep_going = keep_going;
        self
    }

    pub fn run(&self, script: &Script) -> Result<Listing> {
        let mut labels = LabelMap::new();
        let mut lines = Vec::with_capacity(script.len());

        for code in script.codes() {
            let name = self.ops.display_name(code.opcode);
            let (text, failed) = match self.ops.disassemble(code, &mut labels) {
                Ok(text) => (text, false),
                Err(e) if self.keep_going => {
                    log::error!("{}: {}", script.name(), e);
                    (undefine(code, self.ops.name(code.opcode)), true)
                }
                Err(e) => return Err(e),
            };
            lines.push(ListingLine {
                pos: code.pos,
                opcode: code.opcode,
                name,
                text,
                failed,
            });
        }

        let listing = Listing {
            script: script.name().to_owned(),
            lines,
            labels,
        };
        for pos in listing.dangling_labels() {
            log::warn!("{}: branch target {} is not an instruction", listing.script, pos);
        }
        Ok(listing)
    }
}
