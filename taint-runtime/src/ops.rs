use std::fmt;
use std::ops::Range;

use crate::addr::Addr;
use crate::label_set::Label;

/// One instruction of the little taint-transfer language the IR rewriter
/// compiles for each translated function and the interpreter executes
/// against the shadow.
///
/// Many ops are emitted with `UNK` addresses; an [`InsnFixup`] op ahead of
/// them patches in the address the dynamic value log observed before they
/// execute.
#[derive(Debug, Clone, PartialEq)]
pub enum TaintOp {
    /// Associate `l` with the cell at `a`.
    Label { a: Addr, l: Label },
    /// Drop `len` consecutive cells starting at `a`.
    Delete { a: Addr, len: u32 },
    /// `b ← a`. A no-op when both name the same cell.
    Copy { a: Addr, b: Addr },
    /// Byte-wise copy of `len` cells, advancing both sides.
    BulkCopy { a: Addr, b: Addr, len: u32 },
    /// `c ← a ∪ b`.
    Compute { a: Addr, b: Addr, c: Addr },
    /// Consume dynamic-value entries and patch the `num_ops` ops that
    /// follow in this block.
    InsnStart { fixup: InsnFixup, num_ops: u32 },
    /// Record the executing basic block for later phi resolution.
    Breadcrumb { bb: u64 },
    /// Commit the previous instruction's taint-change flag and move the
    /// shadow's notion of the guest PC.
    Pc(u64),
    /// Push a frame and run the named function's op buffer.
    Call { callee: String },
    /// Pop a frame and stop executing the current buffer.
    Ret,
    /// Dump the labels of `len` cells starting at `a` (instrumentation
    /// only; never affects the shadow).
    Query { a: Addr, len: u32 },
    /// Deliver the resolved load address to on-load subscribers.
    LoadCallback { a: Addr },
    /// Deliver the resolved store address to on-store subscribers.
    StoreCallback { a: Addr },
}

/// One candidate of a select or phi fix-up: the selector key and the LADDR
/// slot holding that candidate, or `None` when the candidate was a
/// compile-time constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectCase {
    pub key: u64,
    pub slot: Option<u64>,
}

/// What an [`TaintOp::InsnStart`] rewrites, and from which log entries.
#[derive(Debug, Clone, PartialEq)]
pub enum InsnFixup {
    /// Fill the *source* of the following copies from a load entry.
    Load,
    /// Fill the *destination* side from a store entry.
    Store,
    /// Fill the destination of the following deletes/copies from a store
    /// entry (memset lowering).
    Memset,
    /// Consume a load entry then a store entry and fill both sides.
    Memcpy,
    /// Transfer control. A conditional branch consumes one branch entry
    /// and takes `targets[0]` when the condition was true; an
    /// unconditional one consumes nothing.
    Branch {
        cur_bb: u64,
        targets: [u64; 2],
        conditional: bool,
    },
    /// Consume a switch entry and take the matching case, or the default
    /// block when none matches.
    Switch {
        cur_bb: u64,
        cases: Vec<(i64, u64)>,
        default: u64,
    },
    /// Consume a select entry; keys are 1 (true) and 0 (false).
    Select { cases: Vec<SelectCase> },
    /// Consumes nothing; keyed on the recorded previous basic block.
    Phi { cases: Vec<SelectCase> },
}

impl InsnFixup {
    pub(crate) fn context(&self) -> &'static str {
        match self {
            InsnFixup::Load => "load",
            InsnFixup::Store => "store",
            InsnFixup::Memset => "memset",
            InsnFixup::Memcpy => "memcpy",
            InsnFixup::Branch { .. } => "branch",
            InsnFixup::Switch { .. } => "switch",
            InsnFixup::Select { .. } => "select",
            InsnFixup::Phi { .. } => "phi",
        }
    }
}

/// The compiled taint program of one translated function.
///
/// Ops are stored contiguously, grouped into basic-block spans in layout
/// order. The buffer itself is immutable once compiled; the interpreter
/// patches a scratch copy during fix-ups, so one buffer can be re-executed
/// (or executed re-entrantly through calls) safely.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaintOpBuffer {
    ops: Vec<TaintOp>,
    spans: Vec<BlockSpan>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    /// The block's dense slot number.
    pub bb: u64,
    /// Index of the block's first op.
    pub start: usize,
}

impl TaintOpBuffer {
    pub fn new() -> TaintOpBuffer {
        TaintOpBuffer::default()
    }

    /// Starts the span for block `bb`. Ops pushed afterwards belong to it.
    pub fn begin_block(&mut self, bb: u64) {
        self.spans.push(BlockSpan {
            bb,
            start: self.ops.len(),
        });
    }

    pub fn push(&mut self, op: TaintOp) {
        debug_assert!(
            !self.spans.is_empty(),
            "op pushed before any block was begun"
        );
        self.ops.push(op);
    }

    pub fn ops(&self) -> &[TaintOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn spans(&self) -> &[BlockSpan] {
        &self.spans
    }

    /// The op range of span `i`.
    pub fn span_range(&self, i: usize) -> Range<usize> {
        let start = self.spans[i].start;
        let end = self
            .spans
            .get(i + 1)
            .map_or(self.ops.len(), |next| next.start);
        start..end
    }

    /// Index of the span for block slot `bb`.
    pub fn span_of_block(&self, bb: u64) -> Option<usize> {
        self.spans.iter().position(|s| s.bb == bb)
    }
}

impl fmt::Display for TaintOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaintOp::Label { a, l } => write!(f, "label {a} {l}"),
            TaintOp::Delete { a, len } => write!(f, "delete {a} len {len}"),
            TaintOp::Copy { a, b } => write!(f, "copy {a} -> {b}"),
            TaintOp::BulkCopy { a, b, len } => write!(f, "bulk copy {a} -> {b} len {len}"),
            TaintOp::Compute { a, b, c } => write!(f, "compute {a} {b} -> {c}"),
            TaintOp::InsnStart { fixup, num_ops } => {
                write!(f, "insn_start: {}, {} ops", fixup.context(), num_ops)
            }
            TaintOp::Breadcrumb { bb } => write!(f, "breadcrumb bb {bb}"),
            TaintOp::Pc(pc) => write!(f, "pc {pc:#x}"),
            TaintOp::Call { callee } => write!(f, "call {callee}"),
            TaintOp::Ret => write!(f, "return"),
            TaintOp::Query { a, len } => write!(f, "query {a} len {len}"),
            TaintOp::LoadCallback { a } => write!(f, "ld callback {a}"),
            TaintOp::StoreCallback { a } => write!(f, "st callback {a}"),
        }
    }
}
