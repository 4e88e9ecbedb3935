use rustc_hash::FxHashMap;

use crate::ir::{BlockId, InstId, IrFunction, IrType, Operand};

/// Dense local numbering of a function's arguments, basic blocks and
/// value-producing instructions, stable for the duration of one pass.
///
/// Slot numbers double as the LADDR coordinates of emitted taint ops:
/// arguments come first (so callee argument `i` is slot `i`), then each
/// block followed by its non-void instructions, in layout order.
pub struct SlotTracker {
    args: Vec<u64>,
    blocks: FxHashMap<BlockId, u64>,
    insts: FxHashMap<InstId, u64>,
    next: u64,
}

impl SlotTracker {
    pub fn new(func: &IrFunction) -> SlotTracker {
        let mut tracker = SlotTracker {
            args: Vec::with_capacity(func.params.len()),
            blocks: FxHashMap::default(),
            insts: FxHashMap::default(),
            next: 0,
        };
        for _ in &func.params {
            let slot = tracker.bump();
            tracker.args.push(slot);
        }
        for (bi, block) in func.blocks.iter().enumerate() {
            let slot = tracker.bump();
            tracker.blocks.insert(BlockId(bi as u32), slot);
            for &id in &block.insts {
                if func.inst(id).ty != IrType::Void {
                    let slot = tracker.bump();
                    tracker.insts.insert(id, slot);
                }
            }
        }
        tracker
    }

    fn bump(&mut self) -> u64 {
        let slot = self.next;
        self.next += 1;
        slot
    }

    pub fn arg(&self, i: u32) -> u64 {
        self.args[i as usize]
    }

    pub fn block(&self, b: BlockId) -> u64 {
        self.blocks[&b]
    }

    pub fn inst(&self, i: InstId) -> Option<u64> {
        self.insts.get(&i).copied()
    }

    /// The LADDR slot of a non-constant operand.
    pub fn operand(&self, op: &Operand) -> Option<u64> {
        match op {
            Operand::Arg(i) => Some(self.arg(*i)),
            Operand::Inst(id) => self.inst(*id),
            Operand::Block(b) => Some(self.block(*b)),
            Operand::Const(_) => None,
        }
    }

    /// Total slots handed out; the shadow's per-frame value count must be
    /// at least this.
    pub fn num_slots(&self) -> u64 {
        self.next
    }
}
