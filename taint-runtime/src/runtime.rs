use std::rc::Rc;

use log::info;
use rustc_hash::FxHashMap;

use crate::addr::{Addr, AddrFlag, AddrKind, FUNCTION_FRAMES};
use crate::callbacks::TaintCallbacks;
use crate::dynlog::{DynValBuffer, DynValEntry, MemAccessKind};
use crate::error::TaintError;
use crate::label_set::{self, Label};
use crate::ops::{InsnFixup, TaintOp, TaintOpBuffer};
use crate::shadow::{Shadow, ShadowGeometry};

/// How labels are assigned when bytes are marked tainted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LabelMode {
    /// Every labeled byte gets a fresh label from a monotone counter.
    #[default]
    Byte,
    /// Every labeled byte gets label 1.
    Binary,
}

/// How executing one op buffer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    Completed,
    /// A guest exception cut the block short; the rest of its ops (and of
    /// any calling buffers) were abandoned.
    Exception,
}

enum FixupControl {
    Continue,
    Exception,
}

/// The taint engine proper: owns the [`Shadow`], the registry of compiled
/// op buffers, and the interpreter that executes them against the dynamic
/// value log.
pub struct TaintRuntime {
    pub shad: Shadow,
    pub callbacks: TaintCallbacks,
    enabled: bool,
    label_mode: LabelMode,
    label_count: u32,
    tainted_pointer: bool,
    tainted_instructions: bool,
    collect_stats: bool,
    max_obs_cardinality: u32,
    previous_branch: Option<u64>,
    taken_branch: Option<u64>,
    /// Control transfer the walker consumes at the end of the current
    /// basic-block span.
    pending_jump: Option<u64>,
    funcs: FxHashMap<String, Rc<TaintOpBuffer>>,
}

impl TaintRuntime {
    pub fn new(geom: ShadowGeometry) -> Result<TaintRuntime, TaintError> {
        Ok(TaintRuntime {
            shad: Shadow::new(geom)?,
            callbacks: TaintCallbacks::default(),
            enabled: false,
            label_mode: LabelMode::default(),
            label_count: 0,
            tainted_pointer: false,
            tainted_instructions: false,
            collect_stats: false,
            max_obs_cardinality: 0,
            previous_branch: None,
            taken_branch: None,
            pending_jump: None,
            funcs: FxHashMap::default(),
        })
    }

    // Configuration latches. All of these are flipped from the monitor
    // side between translation blocks, never mid-buffer.

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_label_mode(&mut self, mode: LabelMode) {
        self.label_mode = mode;
    }

    pub fn label_mode(&self) -> LabelMode {
        self.label_mode
    }

    pub fn set_tainted_pointer(&mut self, on: bool) {
        self.tainted_pointer = on;
    }

    pub fn tainted_pointer(&self) -> bool {
        self.tainted_pointer
    }

    pub fn set_tainted_instructions(&mut self, on: bool) {
        self.tainted_instructions = on;
    }

    pub fn set_collect_stats(&mut self, on: bool) {
        self.collect_stats = on;
    }

    /// Largest label-set cardinality seen by a compute so far (leaf count,
    /// i.e. an upper bound on distinct labels).
    pub fn max_observed_cardinality(&self) -> u32 {
        self.max_obs_cardinality
    }

    /// Target of the most recent conditional transfer, as a block slot.
    pub fn taken_branch(&self) -> Option<u64> {
        self.taken_branch
    }

    // Label allocation.

    /// The label the `index`-th byte of the next labeling call will get.
    pub fn label_value(&self, index: u32) -> Label {
        match self.label_mode {
            LabelMode::Byte => self.label_count + index,
            LabelMode::Binary => 1,
        }
    }

    /// Advances the monotone label counter past a labeling of `n` bytes.
    pub fn bump_label_count(&mut self, n: u32) {
        self.label_count += n;
    }

    pub fn label_count(&self) -> u32 {
        self.label_count
    }

    // Compiled-function registry, fed by the IR rewriting pass.

    pub fn register_function(&mut self, name: impl Into<String>, ops: Rc<TaintOpBuffer>) {
        self.funcs.insert(name.into(), ops);
    }

    pub fn function(&self, name: &str) -> Option<&Rc<TaintOpBuffer>> {
        self.funcs.get(name)
    }

    /// Labels `len` bytes of guest physical RAM starting at `pa`, through
    /// the same op machinery instrumented code uses.
    pub fn label_ram_range(&mut self, pa: u64, len: u32) -> Result<(), TaintError> {
        let mut buf = TaintOpBuffer::new();
        buf.begin_block(0);
        for i in 0..len {
            buf.push(TaintOp::Label {
                a: Addr::maddr(pa + u64::from(i)),
                l: self.label_value(i),
            });
        }
        let mut dynval = DynValBuffer::new(1);
        self.execute(&buf, &mut dynval)?;
        self.bump_label_count(len);
        Ok(())
    }

    /// Labels `len` bytes of a generic I/O buffer starting at `ia`.
    pub fn label_io_range(&mut self, ia: u64, len: u32) -> Result<(), TaintError> {
        let mut buf = TaintOpBuffer::new();
        buf.begin_block(0);
        for i in 0..len {
            buf.push(TaintOp::Label {
                a: Addr::iaddr(ia + u64::from(i)),
                l: self.label_value(i),
            });
        }
        let mut dynval = DynValBuffer::new(1);
        self.execute(&buf, &mut dynval)?;
        self.bump_label_count(len);
        Ok(())
    }

    /// Executes one compiled op buffer against the shadow, consuming the
    /// dynamic value log the instrumented code produced.
    pub fn execute(
        &mut self,
        buf: &TaintOpBuffer,
        dynval: &mut DynValBuffer,
    ) -> Result<BlockOutcome, TaintError> {
        self.pending_jump = None;
        self.execute_buffer(buf, dynval, 0)
    }

    fn execute_buffer(
        &mut self,
        buf: &TaintOpBuffer,
        dynval: &mut DynValBuffer,
        depth: u32,
    ) -> Result<BlockOutcome, TaintError> {
        self.callbacks.run_before();
        let outcome = self.execute_inner(buf, dynval, depth);
        self.callbacks.run_after();
        outcome
    }

    fn execute_inner(
        &mut self,
        buf: &TaintOpBuffer,
        dynval: &mut DynValBuffer,
        depth: u32,
    ) -> Result<BlockOutcome, TaintError> {
        if buf.is_empty() {
            return Ok(BlockOutcome::Completed);
        }

        // The compiled buffer stays immutable; fix-ups patch this copy.
        let mut ops: Vec<TaintOp> = buf.ops().to_vec();

        let mut span_idx = 0;
        loop {
            let range = buf.span_range(span_idx);
            let mut i = range.start;
            let mut returned = false;
            while i < range.end {
                let op = ops[i].clone();
                match op {
                    TaintOp::Label { a, l } => self.shad.label(&a, l)?,
                    TaintOp::Delete { a, len } => self.shad.delete_range(&a, len)?,
                    TaintOp::Copy { a, b } => self.shad.copy(&a, &b)?,
                    TaintOp::BulkCopy { a, b, len } => {
                        let (mut x, mut y) = (a, b);
                        for _ in 0..len {
                            self.shad.copy(&x, &y)?;
                            x.advance();
                            y.advance();
                        }
                    }
                    TaintOp::Compute { a, b, c } => {
                        // in tainted-pointer mode a patched pointer compute
                        // can land on a register; registers never originate
                        // from tainted pointers, so those are dropped
                        let reg_dest =
                            matches!(c.kind, AddrKind::Greg(_) | AddrKind::Gspec(_));
                        if !(self.tainted_pointer && reg_dest) {
                            self.shad.compute(&a, &b, &c)?;
                            if self.collect_stats {
                                let card =
                                    label_set::cardinality(self.shad.query(&c).as_ref());
                                self.max_obs_cardinality =
                                    self.max_obs_cardinality.max(card);
                            }
                        }
                    }
                    TaintOp::InsnStart { fixup, num_ops } => {
                        let needed = num_ops as usize;
                        let available = range.end - (i + 1);
                        if needed > available {
                            return Err(TaintError::OpCountOverrun { needed, available });
                        }
                        let follow = &mut ops[i + 1..i + 1 + needed];
                        match self.process_fixup(&fixup, follow, dynval)? {
                            FixupControl::Continue => {}
                            FixupControl::Exception => return Ok(BlockOutcome::Exception),
                        }
                    }
                    TaintOp::Breadcrumb { bb } => self.shad.prev_bb = bb,
                    TaintOp::Pc(pc) => {
                        if self.tainted_instructions && self.shad.taint_state_changed() {
                            // commit the instruction that just finished
                            self.shad.note_tainted_pc();
                        }
                        self.shad.pc = pc;
                        if self.tainted_instructions {
                            self.shad.reset_taint_state_changed();
                        }
                    }
                    TaintOp::Call { callee } => {
                        let func = self
                            .funcs
                            .get(&callee)
                            .cloned()
                            .ok_or_else(|| TaintError::UnknownFunction(callee.clone()))?;
                        let frame = self.shad.current_frame + 1;
                        if frame >= FUNCTION_FRAMES {
                            return Err(TaintError::FrameOverflow {
                                frame,
                                limit: FUNCTION_FRAMES,
                            });
                        }
                        self.shad.current_frame = frame;
                        if self.execute_buffer(&func, dynval, depth + 1)?
                            == BlockOutcome::Exception
                        {
                            return Ok(BlockOutcome::Exception);
                        }
                    }
                    TaintOp::Ret => {
                        if depth > 0 {
                            if self.shad.current_frame == 0 {
                                return Err(TaintError::FrameUnderflow);
                            }
                            self.shad.current_frame -= 1;
                        }
                        returned = true;
                        break;
                    }
                    TaintOp::Query { a, len } => {
                        let mut addr = a;
                        for _ in 0..len {
                            match self.shad.query(&addr) {
                                Some(set) => info!("taint query {addr}: {set}"),
                                None => info!("taint query {addr}: empty"),
                            }
                            addr.advance();
                        }
                    }
                    TaintOp::LoadCallback { a } => {
                        if self.callbacks.has_load_subscribers() {
                            if let AddrKind::Maddr(ma) = a.kind {
                                let pc = self.shad.pc;
                                self.callbacks.run_load(pc, ma + u64::from(a.off));
                            }
                        }
                    }
                    TaintOp::StoreCallback { a } => {
                        if self.callbacks.has_store_subscribers() {
                            if let AddrKind::Maddr(ma) = a.kind {
                                let pc = self.shad.pc;
                                self.callbacks.run_store(pc, ma + u64::from(a.off));
                            }
                        }
                    }
                }
                i += 1;
            }

            if returned {
                return Ok(BlockOutcome::Completed);
            }
            match self.pending_jump.take() {
                Some(bb) => {
                    span_idx = buf
                        .span_of_block(bb)
                        .ok_or(TaintError::UnknownBlock { bb })?;
                }
                // fell off the end of a block with no transfer pending:
                // an unreachable-terminated block
                None => return Ok(BlockOutcome::Completed),
            }
        }
    }

    fn process_fixup(
        &mut self,
        fixup: &InsnFixup,
        follow: &mut [TaintOp],
        dynval: &mut DynValBuffer,
    ) -> Result<FixupControl, TaintError> {
        let context = fixup.context();
        match fixup {
            InsnFixup::Load => {
                let entry = self.pop_entry(dynval, context)?;
                match entry {
                    DynValEntry::Exception => return Ok(FixupControl::Exception),
                    DynValEntry::MemAccess {
                        kind: MemAccessKind::Load,
                        addr,
                    }
                    | DynValEntry::PortAccess {
                        kind: MemAccessKind::Load,
                        addr,
                    } => {
                        for op in follow {
                            match op {
                                TaintOp::Copy { a, .. } => patch_side(a, &addr),
                                TaintOp::LoadCallback { a } => patch_side(a, &addr),
                                _ => {
                                    return Err(TaintError::LogMisaligned {
                                        expected: "copy ops",
                                        context,
                                    })
                                }
                            }
                        }
                    }
                    _ => {
                        return Err(TaintError::LogMisaligned {
                            expected: "load access",
                            context,
                        })
                    }
                }
            }
            InsnFixup::Store | InsnFixup::Memset => {
                let entry = self.pop_entry(dynval, context)?;
                match entry {
                    DynValEntry::Exception => return Ok(FixupControl::Exception),
                    DynValEntry::MemAccess {
                        kind: MemAccessKind::Store,
                        addr,
                    }
                    | DynValEntry::PortAccess {
                        kind: MemAccessKind::Store,
                        addr,
                    } => {
                        for op in follow {
                            match op {
                                TaintOp::Copy { b, .. } => patch_side(b, &addr),
                                TaintOp::Delete { a, .. } => patch_side(a, &addr),
                                TaintOp::StoreCallback { a } => patch_side(a, &addr),
                                TaintOp::Compute { b, c, .. } => {
                                    if !self.tainted_pointer {
                                        return Err(TaintError::LogMisaligned {
                                            expected: "copy/delete ops",
                                            context,
                                        });
                                    }
                                    if addr.flag == AddrFlag::Irrelevant {
                                        b.flag = AddrFlag::Irrelevant;
                                        c.flag = AddrFlag::Irrelevant;
                                    } else if b.is_unk() || c.is_unk() {
                                        patch_side(b, &addr);
                                        patch_side(c, &addr);
                                    }
                                    // non-UNK computes are the pointer-label
                                    // accumulation chain; leave them alone
                                }
                                _ => {
                                    return Err(TaintError::LogMisaligned {
                                        expected: "copy/delete ops",
                                        context,
                                    })
                                }
                            }
                        }
                    }
                    _ => {
                        return Err(TaintError::LogMisaligned {
                            expected: "store access",
                            context,
                        })
                    }
                }
            }
            InsnFixup::Memcpy => {
                let src = self.pop_entry(dynval, context)?;
                if src == DynValEntry::Exception {
                    return Ok(FixupControl::Exception);
                }
                let dst = self.pop_entry(dynval, context)?;
                if dst == DynValEntry::Exception {
                    return Ok(FixupControl::Exception);
                }
                let (src_addr, dst_addr) = match (src, dst) {
                    (
                        DynValEntry::MemAccess {
                            kind: MemAccessKind::Load,
                            addr: s,
                        },
                        DynValEntry::MemAccess {
                            kind: MemAccessKind::Store,
                            addr: d,
                        },
                    ) => (s, d),
                    _ => {
                        return Err(TaintError::LogMisaligned {
                            expected: "load then store access",
                            context,
                        })
                    }
                };
                for op in follow {
                    match op {
                        TaintOp::Copy { a, b } | TaintOp::BulkCopy { a, b, .. } => {
                            patch_side(a, &src_addr);
                            patch_side(b, &dst_addr);
                        }
                        _ => {
                            return Err(TaintError::LogMisaligned {
                                expected: "copy ops",
                                context,
                            })
                        }
                    }
                }
            }
            InsnFixup::Branch {
                cur_bb,
                targets,
                conditional,
            } => {
                let taken = if *conditional {
                    let entry = self.pop_entry(dynval, context)?;
                    match entry {
                        DynValEntry::Exception => return Ok(FixupControl::Exception),
                        DynValEntry::Branch { taken } => {
                            targets[if taken { 0 } else { 1 }]
                        }
                        _ => {
                            return Err(TaintError::LogMisaligned {
                                expected: "branch outcome",
                                context,
                            })
                        }
                    }
                } else {
                    targets[0]
                };
                self.previous_branch = Some(*cur_bb);
                self.taken_branch = Some(taken);
                self.pending_jump = Some(taken);
            }
            InsnFixup::Switch {
                cur_bb,
                cases,
                default,
            } => {
                let entry = self.pop_entry(dynval, context)?;
                let cond = match entry {
                    DynValEntry::Exception => return Ok(FixupControl::Exception),
                    DynValEntry::Switch { cond } => cond,
                    _ => {
                        return Err(TaintError::LogMisaligned {
                            expected: "switch condition",
                            context,
                        })
                    }
                };
                let taken = cases
                    .iter()
                    .find(|(case, _)| *case == cond)
                    .map_or(*default, |(_, bb)| *bb);
                self.previous_branch = Some(*cur_bb);
                self.taken_branch = Some(taken);
                self.pending_jump = Some(taken);
            }
            InsnFixup::Select { cases } => {
                let entry = self.pop_entry(dynval, context)?;
                let key = match entry {
                    DynValEntry::Exception => return Ok(FixupControl::Exception),
                    DynValEntry::Select { sel } => u64::from(sel),
                    _ => {
                        return Err(TaintError::LogMisaligned {
                            expected: "select condition",
                            context,
                        })
                    }
                };
                let case = cases
                    .iter()
                    .find(|c| c.key == key)
                    .ok_or(TaintError::LogMisaligned {
                        expected: "matching select case",
                        context,
                    })?;
                rewrite_selected(follow, case.slot, context)?;
            }
            InsnFixup::Phi { cases } => {
                let prev_bb = self.shad.prev_bb;
                let case = cases
                    .iter()
                    .find(|c| c.key == prev_bb)
                    .ok_or(TaintError::PhiSourceMissing { prev_bb })?;
                rewrite_selected(follow, case.slot, context)?;
            }
        }
        Ok(FixupControl::Continue)
    }

    fn pop_entry(
        &mut self,
        dynval: &mut DynValBuffer,
        context: &'static str,
    ) -> Result<DynValEntry, TaintError> {
        dynval.pop().ok_or(TaintError::LogExhausted { context })
    }
}

/// Fills one operand side of a patched op from the observed address,
/// keeping the per-byte offset the rewriter assigned.
fn patch_side(side: &mut Addr, observed: &Addr) {
    if observed.flag == AddrFlag::Irrelevant {
        side.flag = AddrFlag::Irrelevant;
    } else {
        side.kind = observed.kind;
        side.flag = AddrFlag::None;
    }
}

/// Applies a resolved select/phi choice to the per-byte copies that
/// follow: source slot filled in, or the whole copy turned into a delete
/// of its destination when the chosen candidate was a constant.
fn rewrite_selected(
    follow: &mut [TaintOp],
    slot: Option<u64>,
    context: &'static str,
) -> Result<(), TaintError> {
    for op in follow {
        match op {
            TaintOp::Copy { a, b } => match slot {
                Some(la) => {
                    a.kind = AddrKind::Laddr(la);
                    a.flag = AddrFlag::None;
                }
                None => {
                    let dest = *b;
                    *op = TaintOp::Delete { a: dest, len: 1 };
                }
            },
            _ => {
                return Err(TaintError::LogMisaligned {
                    expected: "copy ops",
                    context,
                })
            }
        }
    }
    Ok(())
}

