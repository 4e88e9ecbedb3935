use std::rc::Rc;

use log::warn;
use rustc_hash::FxHashMap;

use taint_runtime::{
    Addr, AddrFlag, InsnFixup, SelectCase, TaintOp, TaintOpBuffer, MAX_REG_SIZE,
};

use crate::error::PassError;
use crate::helpers::{link_runtime_ops, TAINTED_MD};
use crate::ir::{
    BlockId, Const, InstId, Instruction, IrFunction, IrModule, IrType, Opcode, Operand,
};
use crate::layout::CpuStateLayout;
use crate::slots::SlotTracker;

/// The taint visitor: walks every function of a code-generated module,
/// compiles its taint-op program, and inserts calls to the run-time
/// helpers into the IR around the instructions they shadow.
pub struct TaintPass {
    pub layout: CpuStateLayout,
    /// IR value slots per shadow frame; every rewritten function must fit.
    pub num_vals: u64,
    /// Emit pointer-label computes on guest stores.
    pub tainted_pointer: bool,
}

/// Everything the runtime needs from one pass run.
pub struct PassOutput {
    /// Compiled op buffer per rewritten function, keyed by name.
    pub funcs: FxHashMap<String, Rc<TaintOpBuffer>>,
    /// Largest slot count seen; the shadow's per-frame value count must
    /// cover it.
    pub max_slots: u64,
}

fn laddr(slot: u64) -> Addr {
    Addr::laddr(slot)
}

fn helper_call(name: &str, args: &[i64]) -> Instruction {
    Instruction::new(
        Opcode::Call(name.to_string()),
        IrType::Void,
        args.iter().map(|&v| Operand::Const(Const::Int(v))).collect(),
    )
}

impl TaintPass {
    pub fn new(layout: CpuStateLayout, num_vals: u64) -> TaintPass {
        TaintPass {
            layout,
            num_vals,
            tainted_pointer: false,
        }
    }

    pub fn run_on_module(&self, module: &mut IrModule) -> Result<PassOutput, PassError> {
        link_runtime_ops(module);

        let mut out = PassOutput {
            funcs: FxHashMap::default(),
            max_slots: 0,
        };
        for fi in 0..module.functions.len() {
            let func = &module.functions[fi];
            if func.is_declaration() || func.name.starts_with("taint") {
                continue;
            }
            // already rewritten once
            if func.blocks[0]
                .insts
                .first()
                .is_some_and(|&id| func.inst(id).has_metadata(TAINTED_MD))
            {
                continue;
            }
            let name = func.name.clone();
            let (buf, slots_used) = self.run_on_function(&mut module.functions[fi])?;
            out.max_slots = out.max_slots.max(slots_used);
            out.funcs.insert(name, Rc::new(buf));
        }
        Ok(out)
    }

    fn run_on_function(
        &self,
        func: &mut IrFunction,
    ) -> Result<(TaintOpBuffer, u64), PassError> {
        let slots = SlotTracker::new(func);
        if slots.num_slots() > self.num_vals {
            return Err(PassError::TooManyValues {
                function: func.name.clone(),
                needed: slots.num_slots(),
                limit: self.num_vals,
            });
        }

        // instruction layout before any instrumentation lands
        let original: Vec<Vec<InstId>> = func.blocks.iter().map(|b| b.insts.clone()).collect();

        // clear the frame's own value slots on entry; argument slots are
        // skipped because the caller handed taint in through them
        let arg_base = func.params.len() as u64;
        let clear_len = ((self.num_vals - arg_base) * u64::from(MAX_REG_SIZE)) as u32;
        let entry_anchor = func
            .first_non_phi(BlockId(0))
            .ok_or(PassError::Malformed("entry block is empty"))?;
        func.insert_before(
            entry_anchor,
            helper_call("taint_delete", &[arg_base as i64, i64::from(clear_len)]),
        );
        let front = func.blocks[0].insts[0];
        func.inst_mut(front).set_metadata(TAINTED_MD);

        let mut buf = TaintOpBuffer::new();
        for (bi, insts) in original.iter().enumerate() {
            let block = BlockId(bi as u32);
            buf.begin_block(slots.block(block));
            if bi == 0 {
                buf.push(TaintOp::Delete {
                    a: laddr(arg_base),
                    len: clear_len,
                });
            }
            for &id in insts {
                self.visit_inst(func, &slots, &mut buf, block, id)?;
            }
        }
        Ok((buf, slots.num_slots()))
    }

    fn visit_inst(
        &self,
        func: &mut IrFunction,
        slots: &SlotTracker,
        buf: &mut TaintOpBuffer,
        block: BlockId,
        id: InstId,
    ) -> Result<(), PassError> {
        let inst = func.inst(id).clone();
        match &inst.op {
            // arithmetic mixes every source byte into every destination
            // byte; bitwise combines byte-for-byte
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::UDiv
            | Opcode::SDiv
            | Opcode::URem
            | Opcode::SRem
            | Opcode::Shl
            | Opcode::LShr
            | Opcode::AShr
            | Opcode::FAdd
            | Opcode::FSub
            | Opcode::FMul
            | Opcode::FDiv
            | Opcode::FRem => {
                self.emit_compute(func, slots, buf, id, &inst.operands[0], &inst.operands[1], true)
            }
            Opcode::And | Opcode::Or | Opcode::Xor => {
                self.emit_compute(func, slots, buf, id, &inst.operands[0], &inst.operands[1], false)
            }
            Opcode::ICmp | Opcode::FCmp => {
                self.emit_compute(func, slots, buf, id, &inst.operands[0], &inst.operands[1], true)
            }

            Opcode::Trunc
            | Opcode::ZExt
            | Opcode::SExt
            | Opcode::FPTrunc
            | Opcode::FPExt
            | Opcode::FPToSI
            | Opcode::SIToFP
            | Opcode::UIToFP
            | Opcode::PtrToInt
            | Opcode::IntToPtr
            | Opcode::BitCast => self.cast(func, slots, buf, id, &inst),

            Opcode::Load => self.state_access(func, slots, buf, id, &inst, false),
            Opcode::Store => {
                // volatile stores are code-gen bookkeeping, not guest effects
                if inst.volatile {
                    Ok(())
                } else {
                    self.state_access(func, slots, buf, id, &inst, true)
                }
            }

            // pointer arithmetic keeps the base pointer's labels, mixed
            Opcode::GetElementPtr => {
                self.emit_mix(func, slots, buf, id, &inst.operands[0]);
                Ok(())
            }

            Opcode::MemCpy => self.mem_transfer(func, buf, id, &inst, "taint_copy"),
            Opcode::MemMove => self.mem_transfer(func, buf, id, &inst, "taint_move"),
            Opcode::MemSet => self.memset(func, slots, buf, id, &inst),

            Opcode::Call(name) => {
                let name = name.clone();
                self.call(func, slots, buf, id, &inst, &name)
            }

            Opcode::Select => self.select(func, slots, buf, id, &inst),
            Opcode::Phi => self.phi(func, slots, buf, block, id, &inst),

            Opcode::Br => self.branch(func, slots, buf, block, id, &inst),
            Opcode::Switch => self.switch(func, slots, buf, block, id, &inst),
            Opcode::Ret => self.ret(func, slots, buf, block, id, &inst),
            Opcode::Unreachable => {
                self.breadcrumb(func, slots, buf, block, id);
                Ok(())
            }
            Opcode::Invoke => Err(PassError::InvokeUnsupported),

            Opcode::Alloca
            | Opcode::Fence
            | Opcode::AtomicCmpXchg
            | Opcode::AtomicRmw
            | Opcode::ExtractValue
            | Opcode::InsertValue => Ok(()),
        }
    }

    fn operand_size(&self, func: &IrFunction, op: &Operand) -> u32 {
        match op {
            Operand::Arg(i) => func.params[*i as usize].size_bytes(),
            Operand::Inst(id) => func.inst(*id).ty.size_bytes(),
            Operand::Const(_) | Operand::Block(_) => 0,
        }
    }

    // --- compute family -------------------------------------------------

    /// Every byte of `src` unioned into the scratch cell, fanned out to
    /// every byte of `dest`.
    fn emit_mix(
        &self,
        func: &mut IrFunction,
        slots: &SlotTracker,
        buf: &mut TaintOpBuffer,
        dest: InstId,
        src: &Operand,
    ) {
        let (Some(src_slot), Some(dest_slot)) = (slots.operand(src), slots.inst(dest)) else {
            return;
        };
        let src_size = self.operand_size(func, src);
        let dest_size = func.inst(dest).ty.size_bytes();
        if src_size == 0 || dest_size == 0 {
            return;
        }
        let acc = Addr::ret();
        buf.push(TaintOp::Compute {
            a: laddr(src_slot),
            b: laddr(src_slot),
            c: acc,
        });
        for i in 1..src_size {
            buf.push(TaintOp::Compute {
                a: laddr(src_slot).with_off(i),
                b: acc,
                c: acc,
            });
        }
        for j in 0..dest_size {
            buf.push(TaintOp::Copy {
                a: acc,
                b: laddr(dest_slot).with_off(j),
            });
        }
        func.insert_after(
            dest,
            helper_call(
                "taint_mix",
                &[
                    dest_slot as i64,
                    i64::from(dest_size),
                    src_slot as i64,
                    i64::from(src_size),
                ],
            ),
        );
    }

    fn emit_compute(
        &self,
        func: &mut IrFunction,
        slots: &SlotTracker,
        buf: &mut TaintOpBuffer,
        dest: InstId,
        src1: &Operand,
        src2: &Operand,
        mixed: bool,
    ) -> Result<(), PassError> {
        if src1.is_const() && src2.is_const() {
            return Ok(());
        }
        if src1.is_const() || src2.is_const() {
            let tainted = if src1.is_const() { src2 } else { src1 };
            if mixed {
                self.emit_mix(func, slots, buf, dest, tainted);
            } else {
                let (Some(dest_slot), Some(src_slot)) =
                    (slots.inst(dest), slots.operand(tainted))
                else {
                    return Ok(());
                };
                let size = self.operand_size(func, tainted);
                buf.push(TaintOp::BulkCopy {
                    a: laddr(src_slot),
                    b: laddr(dest_slot),
                    len: size,
                });
                func.insert_after(
                    dest,
                    helper_call(
                        "taint_copy",
                        &[dest_slot as i64, src_slot as i64, i64::from(size)],
                    ),
                );
            }
            return Ok(());
        }

        let (Some(dest_slot), Some(s1), Some(s2)) = (
            slots.inst(dest),
            slots.operand(src1),
            slots.operand(src2),
        ) else {
            return Ok(());
        };
        let src_size = self.operand_size(func, src1);
        let dest_size = func.inst(dest).ty.size_bytes();

        if mixed {
            let acc = Addr::ret();
            buf.push(TaintOp::Compute {
                a: laddr(s1),
                b: laddr(s2),
                c: acc,
            });
            for i in 1..src_size {
                buf.push(TaintOp::Compute {
                    a: laddr(s1).with_off(i),
                    b: acc,
                    c: acc,
                });
                buf.push(TaintOp::Compute {
                    a: laddr(s2).with_off(i),
                    b: acc,
                    c: acc,
                });
            }
            for j in 0..dest_size {
                buf.push(TaintOp::Copy {
                    a: acc,
                    b: laddr(dest_slot).with_off(j),
                });
            }
            func.insert_after(
                dest,
                helper_call(
                    "taint_mix_compute",
                    &[
                        dest_slot as i64,
                        i64::from(dest_size),
                        s1 as i64,
                        s2 as i64,
                        i64::from(src_size),
                    ],
                ),
            );
        } else {
            for i in 0..dest_size {
                buf.push(TaintOp::Compute {
                    a: laddr(s1).with_off(i),
                    b: laddr(s2).with_off(i),
                    c: laddr(dest_slot).with_off(i),
                });
            }
            func.insert_after(
                dest,
                helper_call(
                    "taint_parallel_compute",
                    &[
                        dest_slot as i64,
                        i64::from(dest_size),
                        s1 as i64,
                        s2 as i64,
                    ],
                ),
            );
        }
        Ok(())
    }

    // --- casts ----------------------------------------------------------

    fn cast(
        &self,
        func: &mut IrFunction,
        slots: &SlotTracker,
        buf: &mut TaintOpBuffer,
        id: InstId,
        inst: &Instruction,
    ) -> Result<(), PassError> {
        let src = inst.operands[0];
        let src_size = self.operand_size(func, &src);
        let dest_size = inst.ty.size_bytes();
        let Some(dest_slot) = slots.inst(id) else {
            return Ok(());
        };

        match inst.op {
            Opcode::FPExt
            | Opcode::FPToSI
            | Opcode::FPTrunc
            | Opcode::SIToFP
            | Opcode::UIToFP => {
                self.emit_mix(func, slots, buf, id, &src);
            }
            Opcode::SExt if dest_size > src_size => {
                let Some(src_slot) = slots.operand(&src) else {
                    buf.push(TaintOp::Delete {
                        a: laddr(dest_slot),
                        len: dest_size,
                    });
                    return Ok(());
                };
                for i in 0..src_size {
                    buf.push(TaintOp::Copy {
                        a: laddr(src_slot).with_off(i),
                        b: laddr(dest_slot).with_off(i),
                    });
                }
                // every widened byte takes the top source byte's labels
                for j in src_size..dest_size {
                    buf.push(TaintOp::Copy {
                        a: laddr(src_slot).with_off(src_size - 1),
                        b: laddr(dest_slot).with_off(j),
                    });
                }
                func.insert_after(
                    id,
                    helper_call(
                        "taint_sext",
                        &[
                            dest_slot as i64,
                            i64::from(dest_size),
                            src_slot as i64,
                            i64::from(src_size),
                        ],
                    ),
                );
            }
            _ => match slots.operand(&src) {
                Some(src_slot) => {
                    let len = src_size.min(dest_size);
                    buf.push(TaintOp::BulkCopy {
                        a: laddr(src_slot),
                        b: laddr(dest_slot),
                        len,
                    });
                    func.insert_after(
                        id,
                        helper_call(
                            "taint_copy",
                            &[dest_slot as i64, src_slot as i64, i64::from(len)],
                        ),
                    );
                }
                // a constant source cleans the destination
                None => buf.push(TaintOp::Delete {
                    a: laddr(dest_slot),
                    len: dest_size,
                }),
            },
        }
        Ok(())
    }

    // --- CPU-state loads and stores -------------------------------------

    /// Recognizes the `inttoptr(add(env, offset))` shape the code
    /// generator uses for CPU-state accesses, with `env` in slot zero.
    fn static_state_addr(
        &self,
        func: &IrFunction,
        slots: &SlotTracker,
        ptr: &Operand,
    ) -> Option<Addr> {
        let Operand::Inst(p) = *ptr else {
            return None;
        };
        let pi = func.inst(p);
        if pi.op != Opcode::IntToPtr {
            return None;
        }
        let Operand::Inst(a) = pi.operands[0] else {
            return None;
        };
        let ai = func.inst(a);
        if ai.op != Opcode::Add {
            return None;
        }
        if slots.operand(&ai.operands[0]) != Some(0) {
            return None;
        }
        let offset = ai.operands[1].const_int()?;
        if offset < 0 {
            return None;
        }
        self.layout.classify(offset as u64)
    }

    fn state_access(
        &self,
        func: &mut IrFunction,
        slots: &SlotTracker,
        buf: &mut TaintOpBuffer,
        id: InstId,
        inst: &Instruction,
        is_store: bool,
    ) -> Result<(), PassError> {
        let ptr = inst.operands[if is_store { 1 } else { 0 }];
        let (value, size) = if is_store {
            (inst.operands[0], self.operand_size(func, &inst.operands[0]))
        } else {
            (Operand::Inst(id), inst.ty.size_bytes())
        };

        if let Some(state_addr) = self.static_state_addr(func, slots, &ptr) {
            if is_store {
                match slots.operand(&value) {
                    Some(v) => buf.push(TaintOp::BulkCopy {
                        a: laddr(v),
                        b: state_addr,
                        len: size,
                    }),
                    None => buf.push(TaintOp::Delete {
                        a: state_addr,
                        len: size,
                    }),
                }
            } else if let Some(dest) = slots.inst(id) {
                buf.push(TaintOp::BulkCopy {
                    a: state_addr,
                    b: laddr(dest),
                    len: size,
                });
            }
            func.insert_after(id, helper_call("taint_copy", &[i64::from(size)]));
            return Ok(());
        }

        // address not provable at rewrite time: resolve through the
        // dynamic value log
        if is_store {
            self.dyn_store(func, slots, buf, id, &value, None, size, "taint_host_copy")
        } else {
            self.dyn_load(func, slots, buf, id, id, size, "taint_host_copy")
        }
    }

    /// Load whose source address arrives through the dynamic value log.
    #[allow(clippy::too_many_arguments)]
    fn dyn_load(
        &self,
        func: &mut IrFunction,
        slots: &SlotTracker,
        buf: &mut TaintOpBuffer,
        id: InstId,
        anchor: InstId,
        size: u32,
        helper: &str,
    ) -> Result<(), PassError> {
        let Some(dest) = slots.inst(id) else {
            return Ok(());
        };
        buf.push(TaintOp::InsnStart {
            fixup: InsnFixup::Load,
            num_ops: size + 1,
        });
        for i in 0..size {
            buf.push(TaintOp::Copy {
                a: Addr::unk().with_off(i),
                b: laddr(dest).with_off(i),
            });
        }
        buf.push(TaintOp::LoadCallback { a: Addr::unk() });
        func.insert_after(anchor, helper_call(helper, &[dest as i64, i64::from(size)]));
        Ok(())
    }

    /// Store whose destination address arrives through the dynamic value
    /// log. In tainted-pointer mode the pointer's labels are accumulated
    /// in the scratch cell and unioned into every stored byte.
    #[allow(clippy::too_many_arguments)]
    fn dyn_store(
        &self,
        func: &mut IrFunction,
        slots: &SlotTracker,
        buf: &mut TaintOpBuffer,
        anchor: InstId,
        value: &Operand,
        ptr: Option<&Operand>,
        size: u32,
        helper: &str,
    ) -> Result<(), PassError> {
        let mut ops: Vec<TaintOp> = Vec::new();
        match slots.operand(value) {
            Some(v) => {
                for i in 0..size {
                    ops.push(TaintOp::Copy {
                        a: laddr(v).with_off(i),
                        b: Addr::unk().with_off(i),
                    });
                }
            }
            None => {
                for i in 0..size {
                    ops.push(TaintOp::Delete {
                        a: Addr::unk().with_off(i),
                        len: 1,
                    });
                }
            }
        }

        if self.tainted_pointer {
            if let Some(ptr_slot) = ptr.and_then(|p| slots.operand(p)) {
                let ptr_size = ptr.map_or(0, |p| self.operand_size(func, p));
                let acc = Addr::ret();
                // accumulation chain; both operands stay non-UNK so the
                // store fix-up leaves these alone
                ops.push(TaintOp::Compute {
                    a: laddr(ptr_slot),
                    b: laddr(ptr_slot),
                    c: acc,
                });
                for i in 1..ptr_size {
                    ops.push(TaintOp::Compute {
                        a: laddr(ptr_slot).with_off(i),
                        b: acc,
                        c: acc,
                    });
                }
                for i in 0..size {
                    ops.push(TaintOp::Compute {
                        a: acc,
                        b: Addr::unk().with_off(i),
                        c: Addr::unk().with_off(i),
                    });
                }
            }
        }

        ops.push(TaintOp::StoreCallback { a: Addr::unk() });

        buf.push(TaintOp::InsnStart {
            fixup: InsnFixup::Store,
            num_ops: ops.len() as u32,
        });
        for op in ops {
            buf.push(op);
        }
        func.insert_after(anchor, helper_call(helper, &[i64::from(size)]));
        Ok(())
    }

    // --- memory intrinsics ----------------------------------------------

    fn mem_transfer(
        &self,
        func: &mut IrFunction,
        buf: &mut TaintOpBuffer,
        id: InstId,
        inst: &Instruction,
        helper: &str,
    ) -> Result<(), PassError> {
        let Some(len) = inst.operands[2].const_int() else {
            warn!("skipping memory transfer with non-constant length");
            return Ok(());
        };
        buf.push(TaintOp::InsnStart {
            fixup: InsnFixup::Memcpy,
            num_ops: 1,
        });
        buf.push(TaintOp::BulkCopy {
            a: Addr::unk(),
            b: Addr::unk(),
            len: len as u32,
        });
        // source below destination on the memory log
        let pop = func.insert_after(id, helper_call("taint_memlog_pop", &[]));
        let pop = func.insert_after(pop, helper_call("taint_memlog_pop", &[]));
        func.insert_after(pop, helper_call(helper, &[len]));
        Ok(())
    }

    fn memset(
        &self,
        func: &mut IrFunction,
        slots: &SlotTracker,
        buf: &mut TaintOpBuffer,
        id: InstId,
        inst: &Instruction,
    ) -> Result<(), PassError> {
        let Some(len) = inst.operands[2].const_int() else {
            warn!("skipping memset with non-constant length");
            return Ok(());
        };
        let len = len as u32;
        let fill = inst.operands[1];
        let pop = func.insert_after(id, helper_call("taint_memlog_pop", &[]));
        match slots.operand(&fill) {
            // constant fill wipes the destination
            None => {
                buf.push(TaintOp::InsnStart {
                    fixup: InsnFixup::Memset,
                    num_ops: 1,
                });
                buf.push(TaintOp::Delete {
                    a: Addr::unk(),
                    len,
                });
                func.insert_after(pop, helper_call("taint_delete", &[i64::from(len)]));
            }
            // otherwise broadcast the fill byte's shadow
            Some(v) => {
                buf.push(TaintOp::InsnStart {
                    fixup: InsnFixup::Memset,
                    num_ops: len,
                });
                for i in 0..len {
                    buf.push(TaintOp::Copy {
                        a: laddr(v),
                        b: Addr::unk().with_off(i),
                    });
                }
                func.insert_after(
                    pop,
                    helper_call("taint_copy", &[v as i64, i64::from(len)]),
                );
            }
        }
        Ok(())
    }

    // --- calls ----------------------------------------------------------

    fn call(
        &self,
        func: &mut IrFunction,
        slots: &SlotTracker,
        buf: &mut TaintOpBuffer,
        id: InstId,
        inst: &Instruction,
        name: &str,
    ) -> Result<(), PassError> {
        if let Some(intrinsic) = name.strip_prefix("llvm.") {
            if intrinsic.starts_with("uadd.with.overflow") {
                return self.emit_compute(
                    func,
                    slots,
                    buf,
                    id,
                    &inst.operands[0],
                    &inst.operands[1],
                    true,
                );
            }
            if intrinsic.starts_with("bswap") || intrinsic.starts_with("ctlz") {
                self.emit_mix(func, slots, buf, id, &inst.operands[0]);
                return Ok(());
            }
            warn!("unsupported intrinsic {name} in {}, skipping", func.name);
            return Ok(());
        }

        // helpers the pass itself inserted
        if name.starts_with("taint") {
            return Ok(());
        }

        match name {
            // guest-memory accesses through the softmmu helpers
            "__ldb_mmu" | "__ldw_mmu" | "__ldl_mmu" | "__ldq_mmu" => {
                let size = inst.ty.size_bytes();
                return self.dyn_load(func, slots, buf, id, id, size, "taint_memlog_pop");
            }
            "__stb_mmu" | "__stw_mmu" | "__stl_mmu" | "__stq_mmu" => {
                let value = inst.operands[1];
                let ptr = inst.operands[0];
                let size = self.operand_size(func, &value).max(1);
                return self.dyn_store(
                    func,
                    slots,
                    buf,
                    id,
                    &value,
                    Some(&ptr),
                    size,
                    "taint_memlog_pop",
                );
            }
            // soft-float library calls the code generator leans on
            "sin" | "cos" | "tan" | "log" | "__isinf" | "__isnan" | "rint" | "floor"
            | "abs" | "ceil" | "exp2" => {
                self.emit_mix(func, slots, buf, id, &inst.operands[0]);
                return Ok(());
            }
            "ldexp" | "atan2" => {
                return self.emit_compute(
                    func,
                    slots,
                    buf,
                    id,
                    &inst.operands[0],
                    &inst.operands[1],
                    true,
                );
            }
            _ => {}
        }

        // TODO: model helper_in*/helper_out* as port-shadow transfers once
        // the port log carries sizes; until then they propagate nothing
        if (name.starts_with("helper_in") && name.len() == "helper_in".len() + 1)
            || (name.starts_with("helper_out") && name.len() == "helper_out".len() + 1)
        {
            return Ok(());
        }

        // a call we don't model: run the callee instruction by
        // instruction in its own frame
        for (i, arg) in inst.operands.iter().enumerate() {
            if let Some(slot) = slots.operand(arg) {
                let size = self.operand_size(func, arg);
                buf.push(TaintOp::BulkCopy {
                    a: laddr(slot),
                    b: Addr::laddr(i as u64).with_flag(AddrFlag::FuncArg),
                    len: size,
                });
            }
        }
        func.insert_before(id, helper_call("taint_push_frame", &[]));
        buf.push(TaintOp::Call {
            callee: name.to_string(),
        });
        if inst.ty != IrType::Void {
            if let Some(dest) = slots.inst(id) {
                buf.push(TaintOp::BulkCopy {
                    a: Addr::ret(),
                    b: laddr(dest),
                    len: MAX_REG_SIZE,
                });
            }
        }
        func.insert_after(id, helper_call("taint_pop_frame", &[]));
        Ok(())
    }

    // --- select and phi -------------------------------------------------

    fn select(
        &self,
        func: &mut IrFunction,
        slots: &SlotTracker,
        buf: &mut TaintOpBuffer,
        id: InstId,
        inst: &Instruction,
    ) -> Result<(), PassError> {
        let Some(dest) = slots.inst(id) else {
            return Ok(());
        };
        let size = inst.ty.size_bytes();
        let cases = vec![
            SelectCase {
                key: 1,
                slot: slots.operand(&inst.operands[1]),
            },
            SelectCase {
                key: 0,
                slot: slots.operand(&inst.operands[2]),
            },
        ];
        buf.push(TaintOp::InsnStart {
            fixup: InsnFixup::Select { cases },
            num_ops: size,
        });
        for i in 0..size {
            buf.push(TaintOp::Copy {
                a: Addr::unk().with_off(i),
                b: laddr(dest).with_off(i),
            });
        }
        func.insert_after(id, helper_call("taint_select", &[dest as i64, i64::from(size)]));
        Ok(())
    }

    fn phi(
        &self,
        func: &mut IrFunction,
        slots: &SlotTracker,
        buf: &mut TaintOpBuffer,
        block: BlockId,
        id: InstId,
        inst: &Instruction,
    ) -> Result<(), PassError> {
        let Some(dest) = slots.inst(id) else {
            return Ok(());
        };
        let size = inst.ty.size_bytes();
        let mut cases = Vec::with_capacity(inst.operands.len() / 2);
        for pair in inst.operands.chunks(2) {
            let value = pair[0];
            let incoming = pair
                .get(1)
                .and_then(|o| o.block())
                .ok_or(PassError::Malformed("phi incoming edge is not a block"))?;
            cases.push(SelectCase {
                key: slots.block(incoming),
                slot: slots.operand(&value),
            });
        }
        buf.push(TaintOp::InsnStart {
            fixup: InsnFixup::Phi { cases },
            num_ops: size,
        });
        for i in 0..size {
            buf.push(TaintOp::Copy {
                a: Addr::unk().with_off(i),
                b: laddr(dest).with_off(i),
            });
        }
        // resolved against the breadcrumb, ahead of the block's real work
        let anchor = func
            .first_non_phi(block)
            .ok_or(PassError::Malformed("phi block has no terminator"))?;
        func.insert_before(
            anchor,
            helper_call("taint_select", &[dest as i64, i64::from(size)]),
        );
        Ok(())
    }

    // --- terminators ----------------------------------------------------

    fn breadcrumb(
        &self,
        func: &mut IrFunction,
        slots: &SlotTracker,
        buf: &mut TaintOpBuffer,
        block: BlockId,
        terminator: InstId,
    ) {
        let bb = slots.block(block);
        buf.push(TaintOp::Breadcrumb { bb });
        func.insert_before(terminator, helper_call("taint_breadcrumb", &[bb as i64]));
    }

    fn branch(
        &self,
        func: &mut IrFunction,
        slots: &SlotTracker,
        buf: &mut TaintOpBuffer,
        block: BlockId,
        id: InstId,
        inst: &Instruction,
    ) -> Result<(), PassError> {
        self.breadcrumb(func, slots, buf, block, id);
        let cur_bb = slots.block(block);
        let target = |op: &Operand| -> Result<u64, PassError> {
            op.block()
                .map(|b| slots.block(b))
                .ok_or(PassError::Malformed("branch target is not a block"))
        };
        let fixup = if inst.operands.len() == 3 {
            InsnFixup::Branch {
                cur_bb,
                targets: [target(&inst.operands[1])?, target(&inst.operands[2])?],
                conditional: true,
            }
        } else {
            let t = target(&inst.operands[0])?;
            InsnFixup::Branch {
                cur_bb,
                targets: [t, t],
                conditional: false,
            }
        };
        buf.push(TaintOp::InsnStart { fixup, num_ops: 0 });
        Ok(())
    }

    fn switch(
        &self,
        func: &mut IrFunction,
        slots: &SlotTracker,
        buf: &mut TaintOpBuffer,
        block: BlockId,
        id: InstId,
        inst: &Instruction,
    ) -> Result<(), PassError> {
        self.breadcrumb(func, slots, buf, block, id);
        let cur_bb = slots.block(block);
        let default = inst.operands[1]
            .block()
            .map(|b| slots.block(b))
            .ok_or(PassError::Malformed("switch default is not a block"))?;
        let mut cases = Vec::new();
        for pair in inst.operands[2..].chunks(2) {
            let cond = pair[0]
                .const_int()
                .ok_or(PassError::Malformed("switch case is not a constant"))?;
            let bb = pair
                .get(1)
                .and_then(|o| o.block())
                .map(|b| slots.block(b))
                .ok_or(PassError::Malformed("switch case target is not a block"))?;
            cases.push((cond, bb));
        }
        buf.push(TaintOp::InsnStart {
            fixup: InsnFixup::Switch {
                cur_bb,
                cases,
                default,
            },
            num_ops: 0,
        });
        Ok(())
    }

    fn ret(
        &self,
        func: &mut IrFunction,
        slots: &SlotTracker,
        buf: &mut TaintOpBuffer,
        block: BlockId,
        id: InstId,
        inst: &Instruction,
    ) -> Result<(), PassError> {
        if let Some(value) = inst.operands.first() {
            let size = self.operand_size(func, value);
            match slots.operand(value) {
                Some(v) => {
                    buf.push(TaintOp::BulkCopy {
                        a: laddr(v),
                        b: Addr::ret(),
                        len: size,
                    });
                    func.insert_before(
                        id,
                        helper_call("taint_copy", &[v as i64, i64::from(size)]),
                    );
                }
                None => buf.push(TaintOp::Delete {
                    a: Addr::ret(),
                    len: size.max(1),
                }),
            }
        }
        self.breadcrumb(func, slots, buf, block, id);
        buf.push(TaintOp::Ret);
        Ok(())
    }
}
