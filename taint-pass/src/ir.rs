//! A minimal typed IR mirroring what the emulator's code generator
//! produces for a guest translation block.
//!
//! Instructions live in a per-function arena so their ids stay stable
//! while instrumentation is inserted around them. Basic blocks hold the
//! execution order. The capability surface is deliberately small:
//! get-operand, get-type, insert-before, insert-after, and metadata tags.

/// Index of a function within its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncId(pub usize);

/// Index of a basic block within its function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

/// Arena index of an instruction within its function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrType {
    Void,
    I1,
    I8,
    I16,
    I32,
    I64,
    I128,
    F32,
    F64,
    Ptr,
}

impl IrType {
    /// Size in bytes as the taint model sees it: sub-byte values occupy
    /// one shadow byte.
    pub fn size_bytes(self) -> u32 {
        match self {
            IrType::Void => 0,
            IrType::I1 | IrType::I8 => 1,
            IrType::I16 => 2,
            IrType::I32 | IrType::F32 => 4,
            IrType::I64 | IrType::F64 | IrType::Ptr => 8,
            IrType::I128 => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Const {
    Int(i64),
    Float(f64),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    /// The `i`-th function argument. Argument 0 is always the CPU-state
    /// pointer.
    Arg(u32),
    /// The result of another instruction.
    Inst(InstId),
    /// A basic block, for branch targets and phi incoming edges.
    Block(BlockId),
    Const(Const),
}

impl Operand {
    pub fn is_const(&self) -> bool {
        matches!(self, Operand::Const(_))
    }

    pub fn const_int(&self) -> Option<i64> {
        match self {
            Operand::Const(Const::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn block(&self) -> Option<BlockId> {
        match self {
            Operand::Block(b) => Some(*b),
            _ => None,
        }
    }
}

/// Operand conventions:
///
/// * binary ops, `ICmp`, `FCmp`: `[lhs, rhs]`
/// * casts: `[src]`
/// * `Load`: `[ptr]`; `Store`: `[value, ptr]`
/// * `GetElementPtr`: `[base, indices...]`
/// * `Call(name)`: `[args...]`
/// * `Select`: `[cond, true_val, false_val]`
/// * `Phi`: `[val0, block0, val1, block1, ...]`
/// * `Br`: `[target]` or `[cond, true_block, false_block]`
/// * `Switch`: `[cond, default_block, case_const, case_block, ...]`
/// * `Ret`: `[]` or `[value]`
/// * `MemCpy`/`MemMove`: `[dst, src, len]`; `MemSet`: `[dst, fill, len]`
#[derive(Debug, Clone, PartialEq)]
pub enum Opcode {
    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
    URem,
    SRem,
    Shl,
    LShr,
    AShr,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FRem,
    And,
    Or,
    Xor,
    ICmp,
    FCmp,
    Trunc,
    ZExt,
    SExt,
    FPTrunc,
    FPExt,
    FPToSI,
    SIToFP,
    UIToFP,
    PtrToInt,
    IntToPtr,
    BitCast,
    Alloca,
    Load,
    Store,
    GetElementPtr,
    MemCpy,
    MemMove,
    MemSet,
    Call(String),
    Select,
    Phi,
    Br,
    Switch,
    Ret,
    Unreachable,
    Invoke,
    Fence,
    AtomicCmpXchg,
    AtomicRmw,
    ExtractValue,
    InsertValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub op: Opcode,
    /// Result type; `Void` for instructions that produce no value.
    pub ty: IrType,
    pub operands: Vec<Operand>,
    pub volatile: bool,
    metadata: Vec<String>,
}

impl Instruction {
    pub fn new(op: Opcode, ty: IrType, operands: Vec<Operand>) -> Instruction {
        Instruction {
            op,
            ty,
            operands,
            volatile: false,
            metadata: Vec::new(),
        }
    }

    pub fn volatile(mut self) -> Instruction {
        self.volatile = true;
        self
    }

    pub fn has_metadata(&self, tag: &str) -> bool {
        self.metadata.iter().any(|t| t == tag)
    }

    /// Attaches `tag`, replacing nothing if it is already present.
    pub fn set_metadata(&mut self, tag: &str) {
        if !self.has_metadata(tag) {
            self.metadata.push(tag.to_string());
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self.op,
            Opcode::Br | Opcode::Switch | Opcode::Ret | Opcode::Unreachable | Opcode::Invoke
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Block {
    /// Instruction ids in execution order.
    pub insts: Vec<InstId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IrFunction {
    pub name: String,
    pub params: Vec<IrType>,
    pub ret_type: IrType,
    pub blocks: Vec<Block>,
    insts: Vec<Instruction>,
}

impl IrFunction {
    /// A function with no body is a declaration until blocks are added.
    pub fn new(name: impl Into<String>, params: Vec<IrType>, ret_type: IrType) -> IrFunction {
        IrFunction {
            name: name.into(),
            params,
            ret_type,
            blocks: Vec::new(),
            insts: Vec::new(),
        }
    }

    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn add_block(&mut self) -> BlockId {
        self.blocks.push(Block::default());
        BlockId(self.blocks.len() as u32 - 1)
    }

    /// Appends `inst` to `block` and returns its id.
    pub fn append(&mut self, block: BlockId, inst: Instruction) -> InstId {
        let id = self.alloc(inst);
        self.blocks[block.0 as usize].insts.push(id);
        id
    }

    fn alloc(&mut self, inst: Instruction) -> InstId {
        self.insts.push(inst);
        InstId(self.insts.len() as u32 - 1)
    }

    pub fn inst(&self, id: InstId) -> &Instruction {
        &self.insts[id.0 as usize]
    }

    pub fn inst_mut(&mut self, id: InstId) -> &mut Instruction {
        &mut self.insts[id.0 as usize]
    }

    /// Block and position of `anchor` in execution order.
    fn position_of(&self, anchor: InstId) -> Option<(usize, usize)> {
        for (bi, block) in self.blocks.iter().enumerate() {
            if let Some(pos) = block.insts.iter().position(|&i| i == anchor) {
                return Some((bi, pos));
            }
        }
        None
    }

    pub fn insert_before(&mut self, anchor: InstId, inst: Instruction) -> InstId {
        let (bi, pos) = self
            .position_of(anchor)
            .expect("anchor instruction not found in any block");
        let id = self.alloc(inst);
        self.blocks[bi].insts.insert(pos, id);
        id
    }

    pub fn insert_after(&mut self, anchor: InstId, inst: Instruction) -> InstId {
        let (bi, pos) = self
            .position_of(anchor)
            .expect("anchor instruction not found in any block");
        let id = self.alloc(inst);
        self.blocks[bi].insts.insert(pos + 1, id);
        id
    }

    /// First instruction of `block` that is not a phi.
    pub fn first_non_phi(&self, block: BlockId) -> Option<InstId> {
        self.blocks[block.0 as usize]
            .insts
            .iter()
            .copied()
            .find(|&id| self.inst(id).op != Opcode::Phi)
    }

    pub fn terminator(&self, block: BlockId) -> Option<InstId> {
        self.blocks[block.0 as usize]
            .insts
            .iter()
            .copied()
            .find(|&id| self.inst(id).is_terminator())
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct IrModule {
    pub functions: Vec<IrFunction>,
}

impl IrModule {
    pub fn new() -> IrModule {
        IrModule::default()
    }

    pub fn add_function(&mut self, f: IrFunction) -> FuncId {
        self.functions.push(f);
        FuncId(self.functions.len() - 1)
    }

    pub fn function(&self, name: &str) -> Option<&IrFunction> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.function(name).is_some()
    }
}
