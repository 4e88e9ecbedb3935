use std::fmt;

/// Largest IR value we shadow, in bytes. The emulator's IR produces values
/// of up to 128 bits.
pub const MAX_REG_SIZE: u32 = 16;

/// Number of nested IR call frames the LLV shadow holds.
pub const FUNCTION_FRAMES: u32 = 10;

/// Which shadow map a cell lives in, plus the base coordinate within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddrKind {
    /// Hard-disk sector offset.
    Haddr(u64),
    /// Guest physical RAM byte.
    Maddr(u64),
    /// Generic I/O buffer byte.
    Iaddr(u64),
    /// Guest I/O port byte (port index scaled by the 4-byte port width).
    Paddr(u32),
    /// IR value slot, relative to the current stack frame.
    Laddr(u64),
    /// Guest general-purpose register index.
    Greg(u64),
    /// Guest special register / CPU-state cell, biased by the number of
    /// general registers.
    Gspec(u64),
    /// The call-return shadow slots.
    Ret,
    /// A compile-time constant. Never tainted; queries return empty.
    Const,
    /// Unresolved; the dynamic value log fills these in before execution.
    Unk,
}

/// Qualifier attached to an address by the rewriter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddrFlag {
    #[default]
    None,
    /// An LADDR that belongs to the *next* IR frame (a callee argument
    /// written before the frame is pushed).
    FuncArg,
    /// A known-unobservable CPU-state slot. Reads are empty; writes only
    /// ever delete.
    Irrelevant,
}

/// One shadow cell: a map coordinate, a byte offset, and a flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Addr {
    pub kind: AddrKind,
    pub off: u32,
    pub flag: AddrFlag,
}

impl Addr {
    pub fn haddr(a: u64) -> Self {
        AddrKind::Haddr(a).into()
    }

    pub fn maddr(a: u64) -> Self {
        AddrKind::Maddr(a).into()
    }

    pub fn iaddr(a: u64) -> Self {
        AddrKind::Iaddr(a).into()
    }

    pub fn paddr(a: u32) -> Self {
        AddrKind::Paddr(a).into()
    }

    pub fn laddr(slot: u64) -> Self {
        AddrKind::Laddr(slot).into()
    }

    pub fn greg(reg: u64) -> Self {
        AddrKind::Greg(reg).into()
    }

    pub fn gspec(cell: u64) -> Self {
        AddrKind::Gspec(cell).into()
    }

    pub fn ret() -> Self {
        AddrKind::Ret.into()
    }

    pub fn constant() -> Self {
        AddrKind::Const.into()
    }

    pub fn unk() -> Self {
        AddrKind::Unk.into()
    }

    pub fn with_off(mut self, off: u32) -> Self {
        self.off = off;
        self
    }

    pub fn with_flag(mut self, flag: AddrFlag) -> Self {
        self.flag = flag;
        self
    }

    pub fn is_irrelevant(&self) -> bool {
        self.flag == AddrFlag::Irrelevant
    }

    pub fn is_unk(&self) -> bool {
        self.kind == AddrKind::Unk
    }

    /// True iff `self` and `other` denote the same shadow cell.
    ///
    /// For the flat spaces the base and byte offset fold together; for slot
    /// spaces the coordinates must match field-wise. `Const` and `Unk`
    /// never equal anything, themselves included.
    pub fn same_cell(&self, other: &Addr) -> bool {
        use AddrKind::*;
        match (self.kind, other.kind) {
            (Haddr(a), Haddr(b)) => a + u64::from(self.off) == b + u64::from(other.off),
            (Maddr(a), Maddr(b)) => a + u64::from(self.off) == b + u64::from(other.off),
            (Iaddr(a), Iaddr(b)) => a + u64::from(self.off) == b + u64::from(other.off),
            (Paddr(a), Paddr(b)) => a + self.off == b + other.off,
            (Laddr(a), Laddr(b)) => a == b && self.off == other.off && self.flag == other.flag,
            (Greg(a), Greg(b)) => a == b && self.off == other.off,
            (Gspec(a), Gspec(b)) => a == b && self.off == other.off,
            (Ret, Ret) => self.off == other.off,
            _ => false,
        }
    }

    /// Advances the address by one byte, for bulk-copy walks. The flat
    /// spaces advance their base; the slot spaces advance the byte offset.
    pub fn advance(&mut self) {
        use AddrKind::*;
        match &mut self.kind {
            Haddr(a) | Maddr(a) | Iaddr(a) => *a += 1,
            Paddr(a) => *a += 1,
            Laddr(_) | Greg(_) | Gspec(_) | Ret => self.off += 1,
            Const | Unk => {}
        }
    }
}

impl From<AddrKind> for Addr {
    fn from(kind: AddrKind) -> Self {
        Addr {
            kind,
            off: 0,
            flag: AddrFlag::None,
        }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use AddrKind::*;
        match self.kind {
            Haddr(a) => write!(f, "h{:#x}", a + u64::from(self.off)),
            Maddr(a) => write!(f, "m{:#x}", a + u64::from(self.off)),
            Iaddr(a) => write!(f, "i{:#x}", a + u64::from(self.off)),
            Paddr(a) => write!(f, "p{:#x}", a + self.off),
            Laddr(slot) => {
                let arg = if self.flag == AddrFlag::FuncArg { "+" } else { "" };
                write!(f, "l{}{}[{}]", slot, arg, self.off)
            }
            Greg(r) => write!(f, "r{}[{}]", r, self.off),
            Gspec(s) => write!(f, "s{}[{}]", s, self.off),
            Ret => write!(f, "ret[{}]", self.off),
            Const => write!(f, "constant"),
            Unk => {
                if self.flag == AddrFlag::Irrelevant {
                    write!(f, "irrelevant")
                } else {
                    write!(f, "unknown")
                }
            }
        }
    }
}
