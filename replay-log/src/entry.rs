use std::fmt;

use crate::prog_point::ProgPoint;

/// Kind byte of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryKind {
    Input1 = 0,
    Input2 = 1,
    Input4 = 2,
    Input8 = 3,
    InterruptRequest = 4,
    SkippedCall = 5,
    /// Terminator written when a recording closes cleanly.
    Last = 6,
}

impl EntryKind {
    pub fn from_u8(v: u8) -> Option<EntryKind> {
        Some(match v {
            0 => EntryKind::Input1,
            1 => EntryKind::Input2,
            2 => EntryKind::Input4,
            3 => EntryKind::Input8,
            4 => EntryKind::InterruptRequest,
            5 => EntryKind::SkippedCall,
            6 => EntryKind::Last,
            _ => return None,
        })
    }
}

/// Which emulator call site produced an entry. Stored in the log purely
/// as a sanity check: a tag we do not know is worth a warning during
/// replay, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Callsite(pub u8);

macro_rules! callsites {
    ($($name:ident = $val:expr,)*) => {
        impl Callsite {
            $(pub const $name: Callsite = Callsite($val);)*

            /// The tag's name, when it is one we know.
            pub fn name(self) -> Option<&'static str> {
                match self.0 {
                    $($val => Some(stringify!($name)),)*
                    _ => None,
                }
            }
        }
    };
}

callsites! {
    DEFAULT_IOPORT_READW = 0,
    CPU_INB = 1,
    CPU_INW = 2,
    CPU_INL = 3,
    CPU_PHYSICAL_MEMORY_RW_1 = 4,
    CPU_PHYSICAL_MEMORY_RW_2 = 5,
    CPU_PHYSICAL_MEMORY_RW_3 = 6,
    CPU_PHYSICAL_MEMORY_RW_4 = 7,
    LDL_PHYS = 8,
    LDQ_PHYS = 9,
    IO_READ_0 = 10,
    IO_READ_1 = 11,
    IO_READ_2 = 12,
    IO_READ_3 = 13,
    CPU_EXEC_1 = 14,
    CPU_EXEC_2 = 15,
    CPU_EXEC_3 = 16,
    CPU_EXEC_4 = 17,
    CPU_HALTED = 18,
    RDTSC = 19,
    TB_INVALIDATE_PHYS_PAGE_RANGE = 20,
    CPU_OUTB = 21,
    CPU_OUTW = 22,
    CPU_OUTL = 23,
    IO_WRITE_0 = 24,
    IO_WRITE_1 = 25,
    IO_WRITE_2 = 26,
    IO_WRITE_3 = 27,
    DEFAULT_IOPORT_WRITEW = 28,
    MAIN_LOOP = 29,
    PHYS_MEM_IO_1 = 30,
    PHYS_MEM_IO_2 = 31,
    PHYS_MEM_IO_3 = 32,
    STL_PHYS_ND = 33,
    STQ_PHYS_ND = 34,
    STL_PHYS = 35,
    DO_SMM_ENTER = 36,
    HELPER_RSM = 37,
    LAST = 38,
}

impl fmt::Display for Callsite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "UNKNOWN({})", self.0),
        }
    }
}

/// A machine-emulation call that ran during record but will not run
/// during replay; the log carries enough to redo its guest-visible
/// effect at the right program point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkippedCall {
    /// Device access to physical memory. Only writes carry the bytes; a
    /// device *read* of guest memory has no guest-visible effect to redo.
    MemRw {
        addr: u32,
        buf: Vec<u8>,
        len: u32,
        is_write: bool,
    },
    /// Physical memory region (re-)registration.
    RegMemRegion {
        start_addr: u32,
        size: u64,
        phys_offset: u64,
    },
}

impl SkippedCall {
    pub(crate) fn kind_byte(&self) -> u8 {
        match self {
            SkippedCall::MemRw { .. } => 0,
            SkippedCall::RegMemRegion { .. } => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryVariant {
    Input1(u8),
    Input2(u16),
    Input4(u32),
    Input8(u64),
    InterruptRequest(u16),
    SkippedCall(SkippedCall),
    Last,
}

impl EntryVariant {
    pub fn kind(&self) -> EntryKind {
        match self {
            EntryVariant::Input1(_) => EntryKind::Input1,
            EntryVariant::Input2(_) => EntryKind::Input2,
            EntryVariant::Input4(_) => EntryKind::Input4,
            EntryVariant::Input8(_) => EntryKind::Input8,
            EntryVariant::InterruptRequest(_) => EntryKind::InterruptRequest,
            EntryVariant::SkippedCall(_) => EntryKind::SkippedCall,
            EntryVariant::Last => EntryKind::Last,
        }
    }
}

/// One record of the non-determinism log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub prog_point: ProgPoint,
    pub callsite: Callsite,
    pub variant: EntryVariant,
}
