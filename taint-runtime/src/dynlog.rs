use crate::addr::Addr;
use crate::error::TaintError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAccessKind {
    Load,
    Store,
}

/// One record produced by an instrumented load, store, branch, switch or
/// select while the translated code runs. The taint interpreter consumes
/// these in order to fill in `UNK` operands and to follow the path the
/// code actually took.
#[derive(Debug, Clone, PartialEq)]
pub enum DynValEntry {
    /// A resolved guest-memory or CPU-state access. `addr` carries the
    /// base address; per-byte offsets stay with the ops being fixed up.
    MemAccess { kind: MemAccessKind, addr: Addr },
    /// A guest I/O port access; `addr` is always a `Paddr`.
    PortAccess { kind: MemAccessKind, addr: Addr },
    /// Conditional-branch outcome: the condition value.
    Branch { taken: bool },
    /// Switch condition value.
    Switch { cond: i64 },
    /// Select condition value.
    Select { sel: bool },
    /// A guest exception unwound the rest of this block.
    Exception,
}

/// Bounded ring of [`DynValEntry`] records.
///
/// Instrumented helpers append during execution of a translated block; the
/// taint interpreter consumes in order afterwards. The buffer is reset
/// between translation blocks, so entries never survive a block boundary.
pub struct DynValBuffer {
    entries: Vec<DynValEntry>,
    read_pos: usize,
    capacity: usize,
}

impl DynValBuffer {
    pub fn new(capacity: usize) -> DynValBuffer {
        DynValBuffer {
            entries: Vec::with_capacity(capacity),
            read_pos: 0,
            capacity,
        }
    }

    pub fn push(&mut self, entry: DynValEntry) -> Result<(), TaintError> {
        if self.entries.len() == self.capacity {
            return Err(TaintError::LogOverflow {
                capacity: self.capacity,
            });
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<DynValEntry> {
        let entry = self.entries.get(self.read_pos).cloned();
        if entry.is_some() {
            self.read_pos += 1;
        }
        entry
    }

    /// Entries appended but not yet consumed.
    pub fn remaining(&self) -> usize {
        self.entries.len() - self.read_pos
    }

    pub fn is_drained(&self) -> bool {
        self.remaining() == 0
    }

    /// Resets the ring for the next translation block.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.read_pos = 0;
    }

    // Convenience producers for the instrumented side.

    pub fn log_load(&mut self, addr: Addr) -> Result<(), TaintError> {
        self.push(DynValEntry::MemAccess {
            kind: MemAccessKind::Load,
            addr,
        })
    }

    pub fn log_store(&mut self, addr: Addr) -> Result<(), TaintError> {
        self.push(DynValEntry::MemAccess {
            kind: MemAccessKind::Store,
            addr,
        })
    }

    pub fn log_port_load(&mut self, port: u32) -> Result<(), TaintError> {
        self.push(DynValEntry::PortAccess {
            kind: MemAccessKind::Load,
            addr: Addr::paddr(port),
        })
    }

    pub fn log_port_store(&mut self, port: u32) -> Result<(), TaintError> {
        self.push(DynValEntry::PortAccess {
            kind: MemAccessKind::Store,
            addr: Addr::paddr(port),
        })
    }

    pub fn log_branch(&mut self, taken: bool) -> Result<(), TaintError> {
        self.push(DynValEntry::Branch { taken })
    }

    pub fn log_switch(&mut self, cond: i64) -> Result<(), TaintError> {
        self.push(DynValEntry::Switch { cond })
    }

    pub fn log_select(&mut self, sel: bool) -> Result<(), TaintError> {
        self.push(DynValEntry::Select { sel })
    }

    pub fn log_exception(&mut self) -> Result<(), TaintError> {
        self.push(DynValEntry::Exception)
    }
}
