use taint_runtime::{Addr, AddrFlag};

/// Byte layout of the emulator's CPU-state struct, as seen from slot-zero
/// of every translated function.
///
/// The rewriter uses this to statically resolve
/// `inttoptr(add(env, offset))` accesses to a register or special-register
/// shadow cell; the runtime uses it to classify raw host pointers that
/// could not be proven statically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuStateLayout {
    /// Total size of the state struct in bytes.
    pub state_size: u64,
    /// Offset of the general-purpose register file.
    pub regs_offset: u64,
    /// Bytes per general-purpose register.
    pub reg_size: u64,
    /// Number of general-purpose registers.
    pub num_regs: u64,
}

impl CpuStateLayout {
    /// Classifies a byte offset into the state struct. Offsets inside the
    /// register file become `GREG` cells; everything else in range becomes
    /// a `GSPEC` cell, biased by the register count the way the shadow
    /// expects. Out-of-range offsets are not state accesses at all.
    pub fn classify(&self, offset: u64) -> Option<Addr> {
        if offset >= self.state_size {
            return None;
        }
        let regs_end = self.regs_offset + self.num_regs * self.reg_size;
        if offset >= self.regs_offset && offset < regs_end {
            let rel = offset - self.regs_offset;
            Some(Addr::greg(rel / self.reg_size).with_off((rel % self.reg_size) as u32))
        } else {
            Some(Addr::gspec(self.num_regs + offset))
        }
    }

    /// Run-time counterpart of [`classify`](Self::classify): resolves a
    /// raw host pointer against the state bounds. Pointers outside the
    /// state struct are emulator scratch and marked unobservable.
    pub fn resolve_host_ptr(&self, env_base: u64, ptr: u64) -> Addr {
        if ptr >= env_base && ptr < env_base + self.state_size {
            match self.classify(ptr - env_base) {
                Some(addr) => addr,
                None => Addr::unk().with_flag(AddrFlag::Irrelevant),
            }
        } else {
            Addr::unk().with_flag(AddrFlag::Irrelevant)
        }
    }

    /// Cell count a shadow needs for the special-register space.
    pub fn num_spec_cells(&self) -> u64 {
        self.state_size
    }
}
