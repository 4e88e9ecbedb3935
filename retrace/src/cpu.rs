use memoffset::offset_of;

use taint_pass::CpuStateLayout;

/// Reference layout of a 32-bit x86 guest's CPU state, mirroring the
/// field order the emulator's code generator addresses through slot zero.
///
/// Only the byte layout matters here; the rewriter never reads values,
/// it only turns `env + offset` arithmetic into shadow coordinates.
#[repr(C)]
pub struct CpuStateX86 {
    /// General-purpose register file: eax, ecx, edx, ebx, esp, ebp, esi,
    /// edi.
    pub regs: [u32; 8],
    pub eip: u32,
    pub eflags: u32,
    /// Condition-code scratch the code generator spills into.
    pub cc_src: u32,
    pub cc_dst: u32,
    pub cc_op: u32,
    pub segs: [u32; 6],
    pub cr: [u32; 5],
    pub interrupt_request: u32,
    pub exception_index: u32,
    pub halted: u32,
}

/// The [`CpuStateLayout`] of [`CpuStateX86`], measured rather than
/// hand-counted.
pub fn x86_layout() -> CpuStateLayout {
    CpuStateLayout {
        state_size: std::mem::size_of::<CpuStateX86>() as u64,
        regs_offset: offset_of!(CpuStateX86, regs) as u64,
        reg_size: std::mem::size_of::<u32>() as u64,
        num_regs: 8,
    }
}
