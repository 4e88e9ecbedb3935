use log::warn;

use taint_pass::CpuStateLayout;
use taint_runtime::{
    Addr, DynValBuffer, ShadowGeometry, TaintError, TaintOp, TaintOpBuffer, TaintRuntime,
};

use crate::hooks::AddressTranslate;

/// A [`ShadowGeometry`] sized for `layout` plus the given machine shape.
pub fn taint_shadow_geometry(
    layout: &CpuStateLayout,
    hd_size: u64,
    mem_size: u64,
    io_size: u64,
    num_vals: u64,
) -> ShadowGeometry {
    ShadowGeometry {
        hd_size,
        mem_size,
        io_size,
        port_size: ShadowGeometry::DEFAULT_PORT_SIZE,
        num_vals,
        num_regs: layout.num_regs,
        word_size: layout.reg_size as u32,
        num_spec_cells: layout.num_spec_cells(),
    }
}

/// Labels `len` bytes of guest memory starting at virtual address
/// `vaddr`.
///
/// Labeling is physical, so each byte is translated first; bytes whose
/// page is not mapped are skipped with a warning. The label counter
/// still advances by the full length, so the labels a caller was told to
/// expect stay stable whether or not some pages were resident.
pub fn add_taint_ram(
    env: &impl AddressTranslate,
    rt: &mut TaintRuntime,
    vaddr: u64,
    len: u32,
) -> Result<(), TaintError> {
    let mut buf = TaintOpBuffer::new();
    buf.begin_block(0);
    for i in 0..len {
        let va = vaddr + u64::from(i);
        match env.virt_to_phys(va) {
            Some(pa) => buf.push(TaintOp::Label {
                a: Addr::maddr(pa),
                l: rt.label_value(i),
            }),
            None => warn!("cannot label {va:#x}: no virtual-to-physical mapping"),
        }
    }
    let mut dynval = DynValBuffer::new(1);
    rt.execute(&buf, &mut dynval)?;
    rt.bump_label_count(len);
    Ok(())
}

/// Labels `len` bytes of an I/O buffer starting at `addr`.
pub fn add_taint_io(rt: &mut TaintRuntime, addr: u64, len: u32) -> Result<(), TaintError> {
    rt.label_io_range(addr, len)
}
