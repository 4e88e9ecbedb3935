use rustc_hash::{FxHashMap, FxHashSet};

use crate::addr::{Addr, AddrFlag, AddrKind, FUNCTION_FRAMES, MAX_REG_SIZE};
use crate::error::TaintError;
use crate::fast_shad::FastShad;
use crate::label_set::{self, Label, LabelSetRef};
use crate::shad_dir::ShadDir;

/// The shapes of all the address spaces one [`Shadow`] mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowGeometry {
    /// Hard disk size in bytes.
    pub hd_size: u64,
    /// Guest RAM size in bytes.
    pub mem_size: u64,
    /// Highest generic I/O buffer address.
    pub io_size: u64,
    /// Port space size in bytes.
    pub port_size: u64,
    /// Number of IR value slots per frame.
    pub num_vals: u64,
    /// Guest general-purpose register count.
    pub num_regs: u64,
    /// Bytes per general-purpose register.
    pub word_size: u32,
    /// Special-register cell count; zero disables the GSPEC space.
    pub num_spec_cells: u64,
}

impl ShadowGeometry {
    /// Default port space: 0xffff ports of up to 4 bytes each.
    pub const DEFAULT_PORT_SIZE: u64 = 0xffff * 4;
}

/// Shadow memory for every address space the emulator manipulates.
///
/// One map per [`AddrKind`]: dense arrays for RAM, IR values, the return
/// slots and guest registers, sparse directories for disk, I/O buffers and
/// ports. All accesses go through an [`Addr`]; the resolution rules
/// (frame selection for `LADDR`, register bias for `GSPEC`, `IRRELEVANT`
/// short-circuits) live here.
pub struct Shadow {
    geom: ShadowGeometry,
    hd: ShadDir,
    ram: FastShad,
    io: ShadDir,
    ports: ShadDir,
    llv: FastShad,
    ret: FastShad,
    grv: FastShad,
    gsv: Option<FastShad>,

    /// Current IR stack frame, 0-based.
    pub current_frame: u32,
    /// Slot number of the last basic block that ran (the breadcrumb).
    pub prev_bb: u64,
    /// Guest PC of the last committed instruction.
    pub pc: u64,
    /// Address-space identifier the tainted-PC set is keyed on.
    pub asid: u64,

    taint_state_changed: bool,
    tpc: FxHashMap<u64, FxHashSet<u64>>,
}

/// Where an address landed after resolution: which dense or sparse map,
/// and the flat index within it.
enum Cell {
    Hd(u64),
    Ram(u64),
    Io(u64),
    Port(u64),
    Llv(u64),
    Ret(u64),
    Grv(u64),
    Gsv(u64),
}

impl Shadow {
    pub fn new(geom: ShadowGeometry) -> Result<Shadow, TaintError> {
        let llv_len = geom.num_vals * u64::from(FUNCTION_FRAMES) * u64::from(MAX_REG_SIZE);
        let gsv = if geom.num_spec_cells > 0 {
            Some(FastShad::new(geom.num_spec_cells)?)
        } else {
            None
        };
        Ok(Shadow {
            geom,
            hd: ShadDir::new(),
            ram: FastShad::new(geom.mem_size)?,
            io: ShadDir::new(),
            ports: ShadDir::new(),
            llv: FastShad::new(llv_len)?,
            ret: FastShad::new(u64::from(MAX_REG_SIZE))?,
            grv: FastShad::new(geom.num_regs * u64::from(geom.word_size))?,
            gsv,
            current_frame: 0,
            prev_bb: 0,
            pc: 0,
            asid: 0,
            taint_state_changed: false,
            tpc: FxHashMap::default(),
        })
    }

    pub fn geometry(&self) -> &ShadowGeometry {
        &self.geom
    }

    /// Drops every label in every space: teardown followed by
    /// re-initialization with the same geometry.
    pub fn clear(&mut self) -> Result<(), TaintError> {
        *self = Shadow::new(self.geom)?;
        Ok(())
    }

    fn resolve(&self, a: &Addr) -> Result<Option<Cell>, TaintError> {
        let off = u64::from(a.off);
        let cell = match a.kind {
            AddrKind::Haddr(ha) => Cell::Hd(ha + off),
            AddrKind::Maddr(ma) => Cell::Ram(ma + off),
            AddrKind::Iaddr(ia) => Cell::Io(ia + off),
            AddrKind::Paddr(pa) => Cell::Port(u64::from(pa) + off),
            AddrKind::Laddr(la) => {
                let frame = if a.flag == AddrFlag::FuncArg {
                    self.current_frame + 1
                } else {
                    self.current_frame
                };
                if frame >= FUNCTION_FRAMES {
                    return Err(TaintError::FrameOverflow {
                        frame,
                        limit: FUNCTION_FRAMES,
                    });
                }
                let base = (u64::from(frame) * self.geom.num_vals + la)
                    * u64::from(MAX_REG_SIZE);
                Cell::Llv(base + off)
            }
            AddrKind::Greg(gr) => Cell::Grv(gr * u64::from(self.geom.word_size) + off),
            AddrKind::Gspec(gs) => {
                // the special-register cell index is biased by the number
                // of general registers
                assert!(
                    gs >= self.geom.num_regs,
                    "special-register index {gs} below the register bias"
                );
                Cell::Gsv(gs - self.geom.num_regs + off)
            }
            AddrKind::Ret => Cell::Ret(off),
            AddrKind::Const => return Ok(None),
            AddrKind::Unk => return Err(TaintError::UnresolvedAddr),
        };
        Ok(Some(cell))
    }

    fn gsv(&self) -> &FastShad {
        self.gsv
            .as_ref()
            .unwrap_or_else(|| panic!("no special-register shadow configured"))
    }

    fn gsv_mut(&mut self) -> &mut FastShad {
        self.gsv
            .as_mut()
            .unwrap_or_else(|| panic!("no special-register shadow configured"))
    }

    fn get_cell(&self, cell: &Cell) -> Option<LabelSetRef> {
        match *cell {
            Cell::Hd(i) => self.hd.get(i),
            Cell::Ram(i) => self.ram.get(i),
            Cell::Io(i) => self.io.get(i),
            Cell::Port(i) => self.ports.get(i),
            Cell::Llv(i) => self.llv.get(i),
            Cell::Ret(i) => self.ret.get(i),
            Cell::Grv(i) => self.grv.get(i),
            Cell::Gsv(i) => self.gsv().get(i),
        }
    }

    fn set_cell(&mut self, cell: &Cell, set: Option<LabelSetRef>) -> bool {
        match *cell {
            Cell::Hd(i) => self.hd.set(i, set),
            Cell::Ram(i) => self.ram.set(i, set),
            Cell::Io(i) => self.io.set(i, set),
            Cell::Port(i) => self.ports.set(i, set),
            Cell::Llv(i) => self.llv.set(i, set),
            Cell::Ret(i) => self.ret.set(i, set),
            Cell::Grv(i) => self.grv.set(i, set),
            Cell::Gsv(i) => self.gsv_mut().set(i, set),
        }
    }

    /// The label set at `a`, or `None` when the cell is clean. Reads of
    /// `CONST` and `IRRELEVANT` addresses are always empty.
    pub fn query(&self, a: &Addr) -> Option<LabelSetRef> {
        if a.is_irrelevant() {
            return None;
        }
        match self.resolve(a) {
            Ok(Some(cell)) => self.get_cell(&cell),
            _ => None,
        }
    }

    pub fn query_tainted(&self, a: &Addr) -> bool {
        self.query(a).is_some()
    }

    /// Visits every label at `a` in pre-order.
    pub fn iterate(&self, a: &Addr, f: &mut dyn FnMut(Label)) {
        if let Some(set) = self.query(a) {
            set.iterate(f);
        }
    }

    fn put(&mut self, a: &Addr, set: Option<LabelSetRef>) -> Result<(), TaintError> {
        if a.is_irrelevant() {
            // writes to cells we are not tracking are dropped
            return Ok(());
        }
        if let Some(cell) = self.resolve(a)? {
            if self.set_cell(&cell, set) {
                self.taint_state_changed = true;
            }
        }
        Ok(())
    }

    /// `a ← a ∪ {l}`.
    pub fn label(&mut self, a: &Addr, l: Label) -> Result<(), TaintError> {
        let merged = label_set::union(self.query(a), Some(label_set::singleton(l)));
        self.put(a, merged)
    }

    /// Drops the cell at `a`. Deleting an `IRRELEVANT` address is a no-op.
    pub fn delete(&mut self, a: &Addr) -> Result<(), TaintError> {
        self.put(a, None)
    }

    /// Drops `len` consecutive cells starting at `a`.
    pub fn delete_range(&mut self, a: &Addr, len: u32) -> Result<(), TaintError> {
        let mut addr = *a;
        for _ in 0..len {
            self.delete(&addr)?;
            addr.advance();
        }
        Ok(())
    }

    /// `b ← a`. Copying *from* an `IRRELEVANT` address deletes the
    /// destination instead; copying *to* one is a no-op, as is a copy onto
    /// the same cell.
    pub fn copy(&mut self, a: &Addr, b: &Addr) -> Result<(), TaintError> {
        if a.is_irrelevant() {
            return self.delete(b);
        }
        if b.is_irrelevant() || a.same_cell(b) {
            return Ok(());
        }
        let set = self.query(a);
        self.put(b, set)
    }

    /// `c ← a ∪ b`.
    pub fn compute(&mut self, a: &Addr, b: &Addr, c: &Addr) -> Result<(), TaintError> {
        if c.is_irrelevant() {
            return Ok(());
        }
        let merged = label_set::union(self.query(a), self.query(b));
        self.put(c, merged)
    }

    // Tainted-PC bookkeeping (driven by the PC op when tainted-instruction
    // tracking is on).

    pub fn taint_state_changed(&self) -> bool {
        self.taint_state_changed
    }

    pub fn reset_taint_state_changed(&mut self) {
        self.taint_state_changed = false;
    }

    pub fn note_tainted_pc(&mut self) {
        self.tpc.entry(self.asid).or_default().insert(self.pc);
    }

    /// PCs under `asid` whose execution changed taint state.
    pub fn tainted_pcs(&self, asid: u64) -> Option<&FxHashSet<u64>> {
        self.tpc.get(&asid)
    }

    // Convenience entry points for the plumbing layer and tests.

    pub fn label_ram(&mut self, pa: u64, l: Label) -> Result<(), TaintError> {
        self.label(&Addr::maddr(pa), l)
    }

    pub fn delete_ram(&mut self, pa: u64) -> Result<(), TaintError> {
        self.delete(&Addr::maddr(pa))
    }

    /// Label-set cardinality at physical address `pa`, zero when clean.
    pub fn query_ram(&self, pa: u64) -> u32 {
        label_set::cardinality(self.query(&Addr::maddr(pa)).as_ref())
    }

    /// Label-set cardinality at byte `offset` of register `reg`.
    pub fn query_reg(&self, reg: u64, offset: u32) -> u32 {
        label_set::cardinality(self.query(&Addr::greg(reg).with_off(offset)).as_ref())
    }

    /// Visits the labels at physical address `pa`.
    pub fn iterate_ram(&self, pa: u64, f: &mut dyn FnMut(Label)) {
        self.iterate(&Addr::maddr(pa), f);
    }

    /// Visits the labels at byte `offset` of register `reg`.
    pub fn iterate_reg(&self, reg: u64, offset: u32, f: &mut dyn FnMut(Label)) {
        self.iterate(&Addr::greg(reg).with_off(offset), f);
    }

    /// Number of tainted RAM bytes.
    pub fn occ_ram(&self) -> u64 {
        self.ram.occupied()
    }
}
