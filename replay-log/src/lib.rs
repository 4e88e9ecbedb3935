//! Deterministic record and replay of a whole guest machine.
//!
//! During a live run every source of non-determinism the emulator touches
//! (port reads, interrupt requests, DMA writes into guest RAM, memory
//! region registration) is recorded as one [`Entry`] keyed by the *program
//! point* at which it happened. A later replay run feeds the same values
//! back at exactly the same program points, so the guest re-executes
//! bit-identically and offline analyses can take as many passes as they
//! like.
//!
//! * [`ProgPoint`]: `(eip, ecx, instr_count)`, the replay clock.
//! * [`Entry`] / [`LogWriter`] / [`LogReader`]: the on-disk log and its
//!   little-endian codec.
//! * [`RrEngine`]: the record/replay state machine the emulator drives
//!   at every non-deterministic call site.
//! * [`RrControl`]: the only thing the monitor thread touches: four
//!   atomic request flags, serviced between translation blocks.

mod codec;
mod control;
mod engine;
mod entry;
mod error;
mod prog_point;

pub use codec::{LogReader, LogWriter};
pub use control::RrControl;
pub use engine::{PhysicalMemory, RrEngine, RrMode};
pub use entry::{Callsite, Entry, EntryKind, EntryVariant, SkippedCall};
pub use error::RrError;
pub use prog_point::{PointRelation, ProgPoint};
