//! Byte-granular taint tracking for a whole-system emulator.
//!
//! This crate is the run-time half of the taint engine: it owns the shadow
//! memory that parallels every address space the emulator manipulates
//! (guest RAM, I/O ports, hard-disk blocks, guest registers, and the IR
//! value space of translated code), and it interprets the taint-op programs
//! that the IR rewriting pass compiles for each translated block.
//!
//! The moving parts, leaves first:
//!
//! * [`label_set`]: persistent label sets with structural sharing, so that
//!   set union (the hot path) is O(1) and never mutates an existing set.
//! * [`Shadow`]: one shadow map per address space, addressed uniformly
//!   through [`Addr`].
//! * [`DynValBuffer`]: the dynamic value log filled in by instrumented
//!   loads, stores and branches while the translated code runs.
//! * [`TaintOpBuffer`]: the compiled taint program for one translated
//!   function.
//! * [`TaintRuntime`]: executes op buffers against the shadow, resolving
//!   `UNK` operands from the dynamic value log as it goes.
//!
//! Everything here runs on the single emulator thread; there is no locking
//! and none is needed.

mod addr;
mod callbacks;
mod dynlog;
mod error;
mod fast_shad;
pub mod label_set;
mod ops;
mod runtime;
mod shad_dir;
mod shadow;

pub use addr::{Addr, AddrFlag, AddrKind, FUNCTION_FRAMES, MAX_REG_SIZE};
pub use callbacks::TaintCallbacks;
pub use dynlog::{DynValBuffer, DynValEntry, MemAccessKind};
pub use error::TaintError;
pub use label_set::{Label, LabelSet, LabelSetRef};
pub use ops::{BlockSpan, InsnFixup, SelectCase, TaintOp, TaintOpBuffer};
pub use runtime::{BlockOutcome, LabelMode, TaintRuntime};
pub use shadow::{Shadow, ShadowGeometry};
