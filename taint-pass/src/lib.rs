//! The IR half of the taint engine.
//!
//! The emulator's code generator lowers each guest translation block to a
//! function in a small typed IR. This crate walks those functions and, per
//! instruction, compiles the taint-transfer ops the runtime will execute,
//! while inserting calls to the linked run-time helpers into the IR itself
//! so the instrumented module stays self-describing.
//!
//! * [`ir`]: the IR surface: modules, functions, blocks, and one
//!   [`ir::Instruction`] enum covering the opcodes the rewriter models,
//!   with insert-before/insert-after and metadata support.
//! * [`SlotTracker`]: dense numbering of arguments, blocks and values,
//!   stable for the duration of a pass; slot numbers are the LADDR
//!   coordinates in emitted ops.
//! * [`CpuStateLayout`]: byte layout of the emulator's CPU-state struct,
//!   used to statically resolve `inttoptr(add(env, offset))` accesses.
//! * [`TaintPass`]: the visitor. Running it twice is a no-op: rewritten
//!   functions are tagged with `tainted` metadata and skipped.

pub mod ir;

mod error;
mod helpers;
mod layout;
mod slots;
mod visitor;

pub use error::PassError;
pub use helpers::{link_runtime_ops, runtime_ops_module, HELPER_NAMES, TAINTED_MD};
pub use layout::CpuStateLayout;
pub use slots::SlotTracker;
pub use visitor::{PassOutput, TaintPass};
