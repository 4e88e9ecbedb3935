use crate::ir::{IrFunction, IrModule, IrType};

/// Metadata tag marking instrumentation the pass has already produced;
/// seeing it on a function's first instruction makes a second pass skip
/// the function entirely.
pub const TAINTED_MD: &str = "tainted";

/// The run-time helper surface the rewriter links into every module it
/// touches. Inserted calls name these; the compiled op buffers carry the
/// actual semantics.
pub const HELPER_NAMES: [&str; 13] = [
    "taint_copy",
    "taint_move",
    "taint_mix",
    "taint_mix_compute",
    "taint_parallel_compute",
    "taint_sext",
    "taint_select",
    "taint_host_copy",
    "taint_delete",
    "taint_push_frame",
    "taint_pop_frame",
    "taint_breadcrumb",
    "taint_memlog_pop",
];

/// The prebuilt module defining the run-time helpers, as declarations.
pub fn runtime_ops_module() -> IrModule {
    let mut module = IrModule::new();
    for name in HELPER_NAMES {
        module.add_function(IrFunction::new(name, Vec::new(), IrType::Void));
    }
    module
}

/// Links the helper declarations into `module`. Helpers already present
/// are left alone, so linking twice is harmless.
pub fn link_runtime_ops(module: &mut IrModule) {
    for helper in runtime_ops_module().functions {
        if !module.has_function(&helper.name) {
            module.add_function(helper);
        }
    }
}
