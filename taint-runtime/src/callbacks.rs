/// Called with `(pc, physical address)` right after the access happened.
pub type AccessCallback = Box<dyn FnMut(u64, u64)>;

/// Called immediately before / after one op buffer executes.
pub type BufferCallback = Box<dyn FnMut()>;

/// Subscriptions of external taint consumers.
///
/// Subscribers run synchronously on the emulator thread and must not reach
/// back into the shadow; they only observe.
#[derive(Default)]
pub struct TaintCallbacks {
    on_load: Vec<AccessCallback>,
    on_store: Vec<AccessCallback>,
    before_execute: Vec<BufferCallback>,
    after_execute: Vec<BufferCallback>,
}

impl TaintCallbacks {
    pub fn on_load(&mut self, cb: AccessCallback) {
        self.on_load.push(cb);
    }

    pub fn on_store(&mut self, cb: AccessCallback) {
        self.on_store.push(cb);
    }

    pub fn before_execute_taint_ops(&mut self, cb: BufferCallback) {
        self.before_execute.push(cb);
    }

    pub fn after_execute_taint_ops(&mut self, cb: BufferCallback) {
        self.after_execute.push(cb);
    }

    pub fn has_load_subscribers(&self) -> bool {
        !self.on_load.is_empty()
    }

    pub fn has_store_subscribers(&self) -> bool {
        !self.on_store.is_empty()
    }

    pub(crate) fn run_load(&mut self, pc: u64, addr: u64) {
        for cb in &mut self.on_load {
            cb(pc, addr);
        }
    }

    pub(crate) fn run_store(&mut self, pc: u64, addr: u64) {
        for cb in &mut self.on_store {
            cb(pc, addr);
        }
    }

    pub(crate) fn run_before(&mut self) {
        for cb in &mut self.before_execute {
            cb();
        }
    }

    pub(crate) fn run_after(&mut self) {
        for cb in &mut self.after_execute {
            cb();
        }
    }
}
