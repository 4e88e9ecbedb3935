/// Guest virtual-to-physical translation, as the emulator's softmmu sees
/// it. Labeling works on physical bytes, so the labeling entry points
/// translate first; a miss means the page simply is not mapped right now.
pub trait AddressTranslate {
    fn virt_to_phys(&self, vaddr: u64) -> Option<u64>;
}

/// What little the core knows about a guest process. Filled in by an
/// [`OsIntrospection`] implementation living outside the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub ppid: u32,
    pub name: String,
    pub asid: u64,
}

/// OS-introspection queries the descriptor-tracking collaborator relies
/// on. The core only defines the surface; resolving ASIDs to processes
/// requires guest-OS knowledge the core deliberately does not have.
pub trait OsIntrospection<E> {
    /// The address-space identifier in effect at `pc`.
    fn asid_of(&self, env: &E, pc: u64) -> u64;
    fn find_process_by_asid(&self, asid: u64) -> Option<ProcessInfo>;
    fn find_process_by_pid(&self, pid: u32) -> Option<ProcessInfo>;
}

/// Hook points the core fires for the descriptor tracker, keyed on the
/// emulator's CPU-state type.
pub trait ProcessHooks<E> {
    /// Before every translation block executes.
    fn pre_execute(&mut self, env: &E, pc: u64);
    /// In the child, right after a fork returns.
    fn after_fork(&mut self, env: &E);
    /// In the child, right after a clone returns.
    fn after_clone(&mut self, env: &E, flags: u64);
}
