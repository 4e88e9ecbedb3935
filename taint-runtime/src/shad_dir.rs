use rustc_hash::FxHashMap;

use crate::label_set::LabelSetRef;

/// Sparse shadow directory for the address spaces that are far too large
/// (or too sparsely touched) for a dense array: hard-disk offsets, I/O
/// buffers, and guest ports.
#[derive(Default)]
pub struct ShadDir {
    map: FxHashMap<u64, LabelSetRef>,
}

impl ShadDir {
    pub fn new() -> ShadDir {
        ShadDir::default()
    }

    pub fn get(&self, addr: u64) -> Option<LabelSetRef> {
        self.map.get(&addr).cloned()
    }

    pub fn is_set(&self, addr: u64) -> bool {
        self.map.contains_key(&addr)
    }

    /// Returns true if the directory changed.
    pub fn set(&mut self, addr: u64, set: Option<LabelSetRef>) -> bool {
        match set {
            Some(s) => match self.map.insert(addr, s.clone()) {
                Some(old) => !std::rc::Rc::ptr_eq(&old, &s),
                None => true,
            },
            None => self.map.remove(&addr).is_some(),
        }
    }

    pub fn remove(&mut self, addr: u64) -> bool {
        self.map.remove(&addr).is_some()
    }

    /// Number of occupied cells.
    pub fn occupied(&self) -> u64 {
        self.map.len() as u64
    }
}
