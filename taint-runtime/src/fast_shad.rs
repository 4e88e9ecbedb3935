use std::io;
use std::mem;
use std::ptr;
use std::rc::Rc;

use log::{debug, warn};

use crate::error::TaintError;
use crate::label_set::{LabelSet, LabelSetRef};

/// Geometries at or above this many bytes skip the allocator and get their
/// own anonymous mapping.
const MMAP_THRESHOLD_BYTES: u64 = 16 << 20;

/// Mapped regions are placed at multiples of this base so they stay far
/// away from everything the allocator hands out.
const MAP_BASE_ALIGN: u64 = 1 << 40;

/// How many successively higher fixed bases to try before giving up.
const MAP_ATTEMPTS: u64 = 8;

#[cfg(target_os = "linux")]
const MAP_HUGE: libc::c_int = libc::MAP_HUGETLB;
#[cfg(not(target_os = "linux"))]
const MAP_HUGE: libc::c_int = 0;

/// A dense shadow array: one optional label-set reference per byte cell.
///
/// Cells are stored as raw `*const LabelSet` so that a zeroed backing
/// region is a valid all-empty array; the reference-count protocol is
/// explicit (`set` takes a reference, overwrite and removal release one).
/// Small geometries live on the heap; large ones in a fixed-address
/// anonymous mapping, huge pages preferred. The release path is keyed on
/// the allocation size: only mapped regions are unmapped.
pub struct FastShad {
    cells: Cells,
    len: u64,
    occupied: u64,
}

enum Cells {
    Heap(Vec<*const LabelSet>),
    Mapped {
        base: *mut *const LabelSet,
        bytes: usize,
    },
}

impl FastShad {
    pub fn new(len: u64) -> Result<FastShad, TaintError> {
        let bytes = len
            .checked_mul(mem::size_of::<*const LabelSet>() as u64)
            .expect("shadow geometry overflows the address space");
        let cells = if bytes < MMAP_THRESHOLD_BYTES {
            Cells::Heap(vec![ptr::null(); len as usize])
        } else {
            let base = map_fixed(bytes as usize)
                .map_err(|source| TaintError::Alloc { bytes, source })?;
            Cells::Mapped {
                base: base.cast(),
                bytes: bytes as usize,
            }
        };
        Ok(FastShad {
            cells,
            len,
            occupied: 0,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of cells currently holding a non-empty set.
    pub fn occupied(&self) -> u64 {
        self.occupied
    }

    fn load(&self, idx: u64) -> *const LabelSet {
        assert!(idx < self.len, "shadow index {idx} out of range {}", self.len);
        match &self.cells {
            Cells::Heap(v) => v[idx as usize],
            Cells::Mapped { base, .. } => unsafe { *base.add(idx as usize) },
        }
    }

    fn store(&mut self, idx: u64, p: *const LabelSet) -> *const LabelSet {
        assert!(idx < self.len, "shadow index {idx} out of range {}", self.len);
        match &mut self.cells {
            Cells::Heap(v) => mem::replace(&mut v[idx as usize], p),
            Cells::Mapped { base, .. } => unsafe {
                let slot = base.add(idx as usize);
                slot.replace(p)
            },
        }
    }

    /// Reads the set at `idx`, taking a new reference for the caller.
    pub fn get(&self, idx: u64) -> Option<LabelSetRef> {
        let p = self.load(idx);
        if p.is_null() {
            None
        } else {
            unsafe {
                Rc::increment_strong_count(p);
                Some(Rc::from_raw(p))
            }
        }
    }

    pub fn is_set(&self, idx: u64) -> bool {
        !self.load(idx).is_null()
    }

    /// Stores `set` at `idx`, releasing whatever reference the cell held.
    /// Returns true if the cell changed, i.e. if taint state moved.
    pub fn set(&mut self, idx: u64, set: Option<LabelSetRef>) -> bool {
        let new = match set {
            Some(rc) => Rc::into_raw(rc),
            None => ptr::null(),
        };
        let old = self.store(idx, new);
        match (old.is_null(), new.is_null()) {
            (true, false) => self.occupied += 1,
            (false, true) => self.occupied -= 1,
            _ => {}
        }
        if !old.is_null() {
            unsafe { drop(Rc::from_raw(old)) };
        }
        !ptr::eq(old, new)
    }

    pub fn remove(&mut self, idx: u64) -> bool {
        self.set(idx, None)
    }

    /// Clears `len` consecutive cells starting at `start`.
    pub fn clear_range(&mut self, start: u64, len: u64) {
        for idx in start..start + len {
            self.remove(idx);
        }
    }
}

impl Drop for FastShad {
    fn drop(&mut self) {
        for idx in 0..self.len {
            let old = self.store(idx, ptr::null());
            if !old.is_null() {
                unsafe { drop(Rc::from_raw(old)) };
            }
        }
        if let Cells::Mapped { base, bytes } = self.cells {
            let rc = unsafe { libc::munmap(base.cast(), bytes) };
            if rc != 0 {
                warn!(
                    "munmap of {} byte shadow region failed: {}",
                    bytes,
                    io::Error::last_os_error()
                );
            }
        }
    }
}

/// Maps `bytes` of zeroed anonymous memory at a fixed high address,
/// preferring huge pages and falling back to normal pages, shifting the
/// base upward on failure.
fn map_fixed(bytes: usize) -> io::Result<*mut u8> {
    let mut base = 0u64;
    loop {
        base += MAP_BASE_ALIGN;
        debug!("mapping {bytes} byte shadow region at {base:#x}");
        for extra in [MAP_HUGE, 0] {
            let p = unsafe {
                libc::mmap(
                    base as *mut libc::c_void,
                    bytes,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED | extra,
                    -1,
                    0,
                )
            };
            if p != libc::MAP_FAILED {
                return Ok(p.cast());
            }
            if extra != 0 {
                debug!("huge-page mapping at {base:#x} failed, retrying with normal pages");
            }
        }
        if base > MAP_BASE_ALIGN * MAP_ATTEMPTS {
            return Err(io::Error::last_os_error());
        }
    }
}
