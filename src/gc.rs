// Epoch based reclamation for memory unlinked from the map.
//
// * A shared `epoch` counter, starting from 1.
// * An access-log with one slot per map handle. A handle that is inside an
//   operation holds ``epoch | ENTER_MASK`` in its slot, an idle handle holds
//   a plain epoch value, and a free slot holds ZERO.
// * Memory displaced by a successful CAS is tagged with the epoch at which
//   it was unlinked, and the global epoch moves forward.
// * Tagged memory is freed once every handle inside an operation has entered
//   after that epoch.

use std::{
    mem,
    sync::{
        atomic::{AtomicPtr, AtomicU64, Ordering::SeqCst},
        Arc,
    },
};

use crate::{
    entry::{Entry, Value},
    map::Table,
};

pub const ENTER_MASK: u64 = 0x8000000000000000;
pub const EPOCH_MASK: u64 = 0x7FFFFFFFFFFFFFFF;

/// Guard marking a handle as inside an operation. Nested guards on the same
/// slot are no-ops, only the outer most guard leaves the epoch.
pub struct Epoch<'a> {
    epoch: &'a AtomicU64,
    at: &'a AtomicU64,
    nested: bool,
}

impl<'a> Epoch<'a> {
    pub fn new(epoch: &'a AtomicU64, at: &'a AtomicU64) -> Epoch<'a> {
        let nested = (at.load(SeqCst) & ENTER_MASK) != 0;
        if !nested {
            at.store(epoch.load(SeqCst) | ENTER_MASK, SeqCst);
        }
        Epoch { epoch, at, nested }
    }
}

impl<'a> Drop for Epoch<'a> {
    fn drop(&mut self) {
        if !self.nested {
            self.at.store(self.epoch.load(SeqCst), SeqCst);
        }
    }
}

/// Compute the epoch below which reclaimed memory can be freed.
pub fn gc_epoch(access_log: &[Arc<AtomicU64>], epoch: u64) -> u64 {
    let mut gc_epoch = u64::MAX;
    for at in access_log.iter() {
        let thread_epoch = at.load(SeqCst);
        let thread_epoch = if thread_epoch & ENTER_MASK == 0 {
            epoch
        } else {
            thread_epoch & EPOCH_MASK
        };
        gc_epoch = u64::min(gc_epoch, thread_epoch);
    }
    gc_epoch
}

pub enum Mem<K, V> {
    Entry(*mut Entry<K, V>),
    Value(*mut Value<V>),
    Table(*mut Table<K, V>),
}

enum OwnedMem<K, V> {
    Entry(Box<Entry<K, V>>),
    Value(Box<Value<V>>),
    Table(Box<Table<K, V>>),
}

impl<K, V> OwnedMem<K, V> {
    fn new_vec(mems: Vec<Mem<K, V>>) -> Vec<Self> {
        mems.into_iter()
            .map(|m| match m {
                Mem::Entry(ptr) => unsafe { OwnedMem::Entry(Box::from_raw(ptr)) },
                Mem::Value(ptr) => unsafe { OwnedMem::Value(Box::from_raw(ptr)) },
                Mem::Table(ptr) => unsafe { OwnedMem::Table(Box::from_raw(ptr)) },
            })
            .collect()
    }
}

struct Reclaim<K, V> {
    epoch: u64,
    items: Vec<OwnedMem<K, V>>,
}

/// CAS operation with memory book-keeping, one instance per map handle.
///
/// Before calling [Cas::swing], callers register memory that shall be
/// freed when the CAS succeeds (displaced by the new pointer) and memory
/// that shall be freed when the CAS fails (never published).
pub struct Cas<K, V> {
    reclaims: Vec<Reclaim<K, V>>,
    pass: Vec<Mem<K, V>>,
    fail: Vec<Mem<K, V>>,
}

// raw pointers in `pass` and `fail` are only held for the duration of a
// single swing, and point to memory owned by the map.
unsafe impl<K: Send, V: Send> Send for Cas<K, V> {}

impl<K, V> Cas<K, V> {
    pub fn new() -> Self {
        Cas {
            reclaims: Vec::default(),
            pass: Vec::default(),
            fail: Vec::default(),
        }
    }

    pub fn free_on_pass(&mut self, m: Mem<K, V>) {
        self.pass.push(m)
    }

    pub fn free_on_fail(&mut self, m: Mem<K, V>) {
        self.fail.push(m)
    }

    pub fn swing<T>(
        &mut self,
        epoch: &AtomicU64,
        loc: &AtomicPtr<T>,
        old: *mut T,
        new: *mut T,
    ) -> bool {
        let (pass, fail) = (mem::take(&mut self.pass), mem::take(&mut self.fail));

        match loc.compare_exchange(old, new, SeqCst, SeqCst) {
            Ok(_) if pass.is_empty() => true,
            Ok(_) => {
                // tag with the epoch in which the memory was unlinked.
                let epoch = epoch.fetch_add(1, SeqCst);
                let items = OwnedMem::new_vec(pass);
                self.reclaims.push(Reclaim { epoch, items });
                true
            }
            Err(_) => {
                mem::drop(OwnedMem::new_vec(fail));
                false
            }
        }
    }

    /// Free all memory unlinked before `gc_epoch`.
    pub fn garbage_collect(&mut self, gc_epoch: u64) {
        self.reclaims.retain(|r| r.epoch >= gc_epoch)
    }

    pub fn has_reclaims(&self) -> bool {
        !self.reclaims.is_empty()
    }

    pub fn to_pending(&self) -> usize {
        self.reclaims.iter().map(|r| r.items.len()).sum()
    }
}

#[cfg(test)]
#[path = "gc_test.rs"]
mod gc_test;
