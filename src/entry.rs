use std::{
    borrow::Borrow,
    mem, ptr,
    sync::atomic::{AtomicPtr, AtomicU64, Ordering::SeqCst},
};

use crate::gc::{self, Cas};

/// Boxed value, aligned so that the lowest bit of its pointer is always
/// free to be used as deleted-mark, even for zero sized values.
#[repr(align(8))]
pub struct Value<V> {
    value: V,
}

/// Single node in a bucket chain.
///
/// * `key` is never mutated once the entry is created.
/// * `value` is tagged once the entry is logically deleted, after that it is
///   never swung again.
/// * `next` is tagged, frozen, after `value` is tagged. A frozen entry can
///   only be unlinked from its parent.
pub struct Entry<K, V> {
    key: K,
    value: AtomicPtr<Value<V>>,
    next: AtomicPtr<Entry<K, V>>,
}

impl<K, V> Drop for Entry<K, V> {
    fn drop(&mut self) {
        // an entry owns its current value, successors are owned by the chain.
        let ptr = untag(*self.value.get_mut());
        if !ptr.is_null() {
            mem::drop(unsafe { Box::from_raw(ptr) })
        }
    }
}

pub enum Lookup<'a, K, V> {
    Found(&'a Entry<K, V>),
    // key not found, carry the chain's head as observed by the lookup.
    Absent(*mut Entry<K, V>),
}

impl<K, V> Entry<K, V> {
    pub fn new(key: K, value: V, next: *mut Entry<K, V>) -> Box<Entry<K, V>> {
        let value = Box::leak(Box::new(Value { value }));
        Box::new(Entry {
            key,
            value: AtomicPtr::new(value),
            next: AtomicPtr::new(next),
        })
    }

    /// Append `entry` as the successor of an unpublished entry.
    pub fn set_next(&self, entry: *mut Entry<K, V>) {
        self.next.store(entry, SeqCst)
    }

    #[inline]
    pub fn as_key(&self) -> &K {
        &self.key
    }

    #[inline]
    fn borrow_key<Q>(&self) -> &Q
    where
        K: Borrow<Q>,
        Q: ?Sized,
    {
        self.key.borrow()
    }

    /// Return the current value, None if the entry is logically deleted.
    #[inline]
    pub fn as_value(&self) -> Option<&V> {
        let ptr = self.value.load(SeqCst);
        if istagged(ptr) {
            None
        } else {
            unsafe { ptr.as_ref() }.map(|v| &v.value)
        }
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        istagged(self.value.load(SeqCst))
    }

    #[inline]
    pub fn is_frozen(&self) -> bool {
        istagged(self.next.load(SeqCst))
    }

    #[inline]
    pub fn as_next_ptr(&self) -> *mut Entry<K, V> {
        untag(self.next.load(SeqCst))
    }

    fn freeze(&self) {
        loop {
            let ptr = self.next.load(SeqCst);
            if istagged(ptr) {
                break;
            }
            if self.next.compare_exchange(ptr, tag(ptr), SeqCst, SeqCst).is_ok() {
                break;
            }
        }
    }
}

impl<K, V> Entry<K, V> {
    /// Iterate over every entry reachable from `head`, including logically
    /// deleted entries that are yet to be unlinked.
    pub fn iter(head: &AtomicPtr<Entry<K, V>>) -> Iter<'_, K, V> {
        Iter {
            node: head.load(SeqCst),
            _head: head,
        }
    }

    pub fn get<Q>(head: &AtomicPtr<Entry<K, V>>, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        V: Clone,
        Q: PartialEq + ?Sized,
    {
        Entry::iter(head)
            .filter(|node| node.borrow_key::<Q>() == key)
            .find_map(|node| node.as_value().cloned())
    }

    /// Insert or update `key`. Return the previous value if `key` was
    /// already present, None if a new entry was linked into the chain.
    pub fn set(
        head: &AtomicPtr<Entry<K, V>>,
        key: K,
        value: V,
        epoch: &AtomicU64,
        cas: &mut Cas<K, V>,
    ) -> Option<V>
    where
        K: PartialEq,
        V: Clone,
    {
        // unpublished until the CAS on head succeeds.
        let new: *mut Entry<K, V> = Box::into_raw(Entry::new(key, value, ptr::null_mut()));
        let new_ref = unsafe { new.as_ref().unwrap() };
        let new_value = new_ref.value.load(SeqCst);

        loop {
            match Entry::find(head, &new_ref.key, epoch, cas) {
                Lookup::Found(node) => {
                    let old = node.value.load(SeqCst);
                    if istagged(old) {
                        continue;
                    }
                    let old_value = unsafe { old.as_ref().unwrap() }.value.clone();
                    cas.free_on_pass(gc::Mem::Value(old));
                    if cas.swing(epoch, &node.value, old, new_value) {
                        // value is now owned by `node`, discard the shell.
                        let shell = unsafe { Box::from_raw(new) };
                        shell.value.store(ptr::null_mut(), SeqCst);
                        mem::drop(shell);
                        break Some(old_value);
                    }
                }
                Lookup::Absent(first) => {
                    new_ref.set_next(first);
                    if cas.swing(epoch, head, first, new) {
                        break None;
                    }
                }
            }
        }
    }

    /// Remove `key` from the chain. Return the removed value, None if `key`
    /// was not present.
    pub fn remove<Q>(
        head: &AtomicPtr<Entry<K, V>>,
        key: &Q,
        epoch: &AtomicU64,
        cas: &mut Cas<K, V>,
    ) -> Option<V>
    where
        K: Borrow<Q>,
        V: Clone,
        Q: PartialEq + ?Sized,
    {
        loop {
            match Entry::find(head, key, epoch, cas) {
                Lookup::Found(node) => {
                    let old = node.value.load(SeqCst);
                    if istagged(old) {
                        continue;
                    }
                    // logical delete, linearization point for remove.
                    if node
                        .value
                        .compare_exchange(old, tag(old), SeqCst, SeqCst)
                        .is_err()
                    {
                        continue;
                    }
                    let old_value = unsafe { old.as_ref().unwrap() }.value.clone();
                    node.freeze();
                    Entry::purge(head, epoch, cas);
                    break Some(old_value);
                }
                Lookup::Absent(_) => break None,
            }
        }
    }

    /// Locate the live entry for `key`, unlinking frozen entries on the way.
    fn find<'a, Q>(
        head: &'a AtomicPtr<Entry<K, V>>,
        key: &Q,
        epoch: &AtomicU64,
        cas: &mut Cas<K, V>,
    ) -> Lookup<'a, K, V>
    where
        K: Borrow<Q>,
        Q: PartialEq + ?Sized,
    {
        'retry: loop {
            let mut first = head.load(SeqCst);
            let mut parent: &'a AtomicPtr<Entry<K, V>> = head;
            let mut node_ptr = first;

            while let Some(node) = unsafe { node_ptr.as_ref() } {
                let next_ptr = node.next.load(SeqCst);
                if istagged(next_ptr) {
                    let next_ptr = untag(next_ptr);
                    cas.free_on_pass(gc::Mem::Entry(node_ptr));
                    if !cas.swing(epoch, parent, node_ptr, next_ptr) {
                        continue 'retry;
                    }
                    if ptr::eq(parent, head) {
                        first = next_ptr;
                    }
                    node_ptr = next_ptr;
                    continue;
                }

                if node.borrow_key::<Q>() == key && !node.is_deleted() {
                    break 'retry Lookup::Found(node);
                }
                parent = &node.next;
                node_ptr = next_ptr;
            }

            break Lookup::Absent(first);
        }
    }

    /// Unlink every frozen entry in the chain.
    fn purge(head: &AtomicPtr<Entry<K, V>>, epoch: &AtomicU64, cas: &mut Cas<K, V>) {
        'retry: loop {
            let mut parent = head;
            let mut node_ptr = head.load(SeqCst);

            while let Some(node) = unsafe { node_ptr.as_ref() } {
                let next_ptr = node.next.load(SeqCst);
                if istagged(next_ptr) {
                    let next_ptr = untag(next_ptr);
                    cas.free_on_pass(gc::Mem::Entry(node_ptr));
                    if !cas.swing(epoch, parent, node_ptr, next_ptr) {
                        continue 'retry;
                    }
                    node_ptr = next_ptr;
                    continue;
                }
                parent = &node.next;
                node_ptr = next_ptr;
            }

            break;
        }
    }
}

pub struct Iter<'a, K, V> {
    node: *mut Entry<K, V>,
    _head: &'a AtomicPtr<Entry<K, V>>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = &'a Entry<K, V>;

    fn next(&mut self) -> Option<Self::Item> {
        let node: &'a Entry<K, V> = unsafe { self.node.as_ref()? };
        self.node = node.as_next_ptr();
        Some(node)
    }
}

fn tag<T>(ptr: *mut T) -> *mut T {
    let ptr = ptr as usize;
    debug_assert!(ptr & 0x1 == 0, "unaligned pointer {:x}", ptr);
    (ptr | 0x1) as *mut T
}

fn untag<T>(ptr: *mut T) -> *mut T {
    let ptr = ptr as usize;
    (ptr & !1) as *mut T
}

fn istagged<T>(ptr: *mut T) -> bool {
    let ptr = ptr as usize;
    (ptr & 0x1) == 1
}

#[cfg(test)]
#[path = "entry_test.rs"]
mod entry_test;
