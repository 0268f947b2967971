use std::{
    borrow::Borrow,
    convert::TryFrom,
    fmt, mem,
    marker::PhantomData,
    ptr,
    sync::{
        atomic::{AtomicBool, AtomicIsize, AtomicPtr, AtomicU64, AtomicUsize, Ordering::SeqCst},
        Arc, RwLock,
    },
    thread,
};

use crate::{
    entry::Entry,
    gc::{self, Cas, Epoch},
    hasher::KeyHash,
    Result,
};

/// Number of buckets in a map created with [Map::new].
pub const DEFAULT_CAPACITY: usize = 16;
/// Ratio of entries to buckets above which the bucket table doubles.
pub const DEFAULT_LOAD_FACTOR: f64 = 0.75;
/// Number of mutating operations between two garbage collection attempts.
pub const DEFAULT_GC_PERIOD: usize = 16;

/// Concurrent hash map, a handle to a bucket table shared by all clones.
///
/// Each thread is expected to use its own handle. Cloning a handle is
/// cheap, it registers a new slot in the map's access log, and dropping it
/// releases the slot after the handle's pending garbage is freed.
///
/// [Map::get] and other read APIs take `&self` and never block. [Map::put]
/// and [Map::remove] take `&mut self`, they never block except while the
/// bucket table is being resized.
pub struct Map<K, V> {
    root: Arc<Root<K, V>>,

    epoch: Arc<AtomicU64>,
    access_log: Arc<RwLock<Vec<Arc<AtomicU64>>>>,
    at: Arc<AtomicU64>,
    cas: Cas<K, V>,
    gc_period: usize,
    n_ops: usize,
}

struct Root<K, V> {
    table: AtomicPtr<Table<K, V>>,
    // advisory, adjusted next to chain mutations.
    size: AtomicIsize,
    load_factor: f64,
    // mutators inside a table mutation.
    writers: AtomicUsize,
    resizing: AtomicBool,

    _marker: PhantomData<(K, V)>,
}

/// Array of bucket slots, each slot is the head of an entry chain.
pub struct Table<K, V> {
    buckets: Vec<AtomicPtr<Entry<K, V>>>,
    next_capacity: usize,
}

/// Statistics gathered by [Map::validate].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Stats {
    /// Number of buckets.
    pub capacity: usize,
    /// Advisory entry count, as returned by [Map::size].
    pub size: usize,
    /// Number of live entries reachable from the table.
    pub n_entries: usize,
    /// Entries logically deleted but not yet unlinked from their chain.
    pub n_deleted: usize,
    /// Number of non-empty buckets.
    pub n_buckets: usize,
    /// Longest chain, counting deleted entries.
    pub max_chain: usize,
    /// Number of handles currently registered with the map.
    pub n_handles: usize,
    /// Memory items waiting to be freed by this handle.
    pub n_pending: usize,
}

struct Writer<'a> {
    writers: &'a AtomicUsize,
}

impl<'a> Drop for Writer<'a> {
    fn drop(&mut self) {
        self.writers.fetch_sub(1, SeqCst);
    }
}

struct Exclusive<'a> {
    resizing: &'a AtomicBool,
}

impl<'a> Drop for Exclusive<'a> {
    fn drop(&mut self) {
        self.resizing.store(false, SeqCst);
    }
}

impl<K, V> Drop for Table<K, V> {
    fn drop(&mut self) {
        for head in self.buckets.iter_mut() {
            let mut node_ptr = *head.get_mut();
            while !node_ptr.is_null() {
                let entry = unsafe { Box::from_raw(node_ptr) };
                node_ptr = entry.as_next_ptr();
            }
        }
    }
}

impl<K, V> Table<K, V> {
    fn new(capacity: usize) -> Table<K, V> {
        debug_assert!(capacity.is_power_of_two(), "capacity {}", capacity);

        let mut buckets = Vec::with_capacity(capacity);
        (0..capacity).for_each(|_| buckets.push(AtomicPtr::new(ptr::null_mut())));
        Table {
            buckets,
            next_capacity: capacity.saturating_mul(2),
        }
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    fn to_index(&self, hash: u32) -> usize {
        (hash as usize) & (self.capacity() - 1)
    }

    #[inline]
    fn to_bucket(&self, hash: u32) -> &AtomicPtr<Entry<K, V>> {
        &self.buckets[self.to_index(hash)]
    }

    /// Build a table with `next_capacity` buckets holding a copy of every
    /// live entry. Chain order is preserved. Return the new table and the
    /// number of entries copied.
    fn rehash(&self) -> (Table<K, V>, usize)
    where
        K: KeyHash + Clone,
        V: Clone,
    {
        let table = Table::new(self.next_capacity);
        let mut tails: Vec<*mut Entry<K, V>> = vec![ptr::null_mut(); table.capacity()];
        let mut count = 0;

        for head in self.buckets.iter() {
            for node in Entry::iter(head) {
                let value = match node.as_value() {
                    Some(value) => value.clone(),
                    None => continue,
                };
                let key = node.as_key();
                let n = table.to_index(key.key_hash());
                let entry = Box::into_raw(Entry::new(key.clone(), value, ptr::null_mut()));
                match unsafe { tails[n].as_ref() } {
                    Some(tail) => tail.set_next(entry),
                    None => table.buckets[n].store(entry, SeqCst),
                }
                tails[n] = entry;
                count += 1;
            }
        }

        (table, count)
    }
}

impl<K, V> Drop for Root<K, V> {
    fn drop(&mut self) {
        let table = *self.table.get_mut();
        mem::drop(unsafe { Box::from_raw(table) });
    }
}

impl<K, V> Root<K, V> {
    #[inline]
    fn as_table(&self) -> &Table<K, V> {
        unsafe { self.table.load(SeqCst).as_ref().unwrap() }
    }

    fn to_size(&self) -> usize {
        usize::try_from(self.size.load(SeqCst)).unwrap_or(0)
    }

    fn is_overloaded(&self, table: &Table<K, V>) -> bool {
        (self.to_size() as f64) / (table.capacity() as f64) > self.load_factor
    }

    // wait for an in-flight resize, then register as a table mutator.
    fn enter_writer(&self) -> Writer<'_> {
        loop {
            while self.resizing.load(SeqCst) {
                thread::yield_now();
            }
            self.writers.fetch_add(1, SeqCst);
            if !self.resizing.load(SeqCst) {
                break Writer {
                    writers: &self.writers,
                };
            }
            self.writers.fetch_sub(1, SeqCst);
        }
    }

    // double the bucket table, excluding all mutators for the duration.
    fn resize(&self, epoch: &AtomicU64, cas: &mut Cas<K, V>)
    where
        K: KeyHash + Clone,
        V: Clone,
    {
        if self.resizing.compare_exchange(false, true, SeqCst, SeqCst).is_err() {
            return; // some other handle is resizing.
        }
        let _exclusive = Exclusive {
            resizing: &self.resizing,
        };

        while self.writers.load(SeqCst) > 0 {
            thread::yield_now();
        }

        let old = self.table.load(SeqCst);
        let old_table = unsafe { old.as_ref().unwrap() };
        if !self.is_overloaded(old_table) {
            return; // resized by some other handle while we waited.
        }

        let (table, count) = old_table.rehash();
        let new = Box::into_raw(Box::new(table));

        cas.free_on_pass(gc::Mem::Table(old));
        cas.free_on_fail(gc::Mem::Table(new));
        if cas.swing(epoch, &self.table, old, new) {
            self.size.store(count as isize, SeqCst);
        }
    }
}

impl<K, V> Map<K, V>
where
    K: KeyHash + Eq + Clone,
    V: Clone,
{
    /// Create a new map with [DEFAULT_CAPACITY] buckets and
    /// [DEFAULT_LOAD_FACTOR].
    pub fn new() -> Map<K, V> {
        Map::from_root(DEFAULT_CAPACITY, DEFAULT_LOAD_FACTOR)
    }

    /// Create a new map with at least `capacity` buckets, rounded up to the
    /// next power of two.
    pub fn with_capacity(capacity: usize) -> Result<Map<K, V>> {
        Map::with_config(capacity, DEFAULT_LOAD_FACTOR)
    }

    /// Create a new map with at least `capacity` buckets, rounded up to the
    /// next power of two. The table is doubled when the ratio of entries
    /// to buckets crosses `load_factor`.
    pub fn with_config(capacity: usize, load_factor: f64) -> Result<Map<K, V>> {
        let capacity = match capacity {
            0 => err_at!(InvalidInput, msg: "capacity must be non-zero")?,
            n => match n.checked_next_power_of_two() {
                Some(capacity) => capacity,
                None => err_at!(InvalidInput, msg: "capacity {} too large", n)?,
            },
        };
        if !load_factor.is_finite() || load_factor <= 0.0 {
            err_at!(InvalidInput, msg: "invalid load factor {}", load_factor)?
        }

        Ok(Map::from_root(capacity, load_factor))
    }

    fn from_root(capacity: usize, load_factor: f64) -> Map<K, V> {
        let table = Box::new(Table::new(capacity));
        let root = Arc::new(Root {
            table: AtomicPtr::new(Box::leak(table)),
            size: AtomicIsize::new(0),
            load_factor,
            writers: AtomicUsize::new(0),
            resizing: AtomicBool::new(false),

            _marker: PhantomData,
        });

        let at = Arc::new(AtomicU64::new(1));
        Map {
            root,

            epoch: Arc::new(AtomicU64::new(1)),
            access_log: Arc::new(RwLock::new(vec![Arc::clone(&at)])),
            at,
            cas: Cas::new(),
            gc_period: DEFAULT_GC_PERIOD,
            n_ops: 0,
        }
    }

    /// Collect garbage once every `gc_period` mutating operations. ZERO and
    /// ONE collect after every operation.
    pub fn set_gc_period(&mut self, gc_period: usize) -> &mut Self {
        self.gc_period = gc_period;
        self
    }

    /// Insert or update `key`. Return the previous value if `key` was
    /// present. Trigger a resize when the map is over its load factor.
    pub fn put(&mut self, key: K, value: V) -> Option<V> {
        let res = {
            let root: &Root<K, V> = &self.root;
            let _epoch = Epoch::new(&self.epoch, &self.at);

            if root.is_overloaded(root.as_table()) {
                root.resize(&self.epoch, &mut self.cas);
            }

            let _writer = root.enter_writer();
            let head = root.as_table().to_bucket(key.key_hash());
            match Entry::set(head, key, value, &self.epoch, &mut self.cas) {
                None => {
                    root.size.fetch_add(1, SeqCst);
                    None
                }
                old_value => old_value,
            }
        };

        self.garbage_collect();
        res
    }

    /// Return a clone of the value for `key`, None if `key` is not present.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: KeyHash + Eq + ?Sized,
    {
        let _epoch = Epoch::new(&self.epoch, &self.at);
        let head = self.root.as_table().to_bucket(key.key_hash());
        Entry::get(head, key)
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: KeyHash + Eq + ?Sized,
    {
        self.get(key).is_some()
    }

    /// Remove `key`, return its value if it was present.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: KeyHash + Eq + ?Sized,
    {
        let res = {
            let root: &Root<K, V> = &self.root;
            let _epoch = Epoch::new(&self.epoch, &self.at);
            let _writer = root.enter_writer();

            let head = root.as_table().to_bucket(key.key_hash());
            match Entry::remove(head, key, &self.epoch, &mut self.cas) {
                Some(value) => {
                    root.size.fetch_sub(1, SeqCst);
                    Some(value)
                }
                None => None,
            }
        };

        self.garbage_collect();
        res
    }

    /// Remove `key`, return whether it was present.
    pub fn delete<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: KeyHash + Eq + ?Sized,
    {
        self.remove(key).is_some()
    }
}

impl<K, V> Map<K, V> {
    /// Return the number of entries. Under concurrent mutation this count
    /// is advisory and may lag behind the entries reachable in the table.
    pub fn size(&self) -> usize {
        self.root.to_size()
    }

    pub fn len(&self) -> usize {
        self.size()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Return the number of buckets in the current table.
    pub fn capacity(&self) -> usize {
        let _epoch = Epoch::new(&self.epoch, &self.at);
        self.root.as_table().capacity()
    }

    /// Render all reachable entries as ``{key: value, ...}``, in bucket order
    /// and chain order within a bucket. The order carries no meaning.
    pub fn debug_string(&self) -> String
    where
        K: fmt::Display,
        V: fmt::Display,
    {
        let _epoch = Epoch::new(&self.epoch, &self.at);
        let items: Vec<String> = self
            .root
            .as_table()
            .buckets
            .iter()
            .flat_map(|head| Entry::iter(head))
            .filter_map(|node| {
                let value = node.as_value()?;
                Some(format!("{}: {}", node.as_key(), value))
            })
            .collect();

        format!("{{{}}}", items.join(", "))
    }

    /// Walk the whole table, check its invariants and return statistics.
    ///
    /// * Capacity is a power of two.
    /// * Only deleted entries are frozen.
    /// * Every live entry sits in the bucket its hash points to.
    /// * No key has more than one live entry.
    pub fn validate(&self) -> Result<Stats>
    where
        K: KeyHash + Eq + fmt::Debug,
    {
        let _epoch = Epoch::new(&self.epoch, &self.at);
        let table = self.root.as_table();

        let capacity = table.capacity();
        if !capacity.is_power_of_two() {
            err_at!(Fatal, msg: "capacity {} not a power of two", capacity)?
        }

        let mut stats = Stats {
            capacity,
            size: self.size(),
            n_handles: {
                let access_log = self.access_log.read().expect("fail-lock");
                access_log.iter().filter(|at| at.load(SeqCst) != 0).count()
            },
            n_pending: self.cas.to_pending(),
            ..Stats::default()
        };

        for (n, head) in table.buckets.iter().enumerate() {
            let mut chain = 0;
            let mut keys: Vec<&K> = vec![];
            for node in Entry::iter(head) {
                chain += 1;
                if node.is_frozen() && !node.is_deleted() {
                    err_at!(Fatal, msg: "live key {:?} frozen in bucket {}", node.as_key(), n)?
                }
                if node.is_deleted() {
                    stats.n_deleted += 1;
                    continue;
                }
                let key = node.as_key();
                if table.to_index(key.key_hash()) != n {
                    err_at!(Fatal, msg: "key {:?} found in bucket {}", key, n)?
                }
                if keys.contains(&key) {
                    err_at!(Fatal, msg: "duplicate key {:?} in bucket {}", key, n)?
                }
                keys.push(key);
                stats.n_entries += 1;
            }
            stats.n_buckets += if chain > 0 { 1 } else { 0 };
            stats.max_chain = usize::max(stats.max_chain, chain);
        }

        Ok(stats)
    }

    fn garbage_collect(&mut self) {
        self.n_ops = self.n_ops.wrapping_add(1);
        if !self.cas.has_reclaims() {
            return;
        } else if self.gc_period > 1 && (self.n_ops % self.gc_period) != 0 {
            return;
        }

        let epoch = self.epoch.load(SeqCst);
        let gc_epoch = {
            let access_log = self.access_log.read().expect("fail-lock");
            gc::gc_epoch(&access_log, epoch)
        };
        self.cas.garbage_collect(gc_epoch)
    }
}

impl<K, V> Clone for Map<K, V> {
    fn clone(&self) -> Map<K, V> {
        let at = {
            let mut access_log = self.access_log.write().expect("fail-lock");
            let epoch = self.epoch.load(SeqCst);
            // reuse slots released by dropped handles.
            match access_log.iter().find(|at| at.load(SeqCst) == 0) {
                Some(at) => {
                    at.store(epoch, SeqCst);
                    Arc::clone(at)
                }
                None => {
                    let at = Arc::new(AtomicU64::new(epoch));
                    access_log.push(Arc::clone(&at));
                    at
                }
            }
        };

        Map {
            root: Arc::clone(&self.root),

            epoch: Arc::clone(&self.epoch),
            access_log: Arc::clone(&self.access_log),
            at,
            cas: Cas::new(),
            gc_period: self.gc_period,
            n_ops: 0,
        }
    }
}

impl<K, V> Drop for Map<K, V> {
    fn drop(&mut self) {
        // release the slot, memory reclaimed by this handle is freed once
        // every other handle has moved past it.
        self.at.store(0, SeqCst);

        while self.cas.has_reclaims() {
            let epoch = self.epoch.load(SeqCst);
            let gc_epoch = {
                let access_log = self.access_log.read().expect("fail-lock");
                gc::gc_epoch(&access_log, epoch)
            };
            self.cas.garbage_collect(gc_epoch);
            if self.cas.has_reclaims() {
                thread::yield_now();
            }
        }
    }
}

impl<K, V> fmt::Display for Map<K, V>
where
    K: fmt::Display,
    V: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.debug_string())
    }
}

impl<K, V> fmt::Debug for Map<K, V>
where
    K: fmt::Debug,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let _epoch = Epoch::new(&self.epoch, &self.at);
        let entries = self
            .root
            .as_table()
            .buckets
            .iter()
            .flat_map(|head| Entry::iter(head))
            .filter_map(|node| Some((node.as_key(), node.as_value()?)));
        f.debug_map().entries(entries).finish()
    }
}

#[cfg(test)]
#[path = "map_test.rs"]
mod map_test;

#[cfg(test)]
#[path = "dash_test.rs"]
mod dash_test;
