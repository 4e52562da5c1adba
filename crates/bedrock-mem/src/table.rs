//! Open-addressing hash table with double hashing.
//!
//! Slots live in one power-of-two array obtained from the table's
//! [`Allocator`]. Each slot stores the key's hash next to the key and
//! value; a stored hash of `0` marks the slot empty, so user hashes are
//! coerced to at least `1`. Zeroed memory from the allocator is therefore
//! an empty table.
//!
//! Probing steps through `index = (index + step) & mask`, starting from
//! the hash itself, with `step = (hash >> (64 - exponent)) | 1`. The step
//! is odd, so the sequence visits every slot of the table. The array
//! doubles whenever an insertion would take the occupancy past
//! [`MAX_LOAD_FACTOR`].
//!
//! # Split lookup
//!
//! [`HashTable::probe`] locates the slot for a key (growing first when
//! needed) and [`HashTable::insert_at`] fills it without hashing again.
//! The [`SlotIndex`] carries the table epoch it was issued under; any
//! mutation in between makes it stale, and using a stale index is fatal.
//!
//! ```
//! use bedrock_mem::table::{HashTable, Probe};
//!
//! let mut table = HashTable::new();
//! assert!(table.insert("alpha", 1).is_some());
//! assert!(table.insert("alpha", 2).is_none());
//! assert_eq!(table.find("alpha"), Some(&1));
//!
//! match table.probe("beta") {
//!     Probe::Found(_) => unreachable!(),
//!     Probe::Vacant(slot) => *table.insert_at(slot, "beta", 10) += 1,
//! }
//! assert_eq!(table.find("beta"), Some(&11));
//! ```

use std::borrow::Borrow;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};

use bedrock_log::{debug, trace};
use fxhash::FxBuildHasher;

use crate::allocator::Allocator;
use crate::fatal::fatal;

/// Exponent a table is created with on its first write.
pub const DEFAULT_EXPONENT: u32 = 6;

/// Occupancy at which the table doubles.
pub const MAX_LOAD_FACTOR: f64 = 0.6;

/// Source of table epochs. Unique across tables so a [`SlotIndex`] from
/// one table is stale in every other.
static EPOCH: AtomicU64 = AtomicU64::new(1);

fn next_epoch() -> u64 {
    EPOCH.fetch_add(1, Ordering::Relaxed)
}

struct Slot<K, V> {
    /// `0` when the slot is empty.
    hash: u64,
    key: MaybeUninit<K>,
    value: MaybeUninit<V>,
}

/// A slot located by [`HashTable::probe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotIndex {
    index: usize,
    hash: u64,
    epoch: u64,
}

impl SlotIndex {
    /// Position of the slot in the table's array.
    #[must_use]
    pub fn index(self) -> usize {
        self.index
    }
}

/// Result of [`HashTable::probe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// The key is present in this slot.
    Found(SlotIndex),
    /// The key is absent; this empty slot is where it belongs.
    Vacant(SlotIndex),
}

/// An open-addressing hash table.
pub struct HashTable<'a, K, V, S = FxBuildHasher> {
    slots: NonNull<Slot<K, V>>,
    /// Slot count, `0` while uninitialized, otherwise `1 << exponent`.
    cap: usize,
    exponent: u32,
    used: usize,
    epoch: u64,
    allocator: Allocator<'a>,
    hash_builder: S,
    _marker: PhantomData<(K, V)>,
}

impl<K, V> HashTable<'static, K, V> {
    /// Creates an uninitialized table on the default allocator.
    #[must_use]
    pub fn new() -> Self {
        Self::with_hasher_in(FxBuildHasher::default(), Allocator::UNSET)
    }
}

impl<K, V> Default for HashTable<'static, K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, K, V> HashTable<'a, K, V> {
    /// Creates an uninitialized table bound to `allocator`. Allocates nothing.
    #[must_use]
    pub fn new_in(allocator: Allocator<'a>) -> Self {
        Self::with_hasher_in(FxBuildHasher::default(), allocator)
    }

    /// Creates a table of `1 << exponent` slots.
    #[must_use]
    pub fn with_exponent_in(exponent: u32, allocator: Allocator<'a>) -> Self {
        let mut table = Self::new_in(allocator);
        table.init(exponent, allocator);
        table
    }
}

impl<'a, K, V, S> HashTable<'a, K, V, S> {
    /// Creates an uninitialized table hashing with `hash_builder`.
    #[must_use]
    pub fn with_hasher_in(hash_builder: S, allocator: Allocator<'a>) -> Self {
        Self {
            slots: NonNull::dangling(),
            cap: 0,
            exponent: 0,
            used: 0,
            epoch: next_epoch(),
            allocator,
            hash_builder,
            _marker: PhantomData,
        }
    }

    /// Drops every entry and allocates an empty array of `1 << exponent` slots.
    ///
    /// The previous array is freed under the allocator that provided it.
    pub fn init(&mut self, exponent: u32, allocator: Allocator<'a>) {
        self.destroy();
        self.allocator = allocator;
        let cap = slot_count(exponent);
        self.slots = self.allocator.allocate_array(cap);
        self.cap = cap;
        self.exponent = exponent;
        debug!("hash table initialized with {cap} slots");
    }

    /// Drops every entry and frees the array. Calling it twice is harmless.
    pub fn destroy(&mut self) {
        if self.cap == 0 {
            return;
        }
        self.drop_entries();
        // SAFETY: `slots` holds `cap` slots allocated by `self.allocator`.
        unsafe { self.allocator.deallocate_array(self.slots, self.cap) };
        self.slots = NonNull::dangling();
        self.cap = 0;
        self.exponent = 0;
        self.used = 0;
        self.epoch = next_epoch();
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.used
    }

    /// Returns true if the table holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Number of slots; `0` while uninitialized.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Log2 of the slot count.
    #[must_use]
    pub fn exponent(&self) -> u32 {
        self.exponent
    }

    /// Entry count the table holds before the next insertion doubles it.
    #[must_use]
    pub fn max_load(&self) -> usize {
        max_load(self.cap)
    }

    /// The allocator the slot array comes from.
    #[must_use]
    pub fn allocator(&self) -> Allocator<'a> {
        self.allocator
    }

    /// The table's hasher.
    #[must_use]
    pub fn hasher(&self) -> &S {
        &self.hash_builder
    }

    /// Iterates over entries in slot order.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            slots: self.slots().iter(),
            remaining: self.used,
        }
    }

    /// Iterates over entries with mutable values.
    pub fn iter_mut(&mut self) -> IterMut<'_, K, V> {
        let remaining = self.used;
        IterMut {
            slots: self.slots_mut().iter_mut(),
            remaining,
        }
    }

    /// Iterates over keys.
    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.iter().map(|(key, _)| key)
    }

    /// Iterates over values.
    pub fn values(&self) -> impl Iterator<Item = &V> + '_ {
        self.iter().map(|(_, value)| value)
    }

    fn slots(&self) -> &[Slot<K, V>] {
        // SAFETY: `slots` holds `cap` slots whose hashes are initialized
        // (zeroed when empty); with `cap == 0` the slice is empty.
        unsafe { slice::from_raw_parts(self.slots.as_ptr(), self.cap) }
    }

    fn slots_mut(&mut self) -> &mut [Slot<K, V>] {
        // SAFETY: as in `slots`, with unique access.
        unsafe { slice::from_raw_parts_mut(self.slots.as_ptr(), self.cap) }
    }

    fn drop_entries(&mut self) {
        for slot in self.slots_mut() {
            if slot.hash != 0 {
                slot.hash = 0;
                // SAFETY: an occupied slot holds an initialized key and value.
                unsafe {
                    slot.key.assume_init_drop();
                    slot.value.assume_init_drop();
                }
            }
        }
        self.used = 0;
    }

    /// First empty slot on the probe sequence of `hash`.
    fn vacant_index(&self, hash: u64) -> usize {
        let slots = self.slots();
        let mask = self.cap - 1;
        let step = probe_step(hash, self.exponent);
        let mut index = hash as usize;
        loop {
            index = index.wrapping_add(step) & mask;
            if slots[index].hash == 0 {
                return index;
            }
        }
    }

    /// Moves every entry into a fresh array of `1 << exponent` slots.
    fn rehash(&mut self, exponent: u32) {
        let old_slots = self.slots;
        let old_cap = self.cap;
        let cap = slot_count(exponent);

        self.slots = self.allocator.allocate_array(cap);
        self.cap = cap;
        self.exponent = exponent;
        for i in 0..old_cap {
            // SAFETY: `i < old_cap`; the old array is still allocated.
            let old = unsafe { old_slots.as_ptr().add(i) };
            // SAFETY: the hash field of every slot is initialized.
            let hash = unsafe { (*old).hash };
            if hash != 0 {
                let index = self.vacant_index(hash);
                // SAFETY: the entry moves bitwise into an empty slot of the
                // new array; the old array is freed without dropping it.
                unsafe { ptr::copy_nonoverlapping(old, self.slots.as_ptr().add(index), 1) };
            }
        }
        if old_cap > 0 {
            // SAFETY: the old array came from `self.allocator` with `old_cap` slots.
            unsafe { self.allocator.deallocate_array(old_slots, old_cap) };
        }
        self.epoch = next_epoch();
        trace!("hash table rehashed into {cap} slots");
    }
}

impl<K, V, S> HashTable<'_, K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// Returns the value stored for `key`. Never changes the table.
    #[must_use]
    pub fn find<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let index = self.lookup(key)?;
        // SAFETY: `lookup` only returns occupied slots.
        Some(unsafe { self.slots()[index].value.assume_init_ref() })
    }

    /// Returns the value stored for `key`, mutably.
    #[must_use]
    pub fn find_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let index = self.lookup(key)?;
        // SAFETY: `lookup` only returns occupied slots.
        Some(unsafe { self.slots_mut()[index].value.assume_init_mut() })
    }

    /// Returns true if `key` is present.
    #[must_use]
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.lookup(key).is_some()
    }

    /// Locates the slot for `key`, initializing or growing the table first
    /// if one more entry would exceed the load limit.
    pub fn probe<Q>(&mut self, key: &Q) -> Probe
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.reserve_one();
        let hash = self.hash_of(key);
        let epoch = self.epoch;
        match self.search(hash, key) {
            Ok(index) => Probe::Found(SlotIndex { index, hash, epoch }),
            Err(index) => Probe::Vacant(SlotIndex { index, hash, epoch }),
        }
    }

    /// Writes `key` and `value` into a slot returned by [`HashTable::probe`].
    ///
    /// An occupied slot has its entry replaced. A slot index issued before
    /// any later mutation of this table, or by another table, is fatal.
    pub fn insert_at(&mut self, slot: SlotIndex, key: K, value: V) -> &mut V {
        if slot.epoch != self.epoch || slot.index >= self.cap {
            fatal("Stale hash table slot index.");
        }
        let hash = slot.hash;
        let occupied = {
            let target = &mut self.slots_mut()[slot.index];
            let occupied = target.hash != 0;
            if occupied {
                // SAFETY: the slot is occupied.
                unsafe {
                    target.key.assume_init_drop();
                    target.value.assume_init_drop();
                }
            }
            target.hash = hash;
            target.key.write(key);
            target.value.write(value);
            occupied
        };
        if !occupied {
            self.used += 1;
        }
        self.epoch = next_epoch();
        // SAFETY: the value was just written.
        unsafe { self.slots_mut()[slot.index].value.assume_init_mut() }
    }

    /// Inserts `key` if it is absent.
    ///
    /// Returns the new value, or `None` when the key already exists; the
    /// stored value is left untouched in that case.
    pub fn insert(&mut self, key: K, value: V) -> Option<&mut V> {
        match self.probe(&key) {
            Probe::Found(_) => None,
            Probe::Vacant(slot) => Some(self.insert_at(slot, key, value)),
        }
    }

    /// Returns the value for `key`, inserting `V::default()` first if absent.
    pub fn upsert(&mut self, key: K) -> &mut V
    where
        V: Default,
    {
        self.upsert_with(key, V::default)
    }

    /// Returns the value for `key`, inserting `make()` first if absent.
    pub fn upsert_with(&mut self, key: K, make: impl FnOnce() -> V) -> &mut V {
        match self.probe(&key) {
            Probe::Found(slot) => {
                // SAFETY: `probe` found the key in this slot.
                unsafe { self.slots_mut()[slot.index].value.assume_init_mut() }
            }
            Probe::Vacant(slot) => self.insert_at(slot, key, make()),
        }
    }

    /// Doubles the slot array and reinserts every entry.
    ///
    /// An uninitialized table is initialized at [`DEFAULT_EXPONENT`].
    pub fn grow(&mut self) {
        let exponent = if self.cap == 0 {
            DEFAULT_EXPONENT
        } else {
            self.exponent + 1
        };
        debug!(
            "hash table growing from {} to {} slots ({} entries)",
            self.cap,
            slot_count(exponent),
            self.used
        );
        self.rehash(exponent);
    }

    fn reserve_one(&mut self) {
        while self.cap == 0 || self.used + 1 > self.max_load() {
            self.grow();
        }
    }

    fn hash_of<Q: Hash + ?Sized>(&self, key: &Q) -> u64 {
        self.hash_builder.hash_one(key).max(1)
    }

    fn lookup<Q>(&self, key: &Q) -> Option<usize>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if self.cap == 0 {
            return None;
        }
        self.search(self.hash_of(key), key).ok()
    }

    /// Walks the probe sequence of `hash`: `Ok` with the slot holding
    /// `key`, or `Err` with the first empty slot.
    fn search<Q>(&self, hash: u64, key: &Q) -> Result<usize, usize>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let slots = self.slots();
        let mask = self.cap - 1;
        let step = probe_step(hash, self.exponent);
        let mut index = hash as usize;
        loop {
            index = index.wrapping_add(step) & mask;
            let slot = &slots[index];
            if slot.hash == 0 {
                return Err(index);
            }
            // SAFETY: the slot is occupied.
            if slot.hash == hash && unsafe { slot.key.assume_init_ref() }.borrow() == key {
                return Ok(index);
            }
        }
    }
}

/// Odd step derived from the top `exponent` bits of `hash`.
fn probe_step(hash: u64, exponent: u32) -> usize {
    (hash.checked_shr(64 - exponent).unwrap_or(0) | 1) as usize
}

fn slot_count(exponent: u32) -> usize {
    match 1usize.checked_shl(exponent) {
        Some(cap) if exponent < usize::BITS - 1 => cap,
        _ => fatal("Hash table exponent too large."),
    }
}

/// `floor(capacity * MAX_LOAD_FACTOR)`.
fn max_load(capacity: usize) -> usize {
    capacity / 5 * 3 + capacity % 5 * 3 / 5
}

impl<K, V, S> Drop for HashTable<'_, K, V, S> {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl<K: fmt::Debug, V: fmt::Debug, S> fmt::Debug for HashTable<'_, K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V, S> Extend<(K, V)> for HashTable<'_, K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// Inserts every pair, replacing the values of keys already present.
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (key, value) in iter {
            let slot = match self.probe(&key) {
                Probe::Found(slot) | Probe::Vacant(slot) => slot,
            };
            self.insert_at(slot, key, value);
        }
    }
}

impl<K, V, S> FromIterator<(K, V)> for HashTable<'static, K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher + Default,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut table = HashTable::with_hasher_in(S::default(), Allocator::UNSET);
        table.extend(iter);
        table
    }
}

impl<'t, K, V, S> IntoIterator for &'t HashTable<'_, K, V, S> {
    type Item = (&'t K, &'t V);
    type IntoIter = Iter<'t, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'t, K, V, S> IntoIterator for &'t mut HashTable<'_, K, V, S> {
    type Item = (&'t K, &'t mut V);
    type IntoIter = IterMut<'t, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter_mut()
    }
}

/// Iterator over the entries of a [`HashTable`].
pub struct Iter<'t, K, V> {
    slots: slice::Iter<'t, Slot<K, V>>,
    remaining: usize,
}

impl<'t, K, V> Iterator for Iter<'t, K, V> {
    type Item = (&'t K, &'t V);

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.slots.find(|slot| slot.hash != 0)?;
        self.remaining -= 1;
        // SAFETY: the slot is occupied.
        Some(unsafe { (slot.key.assume_init_ref(), slot.value.assume_init_ref()) })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<K, V> ExactSizeIterator for Iter<'_, K, V> {}

/// Iterator over the entries of a [`HashTable`] with mutable values.
pub struct IterMut<'t, K, V> {
    slots: slice::IterMut<'t, Slot<K, V>>,
    remaining: usize,
}

impl<'t, K, V> Iterator for IterMut<'t, K, V> {
    type Item = (&'t K, &'t mut V);

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.slots.find(|slot| slot.hash != 0)?;
        self.remaining -= 1;
        // SAFETY: the slot is occupied.
        Some(unsafe { (slot.key.assume_init_ref(), slot.value.assume_init_mut()) })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<K, V> ExactSizeIterator for IterMut<'_, K, V> {}
