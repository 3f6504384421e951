//! Robin Hood shard: one open-addressed table, its writer lock, its size.
//!
//! Writers serialise on a per-shard TTAS lock and bracket every slot
//! mutation with the slot's sequence counter (odd while mid-mutation, even
//! when stable). Readers never take the lock: they snapshot a slot between
//! two sequence reads and restart the probe when the counter is odd or has
//! moved. A replaced table is handed to the epoch manager and freed only
//! once every pinned reader has moved on.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::mem::{self, MaybeUninit};
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::borrow::Borrow;

use petek::{EpochManager, RetiredNode, TTas};

use crate::util::{is_power_of_two, next_power_of_two};

/// Capacity floor for every table; also the post-`clear` capacity.
pub(crate) const DEFAULT_CAPACITY: usize = 16;

/// Probe distance that aborts an insertion and forces a doubling resize.
const MAX_DIST: u8 = 128;

/// Expand when an insert would push the load factor past this.
const MAX_LOAD_FACTOR: f64 = 0.75;

/// Candidate for shrinking once the load factor drops under this.
const SHRINK_LOAD_FACTOR: f64 = 0.15;

/// One bucket of the table.
///
/// `dist == 0` marks an empty slot, `dist == 1` the home position, and
/// `dist == k` an element displaced `k - 1` steps past its home. `hash`
/// caches the full key hash so probe loops reject on it before touching the
/// key and resize never rehashes.
struct Slot<K, V> {
    /// Sequence lock. Even: payload stable. Odd: writer mid-mutation.
    seq: AtomicU32,
    data: UnsafeCell<SlotData<K, V>>,
}

struct SlotData<K, V> {
    dist: u8,
    hash: u64,
    key: MaybeUninit<K>,
    value: MaybeUninit<V>,
}

impl<K, V> Slot<K, V> {
    fn empty() -> Self {
        Self {
            seq: AtomicU32::new(0),
            data: UnsafeCell::new(SlotData {
                dist: 0,
                hash: 0,
                key: MaybeUninit::uninit(),
                value: MaybeUninit::uninit(),
            }),
        }
    }

    /// Flip the sequence odd before mutating the payload.
    #[inline]
    fn seq_lock(&self) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Release);
    }

    /// Flip the sequence back to even once the payload is stable.
    #[inline]
    fn seq_unlock(&self) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Release);
    }
}

impl<K, V> Drop for Slot<K, V> {
    fn drop(&mut self) {
        let data = self.data.get_mut();
        if data.dist != 0 {
            // SAFETY: dist > 0 means key and value are initialized.
            unsafe {
                data.key.assume_init_drop();
                data.value.assume_init_drop();
            }
        }
    }
}

/// Heap-allocated power-of-two slot array.
///
/// Table identity is immutable: once a table is published in the shard's
/// pointer its slot array never moves. A resize fills a fresh table and
/// swaps the pointer, so the `RetiredNode` must stay the first field: the
/// whole table is handed to the epoch manager as-is on replacement.
#[repr(C)]
struct Table<K, V> {
    retired: RetiredNode,
    mask: u64,
    slots: Box<[Slot<K, V>]>,
}

impl<K, V> Table<K, V> {
    fn new(capacity: usize) -> Box<Self> {
        debug_assert!(is_power_of_two(capacity));
        Box::new(Self {
            retired: RetiredNode::new(),
            mask: capacity as u64 - 1,
            slots: (0..capacity).map(|_| Slot::empty()).collect(),
        })
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn slot(&self, pos: usize) -> &Slot<K, V> {
        // SAFETY: every caller masks pos with `mask`, which is capacity - 1.
        unsafe { self.slots.get_unchecked(pos) }
    }
}

/// Writer-only state living inside the shard's lock.
struct WriterState {
    /// Streak of erases that left the table under the shrink load.
    shrink_counter: usize,
}

/// One independently lockable Robin Hood table.
pub(crate) struct Shard<K, V> {
    table: AtomicPtr<Table<K, V>>,
    size: AtomicUsize,
    writer: TTas<WriterState>,
    marker: PhantomData<Box<Table<K, V>>>,
}

// SAFETY: slot payloads are only mutated under the writer lock inside
// sequence brackets; readers clone out of them and retry on any overlap.
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Shard<K, V> {}

impl<K, V> Shard<K, V> {
    pub(crate) fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let capacity = next_power_of_two(capacity.max(DEFAULT_CAPACITY));
        Self {
            table: AtomicPtr::new(Box::into_raw(Table::new(capacity))),
            size: AtomicUsize::new(0),
            writer: TTas::new(WriterState { shrink_counter: 0 }),
            marker: PhantomData,
        }
    }

    /// Live entries. Exact under this shard's writer lock, a consistent
    /// per-shard approximation otherwise.
    pub(crate) fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Current table capacity. The caller must hold an epoch guard.
    pub(crate) fn capacity(&self) -> usize {
        unsafe { &*self.table.load(Ordering::Acquire) }.capacity()
    }
}

impl<K, V> Drop for Shard<K, V> {
    fn drop(&mut self) {
        // SAFETY: exclusive access; the currently published table is owned
        // by the shard and was never retired.
        unsafe { drop(Box::from_raw(*self.table.get_mut())) };
    }
}

impl<K, V> Shard<K, V>
where
    K: Eq + Clone + 'static,
    V: Clone + 'static,
{
    /// Lock-free lookup.
    ///
    /// The caller must hold an epoch guard on the manager this shard retires
    /// its tables to; the guard keeps a concurrently replaced table alive
    /// for the whole probe.
    pub(crate) fn find<Q>(&self, hash: u64, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        'restart: loop {
            // SAFETY: guarded by the caller's pin; see above.
            let table = unsafe { &*self.table.load(Ordering::Acquire) };
            let mask = table.mask as usize;
            let mut pos = (hash & table.mask) as usize;
            let mut expected: u8 = 1;

            loop {
                let slot = table.slot(pos);
                let seq_before = slot.seq.load(Ordering::Acquire);
                if seq_before & 1 != 0 {
                    continue 'restart; // writer mid-mutation
                }

                // Snapshot between the two sequence reads. The clone may race
                // a writer; the re-read below rejects any snapshot taken
                // across a mutation before it is ever compared or returned.
                let data = slot.data.get();
                let dist = unsafe { (*data).dist };
                let slot_hash = unsafe { (*data).hash };
                let snapshot = if dist != 0 && dist == expected && slot_hash == hash {
                    // SAFETY: dist > 0 claims an initialized payload; a stale
                    // claim is caught by the sequence re-read.
                    unsafe {
                        Some((
                            (*data).key.assume_init_ref().clone(),
                            (*data).value.assume_init_ref().clone(),
                        ))
                    }
                } else {
                    None
                };

                if slot.seq.load(Ordering::Acquire) != seq_before {
                    continue 'restart; // slot changed under us
                }

                if dist == 0 {
                    return None;
                }
                if dist < expected {
                    // Robin Hood termination: a less-displaced element sits
                    // here, so our key cannot be further down the run.
                    return None;
                }
                if let Some((candidate, value)) = snapshot {
                    if candidate.borrow() == key {
                        return Some(value);
                    }
                }

                pos = (pos + 1) & mask;
                expected = expected.wrapping_add(1);
                if expected == 0 {
                    return None;
                }
            }
        }
    }

    pub(crate) fn contains<Q>(&self, hash: u64, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        self.find(hash, key).is_some()
    }

    /// Insert a new key. Returns false (dropping `key` and `value`) when the
    /// key is already present.
    pub(crate) fn insert(&self, hash: u64, key: K, value: V, epoch: &EpochManager) -> bool {
        let mut writer = self.writer.lock();

        {
            let table = unsafe { &*self.table.load(Ordering::Relaxed) };
            if self.find_pos(table, hash, &key).is_some() {
                return false;
            }
        }

        self.expand_for_insert(epoch);
        self.insert_new(hash, key, value, epoch);
        self.size.fetch_add(1, Ordering::Relaxed);
        writer.shrink_counter = 0;
        true
    }

    /// Insert or overwrite. Returns true when the key was newly inserted.
    pub(crate) fn insert_or_assign(
        &self,
        hash: u64,
        key: K,
        value: V,
        epoch: &EpochManager,
    ) -> bool {
        let mut writer = self.writer.lock();

        {
            let table = unsafe { &*self.table.load(Ordering::Relaxed) };
            if let Some(pos) = self.find_pos(table, hash, &key) {
                let slot = table.slot(pos);
                slot.seq_lock();
                // SAFETY: writer lock held; readers retry on the odd seq.
                let data = unsafe { &mut *slot.data.get() };
                unsafe { data.value.assume_init_drop() };
                data.value.write(value);
                slot.seq_unlock();
                return false;
            }
        }

        self.expand_for_insert(epoch);
        self.insert_new(hash, key, value, epoch);
        self.size.fetch_add(1, Ordering::Relaxed);
        writer.shrink_counter = 0;
        true
    }

    /// Value for `key`, inserting `value` first if the key is absent.
    pub(crate) fn get_or_insert(&self, hash: u64, key: K, value: V, epoch: &EpochManager) -> V {
        self.get_or_insert_with(hash, key, move || value, epoch)
    }

    /// Value for `key`, inserting `factory()` first if the key is absent.
    /// The factory runs under the shard's writer lock and at most once.
    pub(crate) fn get_or_insert_with<F>(
        &self,
        hash: u64,
        key: K,
        factory: F,
        epoch: &EpochManager,
    ) -> V
    where
        F: FnOnce() -> V,
    {
        let mut writer = self.writer.lock();

        {
            let table = unsafe { &*self.table.load(Ordering::Relaxed) };
            if let Some(pos) = self.find_pos(table, hash, &key) {
                // SAFETY: under the writer lock a plain read is stable.
                let data = unsafe { &*table.slot(pos).data.get() };
                return unsafe { data.value.assume_init_ref() }.clone();
            }
        }

        self.expand_for_insert(epoch);
        let value = factory();
        let out = value.clone();
        self.insert_new(hash, key, value, epoch);
        self.size.fetch_add(1, Ordering::Relaxed);
        writer.shrink_counter = 0;
        out
    }

    /// Insert `factory()` if the key is absent. Returns true on insertion;
    /// the factory is not called when the key is present.
    pub(crate) fn try_insert_with<F>(
        &self,
        hash: u64,
        key: K,
        factory: F,
        epoch: &EpochManager,
    ) -> bool
    where
        F: FnOnce() -> V,
    {
        let mut writer = self.writer.lock();

        {
            let table = unsafe { &*self.table.load(Ordering::Relaxed) };
            if self.find_pos(table, hash, &key).is_some() {
                return false;
            }
        }

        self.expand_for_insert(epoch);
        self.insert_new(hash, key, factory(), epoch);
        self.size.fetch_add(1, Ordering::Relaxed);
        writer.shrink_counter = 0;
        true
    }

    /// Remove a key, restoring the Robin Hood invariant by backward-shift.
    pub(crate) fn erase<Q>(&self, hash: u64, key: &Q, epoch: &EpochManager) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let mut writer = self.writer.lock();

        {
            let table = unsafe { &*self.table.load(Ordering::Relaxed) };
            let Some(mut pos) = self.find_pos(table, hash, key) else {
                return false;
            };
            let mask = table.mask as usize;

            // Backward-shift deletion: pull each displaced successor one
            // step toward its home until an empty or at-home slot ends the
            // run. `hollow` is set once the slot at `pos` has had its
            // payload moved out, so only the first round drops anything.
            let mut hollow = false;
            loop {
                let next_pos = (pos + 1) & mask;
                let slot = table.slot(pos);
                let next = table.slot(next_pos);
                // SAFETY: writer lock held; readers never write.
                let next_dist = unsafe { (*next.data.get()).dist };

                if next_dist <= 1 {
                    slot.seq_lock();
                    let data = unsafe { &mut *slot.data.get() };
                    if !hollow {
                        // SAFETY: the located slot held the erased entry.
                        unsafe {
                            data.key.assume_init_drop();
                            data.value.assume_init_drop();
                        }
                    }
                    data.dist = 0;
                    data.hash = 0;
                    slot.seq_unlock();
                    break;
                }

                slot.seq_lock();
                next.seq_lock();
                let data = unsafe { &mut *slot.data.get() };
                let next_data = unsafe { &mut *next.data.get() };
                if !hollow {
                    unsafe {
                        data.key.assume_init_drop();
                        data.value.assume_init_drop();
                    }
                }
                // SAFETY: next_dist > 1, the successor payload is live; the
                // bitwise move leaves `next` hollow for the following round.
                unsafe {
                    data.key.write(next_data.key.assume_init_read());
                    data.value.write(next_data.value.assume_init_read());
                }
                data.hash = next_data.hash;
                data.dist = next_dist - 1;
                next.seq_unlock();
                slot.seq_unlock();

                hollow = true;
                pos = next_pos;
            }
        }

        self.size.fetch_sub(1, Ordering::Relaxed);
        self.maybe_shrink(&mut writer, epoch);
        true
    }

    /// Swap in a fresh minimum-capacity table and retire the old one.
    pub(crate) fn clear(&self, epoch: &EpochManager) {
        let mut writer = self.writer.lock();
        let old = self.table.load(Ordering::Relaxed);
        self.table
            .store(Box::into_raw(Table::new(DEFAULT_CAPACITY)), Ordering::Release);
        self.size.store(0, Ordering::Relaxed);
        writer.shrink_counter = 0;
        // SAFETY: `old` was exclusively owned by this shard and is no longer
        // reachable by new readers; Table embeds RetiredNode at offset 0.
        unsafe { epoch.retire(old) };
    }

    /// Grow to hold `count` entries within the load factor.
    pub(crate) fn reserve(&self, count: usize, epoch: &EpochManager) {
        let _writer = self.writer.lock();
        let needed = (count as f64 / MAX_LOAD_FACTOR) as usize + 1;
        let needed = next_power_of_two(needed).max(DEFAULT_CAPACITY);

        let capacity = unsafe { &*self.table.load(Ordering::Relaxed) }.capacity();
        if needed > capacity {
            self.resize(needed, epoch);
        }
    }

    /// Probe for `key` with plain reads. Writer lock must be held.
    fn find_pos<Q>(&self, table: &Table<K, V>, hash: u64, key: &Q) -> Option<usize>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let mask = table.mask as usize;
        let mut pos = (hash & table.mask) as usize;
        let mut expected: u8 = 1;

        loop {
            // SAFETY: writer lock held; no concurrent slot mutation.
            let data = unsafe { &*table.slot(pos).data.get() };
            if data.dist == 0 || data.dist < expected {
                return None;
            }
            if data.dist == expected
                && data.hash == hash
                && unsafe { data.key.assume_init_ref() }.borrow() == key
            {
                return Some(pos);
            }
            pos = (pos + 1) & mask;
            expected = expected.wrapping_add(1);
            if expected == 0 {
                return None;
            }
        }
    }

    /// Robin Hood insert of a key known to be absent; doubles the table on
    /// probe overflow until the carry lands.
    fn insert_new(&self, hash: u64, key: K, value: V, epoch: &EpochManager) {
        let mut carry = Carry { hash, key, value };
        loop {
            let table = unsafe { &*self.table.load(Ordering::Relaxed) };
            match robin_insert(table, carry) {
                Ok(()) => return,
                Err(displaced) => {
                    // The displaced carry is re-homed after the resize; the
                    // table itself is rehashed by the resize.
                    let capacity = table.capacity();
                    carry = displaced;
                    self.resize(capacity * 2, epoch);
                }
            }
        }
    }

    /// Double ahead of an insert that would exceed the load factor.
    fn expand_for_insert(&self, epoch: &EpochManager) {
        let capacity = unsafe { &*self.table.load(Ordering::Relaxed) }.capacity();
        let size = self.size.load(Ordering::Relaxed);
        if (size + 1) as f64 > capacity as f64 * MAX_LOAD_FACTOR {
            self.resize(capacity * 2, epoch);
        }
    }

    /// Delayed shrink: erases at sub-threshold load bump a streak counter;
    /// once the streak exceeds the capacity, halve (never under the floor).
    fn maybe_shrink(&self, writer: &mut WriterState, epoch: &EpochManager) {
        let capacity = unsafe { &*self.table.load(Ordering::Relaxed) }.capacity();
        let size = self.size.load(Ordering::Relaxed);
        let load = size as f64 / capacity as f64;

        if load < SHRINK_LOAD_FACTOR && capacity > DEFAULT_CAPACITY {
            writer.shrink_counter += 1;
            if writer.shrink_counter > capacity {
                self.resize((capacity / 2).max(DEFAULT_CAPACITY), epoch);
                writer.shrink_counter = 0;
            }
        } else {
            writer.shrink_counter = 0;
        }
    }

    /// Move every entry into a table of `new_capacity`, publish it, and
    /// retire the old table. Writer lock must be held.
    ///
    /// Entries are moved with their cached hash; keys are never rehashed.
    /// Each source slot is emptied inside a sequence bracket so a concurrent
    /// reader either sees the intact entry or retries and picks up the new
    /// table pointer.
    fn resize(&self, new_capacity: usize, epoch: &EpochManager) {
        let old_ptr = self.table.load(Ordering::Relaxed);
        let old = unsafe { &*old_ptr };
        let mut new = Table::new(new_capacity);

        for slot in old.slots.iter() {
            // SAFETY: writer lock held.
            let data = unsafe { &mut *slot.data.get() };
            if data.dist != 0 {
                slot.seq_lock();
                let hash = data.hash;
                // SAFETY: occupied slot; dist is zeroed below so the payload
                // is not dropped again when the old table is reclaimed.
                let (key, value) =
                    unsafe { (data.key.assume_init_read(), data.value.assume_init_read()) };
                data.dist = 0;
                slot.seq_unlock();
                rehash_insert(&mut new, hash, key, value);
            }
        }

        self.table.store(Box::into_raw(new), Ordering::Release);
        // SAFETY: the old table is unreachable for new readers after the
        // release store; pinned readers keep it alive through the manager.
        unsafe { epoch.retire(old_ptr) };
    }
}

/// The element being carried through a Robin Hood probe.
struct Carry<K, V> {
    hash: u64,
    key: K,
    value: V,
}

/// Robin Hood insertion with sequence brackets. Does not check for
/// duplicates; the caller must. Returns the carried element if the probe
/// distance ceiling is hit (caller resizes and retries).
fn robin_insert<K, V>(table: &Table<K, V>, carry: Carry<K, V>) -> Result<(), Carry<K, V>> {
    let mask = table.mask as usize;
    let mut pos = (carry.hash & table.mask) as usize;
    let mut cur_dist: u8 = 1;
    let mut cur_hash = carry.hash;
    let mut cur_key = carry.key;
    let mut cur_value = carry.value;

    loop {
        let slot = table.slot(pos);
        // SAFETY: writer lock held by the caller.
        let data = unsafe { &mut *slot.data.get() };

        if data.dist == 0 {
            slot.seq_lock();
            data.dist = cur_dist;
            data.hash = cur_hash;
            data.key.write(cur_key);
            data.value.write(cur_value);
            slot.seq_unlock();
            return Ok(());
        }

        if data.dist < cur_dist {
            // Steal from the rich: the carry displaces the less-displaced
            // resident and the probe continues with the evictee.
            slot.seq_lock();
            mem::swap(&mut data.dist, &mut cur_dist);
            mem::swap(&mut data.hash, &mut cur_hash);
            // SAFETY: dist > 0, the resident payload is initialized.
            unsafe {
                mem::swap(data.key.assume_init_mut(), &mut cur_key);
                mem::swap(data.value.assume_init_mut(), &mut cur_value);
            }
            slot.seq_unlock();
        }

        pos = (pos + 1) & mask;
        cur_dist += 1;
        if cur_dist >= MAX_DIST {
            return Err(Carry {
                hash: cur_hash,
                key: cur_key,
                value: cur_value,
            });
        }
    }
}

/// Robin Hood insertion into a not-yet-published table. No sequence
/// brackets: no reader can observe the table before the publishing store.
fn rehash_insert<K, V>(table: &mut Table<K, V>, hash: u64, key: K, value: V) {
    let mask = table.mask as usize;
    let mut pos = (hash & table.mask) as usize;
    let mut cur_dist: u8 = 1;
    let mut cur_hash = hash;
    let mut cur_key = key;
    let mut cur_value = value;

    loop {
        let data = table.slots[pos].data.get_mut();

        if data.dist == 0 {
            data.dist = cur_dist;
            data.hash = cur_hash;
            data.key.write(cur_key);
            data.value.write(cur_value);
            return;
        }

        if data.dist < cur_dist {
            mem::swap(&mut data.dist, &mut cur_dist);
            mem::swap(&mut data.hash, &mut cur_hash);
            // SAFETY: dist > 0, the resident payload is initialized.
            unsafe {
                mem::swap(data.key.assume_init_mut(), &mut cur_key);
                mem::swap(data.value.assume_init_mut(), &mut cur_value);
            }
        }

        pos = (pos + 1) & mask;
        cur_dist = cur_dist.wrapping_add(1);
        debug_assert!(cur_dist != 0, "probe distance overflow during rehash");
    }
}
