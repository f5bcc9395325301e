//! A flat hash table scanned in 16-slot clusters.
//!
//! The table keeps one control byte per slot. A byte of `0xFF` marks an empty
//! slot, `0x80` a tombstone left behind by a removal, and any value with the
//! sign bit clear marks an in-use slot whose low 7 bits are a fingerprint of
//! the stored hash. Packing the "unused" states into the sign bit means a
//! single SSE2 `movemask` answers "which slots could hold data" for a whole
//! cluster, and a `cmpeq`/`movemask` pair answers "which slots match this
//! fingerprint".
//!
//! ## Design
//!
//! Capacity is always a power of two and at least one cluster. A hash is
//! split into a cluster index (`hash >> 7`, masked) and the 7-bit
//! fingerprint (`hash & 0x7F`); keeping the fingerprint out of the index
//! bits decorrelates the two, so fingerprint collisions within a cluster stay
//! rare. Probes visit clusters in order, wrapping with mask arithmetic, and
//! terminate at the first cluster containing an empty slot: removals leave
//! tombstones precisely so that this termination rule stays sound without
//! rebuilding the probe chain.
//!
//! Inserts reuse the first tombstone seen on their probe path, falling back
//! to the first empty slot in the terminating cluster. Tombstones are
//! collapsed back to empty slots whenever the table rebuilds, and a probe
//! that wraps the whole table without meeting an empty slot forces a rebuild,
//! so tombstone accumulation cannot wedge the table.
//!
//! All storage lives in one type-erased allocation, `[ controls | slots ]`.
//! The control array is `capacity + 16` bytes long: the final 16 bytes mirror
//! the first 16 at all times, so readers that treat the array as a ring of
//! clusters never branch on wrap-around. Slots are `MaybeUninit` cells,
//! constructed exactly when their control byte becomes in-use and dropped
//! when it leaves in-use (skipped entirely for types without drop glue).
//!
//! Growth is driven by an integer-scaled load factor: the threshold is
//! `capacity * mlf * 2^16 >> 16`, computed once per rebuild, and a mutating
//! insert that would exceed it doubles the capacity. Configurable between
//! 0.2 and 0.8, defaulting per the `load-factor-*` cargo features.
//!
//! [`FlatTable<V>`] stores values of type `V` and requires the caller to
//! provide the hash and an equality predicate for each operation. Prefer
//! [`FlatMap<K, V, S>`] for a keyed interface.
//!
//! [`FlatMap<K, V, S>`]: crate::flat_map::FlatMap

use alloc::alloc::handle_alloc_error;
use alloc::boxed::Box;
use core::alloc::Layout;
#[cfg(target_arch = "x86")]
use core::arch::x86::*;
#[cfg(target_arch = "x86_64")]
use core::arch::x86_64::*;
use core::fmt::Debug;
use core::marker::PhantomData;
use core::mem::MaybeUninit;
use core::ptr::NonNull;

use crate::TryReserveError;
use crate::bits;
use crate::load_factor;

/// Number of slots covered by one metadata load.
const CLUSTER_ENTRIES: usize = 16;

/// Control byte for a slot that has never held a value since the last
/// rebuild.
const EMPTY: u8 = 0xFF;

/// Control byte for a slot whose value was removed. Distinguished from
/// `EMPTY` so probes keep walking past it.
const DELETED: u8 = 0x80;

/// Sign bit shared by `EMPTY` and `DELETED`; clear on every in-use byte.
const UNUSED_BIT: u8 = 0x80;

/// Low bits of the hash stored as the control fingerprint.
const TAG_BITS: u64 = 0x7F;

/// Bits of the hash consumed by the fingerprint; the cluster index starts
/// above them.
const TAG_SHIFT: u32 = 7;

/// Smallest capacity the table will allocate.
const MIN_CAPACITY: usize = CLUSTER_ENTRIES;

#[inline(always)]
fn ctrl_tag(hash: u64) -> u8 {
    (hash & TAG_BITS) as u8
}

#[derive(Debug, Clone, Copy)]
struct DataLayout {
    layout: Layout,
    ctrl_offset: usize,
    slots_offset: usize,
}

impl DataLayout {
    fn new<V>(capacity: usize) -> Result<Self, TryReserveError> {
        let ctrl_layout =
            Layout::from_size_align(capacity + CLUSTER_ENTRIES, CLUSTER_ENTRIES)
                .map_err(|_| TryReserveError::CapacityOverflow)?;
        let slots_layout = Layout::array::<MaybeUninit<V>>(capacity)
            .map_err(|_| TryReserveError::CapacityOverflow)?;

        let (layout, ctrl_offset) = Layout::new::<()>()
            .extend(ctrl_layout)
            .map_err(|_| TryReserveError::CapacityOverflow)?;
        let (layout, slots_offset) = layout
            .extend(slots_layout)
            .map_err(|_| TryReserveError::CapacityOverflow)?;

        Ok(DataLayout {
            layout,
            ctrl_offset,
            slots_offset,
        })
    }
}

enum RawProbe {
    /// The key is present at this slot index.
    Found(usize),
    /// The key is absent; this slot (tombstone or empty) can take it.
    Vacant(usize),
    /// The probe wrapped the whole table without finding a usable slot.
    Full,
}

/// A flat hash table with 16-slot clusters and tombstone deletion.
///
/// `FlatTable<V>` stores values of type `V` and provides fast insertion,
/// lookup, and removal operations. Unlike standard hash maps, this
/// implementation requires you to provide both the hash value and an
/// equality predicate for each operation.
///
/// ## Performance Characteristics
///
/// - **Memory**: 1 byte per slot overhead, plus the size of `V` per slot.
pub struct FlatTable<V> {
    layout: DataLayout,
    alloc: NonNull<u8>,

    size: usize,
    slot_mask: usize,
    cluster_mask: usize,

    threshold: usize,
    mlf_q16: u32,

    _phantom: PhantomData<V>,
}

impl<V> FlatTable<V> {
    /// Creates an empty table with the minimum capacity.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Creates a table that can hold at least `capacity` elements before
    /// growing.
    ///
    /// The allocated slot count is larger than `capacity` because the table
    /// never fills past its load threshold.
    pub fn with_capacity(capacity: usize) -> Self {
        let mlf_q16 = load_factor::DEFAULT_Q16;
        let slots = Self::capacity_for(capacity, mlf_q16);
        let layout = match DataLayout::new::<V>(slots) {
            Ok(layout) => layout,
            Err(_) => panic!("tagmap: capacity overflow"),
        };
        let alloc = match try_alloc_ctrl_init(&layout, slots) {
            Ok(alloc) => alloc,
            Err(_) => handle_alloc_error(layout.layout),
        };

        Self {
            layout,
            alloc,
            size: 0,
            slot_mask: slots - 1,
            cluster_mask: slots / CLUSTER_ENTRIES - 1,
            threshold: load_factor::threshold(slots, mlf_q16),
            mlf_q16,
            _phantom: PhantomData,
        }
    }

    fn capacity_for(elements: usize, mlf_q16: u32) -> usize {
        if elements == 0 {
            return MIN_CAPACITY;
        }
        bits::round_up_pow2(load_factor::capacity_needed(elements, mlf_q16).max(MIN_CAPACITY))
    }

    /// Returns the number of elements in the table.
    pub fn len(&self) -> usize {
        self.size
    }

    /// Returns `true` if the table contains no elements.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Returns the number of allocated slots.
    ///
    /// The table grows before `len` reaches this number; the usable capacity
    /// is bounded by the load threshold.
    pub fn capacity(&self) -> usize {
        self.slot_mask + 1
    }

    /// Returns the number of elements the table can hold before growing.
    pub fn load_threshold(&self) -> usize {
        self.threshold
    }

    /// Returns the configured maximum load factor.
    pub fn max_load_factor(&self) -> f32 {
        load_factor::to_f32(self.mlf_q16)
    }

    /// Sets the maximum load factor, clamped to `[0.2, 0.8]`.
    ///
    /// The load threshold is recomputed immediately; if the current size
    /// already exceeds the new threshold the table rebuilds.
    pub fn set_max_load_factor(&mut self, mlf: f32, rehash: impl Fn(&V) -> u64) {
        self.mlf_q16 = load_factor::clamp_q16(mlf);
        self.threshold = load_factor::threshold(self.capacity(), self.mlf_q16);
        if self.size > self.threshold {
            let capacity = Self::capacity_for(self.size, self.mlf_q16);
            self.resize_rehash(capacity, &rehash);
        }
    }

    fn ctrls_ptr(&self) -> NonNull<[u8]> {
        // SAFETY: `self.alloc` points to a live allocation described by
        // `self.layout`; the control array starts at `ctrl_offset` and holds
        // `capacity + CLUSTER_ENTRIES` bytes (the mirror tail included).
        unsafe {
            NonNull::slice_from_raw_parts(
                self.alloc.add(self.layout.ctrl_offset).cast(),
                self.capacity() + CLUSTER_ENTRIES,
            )
        }
    }

    fn slots_ptr(&self) -> NonNull<[MaybeUninit<V>]> {
        // SAFETY: `self.alloc` points to a live allocation described by
        // `self.layout`; the slot array starts at `slots_offset` and holds
        // `capacity` cells.
        unsafe {
            NonNull::slice_from_raw_parts(
                self.alloc.add(self.layout.slots_offset).cast(),
                self.capacity(),
            )
        }
    }

    #[inline(always)]
    fn cluster_index(&self, hash: u64) -> usize {
        ((hash >> TAG_SHIFT) as usize) & self.cluster_mask
    }

    #[inline(always)]
    fn next_cluster(&self, cluster: usize) -> usize {
        (cluster + 1) & self.cluster_mask
    }

    /// Writes a control byte, keeping the trailing mirror cluster identical
    /// to the head of the array.
    ///
    /// # Safety
    ///
    /// The caller must ensure `index < capacity`.
    #[inline(always)]
    unsafe fn set_ctrl(&mut self, index: usize, value: u8) {
        let capacity = self.capacity();
        // SAFETY: caller ensures `index < capacity`; the mirror write lands
        // in the `CLUSTER_ENTRIES` bytes past the end of the main array.
        unsafe {
            let ctrls = self.ctrls_ptr().as_mut();
            *ctrls.get_unchecked_mut(index) = value;
            if index < CLUSTER_ENTRIES {
                *ctrls.get_unchecked_mut(capacity + index) = value;
            }
        }
    }

    /// Returns a bitmask of slots in the cluster at `base` whose control byte
    /// equals `byte`. Bit `i` corresponds to slot `base + i`.
    ///
    /// # Safety
    ///
    /// The caller must ensure `base + 16` does not exceed the control array.
    #[inline(always)]
    unsafe fn match_byte(&self, base: usize, byte: u8) -> u16 {
        #[cfg(all(
            any(target_arch = "x86", target_arch = "x86_64"),
            target_feature = "sse2"
        ))]
        // SAFETY: bounds guaranteed by the caller; SSE2 is compiled in.
        return unsafe { self.match_byte_sse2(base, byte) };

        #[cfg(not(all(
            any(target_arch = "x86", target_arch = "x86_64"),
            target_feature = "sse2"
        )))]
        // SAFETY: bounds guaranteed by the caller.
        return unsafe { self.match_byte_scalar(base, byte) };
    }

    /// SSE2 version of [`match_byte`](Self::match_byte).
    ///
    /// # Safety
    ///
    /// Same bounds contract as `match_byte`; the CPU must support SSE2.
    #[cfg(all(
        any(target_arch = "x86", target_arch = "x86_64"),
        target_feature = "sse2"
    ))]
    #[inline(always)]
    unsafe fn match_byte_sse2(&self, base: usize, byte: u8) -> u16 {
        // SAFETY: the caller guarantees 16 readable bytes at `base`.
        unsafe {
            let ptr = self.ctrls_ptr().as_ref().as_ptr().add(base);
            let data = _mm_loadu_si128(ptr as *const __m128i);
            let needle = _mm_set1_epi8(byte as i8);
            _mm_movemask_epi8(_mm_cmpeq_epi8(data, needle)) as u16
        }
    }

    /// Scalar version of [`match_byte`](Self::match_byte).
    ///
    /// # Safety
    ///
    /// Same bounds contract as `match_byte`.
    #[cfg(not(all(
        any(target_arch = "x86", target_arch = "x86_64"),
        target_feature = "sse2"
    )))]
    #[inline(always)]
    unsafe fn match_byte_scalar(&self, base: usize, byte: u8) -> u16 {
        let mut mask = 0u16;
        for i in 0..CLUSTER_ENTRIES {
            // SAFETY: the caller guarantees 16 readable bytes at `base`.
            if unsafe { *self.ctrls_ptr().as_ref().get_unchecked(base + i) } == byte {
                mask |= 1 << i;
            }
        }
        mask
    }

    /// Returns a bitmask of unused (empty or deleted) slots in the cluster at
    /// `base`. A single sign-bit extraction covers both states.
    ///
    /// # Safety
    ///
    /// The caller must ensure `base + 16` does not exceed the control array.
    #[inline(always)]
    unsafe fn match_unused(&self, base: usize) -> u16 {
        #[cfg(all(
            any(target_arch = "x86", target_arch = "x86_64"),
            target_feature = "sse2"
        ))]
        // SAFETY: bounds guaranteed by the caller; SSE2 is compiled in.
        return unsafe {
            let ptr = self.ctrls_ptr().as_ref().as_ptr().add(base);
            let data = _mm_loadu_si128(ptr as *const __m128i);
            _mm_movemask_epi8(data) as u16
        };

        #[cfg(not(all(
            any(target_arch = "x86", target_arch = "x86_64"),
            target_feature = "sse2"
        )))]
        return {
            let mut mask = 0u16;
            for i in 0..CLUSTER_ENTRIES {
                // SAFETY: the caller guarantees 16 readable bytes at `base`.
                if unsafe { *self.ctrls_ptr().as_ref().get_unchecked(base + i) } & UNUSED_BIT != 0
                {
                    mask |= 1 << i;
                }
            }
            mask
        };
    }

    /// Searches the probe sequence of `hash` for a value matching `eq`.
    ///
    /// Returns the slot index of the match, or `None` once a cluster with an
    /// empty slot (or a full wrap of the table) proves absence.
    #[inline]
    fn search(&self, hash: u64, eq: impl Fn(&V) -> bool) -> Option<usize> {
        let tag = ctrl_tag(hash);
        let start = self.cluster_index(hash);
        let mut cluster = start;
        loop {
            let base = cluster * CLUSTER_ENTRIES;
            // SAFETY: `base + 16 <= capacity` because cluster indices are
            // masked and the control array extends a full mirror cluster
            // past `capacity`.
            let mut matches = unsafe { self.match_byte(base, tag) } as u64;
            while matches != 0 {
                let index = base + bits::lowest_set(matches);
                matches = bits::clear_lowest(matches);
                // SAFETY: an in-use control byte guarantees the slot holds an
                // initialized value.
                if eq(unsafe { self.slots_ptr().as_ref().get_unchecked(index).assume_init_ref() })
                {
                    return Some(index);
                }
            }
            // SAFETY: same bounds as the tag scan above.
            if unsafe { self.match_byte(base, EMPTY) } != 0 {
                return None;
            }
            cluster = self.next_cluster(cluster);
            if cluster == start {
                return None;
            }
        }
    }

    /// Searches like [`search`](Self::search) while also recording the slot
    /// an insert of this key should use: the first tombstone on the probe
    /// path, or the first empty slot of the terminating cluster.
    fn probe_insert(&self, hash: u64, eq: impl Fn(&V) -> bool) -> RawProbe {
        let tag = ctrl_tag(hash);
        let start = self.cluster_index(hash);
        let mut cluster = start;
        let mut first_deleted: Option<usize> = None;
        loop {
            let base = cluster * CLUSTER_ENTRIES;
            // SAFETY: cluster indices are masked; see `search`.
            let mut matches = unsafe { self.match_byte(base, tag) } as u64;
            while matches != 0 {
                let index = base + bits::lowest_set(matches);
                matches = bits::clear_lowest(matches);
                // SAFETY: an in-use control byte guarantees the slot holds an
                // initialized value.
                if eq(unsafe { self.slots_ptr().as_ref().get_unchecked(index).assume_init_ref() })
                {
                    return RawProbe::Found(index);
                }
            }
            // SAFETY: same bounds as the tag scan above.
            let unused = unsafe { self.match_unused(base) };
            if unused != 0 {
                // SAFETY: same bounds as the tag scan above.
                let empties = unsafe { self.match_byte(base, EMPTY) };
                if first_deleted.is_none() {
                    let deleted = unused & !empties;
                    if deleted != 0 {
                        first_deleted = Some(base + bits::lowest_set(deleted as u64));
                    }
                }
                if empties != 0 {
                    let slot = first_deleted.unwrap_or(base + bits::lowest_set(empties as u64));
                    return RawProbe::Vacant(slot);
                }
            }
            cluster = self.next_cluster(cluster);
            if cluster == start {
                return match first_deleted {
                    Some(slot) => RawProbe::Vacant(slot),
                    None => RawProbe::Full,
                };
            }
        }
    }

    /// Finds a value in the table by hash and equality predicate.
    ///
    /// # Arguments
    ///
    /// * `hash` - The hash value to search for
    /// * `eq` - A predicate function that returns `true` for the desired
    ///   value
    #[inline]
    pub fn find(&self, hash: u64, eq: impl Fn(&V) -> bool) -> Option<&V> {
        if self.size == 0 {
            return None;
        }
        let index = self.search(hash, eq)?;
        // SAFETY: `search` only returns indices of in-use, initialized slots.
        Some(unsafe { self.slots_ptr().as_ref().get_unchecked(index).assume_init_ref() })
    }

    /// Finds a value in the table, returning a mutable reference.
    #[inline]
    pub fn find_mut(&mut self, hash: u64, eq: impl Fn(&V) -> bool) -> Option<&mut V> {
        if self.size == 0 {
            return None;
        }
        let index = self.search(hash, eq)?;
        // SAFETY: `search` only returns indices of in-use, initialized slots.
        Some(unsafe {
            self.slots_ptr()
                .as_mut()
                .get_unchecked_mut(index)
                .assume_init_mut()
        })
    }

    /// Removes and returns a value from the table.
    ///
    /// The removed slot is tombstoned rather than emptied so other probe
    /// chains through it stay intact until the next rebuild.
    pub fn remove(&mut self, hash: u64, eq: impl Fn(&V) -> bool) -> Option<V> {
        if self.size == 0 {
            return None;
        }
        let index = self.search(hash, eq)?;
        self.size -= 1;
        // SAFETY: `search` only returns indices of in-use, initialized
        // slots; `set_ctrl` receives an index below capacity.
        unsafe {
            let value = self
                .slots_ptr()
                .as_ref()
                .get_unchecked(index)
                .assume_init_read();
            self.set_ctrl(index, DELETED);
            Some(value)
        }
    }

    /// Gets an entry for the given hash and equality predicate.
    ///
    /// Grows the table first when the load threshold would be exceeded, so a
    /// subsequent vacant insert cannot fail.
    ///
    /// # Arguments
    ///
    /// * `hash` - The hash value for the entry
    /// * `eq` - A predicate function that returns `true` for matching values
    /// * `rehash` - Recomputes the hash of a stored value during rebuilds
    #[inline]
    pub fn entry(
        &mut self,
        hash: u64,
        eq: impl Fn(&V) -> bool,
        rehash: impl Fn(&V) -> u64,
    ) -> Entry<'_, V> {
        if self.size + 1 > self.threshold {
            self.grow(&rehash);
        }
        loop {
            match self.probe_insert(hash, &eq) {
                RawProbe::Found(index) => {
                    return Entry::Occupied(OccupiedEntry { table: self, index });
                }
                RawProbe::Vacant(index) => {
                    return Entry::Vacant(VacantEntry {
                        table: self,
                        index,
                        tag: ctrl_tag(hash),
                    });
                }
                // Every unused slot on the probe path was a tombstone and the
                // probe wrapped; rebuilding collapses the tombstones.
                RawProbe::Full => self.grow(&rehash),
            }
        }
    }

    /// Reserves capacity for at least `additional` more elements.
    pub fn reserve(&mut self, additional: usize, rehash: impl Fn(&V) -> u64) {
        if let Err(err) = self.try_reserve(additional, rehash) {
            match err {
                TryReserveError::AllocError { layout } => handle_alloc_error(layout),
                TryReserveError::CapacityOverflow => panic!("tagmap: capacity overflow"),
            }
        }
    }

    /// Fallible variant of [`reserve`](Self::reserve).
    ///
    /// On failure the table is left exactly as it was.
    pub fn try_reserve(
        &mut self,
        additional: usize,
        rehash: impl Fn(&V) -> u64,
    ) -> Result<(), TryReserveError> {
        let required = self
            .size
            .checked_add(additional)
            .ok_or(TryReserveError::CapacityOverflow)?;
        if required > self.threshold {
            let capacity = Self::capacity_for(required, self.mlf_q16);
            self.try_resize_rehash(capacity, &rehash)?;
        }
        Ok(())
    }

    /// Rebuilds the table with the smallest power-of-two capacity that is at
    /// least `new_capacity` slots and large enough for the current size.
    ///
    /// Tombstones do not survive a rebuild.
    pub fn rehash(&mut self, new_capacity: usize, rehash: impl Fn(&V) -> u64) {
        let capacity = bits::round_up_pow2(
            new_capacity
                .max(Self::capacity_for(self.size, self.mlf_q16))
                .max(MIN_CAPACITY),
        );
        if capacity != self.capacity() {
            self.resize_rehash(capacity, &rehash);
        }
    }

    /// Shrinks the table to the smallest capacity that holds the current
    /// elements within the load threshold.
    pub fn shrink_to_fit(&mut self, rehash: impl Fn(&V) -> u64) {
        self.rehash(0, rehash);
    }

    /// Removes all elements, keeping the allocated capacity.
    ///
    /// Tombstones are collapsed; every control byte returns to empty.
    pub fn clear(&mut self) {
        // SAFETY: the control array marks exactly the initialized slots; we
        // drop those and then reset every control byte (mirror included).
        unsafe {
            if core::mem::needs_drop::<V>() && self.size > 0 {
                for index in 0..self.capacity() {
                    if *self.ctrls_ptr().as_ref().get_unchecked(index) & UNUSED_BIT == 0 {
                        self.slots_ptr()
                            .as_mut()
                            .get_unchecked_mut(index)
                            .assume_init_drop();
                    }
                }
            }
            core::ptr::write_bytes(
                self.ctrls_ptr().as_mut().as_mut_ptr(),
                EMPTY,
                self.capacity() + CLUSTER_ENTRIES,
            );
        }
        self.size = 0;
    }

    #[cold]
    #[inline(never)]
    fn grow(&mut self, rehash: &dyn Fn(&V) -> u64) {
        let new_capacity = self
            .capacity()
            .checked_mul(2)
            .unwrap_or_else(|| panic!("tagmap: capacity overflow"));
        self.resize_rehash(new_capacity, rehash);
    }

    fn resize_rehash(&mut self, new_capacity: usize, rehash: &dyn Fn(&V) -> u64) {
        if let Err(err) = self.try_resize_rehash(new_capacity, rehash) {
            match err {
                TryReserveError::AllocError { layout } => handle_alloc_error(layout),
                TryReserveError::CapacityOverflow => panic!("tagmap: capacity overflow"),
            }
        }
    }

    /// Rebuilds into a fresh allocation of `new_capacity` slots.
    ///
    /// The new arrays are fully allocated before any value moves, so an
    /// allocation failure leaves the table untouched.
    fn try_resize_rehash(
        &mut self,
        new_capacity: usize,
        rehash: &dyn Fn(&V) -> u64,
    ) -> Result<(), TryReserveError> {
        debug_assert!(bits::is_pow2(new_capacity));
        debug_assert!(load_factor::threshold(new_capacity, self.mlf_q16) >= self.size);

        let new_layout = DataLayout::new::<V>(new_capacity)?;
        let new_alloc = try_alloc_ctrl_init(&new_layout, new_capacity)?;

        let old_capacity = self.capacity();
        let old_layout = self.layout;
        let old_alloc = self.alloc;

        self.layout = new_layout;
        self.alloc = new_alloc;
        self.slot_mask = new_capacity - 1;
        self.cluster_mask = new_capacity / CLUSTER_ENTRIES - 1;
        self.threshold = load_factor::threshold(new_capacity, self.mlf_q16);

        // SAFETY: the old allocation stays valid until the final dealloc; we
        // move each initialized value out exactly once (ownership transfers
        // to the new table) and never drop the moved-out cells.
        unsafe {
            let old_ctrls: NonNull<[u8]> = NonNull::slice_from_raw_parts(
                old_alloc.add(old_layout.ctrl_offset).cast(),
                old_capacity,
            );
            let old_slots: NonNull<[MaybeUninit<V>]> = NonNull::slice_from_raw_parts(
                old_alloc.add(old_layout.slots_offset).cast(),
                old_capacity,
            );

            for index in 0..old_capacity {
                if *old_ctrls.as_ref().get_unchecked(index) & UNUSED_BIT == 0 {
                    let value = old_slots.as_ref().get_unchecked(index).assume_init_read();
                    let hash = rehash(&value);
                    self.insert_unique(hash, value);
                }
            }

            alloc::alloc::dealloc(old_alloc.as_ptr(), old_layout.layout);
        }

        Ok(())
    }

    /// Inserts a value known to be absent, skipping the key comparison.
    /// Only valid on a table with no tombstones and spare capacity, i.e.
    /// mid-rebuild.
    ///
    /// # Safety
    ///
    /// The caller must ensure the table has at least one empty slot and that
    /// no stored value compares equal to `value`.
    unsafe fn insert_unique(&mut self, hash: u64, value: V) {
        let start = self.cluster_index(hash);
        let mut cluster = start;
        loop {
            let base = cluster * CLUSTER_ENTRIES;
            // SAFETY: cluster indices are masked; see `search`.
            let empties = unsafe { self.match_byte(base, EMPTY) };
            if empties != 0 {
                let index = base + bits::lowest_set(empties as u64);
                // SAFETY: `index` is below capacity and its slot is empty.
                unsafe {
                    self.set_ctrl(index, ctrl_tag(hash));
                    self.slots_ptr()
                        .as_mut()
                        .get_unchecked_mut(index)
                        .write(value);
                }
                return;
            }
            cluster = self.next_cluster(cluster);
            debug_assert_ne!(cluster, start);
        }
    }

    /// Returns an iterator over all values in the table.
    ///
    /// The iteration order is unspecified.
    pub fn iter(&self) -> Iter<'_, V> {
        Iter {
            table: self,
            index: 0,
        }
    }

    /// Returns an iterator that removes and yields all values from the
    /// table.
    ///
    /// Values not yielded before the iterator is dropped are still removed
    /// and dropped.
    pub fn drain(&mut self) -> Drain<'_, V> {
        let capacity = self.capacity();
        // SAFETY: the control array has `capacity + CLUSTER_ENTRIES`
        // readable bytes; we snapshot the canonical region, then mark the
        // table empty so the drained cells cannot be dropped twice.
        let occupied = unsafe {
            let snapshot: Box<[u8]> = self.ctrls_ptr().as_ref()[..capacity].to_vec().into();
            core::ptr::write_bytes(
                self.ctrls_ptr().as_mut().as_mut_ptr(),
                EMPTY,
                capacity + CLUSTER_ENTRIES,
            );
            snapshot
        };
        self.size = 0;

        Drain {
            table: self,
            occupied,
            index: 0,
        }
    }
}

impl<V> Default for FlatTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Drop for FlatTable<V> {
    fn drop(&mut self) {
        // SAFETY: in-use control bytes mark exactly the initialized cells.
        unsafe {
            if core::mem::needs_drop::<V>() && self.size > 0 {
                for index in 0..self.capacity() {
                    if *self.ctrls_ptr().as_ref().get_unchecked(index) & UNUSED_BIT == 0 {
                        self.slots_ptr()
                            .as_mut()
                            .get_unchecked_mut(index)
                            .assume_init_drop();
                    }
                }
            }
            alloc::alloc::dealloc(self.alloc.as_ptr(), self.layout.layout);
        }
    }
}

impl<V> Clone for FlatTable<V>
where
    V: Clone,
{
    fn clone(&self) -> Self {
        let capacity = self.capacity();
        let alloc = match try_alloc_ctrl_init(&self.layout, capacity) {
            Ok(alloc) => alloc,
            Err(_) => handle_alloc_error(self.layout.layout),
        };
        let mut new_table = Self {
            layout: self.layout,
            alloc,
            size: self.size,
            slot_mask: self.slot_mask,
            cluster_mask: self.cluster_mask,
            threshold: self.threshold,
            mlf_q16: self.mlf_q16,
            _phantom: PhantomData,
        };

        // SAFETY: both tables share a layout; copying the full control array
        // (mirror included) and cloning exactly the in-use cells reproduces
        // the source state.
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.ctrls_ptr().as_ref().as_ptr(),
                new_table.ctrls_ptr().as_mut().as_mut_ptr(),
                capacity + CLUSTER_ENTRIES,
            );
            for index in 0..capacity {
                if *self.ctrls_ptr().as_ref().get_unchecked(index) & UNUSED_BIT == 0 {
                    new_table
                        .slots_ptr()
                        .as_mut()
                        .get_unchecked_mut(index)
                        .write(self.slots_ptr().as_ref().get_unchecked(index).assume_init_ref().clone());
                }
            }
        }

        new_table
    }
}

impl<V> Debug for FlatTable<V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut tombstones = 0usize;
        // SAFETY: scanning the canonical control region only.
        unsafe {
            for index in 0..self.capacity() {
                if *self.ctrls_ptr().as_ref().get_unchecked(index) == DELETED {
                    tombstones += 1;
                }
            }
        }
        f.debug_struct("FlatTable")
            .field("size", &self.size)
            .field("capacity", &self.capacity())
            .field("threshold", &self.threshold)
            .field("tombstones", &tombstones)
            .finish()
    }
}

fn try_alloc_ctrl_init(layout: &DataLayout, capacity: usize) -> Result<NonNull<u8>, TryReserveError> {
    // SAFETY: the layout has non-zero size (capacity is at least one
    // cluster); a null return is reported to the caller.
    unsafe {
        let raw = alloc::alloc::alloc(layout.layout);
        if raw.is_null() {
            return Err(TryReserveError::AllocError {
                layout: layout.layout,
            });
        }
        core::ptr::write_bytes(
            raw.add(layout.ctrl_offset),
            EMPTY,
            capacity + CLUSTER_ENTRIES,
        );
        Ok(NonNull::new_unchecked(raw))
    }
}

/// A view into a single entry in the table, which may be vacant or occupied.
///
/// Constructed from the [`entry`] method on [`FlatTable`].
///
/// [`entry`]: FlatTable::entry
pub enum Entry<'a, V> {
    /// A vacant entry - the key is not present in the table.
    Vacant(VacantEntry<'a, V>),
    /// An occupied entry - the key is present in the table.
    Occupied(OccupiedEntry<'a, V>),
}

impl<'a, V> Entry<'a, V> {
    /// Inserts a default value if the entry is vacant and returns a mutable
    /// reference.
    pub fn or_insert(self, default: V) -> &'a mut V {
        match self {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(default),
        }
    }

    /// Inserts a value computed from a closure if the entry is vacant and
    /// returns a mutable reference.
    pub fn or_insert_with(self, default: impl FnOnce() -> V) -> &'a mut V {
        match self {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(default()),
        }
    }

    /// Provides in-place mutable access to an occupied entry.
    pub fn and_modify(self, f: impl FnOnce(&mut V)) -> Self {
        match self {
            Entry::Occupied(mut entry) => {
                f(entry.get_mut());
                Entry::Occupied(entry)
            }
            Entry::Vacant(entry) => Entry::Vacant(entry),
        }
    }
}

/// A view into a vacant entry in the table.
///
/// Created by [`entry`] when no stored value matches; holds the slot the
/// insertion will use (a tombstone reused from the probe path, or an empty
/// slot).
///
/// [`entry`]: FlatTable::entry
pub struct VacantEntry<'a, V> {
    table: &'a mut FlatTable<V>,
    index: usize,
    tag: u8,
}

impl<'a, V> VacantEntry<'a, V> {
    /// Inserts a value into the vacant slot and returns a mutable reference
    /// to it.
    pub fn insert(self, value: V) -> &'a mut V {
        self.table.size += 1;
        // SAFETY: `probe_insert` only constructs vacant entries over unused
        // slots below capacity; writing the tag transitions the slot to
        // in-use in the same step as the cell construction.
        unsafe {
            debug_assert!(
                *self.table.ctrls_ptr().as_ref().get_unchecked(self.index) & UNUSED_BIT != 0
            );
            self.table.set_ctrl(self.index, self.tag);
            self.table
                .slots_ptr()
                .as_mut()
                .get_unchecked_mut(self.index)
                .write(value)
        }
    }
}

/// A view into an occupied entry in the table.
///
/// Created by [`entry`] when a stored value matches the probe.
///
/// [`entry`]: FlatTable::entry
pub struct OccupiedEntry<'a, V> {
    table: &'a mut FlatTable<V>,
    index: usize,
}

// An `OccupiedEntry` is only created from a slot index returned by the probe,
// so the index is below capacity and its cell is initialized. The accessors
// below rely on that.
impl<'a, V> OccupiedEntry<'a, V> {
    /// Gets a reference to the value in the entry.
    pub fn get(&self) -> &V {
        // SAFETY: see the invariant note on the impl block.
        unsafe {
            self.table
                .slots_ptr()
                .as_ref()
                .get_unchecked(self.index)
                .assume_init_ref()
        }
    }

    /// Gets a mutable reference to the value in the entry.
    pub fn get_mut(&mut self) -> &mut V {
        // SAFETY: see the invariant note on the impl block.
        unsafe {
            self.table
                .slots_ptr()
                .as_mut()
                .get_unchecked_mut(self.index)
                .assume_init_mut()
        }
    }

    /// Converts the entry into a mutable reference to the value with the
    /// lifetime of the table borrow.
    pub fn into_mut(self) -> &'a mut V {
        // SAFETY: see the invariant note on the impl block.
        unsafe {
            self.table
                .slots_ptr()
                .as_mut()
                .get_unchecked_mut(self.index)
                .assume_init_mut()
        }
    }

    /// Removes the entry from the table, leaving a tombstone, and returns
    /// the value.
    pub fn remove(self) -> V {
        self.table.size -= 1;
        // SAFETY: see the invariant note on the impl block; the cell is read
        // out exactly once before the control byte leaves the in-use state.
        unsafe {
            let value = self
                .table
                .slots_ptr()
                .as_ref()
                .get_unchecked(self.index)
                .assume_init_read();
            self.table.set_ctrl(self.index, DELETED);
            value
        }
    }
}

/// An iterator over the values in a [`FlatTable`].
///
/// Created by [`iter`](FlatTable::iter); yields `&V` in arbitrary order.
pub struct Iter<'a, V> {
    table: &'a FlatTable<V>,
    index: usize,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = &'a V;

    fn next(&mut self) -> Option<Self::Item> {
        let capacity = self.table.capacity();
        // SAFETY: `self.index` stays below `capacity`; in-use control bytes
        // mark initialized cells.
        unsafe {
            while self.index < capacity {
                let index = self.index;
                self.index += 1;
                if *self.table.ctrls_ptr().as_ref().get_unchecked(index) & UNUSED_BIT == 0 {
                    return Some(
                        self.table
                            .slots_ptr()
                            .as_ref()
                            .get_unchecked(index)
                            .assume_init_ref(),
                    );
                }
            }
        }
        None
    }
}

/// A draining iterator over the values in a [`FlatTable`].
///
/// Created by [`drain`](FlatTable::drain); yields owned values and leaves
/// the table empty.
pub struct Drain<'a, V> {
    table: &'a mut FlatTable<V>,
    occupied: Box<[u8]>,
    index: usize,
}

impl<V> Iterator for Drain<'_, V> {
    type Item = V;

    fn next(&mut self) -> Option<Self::Item> {
        // SAFETY: the snapshot marks cells that were initialized when the
        // drain began; the table's own controls were reset, so each cell is
        // read out exactly once, here.
        unsafe {
            while self.index < self.occupied.len() {
                let index = self.index;
                self.index += 1;
                if *self.occupied.get_unchecked(index) & UNUSED_BIT == 0 {
                    return Some(
                        self.table
                            .slots_ptr()
                            .as_ref()
                            .get_unchecked(index)
                            .assume_init_read(),
                    );
                }
            }
        }
        None
    }
}

impl<V> Drop for Drain<'_, V> {
    fn drop(&mut self) {
        for _ in &mut *self {}
    }
}
