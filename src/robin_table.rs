//! A Robin Hood hash table scanned in 32-slot groups.
//!
//! Every slot carries a two-byte control record: a probe-distance byte and a
//! tag byte. The distance byte encodes how far the slot's occupant sits from
//! its home slot, saturating at `0xFD`; `0xFF` marks an empty slot and
//! `0xFE` is reserved as an end-of-table encoding. The tag byte holds eight
//! bits of a secondary hash, mixed from the primary hash with a multiplicative
//! constant so it stays decorrelated from the slot index. With two bytes per
//! slot, a pair of 256-bit loads covers a whole 32-slot group, and one
//! vectorised pass yields both the tag matches and the probe-termination
//! mask.
//!
//! ## Design
//!
//! The table maintains the Robin Hood ordering: scanning forward from any
//! home slot, stored distances never drop below the distance a probing key
//! would have at that position until an empty slot appears. Lookups exploit
//! this with a per-slot distance floor: as soon as a slot holds an occupant
//! "richer" than the probe would be (stored distance below the floor), the
//! key is provably absent and the probe stops. This keeps unsuccessful
//! lookups short even near the load limit.
//!
//! Insertion enforces the ordering by displacement: when the probing entry
//! reaches a slot whose occupant is richer, the occupant is evicted, the new
//! entry takes the slot, and the evicted entry continues probing with its own
//! control record. Removal runs the inverse: the freed slot swallows its
//! successor as long as the successor sits away from its own home slot
//! (distance above zero), so chains stay contiguous and no tombstones exist.
//!
//! Probe windows are anchored at the home slot rather than a group boundary.
//! The control array extends `32` records past the capacity with a
//! byte-identical mirror of the first group, so windows that cross the end
//! of the table read wrapped data without a branch.
//!
//! Distances saturate rather than overflow: a record at `0xFD` means "at
//! least 253 slots from home". Saturated records never trigger the richer
//! short-circuit and are not decremented by removal back-shifts, so probes
//! over them degrade to plain linear scans but stay correct. An insert whose
//! probe first outruns the encoding rebuilds the table at double capacity
//! and retries before falling back to saturated records.
//!
//! All storage lives in one type-erased allocation, `[ controls | slots ]`,
//! with `MaybeUninit` cells constructed exactly while their control record is
//! in use. Growth is driven by the same integer-scaled load threshold as the
//! flat table.
//!
//! [`RobinTable<V>`] stores values of type `V` and requires the caller to
//! provide the hash and an equality predicate for each operation. Prefer
//! [`RobinMap<K, V, S>`] for a keyed interface.
//!
//! [`RobinMap<K, V, S>`]: crate::robin_map::RobinMap

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

/// Number of slots covered by one metadata window.
const GROUP_WIDTH: usize = 32;

/// Distance byte marking an empty slot.
const DIST_EMPTY: u8 = 0xFF;

/// Reserved end-of-table distance encoding; never reported as in-use.
const DIST_END: u8 = 0xFE;

/// Largest storable probe distance; stored distances saturate here.
const MAX_DISTANCE: u8 = 0xFD;

/// Smallest capacity the table will allocate: one full group.
const MIN_CAPACITY: usize = GROUP_WIDTH;

/// Multiplier decorrelating the tag byte from the slot index bits.
const SECONDARY_MIX: u64 = 14695981039346656037;

#[inline(always)]
fn ctrl_tag(hash: u64) -> u8 {
    (hash.wrapping_mul(SECONDARY_MIX) & 0xFF) as u8
}

#[inline(always)]
fn round_distance(distance: usize) -> u8 {
    if distance < MAX_DISTANCE as usize {
        distance as u8
    } else {
        MAX_DISTANCE
    }
}

#[inline(always)]
fn saturating_inc(distance: u8) -> u8 {
    if distance >= MAX_DISTANCE {
        MAX_DISTANCE
    } else {
        distance + 1
    }
}

/// One control record: probe distance plus hash tag.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(C)]
struct Ctrl {
    distance: u8,
    tag: u8,
}

impl Ctrl {
    const EMPTY: Ctrl = Ctrl {
        distance: DIST_EMPTY,
        tag: 0,
    };

    #[inline(always)]
    fn is_used(self) -> bool {
        self.distance < DIST_END
    }

    #[inline(always)]
    fn is_empty(self) -> bool {
        self.distance == DIST_EMPTY
    }
}

/// Bitmasks over one 32-record group. Two bits per slot, lowest bits first;
/// shift a bit index right by one to obtain the slot offset.
type GroupMask = u64;

/// Returns the in-use slots of the group at `ctrl`.
///
/// # Safety
///
/// `ctrl` must point to 32 readable control records (64 bytes).
#[inline(always)]
unsafe fn match_used(ctrl: *const Ctrl) -> GroupMask {
    #[cfg(all(
        any(target_arch = "x86", target_arch = "x86_64"),
        target_feature = "avx2"
    ))]
    // SAFETY: forwarded bounds contract; AVX2 is compiled in.
    return unsafe { match_used_avx2(ctrl) };

    #[cfg(not(all(
        any(target_arch = "x86", target_arch = "x86_64"),
        target_feature = "avx2"
    )))]
    return {
        let mut mask = 0u64;
        for i in 0..GROUP_WIDTH {
            // SAFETY: forwarded bounds contract.
            if unsafe { *ctrl.add(i) }.is_used() {
                mask |= 0b11 << (2 * i);
            }
        }
        mask
    };
}

/// Returns the empty slots of the group at `ctrl`.
///
/// # Safety
///
/// `ctrl` must point to 32 readable control records (64 bytes).
#[inline(always)]
unsafe fn match_empty(ctrl: *const Ctrl) -> GroupMask {
    #[cfg(all(
        any(target_arch = "x86", target_arch = "x86_64"),
        target_feature = "avx2"
    ))]
    // SAFETY: forwarded bounds contract; AVX2 is compiled in.
    return unsafe { match_tag_and_empty_avx2(ctrl, 0).1 };

    #[cfg(not(all(
        any(target_arch = "x86", target_arch = "x86_64"),
        target_feature = "avx2"
    )))]
    return {
        let mut mask = 0u64;
        for i in 0..GROUP_WIDTH {
            // SAFETY: forwarded bounds contract.
            if unsafe { *ctrl.add(i) }.is_empty() {
                mask |= 0b11 << (2 * i);
            }
        }
        mask
    };
}

/// Returns `(tag_hits, empties)` for the group at `ctrl` in one pass. Tag
/// hits exclude unused slots.
///
/// # Safety
///
/// `ctrl` must point to 32 readable control records (64 bytes).
#[inline(always)]
unsafe fn match_tag_and_empty(ctrl: *const Ctrl, tag: u8) -> (GroupMask, GroupMask) {
    #[cfg(all(
        any(target_arch = "x86", target_arch = "x86_64"),
        target_feature = "avx2"
    ))]
    // SAFETY: forwarded bounds contract; AVX2 is compiled in.
    return unsafe { match_tag_and_empty_avx2(ctrl, tag) };

    #[cfg(not(all(
        any(target_arch = "x86", target_arch = "x86_64"),
        target_feature = "avx2"
    )))]
    return {
        let mut hits = 0u64;
        let mut empties = 0u64;
        for i in 0..GROUP_WIDTH {
            // SAFETY: forwarded bounds contract.
            let c = unsafe { *ctrl.add(i) };
            if c.is_used() && c.tag == tag {
                hits |= 0b11 << (2 * i);
            }
            if c.is_empty() {
                empties |= 0b11 << (2 * i);
            }
        }
        (hits, empties)
    };
}

/// Returns `(tag_hits, empty_or_poorer)` for the group at `ctrl`.
///
/// The floor for the slot at offset `i` is `min(d_base + i, 0xFD)`; a slot
/// is *poorer* when its stored distance is below that floor, meaning a key
/// probing at distance `d_base + i` would already have displaced it, which
/// is the Robin Hood short-circuit. Empty slots always set their stop bits;
/// saturated records never do.
///
/// # Safety
///
/// `ctrl` must point to 32 readable control records (64 bytes).
#[inline(always)]
unsafe fn match_tag_with_distance_floor(
    ctrl: *const Ctrl,
    tag: u8,
    d_base: usize,
) -> (GroupMask, GroupMask) {
    #[cfg(all(
        any(target_arch = "x86", target_arch = "x86_64"),
        target_feature = "avx2"
    ))]
    // SAFETY: forwarded bounds contract; AVX2 is compiled in.
    return unsafe { match_tag_with_distance_floor_avx2(ctrl, tag, d_base) };

    #[cfg(not(all(
        any(target_arch = "x86", target_arch = "x86_64"),
        target_feature = "avx2"
    )))]
    return {
        let mut hits = 0u64;
        let mut stops = 0u64;
        for i in 0..GROUP_WIDTH {
            // SAFETY: forwarded bounds contract.
            let c = unsafe { *ctrl.add(i) };
            let floor = round_distance(d_base + i);
            if c.is_used() && c.tag == tag {
                hits |= 0b11 << (2 * i);
            }
            // `distance < floor` can never fire for the empty (0xFF) and
            // end-of-table (0xFE) encodings because floors stop at 0xFD.
            if c.is_empty() || c.distance < floor {
                stops |= 0b11 << (2 * i);
            }
        }
        (hits, stops)
    };
}

#[cfg(all(
    any(target_arch = "x86", target_arch = "x86_64"),
    target_feature = "avx2"
))]
#[inline(always)]
unsafe fn match_used_avx2(ctrl: *const Ctrl) -> GroupMask {
    // SAFETY: the caller guarantees 64 readable bytes at `ctrl`.
    unsafe {
        let ptr = ctrl as *const u8;
        let low_mask = _mm256_set1_epi16(0x00FF);
        let end = _mm256_set1_epi16(DIST_END as i16);

        let mut mask = 0u64;
        for half in 0..2 {
            let data = _mm256_loadu_si256(ptr.add(half * 32) as *const __m256i);
            let dist = _mm256_and_si256(data, low_mask);
            let used = _mm256_cmpgt_epi16(end, dist);
            mask |= (_mm256_movemask_epi8(used) as u32 as u64) << (half * 32);
        }
        mask
    }
}

#[cfg(all(
    any(target_arch = "x86", target_arch = "x86_64"),
    target_feature = "avx2"
))]
#[inline(always)]
unsafe fn match_tag_and_empty_avx2(ctrl: *const Ctrl, tag: u8) -> (GroupMask, GroupMask) {
    // SAFETY: the caller guarantees 64 readable bytes at `ctrl`.
    unsafe {
        let ptr = ctrl as *const u8;
        let low_mask = _mm256_set1_epi16(0x00FF);
        let tag_vec = _mm256_set1_epi16(((tag as u16) << 8) as i16);
        let empty = _mm256_set1_epi16(DIST_EMPTY as i16);
        let end = _mm256_set1_epi16(DIST_END as i16);

        let mut hits = 0u64;
        let mut empties = 0u64;
        for half in 0..2 {
            let data = _mm256_loadu_si256(ptr.add(half * 32) as *const __m256i);
            let dist = _mm256_and_si256(data, low_mask);
            let tags = _mm256_andnot_si256(low_mask, data);
            let used = _mm256_cmpgt_epi16(end, dist);
            let hit = _mm256_and_si256(_mm256_cmpeq_epi16(tags, tag_vec), used);
            let is_empty = _mm256_cmpeq_epi16(dist, empty);
            hits |= (_mm256_movemask_epi8(hit) as u32 as u64) << (half * 32);
            empties |= (_mm256_movemask_epi8(is_empty) as u32 as u64) << (half * 32);
        }
        (hits, empties)
    }
}

#[cfg(all(
    any(target_arch = "x86", target_arch = "x86_64"),
    target_feature = "avx2"
))]
#[inline(always)]
unsafe fn match_tag_with_distance_floor_avx2(
    ctrl: *const Ctrl,
    tag: u8,
    d_base: usize,
) -> (GroupMask, GroupMask) {
    // SAFETY: the caller guarantees 64 readable bytes at `ctrl`.
    unsafe {
        let ptr = ctrl as *const u8;
        let low_mask = _mm256_set1_epi16(0x00FF);
        let tag_vec = _mm256_set1_epi16(((tag as u16) << 8) as i16);
        let empty = _mm256_set1_epi16(DIST_EMPTY as i16);
        let end = _mm256_set1_epi16(DIST_END as i16);
        let max_dist = _mm256_set1_epi16(MAX_DISTANCE as i16);
        let base = _mm256_set1_epi16(d_base.min(MAX_DISTANCE as usize) as i16);
        let lanes = [
            _mm256_setr_epi16(0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15),
            _mm256_setr_epi16(
                16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29, 30, 31,
            ),
        ];

        let mut hits = 0u64;
        let mut stops = 0u64;
        for half in 0..2 {
            let data = _mm256_loadu_si256(ptr.add(half * 32) as *const __m256i);
            let dist = _mm256_and_si256(data, low_mask);
            let tags = _mm256_andnot_si256(low_mask, data);
            let used = _mm256_cmpgt_epi16(end, dist);
            let hit = _mm256_and_si256(_mm256_cmpeq_epi16(tags, tag_vec), used);
            let floor = _mm256_min_epi16(_mm256_add_epi16(base, lanes[half]), max_dist);
            let poorer = _mm256_cmpgt_epi16(floor, dist);
            let stop = _mm256_or_si256(_mm256_cmpeq_epi16(dist, empty), poorer);
            hits |= (_mm256_movemask_epi8(hit) as u32 as u64) << (half * 32);
            stops |= (_mm256_movemask_epi8(stop) as u32 as u64) << (half * 32);
        }
        (hits, stops)
    }
}

#[derive(Debug, Clone, Copy)]
struct DataLayout {
    layout: Layout,
    ctrl_offset: usize,
    slots_offset: usize,
}

impl DataLayout {
    fn new<V>(capacity: usize) -> Result<Self, TryReserveError> {
        let ctrl_layout = Layout::array::<Ctrl>(capacity + GROUP_WIDTH)
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

enum RobinProbe {
    /// The key is present at this slot index.
    Found(usize),
    /// The key is absent; insertion starts at this slot with this distance.
    Insert { index: usize, distance: u8 },
    /// The probe distance outgrew the encoding before a stop appeared.
    Saturated,
}

/// A Robin Hood hash table with 32-slot groups and backward-shift deletion.
///
/// `RobinTable<V>` stores values of type `V` and provides fast insertion,
/// lookup, and removal operations. Unlike standard hash maps, this
/// implementation requires you to provide both the hash value and an
/// equality predicate for each operation.
///
/// ## Performance Characteristics
///
/// - **Memory**: 2 bytes per slot overhead, plus the size of `V` per slot.
pub struct RobinTable<V> {
    layout: DataLayout,
    alloc: NonNull<u8>,

    size: usize,
    slot_mask: usize,

    threshold: usize,
    mlf_q16: u32,

    _phantom: PhantomData<V>,
}

impl<V> RobinTable<V> {
    /// Creates an empty table with the minimum capacity.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Creates a table that can hold at least `capacity` elements before
    /// growing.
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
    pub fn set_max_load_factor(&mut self, mlf: f32, rehash: impl Fn(&V) -> u64) {
        self.mlf_q16 = load_factor::clamp_q16(mlf);
        self.threshold = load_factor::threshold(self.capacity(), self.mlf_q16);
        if self.size > self.threshold {
            let capacity = Self::capacity_for(self.size, self.mlf_q16);
            self.resize_rehash(capacity, &rehash);
        }
    }

    fn ctrls_ptr(&self) -> NonNull<[Ctrl]> {
        // SAFETY: `self.alloc` points to a live allocation described by
        // `self.layout`; the control array starts at `ctrl_offset` and holds
        // `capacity + GROUP_WIDTH` records (the mirror tail included).
        unsafe {
            NonNull::slice_from_raw_parts(
                self.alloc.add(self.layout.ctrl_offset).cast(),
                self.capacity() + GROUP_WIDTH,
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
    fn home_slot(&self, hash: u64) -> usize {
        (hash as usize) & self.slot_mask
    }

    /// Writes a control record, keeping the trailing mirror group identical
    /// to the head of the array.
    ///
    /// # Safety
    ///
    /// The caller must ensure `index < capacity`.
    #[inline(always)]
    unsafe fn set_ctrl(&mut self, index: usize, value: Ctrl) {
        let capacity = self.capacity();
        // SAFETY: caller ensures `index < capacity`; the mirror write lands
        // in the `GROUP_WIDTH` records past the end of the main array.
        unsafe {
            let ctrls = self.ctrls_ptr().as_mut();
            *ctrls.get_unchecked_mut(index) = value;
            if index < GROUP_WIDTH {
                *ctrls.get_unchecked_mut(capacity + index) = value;
            }
        }
    }

    /// Searches the probe sequence of `hash` for a value matching `eq`.
    ///
    /// The probe walks 32-slot windows from the home slot, stopping at the
    /// first empty slot or, while the running distance is still encodable,
    /// at the first slot richer than the probe.
    #[inline]
    fn search(&self, hash: u64, eq: impl Fn(&V) -> bool) -> Option<usize> {
        let tag = ctrl_tag(hash);
        let home = self.home_slot(hash);
        let mut slot = home;
        let mut d_base = 0usize;
        loop {
            // SAFETY: `slot <= slot_mask` and the control array extends a
            // full mirror group past `capacity`, so the 32-record window
            // starting at `slot` is readable.
            let (mut hits, stops) = unsafe {
                let ptr = self.ctrls_ptr().as_ref().as_ptr().add(slot);
                if d_base <= MAX_DISTANCE as usize {
                    match_tag_with_distance_floor(ptr, tag, d_base)
                } else {
                    // Floors are all saturated from here on and can no
                    // longer prove absence; fall back to terminating on
                    // empties alone.
                    match_tag_and_empty(ptr, tag)
                }
            };
            while hits != 0 {
                let index = (slot + (bits::lowest_set(hits) >> 1)) & self.slot_mask;
                hits = bits::clear_lowest(hits);
                // SAFETY: an in-use control record guarantees the slot holds
                // an initialized value.
                if eq(unsafe { self.slots_ptr().as_ref().get_unchecked(index).assume_init_ref() })
                {
                    return Some(index);
                }
            }
            if stops != 0 {
                return None;
            }
            slot = (slot + GROUP_WIDTH) & self.slot_mask;
            d_base += GROUP_WIDTH;
            if slot == home {
                return None;
            }
        }
    }

    /// Searches like [`search`](Self::search) while also locating the slot an
    /// insert of this key must start at: the first empty slot, or the first
    /// slot whose occupant is richer than the probing key.
    ///
    /// With `clamp` unset, the probe reports saturation instead of walking
    /// past the distance encoding; with it set, distances clamp and the probe
    /// always finds a slot.
    fn probe_insert(&self, hash: u64, eq: impl Fn(&V) -> bool, clamp: bool) -> RobinProbe {
        let tag = ctrl_tag(hash);
        let home = self.home_slot(hash);
        let mut slot = home;
        let mut d_base = 0usize;
        loop {
            // SAFETY: window bounds as in `search`.
            let (mut hits, stops) = unsafe {
                let ptr = self.ctrls_ptr().as_ref().as_ptr().add(slot);
                match_tag_with_distance_floor(ptr, tag, d_base)
            };
            while hits != 0 {
                let index = (slot + (bits::lowest_set(hits) >> 1)) & self.slot_mask;
                hits = bits::clear_lowest(hits);
                // SAFETY: an in-use control record guarantees the slot holds
                // an initialized value.
                if eq(unsafe { self.slots_ptr().as_ref().get_unchecked(index).assume_init_ref() })
                {
                    return RobinProbe::Found(index);
                }
            }
            if stops != 0 {
                let offset = bits::lowest_set(stops) >> 1;
                return RobinProbe::Insert {
                    index: (slot + offset) & self.slot_mask,
                    distance: round_distance(d_base + offset),
                };
            }
            slot = (slot + GROUP_WIDTH) & self.slot_mask;
            d_base += GROUP_WIDTH;
            if !clamp && d_base > MAX_DISTANCE as usize {
                return RobinProbe::Saturated;
            }
            if slot == home {
                return RobinProbe::Saturated;
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
    /// The displaced run following the removed slot is shifted back one
    /// position, so the table carries no tombstones.
    pub fn remove(&mut self, hash: u64, eq: impl Fn(&V) -> bool) -> Option<V> {
        if self.size == 0 {
            return None;
        }
        let index = self.search(hash, eq)?;
        // SAFETY: `search` only returns indices of in-use, initialized slots.
        Some(unsafe { self.erase_slot(index) })
    }

    /// Gets an entry for the given hash and equality predicate.
    ///
    /// Grows the table first when the load threshold would be exceeded. A
    /// probe that outruns the distance encoding also grows the table once
    /// before falling back to saturated distances.
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
        let mut grew = false;
        loop {
            match self.probe_insert(hash, &eq, grew) {
                RobinProbe::Found(index) => {
                    return Entry::Occupied(OccupiedEntry { table: self, index });
                }
                RobinProbe::Insert { index, distance } => {
                    return Entry::Vacant(VacantEntry {
                        table: self,
                        index,
                        distance,
                        tag: ctrl_tag(hash),
                    });
                }
                RobinProbe::Saturated => {
                    self.grow(&rehash);
                    grew = true;
                }
            }
        }
    }

    /// Places an entry at `index`, displacing the present occupant and
    /// carrying displaced entries forward until an empty slot absorbs the
    /// chain.
    ///
    /// # Safety
    ///
    /// The caller must ensure `index < capacity`, that the slot at `index`
    /// is empty or holds an occupant with a smaller stored distance than
    /// `distance`, and that the table has at least one empty slot.
    unsafe fn insert_at(&mut self, index: usize, distance: u8, tag: u8, value: V) {
        let mut cur = index;
        let mut carry = Ctrl { distance, tag };
        let mut carry_value = value;
        loop {
            // SAFETY: `cur` is masked below capacity; control and slot
            // accesses stay in bounds.
            let existing = unsafe { *self.ctrls_ptr().as_ref().get_unchecked(cur) };
            if existing.is_empty() {
                unsafe {
                    self.set_ctrl(cur, carry);
                    self.slots_ptr()
                        .as_mut()
                        .get_unchecked_mut(cur)
                        .write(carry_value);
                }
                return;
            }
            if existing.distance < carry.distance {
                // Steal from the richer occupant; it continues probing with
                // its own control record.
                // SAFETY: the in-use record at `cur` marks an initialized
                // cell; it is read out exactly once before being overwritten.
                unsafe {
                    let slot = self.slots_ptr().as_mut().get_unchecked_mut(cur);
                    let displaced = slot.assume_init_read();
                    slot.write(carry_value);
                    carry_value = displaced;
                    self.set_ctrl(cur, carry);
                }
                carry = existing;
            }
            cur = (cur + 1) & self.slot_mask;
            carry.distance = saturating_inc(carry.distance);
        }
    }

    /// Removes the value at `index` and back-shifts the displaced run that
    /// follows it.
    ///
    /// # Safety
    ///
    /// The caller must ensure `index < capacity` and that the slot is
    /// in-use.
    unsafe fn erase_slot(&mut self, index: usize) -> V {
        // SAFETY: the in-use record at `index` marks an initialized cell.
        let value = unsafe {
            self.slots_ptr()
                .as_ref()
                .get_unchecked(index)
                .assume_init_read()
        };
        self.size -= 1;

        let mut hole = index;
        loop {
            let next = (hole + 1) & self.slot_mask;
            // SAFETY: `next` is masked below capacity.
            let c = unsafe { *self.ctrls_ptr().as_ref().get_unchecked(next) };
            if !c.is_used() || c.distance == 0 {
                // SAFETY: `hole` is below capacity; its cell was moved out.
                unsafe { self.set_ctrl(hole, Ctrl::EMPTY) };
                return value;
            }
            // The successor moves one slot closer to its home. Saturated
            // records keep their distance; their true distance is unknown.
            // SAFETY: the in-use record at `next` marks an initialized cell,
            // read out exactly once as it moves into the hole.
            unsafe {
                let moved = self
                    .slots_ptr()
                    .as_ref()
                    .get_unchecked(next)
                    .assume_init_read();
                self.slots_ptr()
                    .as_mut()
                    .get_unchecked_mut(hole)
                    .write(moved);
                let distance = if c.distance >= MAX_DISTANCE {
                    MAX_DISTANCE
                } else {
                    c.distance - 1
                };
                self.set_ctrl(
                    hole,
                    Ctrl {
                        distance,
                        tag: c.tag,
                    },
                );
            }
            hole = next;
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
    pub fn clear(&mut self) {
        // SAFETY: in-use control records mark exactly the initialized cells;
        // after dropping them every record (mirror included) returns to
        // empty.
        unsafe {
            if core::mem::needs_drop::<V>() && self.size > 0 {
                for index in 0..self.capacity() {
                    if self.ctrls_ptr().as_ref().get_unchecked(index).is_used() {
                        self.slots_ptr()
                            .as_mut()
                            .get_unchecked_mut(index)
                            .assume_init_drop();
                    }
                }
            }
            self.ctrls_ptr().as_mut().fill(Ctrl::EMPTY);
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
    /// Old entries are re-inserted uniquely, without key comparisons, but
    /// still with displacement, so the Robin Hood ordering holds in the new
    /// table.
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
        self.threshold = load_factor::threshold(new_capacity, self.mlf_q16);
        // SAFETY: the fresh control array holds at least one full group.
        debug_assert!(unsafe { match_empty(self.ctrls_ptr().as_ref().as_ptr()) } == u64::MAX);

        // SAFETY: the old allocation stays valid until the final dealloc; we
        // move each initialized value out exactly once (ownership transfers
        // to the new table) and never drop the moved-out cells. Group scans
        // stay within the old canonical region because the old capacity is a
        // multiple of the group width.
        unsafe {
            let old_ctrls: *const Ctrl = old_alloc.add(old_layout.ctrl_offset).cast().as_ptr();
            let old_slots: *const MaybeUninit<V> =
                old_alloc.add(old_layout.slots_offset).cast().as_ptr();

            let mut start = 0;
            while start < old_capacity {
                let mut used = match_used(old_ctrls.add(start));
                while used != 0 {
                    let index = start + (bits::lowest_set(used) >> 1);
                    used = bits::clear_lowest(used);
                    let value = (*old_slots.add(index)).assume_init_read();
                    let hash = rehash(&value);
                    self.insert_unique(hash, value);
                }
                start += GROUP_WIDTH;
            }

            alloc::alloc::dealloc(old_alloc.as_ptr(), old_layout.layout);
        }

        Ok(())
    }

    /// Inserts a value known to be absent, skipping the key comparison but
    /// keeping the displacement discipline.
    ///
    /// # Safety
    ///
    /// The caller must ensure the table has at least one empty slot and that
    /// no stored value compares equal to `value`.
    unsafe fn insert_unique(&mut self, hash: u64, value: V) {
        let tag = ctrl_tag(hash);
        let home = self.home_slot(hash);
        let mut slot = home;
        let mut d_base = 0usize;
        loop {
            // SAFETY: window bounds as in `search`.
            let stops = unsafe {
                let ptr = self.ctrls_ptr().as_ref().as_ptr().add(slot);
                match_tag_with_distance_floor(ptr, tag, d_base).1
            };
            if stops != 0 {
                let offset = bits::lowest_set(stops) >> 1;
                let index = (slot + offset) & self.slot_mask;
                let distance = round_distance(d_base + offset);
                // SAFETY: the stop bit proves the slot is empty or poorer
                // than `distance`, and an empty slot exists by the load
                // threshold.
                unsafe { self.insert_at(index, distance, tag, value) };
                return;
            }
            slot = (slot + GROUP_WIDTH) & self.slot_mask;
            d_base += GROUP_WIDTH;
            debug_assert_ne!(slot, home);
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
        // SAFETY: snapshot the canonical control region, then mark the table
        // empty so the drained cells cannot be dropped twice.
        let occupied = unsafe {
            let snapshot: Box<[Ctrl]> = self.ctrls_ptr().as_ref()[..capacity].to_vec().into();
            self.ctrls_ptr().as_mut().fill(Ctrl::EMPTY);
            snapshot
        };
        self.size = 0;

        Drain {
            table: self,
            occupied,
            index: 0,
        }
    }

    /// Returns a histogram of the stored probe distances.
    ///
    /// The final bucket collects saturated records.
    #[cfg(feature = "stats")]
    pub fn probe_histogram(&self) -> ProbeHistogram {
        let mut counts = alloc::vec![0usize; MAX_DISTANCE as usize + 1];
        // SAFETY: scanning the canonical control region only.
        unsafe {
            for index in 0..self.capacity() {
                let c = *self.ctrls_ptr().as_ref().get_unchecked(index);
                if c.is_used() {
                    counts[c.distance as usize] += 1;
                }
            }
        }
        ProbeHistogram {
            populated: self.size,
            capacity: self.capacity(),
            counts,
        }
    }
}

impl<V> Default for RobinTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Drop for RobinTable<V> {
    fn drop(&mut self) {
        // SAFETY: in-use control records mark exactly the initialized cells.
        unsafe {
            if core::mem::needs_drop::<V>() && self.size > 0 {
                for index in 0..self.capacity() {
                    if self.ctrls_ptr().as_ref().get_unchecked(index).is_used() {
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

impl<V> Clone for RobinTable<V>
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
                capacity + GROUP_WIDTH,
            );
            for index in 0..capacity {
                if self.ctrls_ptr().as_ref().get_unchecked(index).is_used() {
                    new_table.slots_ptr().as_mut().get_unchecked_mut(index).write(
                        self.slots_ptr()
                            .as_ref()
                            .get_unchecked(index)
                            .assume_init_ref()
                            .clone(),
                    );
                }
            }
        }

        new_table
    }
}

impl<V> Debug for RobinTable<V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut max_distance = 0u8;
        // SAFETY: scanning the canonical control region only.
        unsafe {
            for index in 0..self.capacity() {
                let c = *self.ctrls_ptr().as_ref().get_unchecked(index);
                if c.is_used() && c.distance > max_distance {
                    max_distance = c.distance;
                }
            }
        }
        f.debug_struct("RobinTable")
            .field("size", &self.size)
            .field("capacity", &self.capacity())
            .field("threshold", &self.threshold)
            .field("max_distance", &max_distance)
            .finish()
    }
}

fn try_alloc_ctrl_init(
    layout: &DataLayout,
    capacity: usize,
) -> Result<NonNull<u8>, TryReserveError> {
    // SAFETY: the layout has non-zero size (capacity is at least one group);
    // a null return is reported to the caller.
    unsafe {
        let raw = alloc::alloc::alloc(layout.layout);
        if raw.is_null() {
            return Err(TryReserveError::AllocError {
                layout: layout.layout,
            });
        }
        let ctrls = core::slice::from_raw_parts_mut(
            raw.add(layout.ctrl_offset) as *mut Ctrl,
            capacity + GROUP_WIDTH,
        );
        ctrls.fill(Ctrl::EMPTY);
        Ok(NonNull::new_unchecked(raw))
    }
}

/// Debug statistics over the stored probe distances of a [`RobinTable`].
#[cfg(feature = "stats")]
#[derive(Debug, Clone)]
pub struct ProbeHistogram {
    /// Number of elements currently in the table.
    pub populated: usize,
    /// Total number of slots allocated.
    pub capacity: usize,
    /// Count of in-use slots per stored probe distance. The final bucket
    /// collects saturated records.
    pub counts: alloc::vec::Vec<usize>,
}

#[cfg(feature = "stats")]
impl ProbeHistogram {
    /// Pretty-print the histogram.
    #[cfg(feature = "std")]
    pub fn print(&self) {
        let last = match self.counts.iter().rposition(|&c| c != 0) {
            Some(last) => last,
            None => {
                println!("probe histogram: empty");
                return;
            }
        };
        let max = *self.counts.iter().max().unwrap();
        let max_bar = 60usize;
        println!(
            "probe distances ({} entries, {} slots):",
            self.populated, self.capacity
        );
        for (distance, &count) in self.counts.iter().enumerate().take(last + 1) {
            let width = (count * max_bar).div_ceil(max);
            let bar = "█".repeat(if count == 0 { 0 } else { width.max(1) });
            println!("{:>3} | {} ({})", distance, bar, count);
        }
    }
}

/// A view into a single entry in the table, which may be vacant or occupied.
///
/// Constructed from the [`entry`] method on [`RobinTable`].
///
/// [`entry`]: RobinTable::entry
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
/// Created by [`entry`] when no stored value matches; holds the slot and
/// probe distance the insertion will use.
///
/// [`entry`]: RobinTable::entry
pub struct VacantEntry<'a, V> {
    table: &'a mut RobinTable<V>,
    index: usize,
    distance: u8,
    tag: u8,
}

impl<'a, V> VacantEntry<'a, V> {
    /// Inserts a value, displacing richer occupants as needed, and returns a
    /// mutable reference to it.
    pub fn insert(self, value: V) -> &'a mut V {
        self.table.size += 1;
        // SAFETY: `probe_insert` guarantees the slot at `index` is empty or
        // poorer than `distance`, and the pre-insert growth check guarantees
        // an empty slot exists. The new value always lands at `index`; any
        // occupant is carried forward by `insert_at`.
        unsafe {
            self.table
                .insert_at(self.index, self.distance, self.tag, value);
            self.table
                .slots_ptr()
                .as_mut()
                .get_unchecked_mut(self.index)
                .assume_init_mut()
        }
    }
}

/// A view into an occupied entry in the table.
///
/// Created by [`entry`] when a stored value matches the probe.
///
/// [`entry`]: RobinTable::entry
pub struct OccupiedEntry<'a, V> {
    table: &'a mut RobinTable<V>,
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

    /// Removes the entry from the table, back-shifting its successors, and
    /// returns the value.
    pub fn remove(self) -> V {
        // SAFETY: see the invariant note on the impl block.
        unsafe { self.table.erase_slot(self.index) }
    }
}

/// An iterator over the values in a [`RobinTable`].
///
/// Created by [`iter`](RobinTable::iter); yields `&V` in arbitrary order.
pub struct Iter<'a, V> {
    table: &'a RobinTable<V>,
    index: usize,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = &'a V;

    fn next(&mut self) -> Option<Self::Item> {
        let capacity = self.table.capacity();
        // SAFETY: `self.index` stays below `capacity`; in-use control
        // records mark initialized cells.
        unsafe {
            while self.index < capacity {
                let index = self.index;
                self.index += 1;
                if self.table.ctrls_ptr().as_ref().get_unchecked(index).is_used() {
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

/// A draining iterator over the values in a [`RobinTable`].
///
/// Created by [`drain`](RobinTable::drain); yields owned values and leaves
/// the table empty.
pub struct Drain<'a, V> {
    table: &'a mut RobinTable<V>,
    occupied: Box<[Ctrl]>,
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
                if self.occupied.get_unchecked(index).is_used() {
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

#[cfg(test)]
mod tests {
    use alloc::string::String;
    use alloc::string::ToString;
    use alloc::vec::Vec;
    use core::hash::Hasher;

    use rand::TryRngCore;
    use rand::rngs::OsRng;
    use siphasher::sip::SipHasher;

    use super::*;

    struct HashState {
        k0: u64,
        k1: u64,
    }

    impl HashState {
        fn default() -> Self {
            let mut rng = OsRng;
            Self {
                k0: rng.try_next_u64().unwrap(),
                k1: rng.try_next_u64().unwrap(),
            }
        }

        fn build_hasher(&self) -> SipHasher {
            SipHasher::new_with_keys(self.k0, self.k1)
        }
    }

    #[derive(Debug, PartialEq, Eq, Clone)]
    struct Item {
        key: u64,
        value: i32,
    }

    fn hash_key(state: &HashState, key: u64) -> u64 {
        let mut h = state.build_hasher();
        h.write_u64(key);
        h.finish()
    }

    fn insert_item(table: &mut RobinTable<Item>, state: &HashState, key: u64, value: i32) -> bool {
        let hash = hash_key(state, key);
        match table.entry(hash, |v| v.key == key, |v| hash_key(state, v.key)) {
            Entry::Vacant(v) => {
                v.insert(Item { key, value });
                true
            }
            Entry::Occupied(mut o) => {
                o.get_mut().value = value;
                false
            }
        }
    }

    fn mirror_matches_head<V>(table: &RobinTable<V>) -> bool {
        // SAFETY: reads within the allocated control array.
        unsafe {
            let ctrls = table.ctrls_ptr().as_ref();
            let capacity = table.capacity();
            (0..GROUP_WIDTH).all(|i| ctrls[i] == ctrls[capacity + i])
        }
    }

    fn load_invariant_holds<V>(table: &RobinTable<V>) -> bool {
        table.size <= table.threshold && table.threshold < table.capacity()
    }

    /// Walks every in-use slot and checks the Robin Hood invariants: the
    /// stored tag matches the key's hash, the home slot implied by the
    /// stored distance is correct, and no slot between home and position is
    /// empty. Saturated records only get the no-empty check.
    fn robin_invariants_hold(table: &RobinTable<Item>, state: &HashState) -> bool {
        // SAFETY: reads within the canonical control region.
        unsafe {
            let ctrls = table.ctrls_ptr().as_ref();
            let mask = table.slot_mask;
            for index in 0..table.capacity() {
                let c = ctrls[index];
                if !c.is_used() {
                    continue;
                }
                let item = table.slots_ptr().as_ref()[index].assume_init_ref();
                let hash = hash_key(state, item.key);
                if ctrl_tag(hash) != c.tag {
                    return false;
                }
                let distance = c.distance as usize;
                if c.distance < MAX_DISTANCE {
                    let home = (index.wrapping_sub(distance)) & mask;
                    if home != table.home_slot(hash) {
                        return false;
                    }
                }
                for back in 1..=distance.min(c.distance as usize) {
                    let probe = (index.wrapping_sub(back)) & mask;
                    if ctrls[probe].is_empty() {
                        return false;
                    }
                }
            }
        }
        true
    }

    #[test]
    fn mask_match_used_and_empty() {
        let mut group = [Ctrl::EMPTY; GROUP_WIDTH];
        group[0] = Ctrl {
            distance: 0,
            tag: 0xAB,
        };
        group[7] = Ctrl {
            distance: 3,
            tag: 0x11,
        };
        group[31] = Ctrl {
            distance: MAX_DISTANCE,
            tag: 0xAB,
        };

        // SAFETY: `group` holds exactly 32 records.
        unsafe {
            let used = match_used(group.as_ptr());
            assert_eq!(used, (0b11 << 0) | (0b11 << 14) | (0b11u64 << 62));

            let empties = match_empty(group.as_ptr());
            assert_eq!(used & empties, 0);
            assert_eq!(used | empties, u64::MAX);

            let (hits, empty_mask) = match_tag_and_empty(group.as_ptr(), 0xAB);
            assert_eq!(hits, (0b11 << 0) | (0b11u64 << 62));
            assert_eq!(empty_mask, empties);
        }
    }

    #[test]
    fn mask_tag_hits_exclude_unused() {
        // An empty record whose tag byte happens to equal the needle must
        // not report a hit.
        let mut group = [Ctrl::EMPTY; GROUP_WIDTH];
        group[4] = Ctrl {
            distance: DIST_EMPTY,
            tag: 0x77,
        };
        group[5] = Ctrl {
            distance: 2,
            tag: 0x77,
        };

        // SAFETY: `group` holds exactly 32 records.
        unsafe {
            let (hits, _) = match_tag_and_empty(group.as_ptr(), 0x77);
            assert_eq!(hits, 0b11 << 10);
        }
    }

    #[test]
    fn mask_distance_floor_detects_poorer_slots() {
        let mut group = [Ctrl::EMPTY; GROUP_WIDTH];
        for i in 0..GROUP_WIDTH {
            // Every slot at its exact probe distance: nothing is poorer.
            group[i] = Ctrl {
                distance: i as u8,
                tag: 0x42,
            };
        }

        // SAFETY: `group` holds exactly 32 records.
        unsafe {
            let (hits, stops) = match_tag_with_distance_floor(group.as_ptr(), 0x42, 0);
            assert_eq!(hits, u64::MAX);
            assert_eq!(stops, 0);

            // Raising the base floor by one makes every slot poorer.
            let (_, stops) = match_tag_with_distance_floor(group.as_ptr(), 0x42, 1);
            assert_eq!(stops, u64::MAX);
        }

        // A slot richer than the probe path stops it even mid-group.
        group[9] = Ctrl {
            distance: 2,
            tag: 0x42,
        };
        // SAFETY: `group` holds exactly 32 records.
        unsafe {
            let (_, stops) = match_tag_with_distance_floor(group.as_ptr(), 0x42, 0);
            assert_eq!(stops, 0b11 << 18);
        }
    }

    #[test]
    fn mask_distance_floor_ignores_saturated_records() {
        let mut group = [Ctrl::EMPTY; GROUP_WIDTH];
        for i in 0..GROUP_WIDTH {
            group[i] = Ctrl {
                distance: MAX_DISTANCE,
                tag: 0,
            };
        }

        // SAFETY: `group` holds exactly 32 records.
        unsafe {
            // Floors clamp at the saturation value, and saturated records
            // never read as poorer, so nothing can stop this probe.
            let (_, stops) = match_tag_with_distance_floor(group.as_ptr(), 0, 10_000);
            assert_eq!(stops, 0);
        }
    }

    #[test]
    fn insert_and_find() {
        let state = HashState::default();
        let mut table: RobinTable<Item> = RobinTable::new();
        for k in 0..32u64 {
            assert!(insert_item(&mut table, &state, k, (k as i32) * 2));
            let hash = hash_key(&state, k);
            assert_eq!(
                table.find(hash, |v| v.key == k),
                Some(&Item {
                    key: k,
                    value: (k as i32) * 2
                }),
                "{:#?}",
                table
            );
        }
        assert_eq!(table.len(), 32);
        assert!(mirror_matches_head(&table));
        assert!(load_invariant_holds(&table));
        assert!(robin_invariants_hold(&table, &state));

        let miss_hash = hash_key(&state, 999);
        assert!(table.find(miss_hash, |v| v.key == 999).is_none());
    }

    #[test]
    fn duplicate_entry_is_occupied() {
        let state = HashState::default();
        let mut table: RobinTable<Item> = RobinTable::new();
        assert!(insert_item(&mut table, &state, 42, 7));
        assert!(!insert_item(&mut table, &state, 42, 11));
        assert_eq!(table.len(), 1);

        let hash = hash_key(&state, 42);
        assert_eq!(table.find(hash, |v| v.key == 42).unwrap().value, 11);
    }

    #[test]
    fn find_mut_and_modify() {
        let state = HashState::default();
        let mut table: RobinTable<Item> = RobinTable::new();
        for k in 0..5u64 {
            insert_item(&mut table, &state, k, 1);
        }
        for k in 0..5u64 {
            let hash = hash_key(&state, k);
            if let Some(v) = table.find_mut(hash, |v| v.key == k) {
                v.value += 9;
            }
        }
        for k in 0..5u64 {
            let hash = hash_key(&state, k);
            assert_eq!(table.find(hash, |v| v.key == k).unwrap().value, 10);
        }
    }

    #[test]
    fn erase_back_shifts_the_displaced_run() {
        // All keys share hash zero, so they form one contiguous run with
        // distances 0..6 from slot zero.
        let mut table: RobinTable<Item> = RobinTable::new();
        for k in 0..6u64 {
            match table.entry(0, |v| v.key == k, |_| 0) {
                Entry::Vacant(v) => {
                    v.insert(Item {
                        key: k,
                        value: k as i32,
                    });
                }
                _ => unreachable!(),
            }
        }

        let removed = table.remove(0, |v| v.key == 2).expect("should remove");
        assert_eq!(removed.key, 2);
        assert_eq!(table.len(), 5);

        // The survivors closed the gap: distances are again 0..5 with no
        // hole in between.
        // SAFETY: reads within the canonical control region.
        unsafe {
            let ctrls = table.ctrls_ptr().as_ref();
            for offset in 0..5usize {
                assert_eq!(ctrls[offset].distance, offset as u8);
            }
            assert!(ctrls[5].is_empty());
        }
        for k in [0u64, 1, 3, 4, 5] {
            assert!(table.find(0, |v| v.key == k).is_some(), "{:#?}", table);
        }
    }

    #[test]
    fn displacement_keeps_mixed_homes_findable() {
        // Two hash values landing 1 slot apart force later inserts of the
        // first chain to displace through the second.
        let mut table: RobinTable<Item> = RobinTable::new();
        let eq = |key: u64| move |v: &Item| v.key == key;
        for k in 0..8u64 {
            let hash = if k % 2 == 0 { 0 } else { 1 };
            match table.entry(hash, eq(k), |v| if v.key % 2 == 0 { 0 } else { 1 }) {
                Entry::Vacant(v) => {
                    v.insert(Item {
                        key: k,
                        value: k as i32,
                    });
                }
                _ => unreachable!(),
            }
        }
        for k in 0..8u64 {
            let hash = if k % 2 == 0 { 0 } else { 1 };
            assert!(
                table.find(hash, |v| v.key == k).is_some(),
                "key {} in {:#?}",
                k,
                table
            );
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn insert_many() {
        let state = HashState::default();
        let mut table: RobinTable<Item> = RobinTable::new();
        for k in 0..100_000u64 {
            assert!(insert_item(&mut table, &state, k, k as i32));
        }
        assert_eq!(table.len(), 100_000, "{:#?}", table);
        assert!(load_invariant_holds(&table));
        assert!(mirror_matches_head(&table));
        for k in 0..100_000u64 {
            let hash = hash_key(&state, k);
            assert_eq!(
                table.find(hash, |v| v.key == k),
                Some(&Item {
                    key: k,
                    value: k as i32
                })
            );
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn random_churn_preserves_invariants() {
        let state = HashState::default();
        let mut rng = OsRng;
        let mut table: RobinTable<Item> = RobinTable::new();
        let mut live: Vec<u64> = Vec::new();

        for round in 0..20 {
            for _ in 0..500 {
                let key = rng.try_next_u64().unwrap() % 4096;
                if insert_item(&mut table, &state, key, round) {
                    live.push(key);
                }
            }
            live.sort_unstable();
            live.dedup();
            let (keep, evict) = live.split_at(live.len() / 2);
            for &key in evict {
                let hash = hash_key(&state, key);
                assert!(table.remove(hash, |v| v.key == key).is_some());
            }
            let keep: Vec<u64> = keep.to_vec();
            for &key in &keep {
                let hash = hash_key(&state, key);
                assert!(table.find(hash, |v| v.key == key).is_some());
            }
            assert_eq!(table.len(), keep.len());
            assert!(robin_invariants_hold(&table, &state));
            assert!(mirror_matches_head(&table));
            assert!(load_invariant_holds(&table));
            live = keep;
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn constant_hash_saturates_and_survives() {
        // Every key hashes to the same slot; by the 255th insert the probe
        // distance outruns the encoding, forcing a rebuild and then
        // saturated records. Everything must stay findable.
        let mut table: RobinTable<Item> = RobinTable::new();
        for k in 0..255u64 {
            match table.entry(0, |v| v.key == k, |_| 0) {
                Entry::Vacant(v) => {
                    v.insert(Item {
                        key: k,
                        value: k as i32,
                    });
                }
                _ => unreachable!(),
            }
        }
        assert_eq!(table.len(), 255);
        for k in 0..255u64 {
            assert_eq!(
                table.find(0, |v| v.key == k).map(|v| v.value),
                Some(k as i32)
            );
        }

        // Back-shift through the saturated run.
        for k in 0..255u64 {
            assert!(table.remove(0, |v| v.key == k).is_some(), "key {}", k);
        }
        assert!(table.is_empty());
    }

    #[test]
    fn reserve_avoids_rehash() {
        let state = HashState::default();
        let mut table: RobinTable<Item> = RobinTable::new();
        table.reserve(10_000, |v| hash_key(&state, v.key));
        let capacity = table.capacity();
        for k in 0..10_000u64 {
            insert_item(&mut table, &state, k, k as i32);
        }
        assert_eq!(table.capacity(), capacity);
        assert_eq!(table.len(), 10_000);
    }

    #[test]
    fn rehash_preserves_contents_and_ordering() {
        let state = HashState::default();
        let mut table: RobinTable<Item> = RobinTable::new();
        for k in 0..100u64 {
            insert_item(&mut table, &state, k, k as i32);
        }
        table.rehash(1024, |v| hash_key(&state, v.key));
        assert_eq!(table.capacity(), 1024);
        assert_eq!(table.len(), 100);
        assert!(robin_invariants_hold(&table, &state));
        for k in 0..100u64 {
            let hash = hash_key(&state, k);
            assert_eq!(table.find(hash, |v| v.key == k).unwrap().value, k as i32);
        }

        table.shrink_to_fit(|v| hash_key(&state, v.key));
        assert!(table.capacity() < 1024);
        assert!(robin_invariants_hold(&table, &state));
        for k in 0..100u64 {
            let hash = hash_key(&state, k);
            assert!(table.find(hash, |v| v.key == k).is_some());
        }
    }

    #[test]
    fn clear_resets_all_controls() {
        let state = HashState::default();
        let mut table: RobinTable<Item> = RobinTable::new();
        for k in 0..20u64 {
            insert_item(&mut table, &state, k, k as i32);
        }
        let capacity = table.capacity();
        table.clear();
        assert_eq!(table.len(), 0);
        assert_eq!(table.capacity(), capacity);
        assert!(mirror_matches_head(&table));
        for k in 0..20u64 {
            let hash = hash_key(&state, k);
            assert!(table.find(hash, |v| v.key == k).is_none());
        }
    }

    #[test]
    fn max_load_factor_is_clamped_and_applied() {
        let state = HashState::default();
        let mut table: RobinTable<Item> = RobinTable::new();
        table.set_max_load_factor(5.0, |v| hash_key(&state, v.key));
        assert!((table.max_load_factor() - 0.8).abs() < 0.01);
        table.set_max_load_factor(0.0, |v| hash_key(&state, v.key));
        assert!((table.max_load_factor() - 0.2).abs() < 0.01);

        for k in 0..40u64 {
            insert_item(&mut table, &state, k, 0);
        }
        assert!(load_invariant_holds(&table));

        table.set_max_load_factor(0.8, |v| hash_key(&state, v.key));
        table.set_max_load_factor(0.2, |v| hash_key(&state, v.key));
        assert!(load_invariant_holds(&table));
        assert!(robin_invariants_hold(&table, &state));
    }

    #[test]
    fn iter_and_drain() {
        let state = HashState::default();
        let mut table: RobinTable<Item> = RobinTable::new();
        for k in 10..20u64 {
            insert_item(&mut table, &state, k, (k as i32) + 1);
        }
        let collected: Vec<u64> = table.iter().map(|v| v.key).collect();
        assert_eq!(collected.len(), 10, "{:#?}", table);
        for k in 10..20u64 {
            assert!(collected.contains(&k));
        }

        let drained: Vec<Item> = table.drain().collect();
        assert_eq!(drained.len(), 10);
        assert_eq!(table.len(), 0);
        for k in 10..20u64 {
            let hash = hash_key(&state, k);
            assert!(table.find(hash, |v| v.key == k).is_none());
        }
    }

    #[test]
    fn drain_drop_removes_unyielded() {
        let state = HashState::default();
        let mut table: RobinTable<String> = RobinTable::new();
        for k in 0..10u64 {
            let hash = hash_key(&state, k);
            let text = k.to_string();
            match table.entry(
                hash,
                |v| *v == text,
                |v| hash_key(&state, v.parse::<u64>().unwrap()),
            ) {
                Entry::Vacant(v) => {
                    v.insert(text);
                }
                _ => unreachable!(),
            }
        }
        let mut drain = table.drain();
        let _ = drain.next();
        drop(drain);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn clone_is_independent() {
        let state = HashState::default();
        let mut table: RobinTable<Item> = RobinTable::new();
        for k in 0..50u64 {
            insert_item(&mut table, &state, k, k as i32);
        }
        let clone = table.clone();
        table.clear();

        assert_eq!(clone.len(), 50);
        assert!(robin_invariants_hold(&clone, &state));
        for k in 0..50u64 {
            let hash = hash_key(&state, k);
            assert_eq!(clone.find(hash, |v| v.key == k).unwrap().value, k as i32);
        }
        assert!(mirror_matches_head(&clone));
    }

    #[derive(Debug, PartialEq, Eq, Clone)]
    struct StringItem {
        key: String,
        value: i32,
    }

    fn hash_string_key(state: &HashState, key: &str) -> u64 {
        let mut h = state.build_hasher();
        h.write(key.as_bytes());
        h.finish()
    }

    #[test]
    fn insert_and_find_string_keys() {
        let state = HashState::default();
        let mut table: RobinTable<StringItem> = RobinTable::new();
        let keys = ["hello", "world", "foo", "bar", "baz"];

        for (i, k) in keys.iter().enumerate() {
            let hash = hash_string_key(&state, k);
            match table.entry(
                hash,
                |v: &StringItem| v.key == *k,
                |v| hash_string_key(&state, &v.key),
            ) {
                Entry::Vacant(v) => {
                    v.insert(StringItem {
                        key: k.to_string(),
                        value: i as i32,
                    });
                }
                Entry::Occupied(_) => panic!("unexpected occupied on first insert"),
            }
        }

        assert_eq!(table.len(), keys.len());
        for (i, k) in keys.iter().enumerate() {
            let hash = hash_string_key(&state, k);
            assert_eq!(
                table.find(hash, |v| v.key == *k),
                Some(&StringItem {
                    key: k.to_string(),
                    value: i as i32
                })
            );
        }

        let miss_hash = hash_string_key(&state, "not found");
        assert!(table.find(miss_hash, |v| v.key == "not found").is_none());
    }
}
