#![forbid(unsafe_code)]
//! Range allocation tracker.
//!
//! A [`RangeTree`] records which half-open `[start, end)` byte ranges of a
//! backing space are in use, with O(log n) insert/remove, automatic
//! coalescing of touching ranges, split-on-partial-remove, a power-of-two
//! size histogram, and set-difference operations between trees
//! ([`remove_xor_add`]).
//!
//! ## Coordinate transform
//!
//! A tree may be created with a base offset and a shift: every external
//! start/size must then be `>= start` and a multiple of `1 << shift`, and is
//! stored internally as `(value - start) >> shift`. This lets a tree over a
//! block-granular region store compact block numbers while callers keep
//! talking in bytes.
//!
//! ## Concurrency
//!
//! Not internally synchronized. Callers serialize all access, including
//! reads against writes, with their own lock. No operation blocks.
//!
//! ## Failure model
//!
//! Structural misuse (overlapping add, destroying a non-empty tree, swap
//! into a non-empty tree, zero-length or misaligned ranges) panics.
//! Removing a range that is not present is tolerated: it logs an error and
//! leaves the tree unchanged, so duplicate frees from racing upstream
//! callers do not crash the engine.

mod seglist;

pub use seglist::Segment;
use seglist::SegmentMap;
use std::fmt;

/// Number of histogram buckets; bucket `i` counts ranges whose length lies
/// in `[2^i, 2^(i+1))`.
pub const HISTOGRAM_SIZE: usize = 64;

/// Hooks bracketing every structural change to a [`RangeTree`].
///
/// An owner supplies these to maintain a derived index (for example a
/// size-sorted view for best-fit allocation) in lockstep with the tree.
/// All hooks run synchronously on the mutating thread; segment coordinates
/// are external (untransformed).
pub trait RangeTreeOps {
    fn on_create(&mut self) {}
    fn on_destroy(&mut self) {}
    fn on_add(&mut self, _start: u64, _size: u64) {}
    fn on_remove(&mut self, _start: u64, _size: u64) {}
    fn on_vacate(&mut self) {}
}

/// Ordered tracker of disjoint `[start, end)` ranges with space accounting.
pub struct RangeTree {
    map: SegmentMap,
    /// Sum of all stored range lengths, in external units.
    space: u64,
    start: u64,
    shift: u32,
    histogram: [u64; HISTOGRAM_SIZE],
    ops: Option<Box<dyn RangeTreeOps>>,
}

impl fmt::Debug for RangeTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RangeTree")
            .field("numsegs", &self.map.len())
            .field("space", &self.space)
            .field("start", &self.start)
            .field("shift", &self.shift)
            .finish_non_exhaustive()
    }
}

impl Default for RangeTree {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl RangeTree {
    /// Create an empty tree over `[start, ..)` with block granularity
    /// `1 << shift`.
    #[must_use]
    pub fn new(start: u64, shift: u32) -> Self {
        Self::build(None, start, shift)
    }

    /// Create an empty tree with structural-change hooks installed.
    /// Fires `on_create` before returning.
    #[must_use]
    pub fn with_ops(ops: Box<dyn RangeTreeOps>, start: u64, shift: u32) -> Self {
        Self::build(Some(ops), start, shift)
    }

    fn build(ops: Option<Box<dyn RangeTreeOps>>, start: u64, shift: u32) -> Self {
        assert!(shift < 64, "shift {shift} out of range");
        let mut rt = Self {
            map: SegmentMap::new(),
            space: 0,
            start,
            shift,
            histogram: [0; HISTOGRAM_SIZE],
            ops,
        };
        if let Some(ops) = rt.ops.as_deref_mut() {
            ops.on_create();
        }
        rt
    }

    /// Tear the tree down. The tree must be empty; a non-zero `space` means
    /// the owner leaked allocated ranges, which is a fatal accounting bug.
    /// Fires `on_destroy`.
    pub fn destroy(mut self) {
        assert_eq!(self.space, 0, "destroying non-empty range tree");
        if let Some(ops) = self.ops.as_deref_mut() {
            ops.on_destroy();
        }
    }

    // ── Coordinate transform ────────────────────────────────────────────────

    fn to_raw(&self, value: u64) -> u64 {
        assert!(
            value >= self.start,
            "offset {value:#x} below tree base {:#x}",
            self.start
        );
        let rel = value - self.start;
        assert!(
            rel & ((1_u64 << self.shift) - 1) == 0,
            "offset {value:#x} not aligned to 1 << {}",
            self.shift
        );
        rel >> self.shift
    }

    fn from_raw(&self, raw: u64) -> u64 {
        (raw << self.shift) + self.start
    }

    /// External length of a raw segment.
    fn ext_len(&self, seg: Segment) -> u64 {
        seg.len() << self.shift
    }

    // ── Histogram maintenance ───────────────────────────────────────────────

    fn stat_incr(&mut self, seg: Segment) {
        let size = self.ext_len(seg);
        assert!(size != 0);
        self.histogram[size.ilog2() as usize] += 1;
    }

    fn stat_decr(&mut self, seg: Segment) {
        let size = self.ext_len(seg);
        assert!(size != 0);
        let idx = size.ilog2() as usize;
        assert!(self.histogram[idx] != 0, "histogram bucket {idx} underflow");
        self.histogram[idx] -= 1;
    }

    /// Recompute the histogram from scratch and panic if it disagrees with
    /// the maintained one. Diagnostic self-check.
    pub fn stat_verify(&self) {
        let mut hist = [0_u64; HISTOGRAM_SIZE];
        for (_, size) in self.iter() {
            hist[size.ilog2() as usize] += 1;
        }
        for (i, (&fresh, &kept)) in hist.iter().zip(self.histogram.iter()).enumerate() {
            if fresh != kept {
                tracing::debug!(
                    target: "fsp::range",
                    bucket = i,
                    fresh,
                    kept,
                    "histogram mismatch"
                );
            }
        }
        assert_eq!(hist, self.histogram, "range tree histogram out of sync");
    }

    /// The maintained size histogram.
    #[must_use]
    pub fn histogram(&self) -> &[u64; HISTOGRAM_SIZE] {
        &self.histogram
    }

    // ── Hook dispatch ───────────────────────────────────────────────────────

    fn notify_add(&mut self, seg: Segment) {
        let (start, size) = (self.from_raw(seg.start), self.ext_len(seg));
        if let Some(ops) = self.ops.as_deref_mut() {
            ops.on_add(start, size);
        }
    }

    fn notify_remove(&mut self, seg: Segment) {
        let (start, size) = (self.from_raw(seg.start), self.ext_len(seg));
        if let Some(ops) = self.ops.as_deref_mut() {
            ops.on_remove(start, size);
        }
    }

    // ── Mutation ────────────────────────────────────────────────────────────

    /// Record `[start, start + size)` as in use.
    ///
    /// The range must not overlap anything already stored; overlapping
    /// ownership is a fatal invariant break. Ranges touching an existing
    /// neighbor on either side coalesce into one stored segment.
    pub fn add(&mut self, start: u64, size: u64) {
        assert!(size != 0, "zero-length range add");
        let end = start.checked_add(size).expect("range wraps address space");
        let rstart = self.to_raw(start);
        let rend = self.to_raw(end);

        if let Some(seg) = self.map.find_colliding(rstart, rend) {
            panic!(
                "adding segment [{start:#x}, {end:#x}) overlapping [{:#x}, {:#x})",
                self.from_raw(seg.start),
                self.from_raw(seg.end)
            );
        }

        let before = self.map.prev_before(rstart).filter(|s| s.end == rstart);
        let after = self.map.next_at_or_after(rstart).filter(|s| s.start == rend);

        let mut merged = Segment::new(rstart, rend);
        if let Some(b) = before {
            self.notify_remove(b);
            self.stat_decr(b);
            self.map.remove(b.start);
            merged.start = b.start;
        }
        if let Some(a) = after {
            self.notify_remove(a);
            self.stat_decr(a);
            self.map.remove(a.start);
            merged.end = a.end;
        }
        self.map.insert(merged);

        self.notify_add(merged);
        self.stat_incr(merged);
        self.space += size;
    }

    /// Remove `[start, start + size)`.
    ///
    /// The range must be fully contained within a single stored segment;
    /// spanning two segments panics. A range with no containing segment is
    /// a tolerated duplicate free: logged, no effect.
    pub fn remove(&mut self, start: u64, size: u64) {
        assert!(size != 0, "zero-length range remove");
        assert!(
            size <= self.space,
            "removing {size} bytes from tree holding {}",
            self.space
        );
        let end = start.checked_add(size).expect("range wraps address space");
        let rstart = self.to_raw(start);
        let rend = self.to_raw(end);

        let Some(seg) = self.map.find_colliding(rstart, rend) else {
            tracing::error!(
                target: "fsp::range",
                start,
                size,
                "removing nonexistent segment from range tree"
            );
            return;
        };
        assert!(
            seg.start <= rstart && seg.end >= rend,
            "removing partially present range [{start:#x}, {end:#x}) \
             against segment [{:#x}, {:#x})",
            self.from_raw(seg.start),
            self.from_raw(seg.end)
        );

        self.stat_decr(seg);
        self.notify_remove(seg);
        self.map.remove(seg.start);

        if seg.start < rstart {
            let left = Segment::new(seg.start, rstart);
            self.map.insert(left);
            self.stat_incr(left);
            self.notify_add(left);
        }
        if seg.end > rend {
            let right = Segment::new(rend, seg.end);
            self.map.insert(right);
            self.stat_incr(right);
            self.notify_add(right);
        }

        self.space -= size;
    }

    /// Remove every stored part of `[start, start + size)`, regardless of
    /// how it lines up with stored segment boundaries. Idempotent.
    pub fn clear(&mut self, start: u64, size: u64) {
        if size == 0 {
            return;
        }
        let end = start.checked_add(size).expect("range wraps address space");
        loop {
            let (rstart, rend) = (self.to_raw(start), self.to_raw(end));
            let Some(seg) = self.map.find_colliding(rstart, rend) else {
                return;
            };
            let free_start = self.from_raw(seg.start).max(start);
            let free_end = self.from_raw(seg.end).min(end);
            self.remove(free_start, free_end - free_start);
        }
    }

    /// Empty the tree. Fires `on_vacate`, then resets the histogram and
    /// `space` to zero.
    pub fn vacate(&mut self) {
        self.vacate_with(|_, _| {});
    }

    /// Empty the tree, calling `visitor(start, size)` once per stored
    /// segment in ascending order as it is discarded.
    pub fn vacate_with(&mut self, mut visitor: impl FnMut(u64, u64)) {
        if let Some(ops) = self.ops.as_deref_mut() {
            ops.on_vacate();
        }
        let map = std::mem::take(&mut self.map);
        for seg in map.iter() {
            visitor(self.from_raw(seg.start), self.ext_len(seg));
        }
        self.histogram = [0; HISTOGRAM_SIZE];
        self.space = 0;
    }

    /// Swap the contents of two trees. `b` must be empty.
    pub fn swap(a: &mut RangeTree, b: &mut RangeTree) {
        assert!(
            b.space == 0 && b.map.is_empty(),
            "swap target must be an empty range tree"
        );
        std::mem::swap(a, b);
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    fn find(&self, start: u64, size: u64) -> Option<Segment> {
        assert!(size != 0);
        let end = start.checked_add(size).expect("range wraps address space");
        let (rstart, rend) = (self.to_raw(start), self.to_raw(end));
        self.map
            .find_colliding(rstart, rend)
            .filter(|seg| seg.start <= rstart && seg.end >= rend)
    }

    /// True iff a single stored segment fully contains `[start, start + size)`.
    #[must_use]
    pub fn contains(&self, start: u64, size: u64) -> bool {
        self.find(start, size).is_some()
    }

    /// Panic if any stored segment fully contains `[start, start + size)`.
    pub fn verify_not_present(&self, start: u64, size: u64) {
        if let Some(seg) = self.find(start, size) {
            panic!(
                "segment [{:#x}, {:#x}) already in range tree",
                self.from_raw(seg.start),
                self.from_raw(seg.end)
            );
        }
    }

    /// First overlap of `[start, start + size)` with stored content, as
    /// `(overlap_start, overlap_size)`: either the prefix beginning at
    /// `start`, or the next stored segment beginning before `start + size`.
    #[must_use]
    pub fn find_in(&self, start: u64, size: u64) -> Option<(u64, u64)> {
        let end = start.checked_add(size).expect("range wraps address space");
        let (seg_start, seg_end) = self.first_overlap(start, end)?;
        let ostart = seg_start.max(start);
        let oend = seg_end.min(end);
        Some((ostart, oend - ostart))
    }

    /// First overlapping stored segment within `[start, end)`, in external
    /// coordinates, untruncated.
    fn first_overlap(&self, start: u64, end: u64) -> Option<(u64, u64)> {
        let (rstart, rend) = (self.to_raw(start), self.to_raw(end));
        self.map
            .first_overlapping(rstart, rend)
            .map(|seg| (self.from_raw(seg.start), self.from_raw(seg.end)))
    }

    /// Read-only ascending traversal.
    pub fn walk(&self, mut visitor: impl FnMut(u64, u64)) {
        for (start, size) in self.iter() {
            visitor(start, size);
        }
    }

    /// Ascending `(start, size)` iterator in external coordinates.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.map
            .iter()
            .map(|seg| (self.from_raw(seg.start), self.ext_len(seg)))
    }

    /// Lowest stored offset; 0 when empty.
    #[must_use]
    pub fn min(&self) -> u64 {
        self.map.first().map_or(0, |seg| self.from_raw(seg.start))
    }

    /// Highest stored end offset; 0 when empty.
    #[must_use]
    pub fn max(&self) -> u64 {
        self.map.last().map_or(0, |seg| self.from_raw(seg.end))
    }

    /// `max - min`.
    #[must_use]
    pub fn span(&self) -> u64 {
        self.max() - self.min()
    }

    /// Number of stored segments.
    #[must_use]
    pub fn numsegs(&self) -> usize {
        self.map.len()
    }

    /// Sum of stored range lengths.
    #[must_use]
    pub fn space(&self) -> u64 {
        self.space
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.space == 0
    }
}

// ── Set algebra ─────────────────────────────────────────────────────────────

/// For the span `[start, end)`: remove every overlapping portion from
/// `removefrom` and add every non-overlapping (gap) portion to `addto`,
/// an XOR against `removefrom`'s occupancy within that span.
pub fn remove_xor_add_segment(
    mut start: u64,
    end: u64,
    removefrom: &mut RangeTree,
    addto: &mut RangeTree,
) {
    while start < end {
        let Some((seg_start, seg_end)) = removefrom.first_overlap(start, end) else {
            addto.add(start, end - start);
            return;
        };
        let overlap_start = seg_start.max(start);
        let overlap_end = seg_end.min(end);
        removefrom.remove(overlap_start, overlap_end - overlap_start);
        if start < overlap_start {
            addto.add(start, overlap_start - start);
        }
        start = overlap_end;
    }
}

/// Apply [`remove_xor_add_segment`] for every segment stored in `src`, in
/// ascending order. `src` is only read; the borrow checker rules out
/// concurrent mutation of it during the call.
pub fn remove_xor_add(src: &RangeTree, removefrom: &mut RangeTree, addto: &mut RangeTree) {
    for (start, size) in src.iter() {
        remove_xor_add_segment(start, start + size, removefrom, addto);
    }
}
