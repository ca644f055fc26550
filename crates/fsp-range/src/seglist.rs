//! Ordered segment store.
//!
//! A thin wrapper over `BTreeMap<start, end>` providing the cursor operations
//! the range tree needs: collision probe, neighbor lookup around a gap, and
//! in-order traversal. All coordinates here are *raw* (already normalized by
//! the owning tree's start/shift transform).
//!
//! Invariant: stored segments are non-empty, pairwise disjoint, and keyed by
//! their start offset, so key order is also spatial order.

use std::collections::BTreeMap;

/// Half-open `[start, end)` segment in raw coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub start: u64,
    pub end: u64,
}

impl Segment {
    #[must_use]
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start < end, "empty segment [{start}, {end})");
        Self { start, end }
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Strict overlap: touching segments do not overlap.
    #[must_use]
    pub fn overlaps(&self, other: &Segment) -> bool {
        self.start < other.end && self.end > other.start
    }
}

/// Ordered container of disjoint segments.
#[derive(Debug, Default, Clone)]
pub struct SegmentMap {
    segs: BTreeMap<u64, u64>,
}

impl SegmentMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.segs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segs.is_empty()
    }

    #[must_use]
    pub fn first(&self) -> Option<Segment> {
        self.segs
            .first_key_value()
            .map(|(&start, &end)| Segment { start, end })
    }

    #[must_use]
    pub fn last(&self) -> Option<Segment> {
        self.segs
            .last_key_value()
            .map(|(&start, &end)| Segment { start, end })
    }

    /// Some segment strictly overlapping `[start, end)`, if any.
    ///
    /// Among overlapping segments this returns the one with the greatest
    /// start. When a segment fully contains `[start, end)` it is the only
    /// possible overlapper, so containment checks compose with this probe.
    #[must_use]
    pub fn find_colliding(&self, start: u64, end: u64) -> Option<Segment> {
        let (&s, &e) = self.segs.range(..end).next_back()?;
        (e > start).then_some(Segment { start: s, end: e })
    }

    /// The overlapping segment with the *smallest* start, if any.
    #[must_use]
    pub fn first_overlapping(&self, start: u64, end: u64) -> Option<Segment> {
        if start >= end {
            return None;
        }
        // Only the rightmost segment starting at or before `start` can reach
        // past it; everything else overlapping must start inside the probe.
        if let Some((&s, &e)) = self.segs.range(..=start).next_back() {
            if e > start {
                return Some(Segment { start: s, end: e });
            }
        }
        self.segs
            .range(start + 1..end)
            .next()
            .map(|(&s, &e)| Segment { start: s, end: e })
    }

    /// The nearest segment whose start is strictly below `start`.
    #[must_use]
    pub fn prev_before(&self, start: u64) -> Option<Segment> {
        self.segs
            .range(..start)
            .next_back()
            .map(|(&s, &e)| Segment { start: s, end: e })
    }

    /// The nearest segment whose start is at or above `start`.
    #[must_use]
    pub fn next_at_or_after(&self, start: u64) -> Option<Segment> {
        self.segs
            .range(start..)
            .next()
            .map(|(&s, &e)| Segment { start: s, end: e })
    }

    pub fn insert(&mut self, seg: Segment) {
        debug_assert!(seg.start < seg.end);
        debug_assert!(
            self.find_colliding(seg.start, seg.end).is_none(),
            "inserting overlapping segment [{}, {})",
            seg.start,
            seg.end
        );
        self.segs.insert(seg.start, seg.end);
    }

    pub fn remove(&mut self, start: u64) -> Option<Segment> {
        self.segs.remove(&start).map(|end| Segment { start, end })
    }

    /// Ascending traversal.
    pub fn iter(&self) -> impl Iterator<Item = Segment> + '_ {
        self.segs.iter().map(|(&start, &end)| Segment { start, end })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_of(segs: &[(u64, u64)]) -> SegmentMap {
        let mut map = SegmentMap::new();
        for &(s, e) in segs {
            map.insert(Segment::new(s, e));
        }
        map
    }

    #[test]
    fn collision_probe_ignores_touching() {
        let map = map_of(&[(10, 20), (30, 40)]);

        // Touching on either side is not a collision.
        assert_eq!(map.find_colliding(0, 10), None);
        assert_eq!(map.find_colliding(20, 30), None);
        assert_eq!(map.find_colliding(40, 50), None);

        assert_eq!(map.find_colliding(5, 11), Some(Segment::new(10, 20)));
        assert_eq!(map.find_colliding(19, 31), Some(Segment::new(30, 40)));
        assert_eq!(map.find_colliding(12, 15), Some(Segment::new(10, 20)));
    }

    #[test]
    fn first_overlapping_prefers_lowest_start() {
        let map = map_of(&[(10, 20), (30, 40), (50, 60)]);

        assert_eq!(map.first_overlapping(0, 100), Some(Segment::new(10, 20)));
        assert_eq!(map.first_overlapping(15, 100), Some(Segment::new(10, 20)));
        assert_eq!(map.first_overlapping(20, 100), Some(Segment::new(30, 40)));
        assert_eq!(map.first_overlapping(41, 50), None);
        assert_eq!(map.first_overlapping(60, 100), None);
    }

    #[test]
    fn neighbor_lookups() {
        let map = map_of(&[(10, 20), (30, 40)]);

        assert_eq!(map.prev_before(30), Some(Segment::new(10, 20)));
        assert_eq!(map.prev_before(10), None);
        assert_eq!(map.next_at_or_after(20), Some(Segment::new(30, 40)));
        assert_eq!(map.next_at_or_after(41), None);

        assert_eq!(map.first(), Some(Segment::new(10, 20)));
        assert_eq!(map.last(), Some(Segment::new(30, 40)));
    }

    #[test]
    fn iteration_is_ascending() {
        let map = map_of(&[(30, 40), (10, 20), (50, 60)]);
        let order: Vec<u64> = map.iter().map(|s| s.start).collect();
        assert_eq!(order, vec![10, 30, 50]);
    }
}
