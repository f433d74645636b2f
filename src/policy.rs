// Priority Policy: rank windows by the configured preference list and pick one venue per window

use std::collections::HashSet;

use crate::{catalog::Slot, window::TimeWindow};

#[derive(Debug, Clone, Copy)]
pub struct PriorityPolicy<'a> {
    preferred: &'a [TimeWindow],
}

impl<'a> PriorityPolicy<'a> {
    pub fn new(preferred: &'a [TimeWindow]) -> Self {
        Self { preferred }
    }

    // Index into the preference list; unlisted windows rank below every listed one.
    pub fn rank(&self, window: &TimeWindow) -> usize {
        self.preferred
            .iter()
            .position(|w| w == window)
            .unwrap_or(self.lowest())
    }

    pub fn lowest(&self) -> usize {
        self.preferred.len()
    }

    // Booking candidates for one cycle, in the order they should be attempted.
    // Windows already in `booked` are dropped. Each remaining window contributes
    // its first discovered venue (upstream order, no further tie-break), and the
    // representatives are sorted by ascending rank. Equal ranks keep discovery order.
    pub fn select_candidates(&self, slots: &[Slot], booked: &[TimeWindow]) -> Vec<Slot> {
        let booked: HashSet<&TimeWindow> = booked.iter().collect();
        let mut seen: HashSet<&TimeWindow> = HashSet::new();

        let mut candidates = Vec::new();

        for slot in slots {
            if booked.contains(&slot.window) || !seen.insert(&slot.window) {
                continue;
            }
            candidates.push(Slot {
                rank: self.rank(&slot.window),
                ..slot.clone()
            });
        }

        candidates.sort_by_key(|slot| slot.rank);
        candidates
    }
}
