// Availability monitor: compares consecutive discovery passes per preferred window

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::{catalog::Slot, window::TimeWindow};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowReport {
    pub window: TimeWindow,
    pub available: Vec<String>,
    pub appeared: Vec<String>,
    pub disappeared: Vec<String>,
}

impl WindowReport {
    pub fn changed(&self) -> bool {
        !self.appeared.is_empty() || !self.disappeared.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorPass {
    pub check: u32,
    pub total_available: usize,
    pub windows: Vec<WindowReport>,
}

impl MonitorPass {
    pub fn changed(&self) -> bool {
        self.windows.iter().any(WindowReport::changed)
    }
}

#[derive(Debug)]
pub struct AvailabilityMonitor {
    windows: Vec<TimeWindow>,
    previous: HashMap<TimeWindow, BTreeSet<String>>,
    checks: u32,
}

impl AvailabilityMonitor {
    pub fn new(windows: Vec<TimeWindow>) -> Self {
        Self {
            windows,
            previous: HashMap::new(),
            checks: 0,
        }
    }

    pub fn checks(&self) -> u32 {
        self.checks
    }

    // Venues are compared by name. The first pass reports everything as appeared.
    pub fn observe(&mut self, slots: &[Slot]) -> MonitorPass {
        self.checks += 1;

        let mut current: HashMap<TimeWindow, BTreeSet<String>> = HashMap::new();
        for slot in slots {
            current
                .entry(slot.window.clone())
                .or_default()
                .insert(slot.venue_name.clone());
        }

        let empty = BTreeSet::new();
        let windows = self
            .windows
            .iter()
            .map(|window| {
                let now = current.get(window).unwrap_or(&empty);
                let before = self.previous.get(window).unwrap_or(&empty);
                WindowReport {
                    window: window.clone(),
                    available: now.iter().cloned().collect(),
                    appeared: now.difference(before).cloned().collect(),
                    disappeared: before.difference(now).cloned().collect(),
                }
            })
            .collect();

        self.previous = current;

        MonitorPass {
            check: self.checks,
            total_available: slots.len(),
            windows,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(window: &str, venue: &str) -> Slot {
        Slot {
            venue_id: "111".into(),
            wid: format!("{window}/{venue}"),
            window: window.parse().unwrap(),
            venue_name: venue.into(),
            rank: 0,
        }
    }

    fn monitor() -> AvailabilityMonitor {
        AvailabilityMonitor::new(vec![
            "20:00-21:00".parse().unwrap(),
            "21:00-22:00".parse().unwrap(),
        ])
    }

    #[test]
    fn test_first_pass_reports_everything_as_new() {
        let mut m = monitor();
        let pass = m.observe(&[slot("20:00-21:00", "Court 2"), slot("20:00-21:00", "Court 1")]);

        assert_eq!(pass.check, 1);
        assert_eq!(pass.total_available, 2);
        assert_eq!(pass.windows[0].appeared, vec!["Court 1", "Court 2"]);
        assert!(pass.windows[1].available.is_empty());
        assert!(!pass.windows[1].changed());
        assert!(pass.changed());
    }

    #[test]
    fn test_diff_between_passes() {
        let mut m = monitor();
        m.observe(&[slot("20:00-21:00", "Court 1"), slot("21:00-22:00", "Court 3")]);

        let pass = m.observe(&[slot("20:00-21:00", "Court 1"), slot("20:00-21:00", "Court 4")]);
        assert_eq!(pass.windows[0].appeared, vec!["Court 4"]);
        assert!(pass.windows[0].disappeared.is_empty());
        assert_eq!(pass.windows[1].disappeared, vec!["Court 3"]);

        let quiet = m.observe(&[slot("20:00-21:00", "Court 1"), slot("20:00-21:00", "Court 4")]);
        assert!(!quiet.changed());
        assert_eq!(m.checks(), 3);
    }

    #[test]
    fn test_windows_outside_the_list_are_ignored() {
        let mut m = monitor();
        let pass = m.observe(&[slot("18:00-19:00", "Court 9")]);
        assert_eq!(pass.windows.len(), 2);
        assert!(!pass.changed());
        assert_eq!(pass.total_available, 1);
    }
}
