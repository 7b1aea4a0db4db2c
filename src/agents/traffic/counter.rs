//! Reset-aware cumulative counter tracking.
//!
//! The proxy exposes monotonically increasing byte counters that drop back
//! to zero whenever it restarts. A reading lower than the last one means a
//! reset: the new value is bytes since the restart, so it is reported in
//! full. Bytes observed but not yet committed (the report failed) are
//! carried across the reset so they are never lost.

/// Tracking state for one counter (one direction of one credential)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CounterState {
    /// No reading seen yet in this process
    #[default]
    BaselineUnknown,

    /// `committed` has been reported; `observed` is the latest reading
    Tracking { committed: u64, observed: u64 },

    /// A reset was seen. `carry` is what was pending before it; `observed`
    /// counts bytes since the restart.
    ResetDetected { carry: u64, observed: u64 },
}

impl CounterState {
    /// Feed one raw reading
    pub fn observe(&mut self, value: u64) {
        *self = match *self {
            // First reading: everything so far is unreported
            CounterState::BaselineUnknown => CounterState::Tracking {
                committed: 0,
                observed: value,
            },
            CounterState::Tracking { committed, observed } => {
                if value >= observed {
                    CounterState::Tracking {
                        committed,
                        observed: value,
                    }
                } else {
                    CounterState::ResetDetected {
                        carry: observed.saturating_sub(committed),
                        observed: value,
                    }
                }
            }
            CounterState::ResetDetected { carry, observed } => {
                if value >= observed {
                    CounterState::ResetDetected {
                        carry,
                        observed: value,
                    }
                } else {
                    // Second reset before a successful report
                    CounterState::ResetDetected {
                        carry: carry.saturating_add(observed),
                        observed: value,
                    }
                }
            }
        };
    }

    /// Bytes observed but not yet reported
    pub fn pending(&self) -> u64 {
        match *self {
            CounterState::BaselineUnknown => 0,
            CounterState::Tracking { committed, observed } => observed.saturating_sub(committed),
            CounterState::ResetDetected { carry, observed } => carry.saturating_add(observed),
        }
    }

    /// Mark everything pending as reported
    pub fn commit(&mut self) {
        match *self {
            CounterState::BaselineUnknown => {}
            CounterState::Tracking { observed, .. } | CounterState::ResetDetected { observed, .. } => {
                *self = CounterState::Tracking {
                    committed: observed,
                    observed,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Observe each reading, report it and commit; returns the deltas
    fn report_each(readings: &[u64]) -> Vec<u64> {
        let mut state = CounterState::default();
        readings
            .iter()
            .map(|r| {
                state.observe(*r);
                let delta = state.pending();
                state.commit();
                delta
            })
            .collect()
    }

    #[test]
    fn test_monotonic_deltas() {
        assert_eq!(report_each(&[100, 150, 150, 400]), vec![100, 50, 0, 250]);
    }

    #[test]
    fn test_reset_reports_post_restart_value() {
        assert_eq!(report_each(&[100, 150, 40]), vec![100, 50, 40]);
    }

    #[test]
    fn test_reset_to_zero() {
        assert_eq!(report_each(&[500, 0, 10]), vec![500, 0, 10]);
    }

    #[test]
    fn test_failed_report_is_carried_across_reset() {
        let mut state = CounterState::default();
        state.observe(100);
        state.commit();

        // 150 observed, report fails, then the proxy restarts
        state.observe(150);
        state.observe(30);
        assert_eq!(state, CounterState::ResetDetected { carry: 50, observed: 30 });
        assert_eq!(state.pending(), 80);

        state.observe(45);
        assert_eq!(state.pending(), 95);

        state.commit();
        state.observe(60);
        assert_eq!(state.pending(), 15);
    }

    #[test]
    fn test_double_reset_accumulates_carry() {
        let mut state = CounterState::default();
        state.observe(100);
        state.commit();
        state.observe(120);
        state.observe(20);
        state.observe(5);

        // 20 pending before reset, 20 since first restart, 5 since second
        assert_eq!(state.pending(), 45);
    }

    #[test]
    fn test_pending_without_commit_accumulates() {
        let mut state = CounterState::default();
        state.observe(10);
        state.observe(25);
        assert_eq!(state.pending(), 25);
    }

    #[test]
    fn test_commit_on_unknown_is_noop() {
        let mut state = CounterState::default();
        state.commit();
        assert_eq!(state, CounterState::BaselineUnknown);
        assert_eq!(state.pending(), 0);
    }
}
