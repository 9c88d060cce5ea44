use std::sync::Mutex;

use crate::temporal::{wall_clock_ms, TemporalAnchor};

struct ClockState {
    physical_ms: u64,
    logical: u32,
}

/// Hybrid Logical Clock stamping entries written by one node.
///
/// - **Local event**: `physical = max(wall_clock, state.physical)`; the logical
///   counter resets when physical advances and increments otherwise.
/// - **Observe**: folds in a timestamp read back from the log so later local
///   stamps sort after everything this node has already seen.
pub struct HybridLogicalClock {
    node_id: u16,
    state: Mutex<ClockState>,
}

impl HybridLogicalClock {
    pub fn new(node_id: u16) -> Self {
        Self {
            node_id,
            state: Mutex::new(ClockState {
                physical_ms: 0,
                logical: 0,
            }),
        }
    }

    /// Strictly increasing timestamp for a local write.
    pub fn now(&self) -> TemporalAnchor {
        let wall = wall_clock_ms();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let physical = wall.max(state.physical_ms);
        let logical = if physical > state.physical_ms {
            0
        } else {
            state.logical + 1
        };

        state.physical_ms = physical;
        state.logical = logical;
        TemporalAnchor::new(physical, logical, self.node_id)
    }

    /// Fold an observed timestamp into the clock.
    pub fn observe(&self, seen: &TemporalAnchor) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if seen.physical_ms > state.physical_ms {
            state.physical_ms = seen.physical_ms;
            state.logical = seen.logical;
        } else if seen.physical_ms == state.physical_ms && seen.logical > state.logical {
            state.logical = seen.logical;
        }
    }

    pub fn node_id(&self) -> u16 {
        self.node_id
    }
}
