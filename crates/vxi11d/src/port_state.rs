//! The currently active VXI-11 port
//!
//! One writer (the orchestrator) and any number of readers (the portmappers)
//! share a single [`PortState`]. Cloning shares the cell.

use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct PortState {
    current: Arc<Mutex<u16>>,
    start: u16,
    end: u16,
}

impl PortState {
    /// Start at the first port of `[start, end]`.
    pub fn new(start: u16, end: u16) -> Self {
        debug_assert!(start <= end);
        Self {
            current: Arc::new(Mutex::new(start)),
            start,
            end,
        }
    }

    pub fn current(&self) -> u16 {
        *self.current.lock()
    }

    /// Move to the next port, wrapping to the range start past the end.
    /// Returns the new port.
    pub fn advance(&self) -> u16 {
        let mut current = self.current.lock();
        *current = if *current >= self.end {
            self.start
        } else {
            *current + 1
        };
        *current
    }
}
