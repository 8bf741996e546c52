//! Bounded temperature history for trend display.

use std::collections::VecDeque;

use serde::Serialize;

/// Samples kept before the oldest are evicted.
pub const DEFAULT_HISTORY_CAPACITY: usize = 120;

/// One sample: a monotonically increasing index and a temperature.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct HistoryPoint {
    pub index: f32,
    pub temperature: f32,
}

/// FIFO-evicting time series of temperature samples.
///
/// The index counter lives with the samples so that clearing the buffer
/// restarts the series at zero.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HistoryBuffer {
    points: VecDeque<HistoryPoint>,
    capacity: usize,
    next_index: u32,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
            next_index: 0,
        }
    }

    /// Append a sample, evicting the oldest if the buffer is full.
    pub fn push(&mut self, temperature: f32) {
        self.points.push_back(HistoryPoint {
            index: self.next_index as f32,
            temperature,
        });
        self.next_index += 1;

        while self.points.len() > self.capacity {
            self.points.pop_front();
        }
    }

    /// Drop all samples and restart the index at zero.
    pub fn clear(&mut self) {
        self.points.clear();
        self.next_index = 0;
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples pushed since the last clear, including evicted ones.
    pub fn total_pushed(&self) -> u32 {
        self.next_index
    }

    pub fn latest(&self) -> Option<&HistoryPoint> {
        self.points.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryPoint> {
        self.points.iter()
    }

    pub fn to_vec(&self) -> Vec<HistoryPoint> {
        self.points.iter().copied().collect()
    }
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
