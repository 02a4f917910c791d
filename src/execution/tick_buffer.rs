use crate::models::Tick;
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

/// Thread-safe rolling window of ticks for one instrument
///
/// One writer appends, any number of readers take snapshots. Both go through
/// the same lock, so a reader sees the window either before or after an
/// append, never halfway.
#[derive(Clone)]
pub struct TickBuffer {
    data: Arc<RwLock<VecDeque<Tick>>>,
    capacity: usize,
}

impl TickBuffer {
    /// Create a new tick buffer
    ///
    /// # Arguments
    /// * `capacity` - Maximum number of ticks kept (window seconds at 1 tick/s)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            data: Arc::new(RwLock::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a tick, evicting the oldest one when full
    pub fn append(&self, tick: Tick) -> Result<(), String> {
        let mut data = self.data.write().map_err(|e| e.to_string())?;

        if data.len() == self.capacity {
            data.pop_front();
        }
        data.push_back(tick);

        Ok(())
    }

    /// Point-in-time copy of the window, oldest first
    pub fn snapshot(&self) -> Result<Vec<Tick>, String> {
        let data = self.data.read().map_err(|e| e.to_string())?;
        Ok(data.iter().cloned().collect())
    }

    /// Last prices only, oldest first
    pub fn prices(&self) -> Result<Vec<f64>, String> {
        let data = self.data.read().map_err(|e| e.to_string())?;
        Ok(data.iter().map(|t| t.last_price).collect())
    }

    /// Most recent tick
    pub fn latest(&self) -> Result<Option<Tick>, String> {
        let data = self.data.read().map_err(|e| e.to_string())?;
        Ok(data.back().cloned())
    }

    pub fn len(&self) -> Result<usize, String> {
        let data = self.data.read().map_err(|e| e.to_string())?;
        Ok(data.len())
    }

    pub fn is_empty(&self) -> Result<bool, String> {
        Ok(self.len()? == 0)
    }
}
