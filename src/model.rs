#[derive(Debug, Clone)]
pub struct PoolMetrics {
    pub threads: usize,
    pub executed_tasks: u64,
}

impl PoolMetrics {
    pub fn tasks_per_thread(&self) -> f64 {
        if self.threads == 0 {
            return 0.0;
        }
        self.executed_tasks as f64 / self.threads as f64
    }
}

/// Snapshot of the four queue counters. Loaded one by one, so a snapshot
/// taken under contention may be slightly inconsistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueMetrics {
    pub capacity: usize,
    pub read_reserved: u64,
    pub read_visible: u64,
    pub write_visible: u64,
    pub write_reserved: u64,
}

impl QueueMetrics {
    /// Tasks pushed and not yet taken out of their slot.
    pub fn occupied(&self) -> u64 {
        self.write_reserved.saturating_sub(self.read_visible)
    }

    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.occupied() as f64 / self.capacity as f64
    }

    /// Producers between reservation and publish.
    pub fn in_flight_pushes(&self) -> u64 {
        self.write_reserved.saturating_sub(self.write_visible)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaMetrics {
    pub size: usize,
    pub used: usize,
    pub fallback_allocations: usize,
}

impl ArenaMetrics {
    pub fn utilization(&self) -> f64 {
        if self.size == 0 {
            return 0.0;
        }
        self.used as f64 / self.size as f64
    }

    pub fn is_exhausted(&self) -> bool {
        self.fallback_allocations > 0
    }
}
