//! One scheduling group's run queue

use reactor_core::task::{SchedulingGroup, Task};
use std::collections::VecDeque;
use std::time::Duration;

/// Weighted FIFO of tasks; the unit the fairness algorithm schedules.
pub struct TaskQueue {
    pub(crate) id: SchedulingGroup,
    pub(crate) name: String,
    shares: f32,
    /// 2^32 / shares, so vruntime advances with a multiply and a shift
    reciprocal_shares_times_2_power_32: u64,
    pub(crate) vruntime: u64,
    pub(crate) runtime: Duration,
    pub(crate) tasks_processed: u64,
    pub(crate) quota_violation_time: Duration,
    pub(crate) tasks: VecDeque<Task>,
    /// In the active or activating list, or currently running
    pub(crate) active: bool,
}

impl TaskQueue {
    pub fn new(id: SchedulingGroup, name: impl Into<String>, shares: f32) -> Self {
        let mut q = Self {
            id,
            name: name.into(),
            shares: 1.0,
            reciprocal_shares_times_2_power_32: 1 << 32,
            vruntime: 0,
            runtime: Duration::ZERO,
            tasks_processed: 0,
            quota_violation_time: Duration::ZERO,
            tasks: VecDeque::new(),
            active: false,
        };
        q.set_shares(shares);
        q
    }

    /// Shares below 1 are clamped to 1.
    pub fn set_shares(&mut self, shares: f32) {
        self.shares = if shares.is_finite() { shares.max(1.0) } else { 1.0 };
        self.reciprocal_shares_times_2_power_32 = ((1u64 << 32) as f64 / self.shares as f64) as u64;
    }

    #[inline]
    pub fn shares(&self) -> f32 {
        self.shares
    }

    /// Wall time to virtual time for this queue.
    #[inline]
    pub fn to_vruntime(&self, runtime: Duration) -> u64 {
        let ns = runtime.as_nanos().min(u64::MAX as u128);
        ((ns * self.reciprocal_shares_times_2_power_32 as u128) >> 32) as u64
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("shares", &self.shares)
            .field("vruntime", &self.vruntime)
            .field("queued", &self.tasks.len())
            .field("active", &self.active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vruntime_scales_with_shares() {
        let one = TaskQueue::new(SchedulingGroup(1), "one", 1.0);
        let four = TaskQueue::new(SchedulingGroup(2), "four", 4.0);
        let d = Duration::from_micros(400);
        assert_eq!(one.to_vruntime(d), 400_000);
        assert_eq!(four.to_vruntime(d), 100_000);
    }

    #[test]
    fn test_shares_clamped() {
        let q = TaskQueue::new(SchedulingGroup(1), "tiny", 0.1);
        assert_eq!(q.shares(), 1.0);
        let q = TaskQueue::new(SchedulingGroup(1), "nan", f32::NAN);
        assert_eq!(q.shares(), 1.0);
    }
}
