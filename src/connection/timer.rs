use std::{
    collections::{binary_heap::PeekMut, BinaryHeap},
    time::Instant,
};

use rustc_hash::FxHashMap;

/// The timers a connection schedules against its reactor
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub(crate) enum Timer {
    /// When to send an ack-eliciting probe packet or declare unacked packets lost
    LossDetection,
    /// When to close the connection after no activity
    Idle,
    /// When the close timer expires, the connection has been fully drained
    Close,
    /// When keys are discarded because they should not be needed anymore
    KeyDiscard,
    /// When to send a PING frame to keep the connection alive
    KeepAlive,
    /// When an application-requested ping gives up waiting for its ack
    Ping,
    /// When pacing will allow us to send a packet
    Pacing,
    /// When the grace period for a graceful close runs out
    CloseGrace,
}

/// Tracks the nearest deadline for each [`Timer`]
///
/// Setting a timer again simply supersedes the old deadline; stale heap
/// entries are skipped when popped.
#[derive(Debug, Clone, Default)]
pub(crate) struct TimerTable {
    armed: FxHashMap<Timer, Instant>,
    deadlines: BinaryHeap<TimerEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TimerEntry {
    time: Instant,
    timer: Timer,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max heap; reverse to pop the earliest deadline
        self.time
            .cmp(&other.time)
            .then_with(|| self.timer.cmp(&other.timer))
            .reverse()
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl TimerTable {
    pub(crate) fn set(&mut self, timer: Timer, time: Instant) {
        self.armed.insert(timer, time);
        self.deadlines.push(TimerEntry { time, timer });
    }

    pub(crate) fn stop(&mut self, timer: Timer) {
        self.armed.remove(&timer);
    }

    pub(crate) fn is_armed(&self, timer: Timer) -> bool {
        self.armed.contains_key(&timer)
    }

    /// Earliest armed deadline, purging superseded entries
    pub(crate) fn next_timeout(&mut self) -> Option<Instant> {
        while let Some(entry) = self.deadlines.peek_mut() {
            if self.armed.get(&entry.timer) != Some(&entry.time) {
                PeekMut::pop(entry);
                continue;
            }
            return Some(entry.time);
        }
        None
    }

    /// Disarm and return one timer whose deadline is at or before `now`
    pub(crate) fn expire_before(&mut self, now: Instant) -> Option<Timer> {
        while let Some(entry) = self.deadlines.peek_mut() {
            if self.armed.get(&entry.timer) != Some(&entry.time) {
                PeekMut::pop(entry);
                continue;
            }
            if entry.time > now {
                return None;
            }
            let timer = entry.timer;
            PeekMut::pop(entry);
            self.armed.remove(&timer);
            return Some(timer);
        }
        None
    }

    pub(crate) fn reset(&mut self) {
        self.armed.clear();
        self.deadlines.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn supersede_and_expire() {
        let mut timers = TimerTable::default();
        let sec = Duration::from_secs(1);
        let now = Instant::now() + Duration::from_secs(10);
        timers.set(Timer::Idle, now - 3 * sec);
        timers.set(Timer::Close, now - 2 * sec);
        timers.set(Timer::Idle, now); // supersedes the earlier deadline

        assert_eq!(timers.next_timeout(), Some(now - 2 * sec));
        assert_eq!(timers.expire_before(now), Some(Timer::Close));
        assert_eq!(timers.expire_before(now), Some(Timer::Idle));
        assert_eq!(timers.expire_before(now), None);
    }

    #[test]
    fn stop_disarms() {
        let mut timers = TimerTable::default();
        let now = Instant::now();
        timers.set(Timer::KeepAlive, now);
        assert!(timers.is_armed(Timer::KeepAlive));
        timers.stop(Timer::KeepAlive);
        assert_eq!(timers.expire_before(now + Duration::from_secs(1)), None);
        assert_eq!(timers.next_timeout(), None);
    }
}
