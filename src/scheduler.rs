use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::constants::FRAME_MS;

pub trait Clock {
    fn now_ms(&self) -> u64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Test clock. Clones share the same time, so a test can keep a handle
/// while a scheduler owns another.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickDue {
    pub frame: bool,
    pub spawn: bool,
    pub growth: bool,
}

/// Frame, spawn and growth timers over an injected clock. Spawn and growth
/// are only considered on frames, and fire once their interval has strictly
/// elapsed. Nothing fires while paused.
#[derive(Clone, Debug)]
pub struct TickScheduler<C: Clock> {
    clock: C,
    last_frame: u64,
    last_spawn: u64,
    last_growth: u64,
    paused: bool,
}

impl<C: Clock> TickScheduler<C> {
    pub fn new(clock: C) -> Self {
        let now = clock.now_ms();
        Self {
            clock,
            last_frame: now,
            last_spawn: now,
            last_growth: now,
            paused: false,
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn poll(&mut self, spawn_rate_ms: u64, growth_rate_ms: u64) -> TickDue {
        let now = self.clock.now_ms();
        if self.paused || now.saturating_sub(self.last_frame) < FRAME_MS {
            return TickDue::default();
        }
        self.last_frame = now;

        let spawn = now.saturating_sub(self.last_spawn) > spawn_rate_ms;
        if spawn {
            self.last_spawn = now;
        }
        let growth = now.saturating_sub(self.last_growth) > growth_rate_ms;
        if growth {
            self.last_growth = now;
        }

        TickDue {
            frame: true,
            spawn,
            growth,
        }
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Restarts every timer from now, so time spent paused is not caught up.
    pub fn resume(&mut self) {
        self.paused = false;
        self.rebase();
    }

    pub fn rebase(&mut self) {
        let now = self.clock.now_ms();
        self.last_frame = now;
        self.last_spawn = now;
        self.last_growth = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_rate_limited() {
        let clock = ManualClock::new(1_000);
        let mut scheduler = TickScheduler::new(clock.clone());
        assert!(!scheduler.poll(5_000, 8_000).frame);
        clock.advance(FRAME_MS);
        assert!(scheduler.poll(5_000, 8_000).frame);
        clock.advance(1);
        assert!(!scheduler.poll(5_000, 8_000).frame);
    }

    #[test]
    fn spawn_fires_only_after_interval_strictly_elapsed() {
        let clock = ManualClock::new(0);
        let mut scheduler = TickScheduler::new(clock.clone());
        clock.advance(5_000);
        let due = scheduler.poll(5_000, 8_000);
        assert!(due.frame && !due.spawn && !due.growth);

        clock.advance(FRAME_MS);
        let due = scheduler.poll(5_000, 8_000);
        assert!(due.spawn && !due.growth);

        clock.advance(3_000);
        let due = scheduler.poll(5_000, 8_000);
        assert!(!due.spawn && due.growth);
    }

    #[test]
    fn pause_suppresses_and_resume_rebases() {
        let clock = ManualClock::new(0);
        let mut scheduler = TickScheduler::new(clock.clone());
        scheduler.pause();
        clock.advance(60_000);
        assert_eq!(scheduler.poll(1_000, 1_000), TickDue::default());

        scheduler.resume();
        clock.advance(FRAME_MS);
        let due = scheduler.poll(1_000, 1_000);
        assert!(due.frame);
        assert!(!due.spawn && !due.growth, "no burst after a long pause");

        clock.advance(1_000);
        let due = scheduler.poll(1_000, 1_000);
        assert!(due.spawn && due.growth);
    }

    #[test]
    fn system_clock_moves_forward() {
        let clock = SystemClock;
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
        assert!(a > 0);
    }
}
