//! Hierarchical timing wheel.
//!
//! One near wheel of 256 slots plus four cascade wheels of 64 slots
//! each; a tick is 10 ms (one centisecond). The timer thread samples a
//! monotonic clock every 2.5 ms and advances the wheel once per elapsed
//! centisecond, so a long stall replays the missed ticks in a bounded
//! loop rather than skipping them.
//!
//! Fired nodes are collected under the wheel lock but dispatched after
//! it is released; the lock is never held across a mailbox push.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::message::Handle;

const TIME_NEAR_SHIFT: u32 = 8;
const TIME_NEAR: usize = 1 << TIME_NEAR_SHIFT;
const TIME_LEVEL_SHIFT: u32 = 6;
const TIME_LEVEL: usize = 1 << TIME_LEVEL_SHIFT;
const TIME_NEAR_MASK: u32 = (TIME_NEAR as u32) - 1;
const TIME_LEVEL_MASK: u32 = (TIME_LEVEL as u32) - 1;

/// A pending timeout: fire `session` at `expire` ticks toward `handle`.
#[derive(Debug, Clone, Copy)]
struct TimerNode {
    expire: u32,
    handle: Handle,
    session: i32,
}

/// A fired timeout, ready to become a PTYPE_RESPONSE push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired {
    pub handle: Handle,
    pub session: i32,
}

#[derive(Debug)]
struct Wheel {
    near: [Vec<TimerNode>; TIME_NEAR],
    level: [[Vec<TimerNode>; TIME_LEVEL]; 4],
    /// Wrapping tick counter indexing the wheels.
    time: u32,
    /// Monotonic centiseconds at the last update.
    current_point: u64,
}

impl Wheel {
    fn add(&mut self, node: TimerNode) {
        let time = node.expire;
        let current = self.time;
        if (time | TIME_NEAR_MASK) == (current | TIME_NEAR_MASK) {
            self.near[(time & TIME_NEAR_MASK) as usize].push(node);
            return;
        }
        let mut mask: u32 = (TIME_NEAR as u32) << TIME_LEVEL_SHIFT;
        let mut i = 0;
        while i < 3 {
            if (time | (mask - 1)) == (current | (mask - 1)) {
                break;
            }
            mask <<= TIME_LEVEL_SHIFT;
            i += 1;
        }
        let slot = (time >> (TIME_NEAR_SHIFT + i as u32 * TIME_LEVEL_SHIFT)) & TIME_LEVEL_MASK;
        self.level[i][slot as usize].push(node);
    }

    /// Re-insert every node of cascade slot `(lvl, idx)` one level down.
    fn move_list(&mut self, lvl: usize, idx: usize) {
        let nodes = std::mem::take(&mut self.level[lvl][idx]);
        for node in nodes {
            self.add(node);
        }
    }

    /// Advance one tick, migrating cascade slots at their boundaries.
    fn shift(&mut self) {
        self.time = self.time.wrapping_add(1);
        let ct = self.time;
        if ct == 0 {
            self.move_list(3, 0);
            return;
        }
        let mut mask: u32 = TIME_NEAR as u32;
        let mut time = ct >> TIME_NEAR_SHIFT;
        let mut i = 0;
        while (ct & (mask - 1)) == 0 {
            let idx = (time & TIME_LEVEL_MASK) as usize;
            if idx != 0 {
                self.move_list(i, idx);
                break;
            }
            mask <<= TIME_LEVEL_SHIFT;
            time >>= TIME_LEVEL_SHIFT;
            i += 1;
        }
    }

    /// Drain the near slot for the current tick into `fired`.
    fn execute(&mut self, fired: &mut Vec<Expired>) {
        let idx = (self.time & TIME_NEAR_MASK) as usize;
        for node in self.near[idx].drain(..) {
            fired.push(Expired {
                handle: node.handle,
                session: node.session,
            });
        }
    }
}

/// The runtime's timer: wheel state plus the tick and wall-clock bases.
#[derive(Debug)]
pub struct Timer {
    wheel: Mutex<Wheel>,
    /// Ticks elapsed since boot; mirrors the wheel under a relaxed
    /// atomic so `now()` never takes the lock.
    current: AtomicU64,
    /// Wall-clock seconds at boot.
    start_secs: u64,
    origin: Instant,
}

impl Default for Timer {
    fn default() -> Timer {
        Timer::new()
    }
}

impl Timer {
    #[must_use]
    pub fn new() -> Timer {
        let start_secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Timer {
            wheel: Mutex::new(Wheel {
                near: std::array::from_fn(|_| Vec::new()),
                level: std::array::from_fn(|_| std::array::from_fn(|_| Vec::new())),
                time: 0,
                current_point: 0,
            }),
            current: AtomicU64::new(0),
            start_secs,
            origin: Instant::now(),
        }
    }

    /// Ticks (centiseconds) elapsed since boot.
    #[must_use]
    pub fn now(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    /// Wall-clock seconds at boot.
    #[must_use]
    pub fn start_secs(&self) -> u64 {
        self.start_secs
    }

    /// Schedule `session` to fire toward `handle` after `ticks` (> 0).
    ///
    /// Non-positive delays never reach the wheel; the caller pushes the
    /// response directly.
    pub fn add(&self, handle: Handle, ticks: i32, session: i32) {
        debug_assert!(ticks > 0);
        let mut wheel = self.wheel.lock().unwrap_or_else(|e| e.into_inner());
        let expire = wheel.time.wrapping_add(ticks as u32);
        wheel.add(TimerNode {
            expire,
            handle,
            session,
        });
    }

    /// Sample the monotonic clock and advance the wheel once per elapsed
    /// centisecond. Returns every timeout that fired; the caller turns
    /// them into PTYPE_RESPONSE pushes after the lock is gone.
    #[must_use]
    pub fn update(&self) -> Vec<Expired> {
        let elapsed = self.origin.elapsed();
        let cp = elapsed.as_secs() * 100 + u64::from(elapsed.subsec_millis()) / 10;

        let mut fired = Vec::new();
        let mut wheel = self.wheel.lock().unwrap_or_else(|e| e.into_inner());
        if cp <= wheel.current_point {
            return fired;
        }
        let diff = cp - wheel.current_point;
        wheel.current_point = cp;
        self.current.fetch_add(diff, Ordering::Relaxed);
        for _ in 0..diff {
            wheel.execute(&mut fired);
            wheel.shift();
            wheel.execute(&mut fired);
        }
        fired
    }

    /// Test-facing advance of exactly `n` ticks, ignoring the wall clock.
    #[cfg(test)]
    fn advance(&self, n: u32) -> Vec<Expired> {
        let mut fired = Vec::new();
        let mut wheel = self.wheel.lock().unwrap_or_else(|e| e.into_inner());
        self.current.fetch_add(u64::from(n), Ordering::Relaxed);
        for _ in 0..n {
            wheel.execute(&mut fired);
            wheel.shift();
            wheel.execute(&mut fired);
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_at_exact_tick_never_early() {
        let timer = Timer::new();
        timer.add(1, 10, 77);
        // 9 ticks: nothing.
        assert!(timer.advance(9).is_empty());
        // 10th tick fires it.
        let fired = timer.advance(1);
        assert_eq!(fired, vec![Expired { handle: 1, session: 77 }]);
        // Never again.
        assert!(timer.advance(600).is_empty());
    }

    #[test]
    fn shorter_delay_fires_first() {
        let timer = Timer::new();
        timer.add(1, 10, 100);
        timer.add(1, 5, 50);
        let fired = timer.advance(20);
        let sessions: Vec<i32> = fired.iter().map(|e| e.session).collect();
        assert_eq!(sessions, vec![50, 100]);
    }

    #[test]
    fn same_slot_preserves_insertion_order() {
        let timer = Timer::new();
        for s in 0..8 {
            timer.add(9, 3, s);
        }
        let fired = timer.advance(3);
        let sessions: Vec<i32> = fired.iter().map(|e| e.session).collect();
        assert_eq!(sessions, (0..8).collect::<Vec<i32>>());
    }

    #[test]
    fn cascade_boundary_levels() {
        // d = 2^14 - 1 must land in the first cascade wheel, d = 2^14 in
        // the second (base tick 0).
        let timer = Timer::new();
        timer.add(1, (1 << 14) - 1, 1);
        timer.add(1, 1 << 14, 2);
        {
            let wheel = timer.wheel.lock().unwrap();
            let level0: usize = wheel.level[0].iter().map(Vec::len).sum();
            let level1: usize = wheel.level[1].iter().map(Vec::len).sum();
            assert_eq!(level0, 1);
            assert_eq!(level1, 1);
        }
        // Both still fire exactly on time.
        let fired = timer.advance((1 << 14) - 1);
        assert_eq!(fired, vec![Expired { handle: 1, session: 1 }]);
        let fired = timer.advance(1);
        assert_eq!(fired, vec![Expired { handle: 1, session: 2 }]);
    }

    #[test]
    fn long_delay_survives_cascades() {
        let timer = Timer::new();
        let delay = (1 << 20) + 123;
        timer.add(4, delay, 9);
        assert!(timer.advance(delay as u32 - 1).is_empty());
        assert_eq!(
            timer.advance(1),
            vec![Expired {
                handle: 4,
                session: 9
            }]
        );
    }

    #[test]
    fn update_tracks_wall_time() {
        let timer = Timer::new();
        timer.add(2, 1, 5);
        let deadline = Instant::now() + std::time::Duration::from_millis(500);
        let mut fired = Vec::new();
        while fired.is_empty() && Instant::now() < deadline {
            fired = timer.update();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert_eq!(
            fired,
            vec![Expired {
                handle: 2,
                session: 5
            }]
        );
        assert!(timer.now() >= 1);
    }
}
