use crate::config::Tunables;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TickFlag {
    TimeSync,
    PowerPoll,
    MinuteCheck,
    Mirror,
}

const FLAG_COUNT: usize = 4;

impl TickFlag {
    pub const ALL: [TickFlag; FLAG_COUNT] = [
        TickFlag::TimeSync,
        TickFlag::PowerPoll,
        TickFlag::MinuteCheck,
        TickFlag::Mirror,
    ];

    fn index(self) -> usize {
        match self {
            TickFlag::TimeSync => 0,
            TickFlag::PowerPoll => 1,
            TickFlag::MinuteCheck => 2,
            TickFlag::Mirror => 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SchedulerStats {
    pub total_fired: u32,
    /// Periods that elapsed while the flag was still set.
    pub total_coalesced: u32,
    /// Whole periods that passed without a poll.
    pub total_skipped: u32,
}

#[derive(Debug, Clone, Copy)]
struct PeriodicTimer {
    period_ms: u64,
    next_due_ms: u64,
    fired: bool,
}

/// Fixed-period flag source for the control loop. A flag stays set until it
/// is taken; periods missed in between are dropped, never replayed.
#[derive(Debug)]
pub struct TickScheduler {
    timers: [PeriodicTimer; FLAG_COUNT],
    stats: SchedulerStats,
}

impl TickScheduler {
    /// Every timer is due at `start_ms` so the first tick runs each service once.
    pub fn new(tunables: &Tunables, start_ms: u64) -> Self {
        let periods = [
            tunables.time_sync_period_s * 1000,
            tunables.power_poll_period_ms,
            tunables.minute_check_period_ms,
            tunables.mirror_period_ms,
        ];
        let timers = periods.map(|period_ms| PeriodicTimer {
            period_ms: period_ms.max(1),
            next_due_ms: start_ms,
            fired: false,
        });
        Self {
            timers,
            stats: SchedulerStats::default(),
        }
    }

    pub fn poll(&mut self, now_ms: u64) {
        for timer in &mut self.timers {
            if now_ms < timer.next_due_ms {
                continue;
            }
            if timer.fired {
                self.stats.total_coalesced += 1;
            } else {
                self.stats.total_fired += 1;
            }
            timer.fired = true;
            let missed = (now_ms - timer.next_due_ms) / timer.period_ms;
            self.stats.total_skipped += missed as u32;
            timer.next_due_ms += (missed + 1) * timer.period_ms;
        }
    }

    /// Consume a flag. True when it was set.
    pub fn take(&mut self, flag: TickFlag) -> bool {
        let timer = &mut self.timers[flag.index()];
        core::mem::replace(&mut timer.fired, false)
    }

    /// Set a flag now, outside its period.
    pub fn force(&mut self, flag: TickFlag) {
        self.timers[flag.index()].fired = true;
    }

    pub fn is_set(&self, flag: TickFlag) -> bool {
        self.timers[flag.index()].fired
    }

    pub fn next_due_ms(&self, flag: TickFlag) -> u64 {
        self.timers[flag.index()].next_due_ms
    }

    pub fn get_stats(&self) -> &SchedulerStats {
        &self.stats
    }
}
