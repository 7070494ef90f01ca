//! Tick clocks for both ends of a session.
//!
//! The server runs a fixed-step accumulator: wall time is folded into
//! a tick counter, and each consumed tick may emit a sync broadcast or
//! a logic step. Clients never free-run; they anchor to the wrapped
//! tick the server broadcasts and extrapolate between anchors.

use std::time::Instant;

use crate::TICK_WRAP;

/// Ping send interval starts here and backs off linearly.
const PING_INTERVAL_START_MS: u64 = 500;
/// Per-send backoff increment.
const PING_INTERVAL_STEP_MS: u64 = 500;
/// Backoff ceiling.
const PING_INTERVAL_MAX_MS: u64 = 8_000;

/// Longest wall-clock gap folded into the accumulator in one advance.
/// A suspended process resumes with a bounded burst of catch-up ticks
/// instead of minutes of them.
const MAX_FRAME_MS: u64 = 2_000;

/// Session parameters the server announces in its START payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StartParams {
    /// Ticks per second.
    pub tick_rate: u32,
    /// Logic steps run every `logic_rate` ticks.
    pub logic_rate: u32,
    /// Sync broadcasts go out every `sync_rate` ticks.
    pub sync_rate: u32,
    /// Seed for the shared random sequence.
    pub seed: u32,
}

/// Something the clock decided should happen on a consumed tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockEvent {
    /// Broadcast this wrapped tick to every client.
    Sync(u8),
    /// Run one logic step at this tick time.
    Logic { time_ms: u64, tick: u64 },
}

/// The authoritative tick source.
#[derive(Debug)]
pub struct ServerClock {
    running: bool,
    period_ms: u64,
    tick_rate: u32,
    logic_rate: u32,
    sync_rate: u32,
    tick: u64,
    tick_time_ms: u64,
    real_time_ms: u64,
    last_frame: Option<Instant>,
}

impl ServerClock {
    #[must_use]
    pub fn new(tick_rate: u32, logic_rate: u32, sync_rate: u32) -> Self {
        Self {
            running: false,
            period_ms: (1_000 / u64::from(tick_rate.max(1))).max(1),
            tick_rate,
            logic_rate: logic_rate.max(1),
            sync_rate: sync_rate.max(1),
            tick: 0,
            tick_time_ms: 0,
            real_time_ms: 0,
            last_frame: None,
        }
    }

    /// Starts ticking from tick 1. Returns `false` if already running.
    pub fn start(&mut self, now: Instant) -> bool {
        if self.running {
            return false;
        }
        self.tick = 1;
        self.tick_time_ms = 0;
        self.real_time_ms = 0;
        self.last_frame = Some(now);
        self.running = true;
        true
    }

    /// Stops ticking. Returns `false` if not running.
    pub fn stop(&mut self) -> bool {
        if !self.running {
            return false;
        }
        self.running = false;
        self.last_frame = None;
        true
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running
    }

    /// The next tick to be consumed.
    #[must_use]
    pub const fn tick(&self) -> u64 {
        self.tick
    }

    /// Tick-domain time in milliseconds.
    #[must_use]
    pub const fn time_ms(&self) -> u64 {
        self.tick_time_ms
    }

    #[must_use]
    pub const fn tick_rate(&self) -> u32 {
        self.tick_rate
    }

    #[must_use]
    pub const fn logic_rate(&self) -> u32 {
        self.logic_rate
    }

    #[must_use]
    pub const fn sync_rate(&self) -> u32 {
        self.sync_rate
    }

    /// Folds elapsed wall time into the accumulator and appends the
    /// resulting events, oldest first.
    pub fn advance(&mut self, now: Instant, events: &mut Vec<ClockEvent>) {
        if !self.running {
            return;
        }
        let last = self.last_frame.unwrap_or(now);
        let elapsed = (now.saturating_duration_since(last).as_millis() as u64).min(MAX_FRAME_MS);
        self.last_frame = Some(now);
        self.real_time_ms += elapsed;

        while self.tick_time_ms < self.real_time_ms {
            if self.tick % u64::from(self.sync_rate) == 0 {
                events.push(ClockEvent::Sync((self.tick % TICK_WRAP) as u8));
            }
            if self.tick % u64::from(self.logic_rate) == 0 {
                events.push(ClockEvent::Logic { time_ms: self.tick_time_ms, tick: self.tick });
            }
            self.tick += 1;
            self.tick_time_ms += self.period_ms;
        }
    }
}

/// A follower clock anchored to server sync broadcasts.
///
/// Between broadcasts the absolute tick is extrapolated from the time
/// since the last anchor; each broadcast snaps the anchor forward, so
/// extrapolation error never accumulates.
#[derive(Debug)]
pub struct ClientClock {
    syncing: bool,
    period_ms: u64,
    logic_rate: u32,
    seed: u32,
    base_tick: u64,
    last_wrapped: u8,
    anchor_tick: u64,
    anchor_at: Option<Instant>,
    started_at: Option<Instant>,
    ping_ms: f64,
    ping_interval_ms: u64,
    last_ping_at_ms: Option<u64>,
}

impl Default for ClientClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            syncing: false,
            period_ms: 1,
            logic_rate: 1,
            seed: 0,
            base_tick: 0,
            last_wrapped: 0,
            anchor_tick: 0,
            anchor_at: None,
            started_at: None,
            ping_ms: 0.0,
            ping_interval_ms: PING_INTERVAL_START_MS,
            last_ping_at_ms: None,
        }
    }

    /// Adopts the server's session parameters and anchors to the tick
    /// stamped on the START envelope.
    pub fn start(&mut self, params: StartParams, anchor_tick: u64, now: Instant) {
        self.period_ms = (1_000 / u64::from(params.tick_rate.max(1))).max(1);
        self.logic_rate = params.logic_rate.max(1);
        self.seed = params.seed;
        self.base_tick = anchor_tick / TICK_WRAP;
        self.last_wrapped = (anchor_tick % TICK_WRAP) as u8;
        self.anchor_tick = anchor_tick;
        self.anchor_at = Some(now);
        self.started_at = Some(now);
        self.ping_ms = 0.0;
        self.ping_interval_ms = PING_INTERVAL_START_MS;
        self.last_ping_at_ms = None;
        self.syncing = true;
    }

    pub fn stop(&mut self) {
        self.syncing = false;
        self.anchor_at = None;
        self.started_at = None;
    }

    #[must_use]
    pub const fn is_syncing(&self) -> bool {
        self.syncing
    }

    #[must_use]
    pub const fn logic_rate(&self) -> u32 {
        self.logic_rate
    }

    #[must_use]
    pub const fn period_ms(&self) -> u64 {
        self.period_ms
    }

    #[must_use]
    pub const fn seed(&self) -> u32 {
        self.seed
    }

    /// Latest one-way latency estimate in milliseconds.
    #[must_use]
    pub const fn ping_ms(&self) -> f64 {
        self.ping_ms
    }

    /// Folds a wrapped tick broadcast into the absolute counter.
    ///
    /// A wrapped value smaller than the previous one means the server
    /// counter crossed a wrap boundary since the last broadcast.
    pub fn observe_wrapped(&mut self, wrapped: u8, now: Instant) {
        if !self.syncing {
            return;
        }
        if wrapped < self.last_wrapped {
            self.base_tick += 1;
        }
        self.last_wrapped = wrapped;
        self.anchor_tick = self.base_tick * TICK_WRAP + u64::from(wrapped);
        self.anchor_at = Some(now);
    }

    /// The current absolute tick: the last anchor plus whole periods
    /// elapsed since it, rounded to the nearest tick.
    #[must_use]
    pub fn tick_estimate(&self, now: Instant) -> u64 {
        let Some(anchor_at) = self.anchor_at else {
            return 0;
        };
        let elapsed = now.saturating_duration_since(anchor_at).as_millis() as u64;
        let drift = (elapsed + self.period_ms / 2) / self.period_ms;
        self.anchor_tick + drift
    }

    /// Tick-domain session time: the anchor tick in milliseconds plus
    /// wall time elapsed since that anchor was observed. Snaps forward
    /// with every sync broadcast, the same way the tick estimate does.
    #[must_use]
    pub fn time_ms(&self, now: Instant) -> u64 {
        let Some(anchor_at) = self.anchor_at else {
            return 0;
        };
        let elapsed = now.saturating_duration_since(anchor_at).as_millis() as u64;
        self.anchor_tick * self.period_ms + elapsed
    }

    /// Milliseconds since this clock started, the timebase echoed in
    /// latency probes.
    #[must_use]
    pub fn local_time_ms(&self, now: Instant) -> u64 {
        self.started_at
            .map(|t| now.saturating_duration_since(t).as_millis() as u64)
            .unwrap_or(0)
    }

    /// If a latency probe is due, marks it sent and returns the local
    /// timestamp to echo. The send interval backs off after every
    /// probe, up to a ceiling.
    pub fn take_ping(&mut self, now: Instant) -> Option<u64> {
        if !self.syncing {
            return None;
        }
        let t = self.local_time_ms(now);
        let due = match self.last_ping_at_ms {
            None => true,
            Some(last) => t.saturating_sub(last) >= self.ping_interval_ms,
        };
        if !due {
            return None;
        }
        self.last_ping_at_ms = Some(t);
        self.ping_interval_ms = (self.ping_interval_ms + PING_INTERVAL_STEP_MS).min(PING_INTERVAL_MAX_MS);
        Some(t)
    }

    /// Folds an echoed probe timestamp into the latency estimate.
    pub fn record_pong(&mut self, echoed_ms: u64, now: Instant) {
        let rtt = self.local_time_ms(now).saturating_sub(echoed_ms);
        self.ping_ms = rtt as f64 / 2.0;
    }
}
