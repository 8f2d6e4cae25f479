use std::sync::OnceLock;
use std::time::Instant;

/// Coarse monotonic tick counter. Trace-dump directory names and the DAG dump
/// header stamp ticks rather than wall-clock time so replays sort naturally.
pub struct TickClock {
    origin: Instant,
}

impl TickClock {
    /// Ticks are microseconds since clock creation.
    pub const TICKS_PER_SEC: u64 = 1_000_000;

    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }

    pub fn now_ticks(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

impl Default for TickClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide clock shared by every client's dump paths.
pub fn process_clock() -> &'static TickClock {
    static CLOCK: OnceLock<TickClock> = OnceLock::new();
    CLOCK.get_or_init(TickClock::new)
}
