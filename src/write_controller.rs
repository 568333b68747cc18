//! Write admission control.
//!
//! The controller throttles or halts incoming writes when downstream work
//! (flushing, compaction) cannot keep up. Three orthogonal reference
//! counted tokens exist:
//!
//! - **stop**: while any is held, writes block on a condition variable
//! - **delay**: while any is held, writes are paced by a credit bucket
//! - **compaction pressure**: advisory, asks for more background workers
//!
//! There is one controller per database instance; it is constructed
//! explicitly and shared by `Arc`, never hidden in a global.

use crate::clock::Clock;
use std::collections::HashMap;
use std::sync::atomic::{
    AtomicBool, AtomicI64, AtomicU64,
    Ordering::{Acquire, Relaxed, Release},
};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

const MICROS_PER_SECOND: u64 = 1_000_000;

/// Credit is refilled every millisecond
const MICROS_PER_REFILL: u64 = 1_000;

/// How often a stalled writer re-checks the background error signal
const STALL_POLL_INTERVAL: Duration = Duration::from_millis(10);

fn ceil_div(a: u128, b: u128) -> u128 {
    (a + b - 1) / b
}

/// Background error flag observed by stalled writers.
///
/// Setting it releases stalled writers on their next poll; it carries no
/// payload because the error itself is owned by whoever set it.
#[derive(Clone, Debug, Default)]
pub struct ErrorSignal(Arc<AtomicBool>);

impl ErrorSignal {
    /// Marks the background state as failed
    pub fn set(&self) {
        self.0.store(true, Release);
    }

    /// Whether the background state is still clean
    #[must_use]
    pub fn is_ok(&self) -> bool {
        !self.0.load(Acquire)
    }
}

/// Identifies one registered group of write sources
pub type RegistrantId = u64;

/// Identifies one write source within a registrant
pub type SourceId = u32;

/// Process-wide coordinator gating the aggregate write rate
pub struct WriteController {
    total_stopped: AtomicI64,
    total_delayed: AtomicI64,
    total_compaction_pressure: AtomicI64,

    /// Bytes allowed to be written without delay
    credit_in_bytes: AtomicU64,

    /// Next time more credit may be added, in clock micros. RMW sequences
    /// happen under `metrics_mutex`.
    next_refill_time: AtomicU64,

    delayed_write_rate: AtomicU64,
    max_delayed_write_rate: AtomicU64,

    /// Whether multi-source min-rate aggregation is used
    dynamic_delay: bool,

    /// Serializes refill computations on the slow path
    metrics_mutex: Mutex<()>,

    /// Registered write sources: registrant -> source -> desired rate
    rate_maps: Mutex<HashMap<RegistrantId, HashMap<SourceId, u64>>>,

    stop_mutex: Mutex<()>,
    stop_cv: Condvar,
}

impl WriteController {
    /// Creates a controller with the given initial (and maximum) delayed
    /// write rate in bytes per second.
    #[must_use]
    pub fn new(dynamic_delay: bool, delayed_write_rate: u64) -> Self {
        let controller = Self {
            total_stopped: AtomicI64::new(0),
            total_delayed: AtomicI64::new(0),
            total_compaction_pressure: AtomicI64::new(0),
            credit_in_bytes: AtomicU64::new(0),
            next_refill_time: AtomicU64::new(0),
            delayed_write_rate: AtomicU64::new(0),
            max_delayed_write_rate: AtomicU64::new(0),
            dynamic_delay,
            metrics_mutex: Mutex::new(()),
            rate_maps: Mutex::new(HashMap::new()),
            stop_mutex: Mutex::new(()),
            stop_cv: Condvar::new(),
        };

        controller.set_max_delayed_write_rate(delayed_write_rate);
        controller
    }

    /// While the returned token is held, all writes are stopped; writers
    /// wait in [`WriteController::wait_on_cv`].
    #[must_use]
    pub fn get_stop_token(&self) -> StopToken<'_> {
        let before = self.total_stopped.fetch_add(1, Relaxed);
        log::debug!("write stall engaged ({} stop tokens)", before + 1);

        StopToken { controller: self }
    }

    /// While the returned token is held, writes are rate limited; every
    /// write calls [`WriteController::get_delay`] with its byte count.
    ///
    /// This is the single-source path; with `dynamic_delay` the rate map
    /// interface below replaces it.
    #[must_use]
    pub fn get_delay_token(&self, delayed_write_rate: u64) -> DelayToken<'_> {
        if self.total_delayed.fetch_add(1, Relaxed) == 0 {
            // Starting delay: begin a fresh refill cycle
            self.reset_counters();
        }

        // Any existing credit or refill debt is based on the old rate; it
        // simply carries over into the next refill.
        self.set_delayed_write_rate(delayed_write_rate);

        DelayToken { controller: self }
    }

    /// While the returned token is held, background compaction should run
    /// with increased parallelism. Does not gate writes.
    #[must_use]
    pub fn get_compaction_pressure_token(&self) -> CompactionPressureToken<'_> {
        self.total_compaction_pressure.fetch_add(1, Relaxed);

        CompactionPressureToken { controller: self }
    }

    /// Whether any stop token is currently held
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.total_stopped.load(Relaxed) > 0
    }

    /// Whether writes are currently rate limited
    #[must_use]
    pub fn needs_delay(&self) -> bool {
        self.total_delayed.load(Relaxed) > 0
    }

    /// Whether background compaction should be sped up
    #[must_use]
    pub fn needs_speedup_compaction(&self) -> bool {
        self.is_stopped()
            || self.needs_delay()
            || self.total_compaction_pressure.load(Relaxed) > 0
    }

    /// Whether multi-source min-rate aggregation is enabled
    #[must_use]
    pub fn is_dynamic_delay(&self) -> bool {
        self.dynamic_delay
    }

    /// Current delayed write rate in bytes per second
    #[must_use]
    pub fn delayed_write_rate(&self) -> u64 {
        self.delayed_write_rate.load(Relaxed)
    }

    /// Upper bound for the delayed write rate
    #[must_use]
    pub fn max_delayed_write_rate(&self) -> u64 {
        self.max_delayed_write_rate.load(Relaxed)
    }

    /// Sets the delayed write rate, clamped to
    /// `[1, max_delayed_write_rate]`.
    pub fn set_delayed_write_rate(&self, write_rate: u64) {
        let write_rate = write_rate.clamp(1, self.max_delayed_write_rate().max(1));
        self.delayed_write_rate.store(write_rate, Relaxed);
    }

    /// Raises or lowers the rate ceiling; the current rate is reset to it.
    pub fn set_max_delayed_write_rate(&self, write_rate: u64) {
        let write_rate = write_rate.max(1);
        self.max_delayed_write_rate.store(write_rate, Relaxed);
        self.delayed_write_rate.store(write_rate, Relaxed);
    }

    /// Returns how many microseconds the caller must sleep before its
    /// write of `num_bytes` may proceed. 0 means no delay; when stopped,
    /// 0 is returned as well and the caller is expected to wait on the
    /// condition variable instead.
    ///
    /// The controller trusts the caller to actually sleep the returned
    /// duration; the sleep is cooperative and cancellable.
    pub fn get_delay(&self, clock: &dyn Clock, num_bytes: u64) -> u64 {
        if self.total_stopped.load(Relaxed) > 0 {
            return 0;
        }
        if self.total_delayed.load(Relaxed) == 0 {
            return 0;
        }

        // Fast path: pay from existing credit without the mutex
        let mut credits = self.credit_in_bytes.load(Relaxed);
        while credits >= num_bytes {
            match self.credit_in_bytes.compare_exchange_weak(
                credits,
                credits - num_bytes,
                Relaxed,
                Relaxed,
            ) {
                Ok(_) => return 0,
                Err(now) => credits = now,
            }
        }

        let time_now = clock.now_micros();

        let _guard = self.metrics_mutex.lock().expect("lock is poisoned");

        // Check again under the mutex; a refill may have raced us here
        let credits = self.credit_in_bytes.load(Relaxed);
        if credits >= num_bytes {
            self.credit_in_bytes.store(credits - num_bytes, Relaxed);
            return 0;
        }

        let rate = self.delayed_write_rate.load(Relaxed).max(1);

        let mut next_refill_time = self.next_refill_time.load(Relaxed);
        if next_refill_time == 0 {
            // Start with an initial allotment of bytes for one interval
            next_refill_time = time_now;
        }

        let mut credit = credits;
        if next_refill_time <= time_now {
            // Refill for the interval plus any extra elapsed time
            let elapsed = time_now - next_refill_time + MICROS_PER_REFILL;
            credit += ceil_div(
                u128::from(elapsed) * u128::from(rate),
                u128::from(MICROS_PER_SECOND),
            ) as u64;
            next_refill_time = time_now + MICROS_PER_REFILL;

            if credit >= num_bytes {
                self.credit_in_bytes.store(credit - num_bytes, Relaxed);
                self.next_refill_time.store(next_refill_time, Relaxed);
                return 0;
            }
        }

        // Over budget: charge the shortfall against future refills
        let bytes_over_budget = num_bytes - credit;
        let needed_delay = ceil_div(
            u128::from(bytes_over_budget) * u128::from(MICROS_PER_SECOND),
            u128::from(rate),
        ) as u64;

        self.credit_in_bytes.store(0, Relaxed);
        next_refill_time += needed_delay;
        self.next_refill_time.store(next_refill_time, Relaxed);

        // At least one refill interval, to bound how often writers return
        (next_refill_time - time_now).max(MICROS_PER_REFILL)
    }

    /// Registers a group of write sources for min-rate aggregation.
    pub fn register_rate_map(&self, registrant: RegistrantId) {
        let mut maps = self.rate_maps.lock().expect("lock is poisoned");
        maps.entry(registrant).or_default();
    }

    /// Removes a registrant along with all of its sources.
    pub fn deregister_rate_map(&self, registrant: RegistrantId) {
        {
            let mut maps = self.rate_maps.lock().expect("lock is poisoned");

            if let Some(map) = maps.remove(&registrant) {
                if !map.is_empty() {
                    self.total_delayed.fetch_sub(map.len() as i64, Relaxed);
                    let min = Self::min_rate_of(self.max_delayed_write_rate(), maps.values());
                    self.set_delayed_write_rate(min);
                }
            }
        }

        self.maybe_reset_counters();
    }

    /// Publishes `source`'s desired write rate. The effective delayed rate
    /// becomes the minimum over all sources of all registrants.
    ///
    /// # Panics
    ///
    /// Panics if `registrant` was not registered.
    pub fn update_rate(&self, registrant: RegistrantId, source: SourceId, write_rate: u64) {
        let mut maps = self.rate_maps.lock().expect("lock is poisoned");

        let was_min = self.is_min_rate(&maps, registrant, source);

        let map = maps
            .get_mut(&registrant)
            .expect("registrant is not registered");
        let inserted = map.insert(source, write_rate).is_none();

        if inserted && self.total_delayed.fetch_add(1, Relaxed) == 0 {
            // First delayed source: begin a fresh refill cycle
            self.reset_counters();
        }

        let mut min_rate = self.delayed_write_rate();
        if write_rate <= min_rate {
            min_rate = write_rate;
        } else if was_min {
            min_rate = Self::min_rate_of(self.max_delayed_write_rate(), maps.values());
        }

        log::debug!("delayed write rate set to {min_rate} B/s");
        self.set_delayed_write_rate(min_rate);
    }

    /// Withdraws `source`'s rate request. When the last source disappears,
    /// the credit bucket is reset.
    pub fn remove_source(&self, registrant: RegistrantId, source: SourceId) {
        {
            let mut maps = self.rate_maps.lock().expect("lock is poisoned");

            let present = maps
                .get(&registrant)
                .is_some_and(|map| map.contains_key(&source));
            if !present {
                return;
            }

            let was_min = self.is_min_rate(&maps, registrant, source);
            maps.get_mut(&registrant)
                .expect("registrant checked above")
                .remove(&source);
            self.total_delayed.fetch_sub(1, Relaxed);

            if was_min {
                let min = Self::min_rate_of(self.max_delayed_write_rate(), maps.values());
                self.set_delayed_write_rate(min);
            }
        }

        self.maybe_reset_counters();
    }

    fn min_rate_of<'a>(
        ceiling: u64,
        maps: impl Iterator<Item = &'a HashMap<SourceId, u64>>,
    ) -> u64 {
        let mut min_rate = ceiling;

        for map in maps {
            for &rate in map.values() {
                if rate < min_rate {
                    min_rate = rate;
                }
            }
        }

        min_rate
    }

    /// A source already in the map cannot have a rate below the effective
    /// one, so equality means it is (one of) the minimum holders.
    fn is_min_rate(
        &self,
        maps: &HashMap<RegistrantId, HashMap<SourceId, u64>>,
        registrant: RegistrantId,
        source: SourceId,
    ) -> bool {
        maps.get(&registrant)
            .and_then(|map| map.get(&source))
            .is_some_and(|&rate| rate <= self.delayed_write_rate())
    }

    fn reset_counters(&self) {
        let _guard = self.metrics_mutex.lock().expect("lock is poisoned");
        self.next_refill_time.store(0, Relaxed);
        self.credit_in_bytes.store(0, Relaxed);
    }

    fn maybe_reset_counters(&self) {
        if self.total_delayed.load(Relaxed) == 0 {
            self.reset_counters();
        }
    }

    /// Blocks the caller while any stop token is held and the background
    /// error signal is clean. Returning early on a background error lets
    /// the writer surface that error instead of hanging forever.
    pub fn wait_on_cv(&self, error: &ErrorSignal) {
        let mut guard = self.stop_mutex.lock().expect("lock is poisoned");

        while error.is_ok() && self.is_stopped() {
            // The error signal has no waker of its own, so bound each wait
            let (g, _) = self
                .stop_cv
                .wait_timeout(guard, STALL_POLL_INTERVAL)
                .expect("lock is poisoned");
            guard = g;
        }
    }

    fn notify_cv(&self) {
        debug_assert!(self.total_stopped.load(Relaxed) >= 1);

        {
            let _guard = self.stop_mutex.lock().expect("lock is poisoned");
            self.total_stopped.fetch_sub(1, Relaxed);
        }

        log::debug!("stop token released");
        self.stop_cv.notify_all();
    }
}

/// Blocks all writes while held
pub struct StopToken<'a> {
    controller: &'a WriteController,
}

impl Drop for StopToken<'_> {
    fn drop(&mut self) {
        self.controller.notify_cv();
    }
}

/// Rate-limits writes while held
pub struct DelayToken<'a> {
    controller: &'a WriteController,
}

impl Drop for DelayToken<'_> {
    fn drop(&mut self) {
        let before = self.controller.total_delayed.fetch_sub(1, Relaxed);
        debug_assert!(before >= 1);
    }
}

/// Requests more background compaction parallelism while held
pub struct CompactionPressureToken<'a> {
    controller: &'a WriteController,
}

impl Drop for CompactionPressureToken<'_> {
    fn drop(&mut self) {
        let before = self.controller.total_compaction_pressure.fetch_sub(1, Relaxed);
        debug_assert!(before >= 1);
    }
}
