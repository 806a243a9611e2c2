// The clock discipline: a hybrid phase-locked/frequency-locked feedback
// loop that turns combined offset samples into step and slew corrections
// of the local oscillator.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::time_types::{NtpDuration, NtpInstant, NtpTimestamp, PollInterval};

/// step threshold (s)
const STEP_THRESHOLD: f64 = 0.128;
/// stepout threshold (s)
const WATCH: f64 = 900.0;
/// panic threshold (s)
const PANIC_THRESHOLD: f64 = 1000.0;
/// PLL loop gain
const PLL: f64 = 65536.0;
/// FLL loop gain
const FLL: f64 = 18.0; // MAXPOLL + 1
/// parameter averaging constant
const AVG: f64 = 4.0;
/// compromise Allan intercept (s)
const ALLAN: f64 = 1500.0;
/// poll-adjust threshold
const LIMIT: i32 = 30;
/// frequency tolerance (500 ppm)
const MAX_FREQ: f64 = 500e-6;
/// poll-adjust gate
const PGATE: f64 = 4.0;

/// Interface to the kernel clock. The protocol state machine never touches
/// the wall clock directly; everything goes through an implementation of
/// this trait.
pub trait NtpClock {
    type Error: std::error::Error;

    /// Read the current time, in NTP long format
    fn now(&self) -> Result<NtpTimestamp, Self::Error>;
    /// Discontinuously set the wall clock, moving it by the given offset
    fn step_clock(&self, offset: NtpDuration) -> Result<(), Self::Error>;
    /// Slew the clock at the given rate (s/s) until the next call
    fn adjust_clock(&self, rate: f64) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClockState {
    /// the clock has never been set and no frequency estimate exists
    Nset,
    /// the frequency was initialized from the frequency file
    Fset,
    /// an offset spike is being watched
    Spik,
    /// the oscillator frequency is being measured directly
    Freq,
    /// normal operation
    Sync,
}

/// Verdict of the discipline on a single combined offset sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockUpdateResult {
    /// sample consumed without an adjustment, e.g. during a frequency
    /// measurement window
    Ignore,
    /// gradual adjustment through the one-hertz loop; the normal case
    Slew,
    /// the clock was stepped; all associations must be reset
    Step,
    /// the offset is beyond any plausible error and the process should
    /// terminate rather than follow it
    Panic,
}

/// The local clock process state: discipline state machine, residual phase,
/// frequency estimate and the statistics driving the poll-adjust mechanism.
#[derive(Debug)]
pub struct ClockDiscipline {
    state: ClockState,
    /// current residual offset (s)
    offset: f64,
    /// previous offset (s)
    last: f64,
    /// jiggle counter for the poll-adjust hysteresis
    count: i32,
    /// frequency (s/s)
    freq: f64,
    /// RMS jitter (s)
    jitter: f64,
    /// RMS wander (s/s)
    wander: f64,
    /// time of the last accepted update; the famous s.t
    last_update: NtpInstant,
    /// system poll interval (log2 s); the discipline owns this because the
    /// poll-adjust mechanism is the only writer
    poll: PollInterval,
}

impl ClockDiscipline {
    /// Start without any knowledge of the oscillator (NSET)
    pub fn new(precision: f64) -> Self {
        Self {
            state: ClockState::Nset,
            offset: 0.0,
            last: 0.0,
            count: 0,
            freq: 0.0,
            jitter: precision,
            wander: 0.0,
            last_update: NtpInstant::ZERO,
            poll: PollInterval::MIN,
        }
    }

    /// Start with a frequency estimate read back from the frequency
    /// file (FSET)
    pub fn with_frequency(precision: f64, frequency: f64) -> Self {
        Self {
            state: ClockState::Fset,
            freq: frequency.clamp(-MAX_FREQ, MAX_FREQ),
            ..Self::new(precision)
        }
    }

    pub fn state(&self) -> ClockState {
        self.state
    }

    pub fn poll_interval(&self) -> PollInterval {
        self.poll
    }

    pub fn frequency(&self) -> f64 {
        self.freq
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    pub fn wander(&self) -> f64 {
        self.wander
    }

    /// Time of the last accepted clock update; samples older than this are
    /// stale and must be refused
    pub(crate) fn last_update(&self) -> NtpInstant {
        self.last_update
    }

    /// Enter a new state with the given update time and residual offset
    fn rstclock(&mut self, state: ClockState, time: NtpInstant, offset: f64) {
        if state != self.state {
            debug!(from = ?self.state, to = ?state, "clock discipline state transition");
        }
        self.state = state;
        self.last = offset;
        self.offset = offset;
        self.last_update = time;
    }

    /// Discipline the local clock with a combined offset sample produced at
    /// peer update time `peer_time`.
    ///
    /// This is where the action is and defines how the system reacts to
    /// large time and frequency errors. There are two main regimes: when
    /// the offset exceeds the step threshold and when it does not.
    pub(crate) fn update<C: NtpClock>(
        &mut self,
        clock: &C,
        offset: f64,
        peer_time: NtpInstant,
        local_clock_time: NtpInstant,
        precision: f64,
    ) -> Result<ClockUpdateResult, C::Error> {
        // If the offset is too large, give up and go home.
        if offset.abs() > PANIC_THRESHOLD {
            return Ok(ClockUpdateResult::Panic);
        }

        let mut rval = ClockUpdateResult::Slew;
        let mu = (peer_time - self.last_update).to_seconds();
        let mut freq = 0.0;

        if offset.abs() > STEP_THRESHOLD {
            match self.state {
                // In SYNC state, we ignore the first outlier and switch to
                // SPIK state.
                ClockState::Sync => {
                    self.state = ClockState::Spik;
                    return Ok(rval);
                }

                // In FREQ and SPIK states, we ignore outliers until the
                // stepout threshold is exceeded.
                ClockState::Freq | ClockState::Spik if mu < WATCH => {
                    return Ok(ClockUpdateResult::Ignore)
                }

                // We get here directly in NSET and FSET states and from
                // above in FREQ and SPIK states once the stepout threshold
                // has expired. Step the time and clamp down the poll
                // interval.
                //
                // In NSET state an initial frequency correction is not
                // available, usually because the frequency file has not yet
                // been written. Since the time is outside the capture range
                // the clock is stepped; the frequency will be set directly
                // following the stepout interval.
                prior => {
                    // at the first outlier after the stepout threshold the
                    // apparent frequency correction is measured directly
                    if prior == ClockState::Freq {
                        freq = (offset - self.offset) / mu;
                    }

                    info!(offset, "stepping the system clock");
                    clock.step_clock(NtpDuration::from_seconds(offset))?;
                    self.count = 0;
                    self.poll = PollInterval::MIN;
                    rval = ClockUpdateResult::Step;

                    if prior == ClockState::Nset {
                        self.rstclock(ClockState::Freq, peer_time, 0.0);
                        return Ok(rval);
                    }
                    self.rstclock(ClockState::Sync, peer_time, 0.0);
                }
            }
        } else {
            // Compute the clock jitter as the RMS of exponentially weighted
            // offset differences. This is used by the poll-adjust code.
            let etemp = self.jitter.powi(2);
            let dtemp = (offset - self.last).abs().max(precision).powi(2);
            self.jitter = (etemp + (dtemp - etemp) / AVG).sqrt();

            match self.state {
                // This is the first update received and the frequency has
                // not been initialized. The first thing to do is directly
                // measure the oscillator frequency.
                ClockState::Nset => {
                    self.rstclock(ClockState::Freq, peer_time, offset);
                    return Ok(ClockUpdateResult::Ignore);
                }

                // The frequency has been initialized from file. Adjust the
                // phase, but don't adjust the frequency until the next
                // update.
                ClockState::Fset => {
                    self.rstclock(ClockState::Sync, peer_time, offset);
                }

                // Ignore updates until the stepout threshold, then correct
                // the phase and frequency and switch to SYNC state.
                ClockState::Freq => {
                    if (local_clock_time - self.last_update).to_seconds() < WATCH {
                        return Ok(ClockUpdateResult::Ignore);
                    }
                    freq = (offset - self.offset) / mu;
                    self.rstclock(ClockState::Sync, peer_time, offset);
                }

                // Normal operation: compute the frequency update due to the
                // PLL and FLL contributions.
                ClockState::Sync | ClockState::Spik => {
                    let poll_seconds = self.poll.as_seconds() as f64;

                    // The FLL and PLL frequency gain constants depend on
                    // the poll interval and Allan intercept. The FLL is not
                    // used below one half the Allan intercept. Above that
                    // the loop gain increases in steps to 1 / AVG.
                    if poll_seconds > ALLAN / 2.0 {
                        let gain = (FLL - self.poll.as_log2() as f64).max(AVG);
                        freq += (offset - self.offset) / (mu.max(ALLAN) * gain);
                    }

                    // For the PLL the integration interval (numerator) is
                    // the minimum of the update interval and poll interval.
                    // This allows oversampling, but not undersampling.
                    let etemp = mu.min(poll_seconds);
                    let dtemp = 4.0 * PLL * poll_seconds;
                    freq += offset * etemp / (dtemp * dtemp);

                    self.rstclock(ClockState::Sync, peer_time, offset);
                }
            }
        }

        // Calculate the new frequency and frequency stability (wander).
        // Compute the clock wander as the RMS of exponentially weighted
        // frequency differences. This is not used directly, but can, along
        // with the jitter, be a highly useful monitoring and debugging tool.
        let total = freq + self.freq;
        self.freq = total.clamp(-MAX_FREQ, MAX_FREQ);
        let etemp = self.wander.powi(2);
        let dtemp = total.powi(2);
        self.wander = (etemp + (dtemp - etemp) / AVG).sqrt();

        // Here we adjust the poll interval by comparing the current offset
        // with the clock jitter. If the offset is less than the clock
        // jitter times a constant, then the averaging interval is
        // increased; otherwise, it is decreased. A bit of hysteresis helps
        // calm the dance. Works best using burst mode.
        if self.offset.abs() < PGATE * self.jitter {
            self.count += self.poll.as_log2() as i32;
            if self.count > LIMIT {
                self.count = LIMIT;
                if self.poll < PollInterval::MAX {
                    self.count = 0;
                    self.poll = self.poll.inc();
                }
            }
        } else {
            self.count -= 2 * self.poll.as_log2() as i32;
            if self.count < -LIMIT {
                self.count = -LIMIT;
                if self.poll > PollInterval::MIN {
                    self.count = 0;
                    self.poll = self.poll.dec();
                }
            }
        }

        Ok(rval)
    }

    /// Implement the phase and frequency adjustments for one tick of the
    /// one-hertz timer. The gain factor (denominator) is not allowed to
    /// increase beyond the Allan intercept. It doesn't make sense to
    /// average phase noise beyond this point and it helps to damp residual
    /// offset at the longer poll intervals.
    pub(crate) fn adjust<C: NtpClock>(&mut self, clock: &C) -> Result<(), C::Error> {
        let gain = PLL * (self.poll.as_seconds() as f64).min(ALLAN);
        let dtemp = self.offset / gain;
        self.offset -= dtemp;

        clock.adjust_clock(self.freq + dtemp)
    }
}
