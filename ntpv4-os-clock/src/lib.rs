//! Implementation of the kernel clock collaborator for Unix-like systems,
//! built on `clock_gettime`, `clock_settime` and `ntp_adjtime`.

use ntpv4_proto::{NtpClock, NtpDuration, NtpTimestamp, JAN_1970};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClockError {
    #[error("insufficient permissions to change the system clock")]
    NoPermission,
    #[error("invalid parameter for a system clock operation")]
    Invalid,
    #[error("system clock operation failed: {0}")]
    Io(#[from] std::io::Error),
}

fn convert_errno() -> ClockError {
    let error = std::io::Error::last_os_error();
    match error.raw_os_error() {
        Some(libc::EPERM) => ClockError::NoPermission,
        Some(libc::EINVAL) => ClockError::Invalid,
        _ => ClockError::Io(error),
    }
}

/// The system wall clock, manipulated through the libc interfaces.
///
/// Reading never requires privileges; stepping and slewing require
/// CAP_SYS_TIME (or root) and will report [`ClockError::NoPermission`]
/// otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixClock;

/// number of back-to-back clock readings used to estimate the precision
const PRECISION_PROBES: usize = 32;

/// assumed precision when the clock resolution cannot be measured
const FALLBACK_PRECISION: i8 = -18;

impl UnixClock {
    fn clock_gettime() -> Result<libc::timespec, ClockError> {
        let mut timespec = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };

        // Safety: the timespec is exclusively owned and outlives the call
        let status = unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut timespec) };
        if status != 0 {
            return Err(convert_errno());
        }

        Ok(timespec)
    }

    fn clock_settime(timespec: libc::timespec) -> Result<(), ClockError> {
        // Safety: the timespec is a plain value; the kernel only reads it
        let status = unsafe { libc::clock_settime(libc::CLOCK_REALTIME, &timespec) };
        if status != 0 {
            return Err(convert_errno());
        }

        Ok(())
    }

    /// Measure the precision of the system clock: the log2 of the smallest
    /// increment observable between consecutive readings. The protocol
    /// uses this as the lower bound on delay and jitter estimates.
    pub fn measure_precision(&self) -> Result<i8, ClockError> {
        let mut min_increment = f64::INFINITY;

        let mut previous = self.now()?;
        for _ in 0..PRECISION_PROBES {
            let current = self.now()?;
            let increment = (current - previous).to_seconds();
            if increment > 0.0 && increment < min_increment {
                min_increment = increment;
            }
            previous = current;
        }

        if !min_increment.is_finite() {
            return Ok(FALLBACK_PRECISION);
        }

        Ok(min_increment.log2().floor().clamp(-30.0, 0.0) as i8)
    }

    /// Check that the process may actually discipline the clock, by
    /// applying the identity frequency adjustment. Best done at startup,
    /// before the protocol starts relying on the clock.
    pub fn check_permissions(&self) -> Result<(), ClockError> {
        self.adjust_clock(0.0)
    }
}

fn timespec_to_timestamp(timespec: libc::timespec) -> NtpTimestamp {
    // The NTP era rolls over in 2036; wrapping addition gives the
    // correct timestamp within the current era either way.
    let seconds = (timespec.tv_sec as u32).wrapping_add(JAN_1970);
    NtpTimestamp::from_seconds_nanos_since_ntp_era(seconds, timespec.tv_nsec as u32)
}

/// Add an offset to a kernel timestamp. The addition is done in native
/// format to avoid overflow or loss of precision.
fn offset_timespec(timespec: libc::timespec, offset: NtpDuration) -> libc::timespec {
    let offset_seconds = offset.to_seconds();
    let whole = offset_seconds.floor();
    let fraction = offset_seconds - whole;

    let mut tv_sec = timespec.tv_sec + whole as libc::time_t;
    let mut tv_nsec = timespec.tv_nsec + (fraction * 1e9) as libc::c_long;

    if tv_nsec >= 1_000_000_000 {
        tv_sec += 1;
        tv_nsec -= 1_000_000_000;
    }

    libc::timespec { tv_sec, tv_nsec }
}

/// The kernel expects frequency corrections in "scaled ppm": parts per
/// million shifted left by 16 bits.
fn frequency_to_scaled_ppm(rate: f64) -> libc::c_long {
    (rate * 1e6 * 65536.0) as libc::c_long
}

impl NtpClock for UnixClock {
    type Error = ClockError;

    fn now(&self) -> Result<NtpTimestamp, Self::Error> {
        Ok(timespec_to_timestamp(Self::clock_gettime()?))
    }

    fn step_clock(&self, offset: NtpDuration) -> Result<(), Self::Error> {
        let current = Self::clock_gettime()?;
        Self::clock_settime(offset_timespec(current, offset))
    }

    fn adjust_clock(&self, rate: f64) -> Result<(), Self::Error> {
        // Safety: timex is plain data and a zeroed value is a valid
        // (no-op) request
        let mut timex: libc::timex = unsafe { std::mem::zeroed() };
        timex.modes = libc::MOD_FREQUENCY;
        timex.freq = frequency_to_scaled_ppm(rate);

        // Safety: the timex is exclusively owned and outlives the call
        let status = unsafe { libc::ntp_adjtime(&mut timex) };
        if status == -1 {
            return Err(convert_errno());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_epoch_maps_to_jan_1970() {
        let timespec = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let timestamp = timespec_to_timestamp(timespec);
        assert_eq!(
            timestamp,
            NtpTimestamp::from_fixed_int((JAN_1970 as u64) << 32)
        );
    }

    #[test]
    fn nanoseconds_become_fraction() {
        let timespec = libc::timespec {
            tv_sec: 0,
            tv_nsec: 500_000_000,
        };
        let timestamp = timespec_to_timestamp(timespec);
        let expected = NtpTimestamp::from_fixed_int(((JAN_1970 as u64) << 32) + (1 << 31));
        assert_eq!(timestamp, expected);
    }

    #[test]
    fn offset_addition_carries_nanoseconds() {
        let timespec = libc::timespec {
            tv_sec: 100,
            tv_nsec: 800_000_000,
        };

        let result = offset_timespec(timespec, NtpDuration::from_seconds(0.5));
        assert_eq!(result.tv_sec, 101);
        assert_eq!(result.tv_nsec, 300_000_000);
    }

    #[test]
    fn negative_offset_steps_backwards() {
        let timespec = libc::timespec {
            tv_sec: 100,
            tv_nsec: 500_000_000,
        };

        let result = offset_timespec(timespec, NtpDuration::from_seconds(-2.25));
        assert_eq!(result.tv_sec, 98);
        assert_eq!(result.tv_nsec, 250_000_000);
    }

    #[test]
    fn scaled_ppm_conversion() {
        // 500 ppm is the protocol's frequency tolerance
        assert_eq!(frequency_to_scaled_ppm(500e-6), 500 << 16);
        assert_eq!(frequency_to_scaled_ppm(-500e-6), -(500 << 16));
        assert_eq!(frequency_to_scaled_ppm(0.0), 0);
    }

    #[test]
    fn reading_the_clock_works() {
        let clock = UnixClock;
        let first = clock.now().unwrap();
        let second = clock.now().unwrap();
        assert!(second >= first);
    }

    #[test]
    fn precision_is_subsecond() {
        let clock = UnixClock;
        let precision = clock.measure_precision().unwrap();
        assert!(precision < 0);
        assert!(precision >= -30);
    }
}
