use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Offset in seconds between the NTP era (1 January 1900) and the Unix
/// epoch (1 January 1970), used when converting kernel time.
pub const JAN_1970: u32 = 2_208_988_800; // (70 * 365 + 17) * 86400

/// NtpTimestamp represents an ntp timestamp.
///
/// The timestamp is a 64-bit unsigned fixed-point number with the decimal
/// point to the left of bit 32: seconds since the NTP era in the upper half,
/// the fraction of a second in the lower half. The only arithmetic operation
/// permitted is subtraction, yielding a signed difference interpreted as
/// seconds ([`NtpDuration`]).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NtpTimestamp {
    timestamp: u64,
}

impl NtpTimestamp {
    pub const ZERO: Self = Self { timestamp: 0 };

    pub(crate) const fn from_bits(bits: [u8; 8]) -> NtpTimestamp {
        NtpTimestamp {
            timestamp: u64::from_be_bytes(bits),
        }
    }

    pub(crate) const fn to_bits(self) -> [u8; 8] {
        self.timestamp.to_be_bytes()
    }

    /// Create an NTP timestamp from the number of seconds and nanoseconds that
    /// have passed since the last NTP era boundary.
    pub const fn from_seconds_nanos_since_ntp_era(seconds: u32, nanos: u32) -> Self {
        // Although having a valid interpretation, providing more than
        // 1 second worth of nanoseconds as input probably indicates an error
        // from the caller.
        debug_assert!(nanos < 1_000_000_000);
        // NTP uses 1/2^32 sec as its unit of fractional time.
        // our time is in nanoseconds, so 1/1e9 seconds
        let fraction = ((nanos as u64) << 32) / 1_000_000_000;

        // alternatively, abuse FP arithmetic to save an instruction
        // let fraction = (nanos as f64 * 4.294967296) as u64;

        let timestamp = ((seconds as u64) << 32) + fraction;
        NtpTimestamp::from_fixed_int(timestamp)
    }

    /// Directly construct a timestamp from the 64-bit fixed-point
    /// representation. Note that this is not a seconds value.
    pub const fn from_fixed_int(timestamp: u64) -> NtpTimestamp {
        NtpTimestamp { timestamp }
    }

    pub const fn is_zero(self) -> bool {
        self.timestamp == 0
    }
}

// In order to provide increased entropy on origin timestamps, and to
// keep the subtraction semantics simple, the timestamp wraps around.
impl Sub for NtpTimestamp {
    type Output = NtpDuration;

    fn sub(self, rhs: Self) -> Self::Output {
        // In order to properly deal with timestamp rollover, this
        // subtraction should be a wrapping subtraction, with the
        // result interpreted as a signed duration.
        NtpDuration {
            duration: self.timestamp.wrapping_sub(rhs.timestamp) as i64,
        }
    }
}

impl Add<NtpDuration> for NtpTimestamp {
    type Output = NtpTimestamp;

    fn add(self, rhs: NtpDuration) -> Self::Output {
        NtpTimestamp {
            timestamp: self.timestamp.wrapping_add(rhs.duration as u64),
        }
    }
}

impl AddAssign<NtpDuration> for NtpTimestamp {
    fn add_assign(&mut self, rhs: NtpDuration) {
        *self = *self + rhs;
    }
}

/// NtpDuration is used to represent signed intervals between NtpTimestamps.
///
/// A negative duration interval is interpreted to mean that the first
/// timestamp used to define the interval represents a point in time after
/// the second timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct NtpDuration {
    duration: i64,
}

impl NtpDuration {
    pub const ZERO: Self = Self { duration: 0 };
    pub const ONE: Self = Self { duration: 1 << 32 };

    /// Maximum dispersion (16 s): also the dispersion of an empty clock
    /// filter stage.
    pub const MAX_DISPERSION: Self = Self { duration: 16 << 32 };

    /// Minimum dispersion (0.01 s): lower clamp used in root distance
    /// calculations to avoid timing loops with highly precise sources.
    pub const MIN_DISPERSION: Self = Self {
        duration: (1 << 32) / 100,
    };

    /// NtpDuration in NTP short format: 32 bits, decimal point to the left
    /// of bit 16. Used on the wire for root delay and root dispersion.
    pub(crate) const fn from_bits_short(bits: [u8; 4]) -> Self {
        NtpDuration {
            duration: (u32::from_be_bytes(bits) as i64) << 16,
        }
    }

    pub(crate) fn to_bits_short(self) -> [u8; 4] {
        // serializing a negative duration should never happen
        // and indicates a programming error elsewhere.
        // as for serializing of durations larger than which can be
        // expressed in the short format, this should only be
        // the result of an extreme clock error, so saturating
        // is a reasonable behaviour here.
        debug_assert!(self.duration >= 0);

        match self.duration > 0x0000_FFFF_FFFF_FFFF {
            true => [0xFF, 0xFF, 0xFF, 0xFF],
            false => (((self.duration & 0x0000_FFFF_FFFF_0000) >> 16) as u32).to_be_bytes(),
        }
    }

    /// Convert to an f64; required for statistical calculations
    /// (e.g. in the clock filter and combine algorithms)
    pub fn to_seconds(self) -> f64 {
        // dividing by 2^32 gives us the correct fraction and whole seconds
        const FRAC: f64 = u32::MAX as f64 + 1.0; // 2^32
        self.duration as f64 / FRAC
    }

    pub fn from_seconds(seconds: f64) -> Self {
        const FRAC: f64 = u32::MAX as f64 + 1.0; // 2^32

        let i = seconds.floor();
        let f = seconds - i;

        // Ensure proper saturating behaviour
        let duration = match i as i64 {
            i if i >= std::i32::MIN as i64 && i <= std::i32::MAX as i64 => {
                (i << 32) | (f * FRAC) as i64
            }
            i if i < std::i32::MIN as i64 => std::i64::MIN,
            i if i > std::i32::MAX as i64 => std::i64::MAX,
            _ => unreachable!(),
        };

        Self { duration }
    }

    /// Interval of same length as the poll interval or precision exponent
    /// `input`, interpreted as a signed log2 seconds value.
    pub const fn from_exponent(input: i8) -> Self {
        Self {
            duration: match input {
                exp if exp > 30 => std::i64::MAX, // maximum delay is 2^30 seconds (about 34 years)
                exp if exp > 0 => 1i64 << (32 + exp),
                exp if exp > -32 => 1i64 << (32 + exp),
                _ => 0,
            },
        }
    }

    /// Directly construct a duration from the 64-bit fixed-point
    /// representation. Note that this is not a seconds value.
    pub const fn from_fixed_int(duration: i64) -> NtpDuration {
        NtpDuration { duration }
    }

    pub const fn abs(self) -> Self {
        Self {
            duration: self.duration.abs(),
        }
    }

    pub const fn divided_by(self, rhs: i64) -> Self {
        Self {
            duration: self.duration / rhs,
        }
    }
}

impl Add for NtpDuration {
    type Output = NtpDuration;

    fn add(self, rhs: Self) -> Self::Output {
        // For duration, saturation is safer as that ensures
        // addition or substraction of two big durations never
        // unintentionally cancel, ensuring that filtering
        // can properly reject such samples.
        NtpDuration {
            duration: self.duration.saturating_add(rhs.duration),
        }
    }
}

impl AddAssign for NtpDuration {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for NtpDuration {
    type Output = NtpDuration;

    fn sub(self, rhs: Self) -> Self::Output {
        NtpDuration {
            duration: self.duration.saturating_sub(rhs.duration),
        }
    }
}

impl SubAssign for NtpDuration {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl Neg for NtpDuration {
    type Output = NtpDuration;

    fn neg(self) -> Self::Output {
        NtpDuration {
            duration: -self.duration,
        }
    }
}

impl Mul<i64> for NtpDuration {
    type Output = NtpDuration;

    fn mul(self, rhs: i64) -> Self::Output {
        NtpDuration {
            duration: self.duration.saturating_mul(rhs),
        }
    }
}

impl Div<i64> for NtpDuration {
    type Output = NtpDuration;

    fn div(self, rhs: i64) -> Self::Output {
        NtpDuration {
            duration: self.duration / rhs,
        }
    }
}

impl Serialize for NtpDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.to_seconds())
    }
}

impl<'de> Deserialize<'de> for NtpDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let seconds = f64::deserialize(deserializer)?;

        if !seconds.is_finite() {
            return Err(serde::de::Error::custom("duration must be a finite number"));
        }

        Ok(NtpDuration::from_seconds(seconds))
    }
}

/// Process time: a counter that advances by one second for every elapsed
/// second of real time, driven by the one-hertz adjust loop. Unlike
/// [`NtpTimestamp`] it is never stepped, so intervals measured with it are
/// immune to clock steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct NtpInstant {
    seconds: u64,
}

impl NtpInstant {
    pub const ZERO: Self = Self { seconds: 0 };

    pub const fn from_seconds(seconds: u64) -> Self {
        Self { seconds }
    }

    pub const fn as_seconds(self) -> u64 {
        self.seconds
    }

    pub const fn add_seconds(self, seconds: u64) -> Self {
        Self {
            seconds: self.seconds + seconds,
        }
    }

    /// Advance by one tick of the one-hertz timer
    pub fn tick(&mut self) {
        self.seconds += 1;
    }
}

impl Sub for NtpInstant {
    type Output = NtpDuration;

    fn sub(self, rhs: Self) -> Self::Output {
        NtpDuration {
            duration: (self.seconds as i64).wrapping_sub(rhs.seconds as i64) << 32,
        }
    }
}

/// A poll interval, as a signed log2 seconds value. The wire format and the
/// poll scheduler use the exponent directly; conversion to seconds goes
/// through [`NtpDuration`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PollInterval(i8);

impl PollInterval {
    pub const MIN: Self = Self(6); // 64 s
    pub const MAX: Self = Self(17); // ~36 h

    pub const fn from_log2(log2: i8) -> Self {
        Self(log2)
    }

    pub const fn as_log2(self) -> i8 {
        self.0
    }

    pub fn as_duration(self) -> NtpDuration {
        NtpDuration::from_exponent(self.0)
    }

    /// Interval length in whole seconds. Only meaningful for non-negative
    /// exponents, which clamping guarantees.
    pub fn as_seconds(self) -> u64 {
        1 << self.0.max(0)
    }

    #[must_use]
    pub fn clamped(self) -> Self {
        Self(self.0.clamp(Self::MIN.0, Self::MAX.0))
    }

    #[must_use]
    pub fn inc(self) -> Self {
        Self((self.0 + 1).min(Self::MAX.0))
    }

    #[must_use]
    pub fn dec(self) -> Self {
        Self((self.0 - 1).max(Self::MIN.0))
    }
}

impl Default for PollInterval {
    fn default() -> Self {
        Self::MIN
    }
}
