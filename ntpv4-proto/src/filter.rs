// The clock filter: an eight-stage shift register per association that
// selects the best of the most recent samples, producing the smoothed
// offset/delay/dispersion/jitter estimates consumed by server selection.

use crate::packet::{NtpAssociationMode, NtpHeader, NtpLeapIndicator};
use crate::peer::{multiply_by_phi, Peer, PeerStatistics};
use crate::time_types::{NtpDuration, NtpInstant, NtpTimestamp, PollInterval};

/// Spike gate: a sample whose offset moved more than SGATE times the jitter
/// within a short window is discarded as a popcorn spike.
const SGATE: f64 = 3.0;

/// Assumed one-way delay of a broadcast packet
pub(crate) const BROADCAST_DELAY: NtpDuration = NtpDuration::ONE.divided_by(250); // 0.004 s

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterTuple {
    pub(crate) offset: NtpDuration,
    pub(crate) delay: NtpDuration,
    pub(crate) dispersion: NtpDuration,
    pub(crate) time: NtpInstant,
}

impl FilterTuple {
    pub(crate) const DUMMY: Self = Self {
        offset: NtpDuration::ZERO,
        delay: NtpDuration::MAX_DISPERSION,
        dispersion: NtpDuration::MAX_DISPERSION,
        time: NtpInstant::ZERO,
    };

    fn is_dummy(self) -> bool {
        self == Self::DUMMY
    }

    /// The sample fed to the filter when a peer has missed three consecutive
    /// polls, driving its dispersion up until it is no longer fit.
    pub(crate) const fn dead(time: NtpInstant) -> Self {
        Self {
            offset: NtpDuration::ZERO,
            delay: NtpDuration::ZERO,
            dispersion: NtpDuration::MAX_DISPERSION,
            time,
        }
    }

    /// Offset, delay and dispersion for a packet in any mode except
    /// broadcast.
    ///
    /// The first-order timestamp differences are computed directly in 64-bit
    /// fixed-point arithmetic, and only the result is converted to floating
    /// double later on. This is necessary in order to avoid overflow and
    /// preserve precision.
    pub(crate) fn from_packet(
        packet: &NtpHeader,
        system_precision: NtpDuration,
        destination_timestamp: NtpTimestamp,
        local_clock_time: NtpInstant,
    ) -> Self {
        // for reference
        //
        // | org       | T1         | origin timestamp      |
        // | rec       | T2         | receive timestamp     |
        // | xmt       | T3         | transmit timestamp    |
        // | dst       | T4         | destination timestamp |

        // a broadcast association uses different logic
        debug_assert_ne!(packet.mode, NtpAssociationMode::Broadcast);

        let packet_precision = NtpDuration::from_exponent(packet.precision);

        // offset is the average of the deltas (T2 - T1) and (T4 - T3)
        let offset1 = packet.receive_timestamp - packet.origin_timestamp;
        let offset2 = destination_timestamp - packet.transmit_timestamp;
        let offset = (offset1 + offset2) / 2i64;

        // delay is (T4 - T1) - (T2 - T3)
        let delta1 = destination_timestamp - packet.origin_timestamp;
        let delta2 = packet.receive_timestamp - packet.transmit_timestamp;
        // In cases where the server and client clocks are running at
        // different rates and with very fast networks, the delay can appear
        // negative. The delay is clamped not less than the system precision.
        let delay = Ord::max(system_precision, delta1 - delta2);

        let dispersion = packet_precision + system_precision + multiply_by_phi(delta1);

        Self {
            offset,
            delay,
            dispersion,
            time: local_clock_time,
        }
    }

    /// A broadcast packet makes only one trip, so the client cannot measure
    /// the roundtrip. The offset is the raw transmit-to-capture difference
    /// and the delay is the configured broadcast delay.
    pub(crate) fn from_broadcast(
        packet: &NtpHeader,
        system_precision: NtpDuration,
        destination_timestamp: NtpTimestamp,
        local_clock_time: NtpInstant,
    ) -> Self {
        debug_assert_eq!(packet.mode, NtpAssociationMode::Broadcast);

        let packet_precision = NtpDuration::from_exponent(packet.precision);

        let offset = packet.transmit_timestamp - destination_timestamp;
        let delay = BROADCAST_DELAY;
        let dispersion =
            packet_precision + system_precision + multiply_by_phi(BROADCAST_DELAY * 2i64);

        Self {
            offset,
            delay,
            dispersion,
            time: local_clock_time,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct LastMeasurements {
    register: [FilterTuple; 8],
}

impl Default for LastMeasurements {
    fn default() -> Self {
        Self::new()
    }
}

impl LastMeasurements {
    pub(crate) const fn new() -> Self {
        Self {
            register: [FilterTuple::DUMMY; 8],
        }
    }

    /// Insert the new tuple at index 0, move all other tuples one to the
    /// right. The final (oldest) tuple is discarded. Shifted tuples age:
    /// their dispersion grows by PHI times the interval since the last
    /// update of this register.
    fn shift_and_insert(&mut self, mut current: FilterTuple, dispersion_correction: NtpDuration) {
        for tuple in self.register.iter_mut() {
            // adding the dispersion correction would make the dummy no longer a dummy
            if !tuple.is_dummy() {
                tuple.dispersion += dispersion_correction;
            }

            std::mem::swap(&mut current, tuple);
        }
    }

    /// Return every stage to the dummy tuple, as done on association reset
    pub(crate) fn reset(&mut self) {
        self.register = [FilterTuple::DUMMY; 8];
    }
}

/// Temporary list
#[derive(Debug, Clone)]
struct TemporaryList {
    /// Invariant: this array is always sorted by increasing delay!
    register: [FilterTuple; 8],
}

impl TemporaryList {
    fn from_clock_filter_contents(source: &LastMeasurements) -> Self {
        // copy the registers
        let mut register = source.register;

        // sort by delay, ignoring NaN
        register.sort_by(|t1, t2| {
            t1.delay
                .partial_cmp(&t2.delay)
                .unwrap_or(std::cmp::Ordering::Less)
        });

        Self { register }
    }

    fn smallest_delay(&self) -> &FilterTuple {
        &self.register[0]
    }

    /// Prefix of the temporary list containing only the valid tuples
    fn valid_tuples(&self) -> &[FilterTuple] {
        let num_invalid_tuples = self
            .register
            .iter()
            .rev()
            .take_while(|t| t.is_dummy())
            .count();

        let num_valid_tuples = self.register.len() - num_invalid_tuples;

        &self.register[..num_valid_tuples]
    }

    /// #[no_run]
    ///                     i=n-1
    ///                     ---     epsilon_i
    ///      epsilon =       \     ----------
    ///                      /        (i+1)
    ///                     ---     2
    ///                     i=0
    /// Invariant: the register is sorted wrt delay
    fn dispersion(&self) -> NtpDuration {
        self.register
            .iter()
            .enumerate()
            .map(|(i, t)| t.dispersion / 2i64.pow(i as u32 + 1))
            .fold(NtpDuration::default(), |a, b| a + b)
    }

    /// #[no_run]
    ///                 +-----                 -----+^1/2
    ///                 |  n-1                      |
    ///                 |  ---                      |
    ///                 |  \                     2  |
    ///      psi   =    |  /    (theta_0-theta_j)   |
    ///                 |  ---                      |
    ///                 |  j=1                      |
    ///                 +-----                 -----+
    ///
    /// In order to ensure consistency and avoid divide exceptions in other
    /// computations, psi is bounded from below by the system precision.
    ///
    /// Invariant: the register is sorted wrt delay
    fn jitter(&self, smallest_delay: FilterTuple, system_precision: f64) -> f64 {
        let root_sum_square = self
            .valid_tuples()
            .iter()
            .map(|t| (t.offset - smallest_delay.offset).to_seconds().powi(2))
            .sum::<f64>()
            .sqrt();

        root_sum_square.max(system_precision)
    }

    #[cfg(test)]
    const fn new() -> Self {
        Self {
            register: [FilterTuple::DUMMY; 8],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Ignore,
    Process,
}

/// Compute a filter tuple from an arbitrary 48-octet header; the fixed
/// point arithmetic must never panic.
#[cfg(feature = "fuzz")]
pub fn fuzz_tuple_from_packet(data: &[u8; 48], destination: u64, precision: i8) {
    let packet = match crate::packet::NtpPacket::deserialize(data) {
        Ok(packet) => packet,
        Err(_) => return,
    };

    let system_precision = NtpDuration::from_exponent(precision);
    let destination_timestamp = NtpTimestamp::from_fixed_int(destination);

    let _ = if packet.header.mode == NtpAssociationMode::Broadcast {
        FilterTuple::from_broadcast(
            &packet.header,
            system_precision,
            destination_timestamp,
            NtpInstant::ZERO,
        )
    } else {
        FilterTuple::from_packet(
            &packet.header,
            system_precision,
            destination_timestamp,
            NtpInstant::ZERO,
        )
    };
}

impl Peer {
    /// Shift a new sample into the filter and update the peer statistics
    /// from the best sample currently in the register.
    ///
    /// [`Decision::Process`] means the peer update time advanced and the
    /// caller should shake out the truechimers (unless a burst is in
    /// progress).
    pub(crate) fn clock_filter(
        &mut self,
        new_tuple: FilterTuple,
        system_leap: NtpLeapIndicator,
        system_precision: f64,
        system_poll: PollInterval,
    ) -> Decision {
        let dispersion_correction = multiply_by_phi(new_tuple.time - self.time);
        self.last_measurements
            .shift_and_insert(new_tuple, dispersion_correction);

        let temporary_list = TemporaryList::from_clock_filter_contents(&self.last_measurements);
        let smallest_delay = *temporary_list.smallest_delay();

        let previous_offset = self.statistics.offset;

        self.statistics = PeerStatistics {
            offset: smallest_delay.offset,
            delay: smallest_delay.delay,
            dispersion: temporary_list.dispersion(),
            jitter: temporary_list.jitter(smallest_delay, system_precision),
        };

        // Prime directive: use a sample only once and never a sample
        // older than the latest one, but anything goes before first
        // synchronized.
        if smallest_delay.time <= self.time && system_leap.is_synchronized() {
            return Decision::Ignore;
        }

        // Popcorn spike suppressor. Compare the difference between the
        // last and current offsets to the current jitter. If greater
        // than SGATE (3) and if the interval since the last offset is
        // less than twice the system poll interval, dump the spike.
        let offset_change = (smallest_delay.offset - previous_offset).to_seconds().abs();
        let interval = (smallest_delay.time - self.time).to_seconds();
        if offset_change > SGATE * self.statistics.jitter
            && interval < 2.0 * system_poll.as_seconds() as f64
        {
            return Decision::Ignore;
        }

        self.time = smallest_delay.time;

        Decision::Process
    }
}
