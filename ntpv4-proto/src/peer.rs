use std::net::SocketAddr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::filter::{FilterTuple, LastMeasurements};
use crate::packet::{NtpAssociationMode, NtpHeader, NtpLeapIndicator};
use crate::time_types::{NtpDuration, NtpInstant, NtpTimestamp, PollInterval};
use crate::ReferenceId;

/// Stratum 16 is the infinity metric: a peer at or above it has no path to
/// a primary reference. Stratum 0 on the wire is mapped to this value.
pub(crate) const MAX_STRATUM: u8 = 16;
pub(crate) const MAX_DISTANCE: NtpDuration = NtpDuration::ONE;

/// Burst interval (s)
const BTIME: u64 = 2;

/// frequency tolerance (15 ppm)
// const PHI: f64 = 15e-6;
pub(crate) fn multiply_by_phi(duration: NtpDuration) -> NtpDuration {
    (duration * 15) / 1_000_000
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct PeerStatistics {
    pub offset: NtpDuration,
    pub delay: NtpDuration,

    pub dispersion: NtpDuration,
    pub jitter: f64,
}

/// The mode this host operates in towards a particular remote address.
/// Unlike the wire mode of a packet this includes broadcast client, which
/// never appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostMode {
    SymmetricActive,
    SymmetricPassive,
    Client,
    Server,
    Broadcast,
    BroadcastClient,
}

impl HostMode {
    /// The mode field of packets transmitted for this association.
    /// A broadcast client never transmits.
    pub(crate) fn to_wire_mode(self) -> NtpAssociationMode {
        match self {
            HostMode::SymmetricActive => NtpAssociationMode::SymmetricActive,
            HostMode::SymmetricPassive => NtpAssociationMode::SymmetricPassive,
            HostMode::Client => NtpAssociationMode::Client,
            HostMode::Server => NtpAssociationMode::Server,
            HostMode::Broadcast => NtpAssociationMode::Broadcast,
            HostMode::BroadcastClient => NtpAssociationMode::Broadcast,
        }
    }
}

/// Per-association option flags
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PeerFlags {
    /// association was mobilized on packet arrival and is torn down again
    /// on errors and steps
    pub ephemeral: bool,
    /// send a burst of packets when the peer is reachable
    pub burst: bool,
    /// send a burst of packets when the peer is not reachable
    pub iburst: bool,
    /// do not allow access unless authenticated (implies no_peer)
    pub no_trust: bool,
    /// do not mobilize an association unless authenticated
    pub no_peer: bool,
    /// manycast client
    pub manycast: bool,
}

/// Used to determine whether the server is reachable and the data are fresh
///
/// The register is shifted left by one bit when a packet is sent and the
/// rightmost bit is set to zero. As valid packets arrive, the rightmost bit
/// is set to one. If the register contains any nonzero bits, the server is
/// considered reachable; otherwise, it is unreachable.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct Reach(u8);

impl Reach {
    pub fn is_reachable(&self) -> bool {
        self.0 != 0
    }

    /// We have just received a packet, so the peer is definitely reachable
    pub(crate) fn received_packet(&mut self) {
        self.0 |= 1;
    }

    /// A packet received some number of poll intervals ago is decreasingly
    /// relevant for determining that a peer is still reachable. We discount
    /// the packets received so far.
    pub(crate) fn poll(&mut self) {
        self.0 <<= 1
    }

    /// No replies to any of the last three polls: the filter should be fed
    /// a dead sample so stale data ages out of the statistics.
    pub(crate) fn missed_three(&self) -> bool {
        self.0 & 0x7 == 0
    }

    pub fn as_bits(&self) -> u8 {
        self.0
    }
}

/// Reason an association is being reset or torn down; recorded in the
/// association's reference id for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ClearReason {
    /// initialization at mobilize time
    Init = 0,
    /// the peer timed out while ephemeral
    Stale = 1,
    /// the system clock was stepped, invalidating all samples
    Step = 2,
    /// authentication failure
    AuthError = 3,
    /// a crypto-NAK was received
    CryptoNak = 4,
    /// the configured key is missing or untrusted
    UntrustedKey = 5,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AcceptSynchronizationError {
    ServerUnreachable,
    Loop,
    Distance,
    Stratum,
}

/// A single association: the complete protocol state kept for one remote
/// peer, shared between the receive and poll processes.
#[derive(Debug, Clone)]
pub struct Peer {
    // Variables set by configuration
    pub(crate) source_address: SocketAddr,
    pub(crate) destination_address: SocketAddr,
    pub(crate) version: u8,
    pub(crate) hmode: HostMode,
    pub(crate) keyid: u32,
    pub(crate) flags: PeerFlags,
    pub(crate) our_id: ReferenceId,

    // Variables set by received packet
    pub(crate) leap: NtpLeapIndicator,
    pub(crate) pmode: NtpAssociationMode,
    pub(crate) stratum: u8,
    pub(crate) ppoll: i8,
    pub(crate) rootdelay: NtpDuration,
    pub(crate) rootdisp: NtpDuration,
    pub(crate) refid: ReferenceId,
    pub(crate) reftime: NtpTimestamp,
    pub(crate) org: NtpTimestamp,
    pub(crate) rec: NtpTimestamp,
    pub(crate) xmt: NtpTimestamp,

    // Computed data
    pub(crate) time: NtpInstant,
    pub(crate) last_measurements: LastMeasurements,
    pub(crate) statistics: PeerStatistics,

    // Poll process variables
    pub(crate) hpoll: PollInterval,
    pub(crate) burst: u8,
    pub(crate) reach: Reach,
    pub(crate) ttl: u8,
    pub(crate) unreach: u32,
    pub(crate) outdate: NtpInstant,
    pub(crate) nextdate: NtpInstant,
}

impl Peer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        source_address: SocketAddr,
        destination_address: SocketAddr,
        version: u8,
        hmode: HostMode,
        keyid: u32,
        flags: PeerFlags,
        local_clock_time: NtpInstant,
        system_precision: f64,
    ) -> Self {
        let mut peer = Self {
            source_address,
            destination_address,
            version,
            hmode,
            keyid,
            flags,
            our_id: ReferenceId::from_ip(destination_address.ip()),

            leap: NtpLeapIndicator::Unknown,
            pmode: NtpAssociationMode::Reserved,
            stratum: MAX_STRATUM,
            ppoll: PollInterval::MAX.as_log2(),
            rootdelay: NtpDuration::ZERO,
            rootdisp: NtpDuration::ZERO,
            refid: ReferenceId::NONE,
            reftime: NtpTimestamp::ZERO,
            org: NtpTimestamp::ZERO,
            rec: NtpTimestamp::ZERO,
            xmt: NtpTimestamp::ZERO,

            time: local_clock_time,
            last_measurements: LastMeasurements::new(),
            statistics: PeerStatistics::default(),

            hpoll: PollInterval::MIN,
            burst: 0,
            reach: Reach::default(),
            ttl: 0,
            unreach: 0,
            outdate: local_clock_time,
            nextdate: local_clock_time,
        };
        peer.clear(ClearReason::Init, local_clock_time, system_precision);
        peer
    }

    /// Reinitialize the association after mobilization, a clock step, or a
    /// protocol error. Everything derived from received packets is wiped;
    /// the kiss code is recorded in the reference id for monitoring.
    ///
    /// Note that tearing down an ephemeral association entirely is the
    /// responsibility of the association table, not of this routine.
    pub(crate) fn clear(
        &mut self,
        kiss: ClearReason,
        local_clock_time: NtpInstant,
        system_precision: f64,
    ) {
        self.org = NtpTimestamp::ZERO;
        self.rec = NtpTimestamp::ZERO;
        self.xmt = NtpTimestamp::ZERO;

        self.leap = NtpLeapIndicator::Unknown;
        self.stratum = MAX_STRATUM;
        self.ppoll = PollInterval::MAX.as_log2();
        self.hpoll = PollInterval::MIN;
        self.refid = ReferenceId::from_int(kiss as u32);

        self.last_measurements.reset();
        self.statistics = PeerStatistics {
            offset: NtpDuration::ZERO,
            delay: NtpDuration::ZERO,
            dispersion: NtpDuration::MAX_DISPERSION,
            jitter: system_precision,
        };

        self.burst = 0;
        self.reach = Reach::default();
        self.ttl = 0;
        self.unreach = 0;

        // Randomize the first poll just in case thousands of broadcast
        // clients have just been stirred up after a long absence of the
        // broadcast server.
        self.time = local_clock_time;
        self.outdate = local_clock_time;
        let delay = rand::thread_rng().gen_range(0..PollInterval::MIN.as_seconds());
        self.nextdate = self.outdate.add_seconds(delay);
    }

    /// Light up the header fields from a validated packet and compute the
    /// sample for the clock filter.
    ///
    /// Returns None without producing a sample when the server is itself
    /// unsynchronized or its header values are inconsistent.
    pub(crate) fn update_from_packet(
        &mut self,
        packet: &NtpHeader,
        destination_timestamp: NtpTimestamp,
        local_clock_time: NtpInstant,
        system_precision: NtpDuration,
    ) -> Option<FilterTuple> {
        self.leap = packet.leap;
        self.pmode = packet.mode;
        // we map stratum 0 (unspecified) to MAXSTRAT to make stratum
        // comparisons simpler and to provide a natural interface for radio
        // clock drivers that operate for convenience at stratum 0
        self.stratum = if packet.stratum == 0 {
            MAX_STRATUM
        } else {
            packet.stratum
        };
        self.ppoll = packet.poll;
        self.rootdelay = packet.root_delay;
        self.rootdisp = packet.root_dispersion;
        self.refid = packet.reference_id;
        self.reftime = packet.reference_timestamp;

        // Verify the server is synchronized with valid stratum and
        // reference time not later than the transmit time.
        if !self.leap.is_synchronized() || self.stratum >= MAX_STRATUM {
            return None; // unsynchronized
        }

        // Verify valid root distance.
        let packet_dispersion = packet.root_delay / 2i64 + packet.root_dispersion;
        if packet_dispersion >= NtpDuration::MAX_DISPERSION
            || self.reftime > packet.transmit_timestamp
        {
            return None; // invalid header values
        }

        let poll_interval = self.hpoll;
        self.poll_update(local_clock_time, poll_interval);
        self.reach.received_packet();

        let tuple = if self.pmode == NtpAssociationMode::Broadcast {
            FilterTuple::from_broadcast(
                packet,
                system_precision,
                destination_timestamp,
                local_clock_time,
            )
        } else {
            FilterTuple::from_packet(
                packet,
                system_precision,
                destination_timestamp,
                local_clock_time,
            )
        };

        Some(tuple)
    }

    /// The root synchronization distance is the maximum error due to
    /// all causes of the local clock relative to the primary server.
    /// It is defined as half the total delay plus total dispersion
    /// plus peer jitter.
    pub(crate) fn root_distance(&self, local_clock_time: NtpInstant) -> NtpDuration {
        NtpDuration::MIN_DISPERSION.max(self.rootdelay + self.statistics.delay) / 2i64
            + self.rootdisp
            + self.statistics.dispersion
            + multiply_by_phi(local_clock_time - self.time)
            + NtpDuration::from_seconds(self.statistics.jitter)
    }

    /// Test if this association is acceptable for synchronization
    ///
    /// Known as `accept` and `fit` in RFC5905.
    pub(crate) fn accept_synchronization(
        &self,
        local_clock_time: NtpInstant,
        system_poll: PollInterval,
        system_refid: ReferenceId,
    ) -> Result<(), AcceptSynchronizationError> {
        use AcceptSynchronizationError::*;

        // A stratum error occurs if
        //     1: the server has never been synchronized,
        //     2: the server stratum is invalid
        if !self.leap.is_synchronized() || self.stratum >= MAX_STRATUM {
            return Err(Stratum);
        }

        //  A distance error occurs if the root distance exceeds the
        //  distance threshold plus an increment equal to one poll interval.
        let distance = self.root_distance(local_clock_time);
        if distance > MAX_DISTANCE + multiply_by_phi(system_poll.as_duration()) {
            return Err(Distance);
        }

        // Detect whether the remote uses us or our current system peer as
        // their main time reference. If so, we shouldn't sync to them as
        // that would create a loop. This can only ever be an issue if the
        // peer is not using hardware as its source, so ignore the
        // reference_id if stratum is 1.
        if self.stratum != 1 && (self.refid == self.our_id || self.refid == system_refid) {
            return Err(Loop);
        }

        // An unreachable error occurs if the server is unreachable.
        if !self.reach.is_reachable() {
            return Err(ServerUnreachable);
        }

        Ok(())
    }

    /// Determine the time of the next poll. If within a burst the poll
    /// interval is two seconds. Otherwise, it is the minimum of the host
    /// poll interval and peer poll interval, clamped to the legal range.
    /// The design ensures that a longer interval can be preempted by a
    /// shorter one if required for rapid response.
    pub(crate) fn poll_update(&mut self, local_clock_time: NtpInstant, poll: PollInterval) {
        self.hpoll = poll.clamped();

        if self.burst > 0 {
            if self.nextdate != local_clock_time {
                return;
            }
            self.nextdate = self.nextdate.add_seconds(BTIME);
        } else {
            // While not shown here, the reference implementation randomizes
            // the poll interval by a small factor.
            let interval = PollInterval::from_log2(self.ppoll.min(self.hpoll.as_log2())).clamped();
            self.nextdate = self.outdate.add_seconds(interval.as_seconds());
        }

        // It might happen that the due time has already passed. If so, make
        // it one second in the future.
        if self.nextdate <= local_clock_time {
            self.nextdate = local_clock_time.add_seconds(1);
        }
    }

    pub fn observe(&self) -> PeerSnapshot {
        PeerSnapshot {
            address: self.source_address,
            mode: self.hmode,
            stratum: self.stratum,
            reference_id: self.refid,
            reachability: self.reach,
            poll_interval: self.hpoll.as_log2(),
            statistics: self.statistics,
        }
    }

    #[cfg(any(test, feature = "fuzz", feature = "ext-test"))]
    pub fn test_peer() -> Self {
        Peer {
            source_address: "127.0.0.1:123".parse().unwrap(),
            destination_address: "127.0.0.2:123".parse().unwrap(),
            version: crate::packet::VERSION,
            hmode: HostMode::Client,
            keyid: 0,
            flags: PeerFlags::default(),
            our_id: ReferenceId::from_int(0),

            leap: NtpLeapIndicator::Unknown,
            pmode: NtpAssociationMode::Reserved,
            stratum: 0,
            ppoll: PollInterval::MAX.as_log2(),
            rootdelay: NtpDuration::ZERO,
            rootdisp: NtpDuration::ZERO,
            refid: ReferenceId::from_int(0),
            reftime: NtpTimestamp::ZERO,
            org: NtpTimestamp::ZERO,
            rec: NtpTimestamp::ZERO,
            xmt: NtpTimestamp::ZERO,

            time: NtpInstant::ZERO,
            last_measurements: LastMeasurements::new(),
            statistics: PeerStatistics::default(),

            hpoll: PollInterval::MIN,
            burst: 0,
            reach: Reach::default(),
            ttl: 0,
            unreach: 0,
            outdate: NtpInstant::ZERO,
            nextdate: NtpInstant::ZERO,
        }
    }
}

/// Per-association state as exposed on the observability socket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PeerSnapshot {
    pub address: SocketAddr,
    pub mode: HostMode,
    pub stratum: u8,
    pub reference_id: ReferenceId,
    pub reachability: Reach,
    pub poll_interval: i8,
    pub statistics: PeerStatistics,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reachability() {
        let mut reach = Reach::default();

        // the default reach register value is 0, and hence not reachable
        assert!(!reach.is_reachable());

        // when we receive a packet, we set the right-most bit;
        // we just received a packet from the peer, so it is reachable
        reach.received_packet();
        assert!(reach.is_reachable());

        // on every poll, the register is shifted to the left, and there are
        // 8 bits. So we can poll 7 times and the peer is still considered reachable
        for _ in 0..7 {
            reach.poll();
        }

        assert!(reach.is_reachable());

        // but one more poll and all 1 bits have been shifted out;
        // the peer is no longer reachable
        reach.poll();
        assert!(!reach.is_reachable());

        // until we receive a packet from it again
        reach.received_packet();
        assert!(reach.is_reachable());
    }

    #[test]
    fn reach_missed_three() {
        let mut reach = Reach::default();
        reach.received_packet();
        assert!(!reach.missed_three());

        reach.poll();
        assert!(!reach.missed_three());
        reach.poll();
        assert!(!reach.missed_three());

        // third consecutive miss: the low three bits are now clear
        reach.poll();
        assert!(reach.missed_three());

        // the peer counts as reachable for a few more polls regardless
        assert!(reach.is_reachable());
    }

    #[test]
    fn test_root_duration_sanity() {
        // Ensure root distance at least increases as it is supposed to
        // when changing the main measurement parameters

        let duration_1s = NtpDuration::from_fixed_int(1 << 32);
        let duration_2s = NtpDuration::from_fixed_int(2 << 32);

        let instant_1s = NtpInstant::from_seconds(1);
        let instant_2s = NtpInstant::from_seconds(2);

        let reference = Peer {
            statistics: PeerStatistics {
                delay: duration_1s,
                dispersion: duration_1s,
                ..Default::default()
            },
            rootdelay: duration_1s,
            rootdisp: duration_1s,
            time: instant_1s,
            ..Peer::test_peer()
        };

        // the peer statistics age into the distance
        assert!(reference.root_distance(instant_1s) < reference.root_distance(instant_2s));

        let higher_delay = Peer {
            statistics: PeerStatistics {
                delay: duration_2s,
                dispersion: duration_1s,
                ..Default::default()
            },
            rootdelay: duration_1s,
            rootdisp: duration_1s,
            time: instant_1s,
            ..Peer::test_peer()
        };
        assert!(reference.root_distance(instant_1s) < higher_delay.root_distance(instant_1s));

        let higher_dispersion = Peer {
            statistics: PeerStatistics {
                delay: duration_1s,
                dispersion: duration_2s,
                ..Default::default()
            },
            rootdelay: duration_1s,
            rootdisp: duration_1s,
            time: instant_1s,
            ..Peer::test_peer()
        };
        assert!(reference.root_distance(instant_1s) < higher_dispersion.root_distance(instant_1s));

        let higher_rootdelay = Peer {
            statistics: PeerStatistics {
                delay: duration_1s,
                dispersion: duration_1s,
                ..Default::default()
            },
            rootdelay: duration_2s,
            rootdisp: duration_1s,
            time: instant_1s,
            ..Peer::test_peer()
        };
        assert!(reference.root_distance(instant_1s) < higher_rootdelay.root_distance(instant_1s));

        let higher_rootdisp = Peer {
            statistics: PeerStatistics {
                delay: duration_1s,
                dispersion: duration_1s,
                ..Default::default()
            },
            rootdelay: duration_1s,
            rootdisp: duration_2s,
            time: instant_1s,
            ..Peer::test_peer()
        };
        assert!(reference.root_distance(instant_1s) < higher_rootdisp.root_distance(instant_1s));
    }

    #[test]
    fn test_accept_synchronization() {
        use AcceptSynchronizationError::*;

        let local_clock_time = NtpInstant::ZERO;
        let system_poll = PollInterval::MIN;
        let system_refid = ReferenceId::from_int(0xAABBCCDD);

        let mut peer = Peer::test_peer();
        peer.leap = NtpLeapIndicator::NoWarning;
        peer.stratum = 2;

        // by default, the packet id and the peer's id are the same,
        // indicating a loop
        assert_eq!(
            peer.accept_synchronization(local_clock_time, system_poll, system_refid),
            Err(Loop)
        );

        peer.our_id = ReferenceId::from_int(42);

        assert_eq!(
            peer.accept_synchronization(local_clock_time, system_poll, system_refid),
            Err(ServerUnreachable)
        );

        peer.reach.received_packet();

        assert_eq!(
            peer.accept_synchronization(local_clock_time, system_poll, system_refid),
            Ok(())
        );

        // synchronizing to the system peer's source would also be a loop
        peer.refid = system_refid;
        assert_eq!(
            peer.accept_synchronization(local_clock_time, system_poll, system_refid),
            Err(Loop)
        );
        peer.refid = ReferenceId::from_int(0);

        peer.leap = NtpLeapIndicator::Unknown;
        assert_eq!(
            peer.accept_synchronization(local_clock_time, system_poll, system_refid),
            Err(Stratum)
        );

        peer.leap = NtpLeapIndicator::NoWarning;
        peer.stratum = 42;
        assert_eq!(
            peer.accept_synchronization(local_clock_time, system_poll, system_refid),
            Err(Stratum)
        );

        peer.stratum = 2;
        peer.rootdisp = MAX_DISTANCE * 2;
        assert_eq!(
            peer.accept_synchronization(local_clock_time, system_poll, system_refid),
            Err(Distance)
        );
    }

    #[test]
    fn update_from_packet_remaps_stratum_zero() {
        let mut peer = Peer::test_peer();
        let mut packet = NtpHeader::new();
        packet.leap = NtpLeapIndicator::NoWarning;
        packet.stratum = 0;
        packet.mode = NtpAssociationMode::Server;

        let update = peer.update_from_packet(
            &packet,
            NtpTimestamp::from_fixed_int(1 << 32),
            NtpInstant::from_seconds(1),
            NtpDuration::from_exponent(-18),
        );

        // stratum 0 counts as unspecified, so no sample is produced, but
        // the stratum must read as the infinity metric
        assert!(update.is_none());
        assert_eq!(peer.stratum, MAX_STRATUM);
    }

    #[test]
    fn update_from_packet_rejects_unsynchronized_server() {
        let mut peer = Peer::test_peer();
        let mut packet = NtpHeader::new();
        packet.leap = NtpLeapIndicator::Unknown;
        packet.stratum = 2;
        packet.mode = NtpAssociationMode::Server;

        let update = peer.update_from_packet(
            &packet,
            NtpTimestamp::from_fixed_int(1 << 32),
            NtpInstant::from_seconds(1),
            NtpDuration::from_exponent(-18),
        );

        assert!(update.is_none());
        // the reach register is only updated for usable packets
        assert!(!peer.reach.is_reachable());
    }

    #[test]
    fn update_from_packet_rejects_excessive_root_distance() {
        let mut peer = Peer::test_peer();
        let mut packet = NtpHeader::new();
        packet.leap = NtpLeapIndicator::NoWarning;
        packet.stratum = 2;
        packet.mode = NtpAssociationMode::Server;
        packet.root_delay = NtpDuration::from_seconds(20.0);
        packet.root_dispersion = NtpDuration::from_seconds(10.0);

        let update = peer.update_from_packet(
            &packet,
            NtpTimestamp::from_fixed_int(1 << 32),
            NtpInstant::from_seconds(1),
            NtpDuration::from_exponent(-18),
        );

        assert!(update.is_none());
    }

    #[test]
    fn update_from_packet_rejects_reftime_after_xmt() {
        let mut peer = Peer::test_peer();
        let mut packet = NtpHeader::new();
        packet.leap = NtpLeapIndicator::NoWarning;
        packet.stratum = 2;
        packet.mode = NtpAssociationMode::Server;
        packet.reference_timestamp = NtpTimestamp::from_fixed_int(10 << 32);
        packet.transmit_timestamp = NtpTimestamp::from_fixed_int(5 << 32);

        let update = peer.update_from_packet(
            &packet,
            NtpTimestamp::from_fixed_int(11 << 32),
            NtpInstant::from_seconds(1),
            NtpDuration::from_exponent(-18),
        );

        assert!(update.is_none());
    }

    #[test]
    fn update_from_packet_computes_offset_and_delay() {
        let mut peer = Peer::test_peer();
        let mut packet = NtpHeader::new();
        packet.leap = NtpLeapIndicator::NoWarning;
        packet.stratum = 2;
        packet.mode = NtpAssociationMode::Server;
        // T1 = 0, T2 = 1, T3 = 2; captured at T4 = 3
        packet.origin_timestamp = NtpTimestamp::from_fixed_int(0);
        packet.receive_timestamp = NtpTimestamp::from_fixed_int(1 << 32);
        packet.transmit_timestamp = NtpTimestamp::from_fixed_int(2 << 32);

        let update = peer.update_from_packet(
            &packet,
            NtpTimestamp::from_fixed_int(3 << 32),
            NtpInstant::from_seconds(1),
            NtpDuration::from_exponent(-18),
        );

        let tuple = update.unwrap();
        // offset = ((T2 - T1) + (T4 - T3)) / 2 = 1 s
        assert_eq!(tuple.offset, NtpDuration::from_fixed_int(1 << 32));
        // delay = (T4 - T1) - (T2 - T3) = 4 s
        assert_eq!(tuple.delay, NtpDuration::from_fixed_int(4 << 32));
        assert!(peer.reach.is_reachable());
    }

    #[test]
    fn clear_resets_association() {
        let mut peer = Peer::test_peer();
        peer.flags.ephemeral = true;
        peer.leap = NtpLeapIndicator::NoWarning;
        peer.stratum = 3;
        peer.xmt = NtpTimestamp::from_fixed_int(999);
        peer.reach.received_packet();
        peer.unreach = 7;

        let now = NtpInstant::from_seconds(1000);
        peer.clear(ClearReason::Step, now, 2.0f64.powi(-18));

        assert_eq!(peer.leap, NtpLeapIndicator::Unknown);
        assert_eq!(peer.stratum, MAX_STRATUM);
        assert_eq!(peer.xmt, NtpTimestamp::ZERO);
        assert!(!peer.reach.is_reachable());
        assert_eq!(peer.unreach, 0);
        // the kiss code lands in the refid for monitoring
        assert_eq!(peer.refid, ReferenceId::from_int(ClearReason::Step as u32));
        // flags are part of the configuration and survive a reset
        assert!(peer.flags.ephemeral);

        // the first poll is randomized within one minimum poll interval
        assert!(peer.nextdate >= peer.outdate);
        assert!(peer.nextdate < peer.outdate.add_seconds(PollInterval::MIN.as_seconds()));
        assert_eq!(peer.outdate, now);
    }

    #[test]
    fn poll_update_uses_minimum_of_peer_and_host_poll() {
        let mut peer = Peer::test_peer();
        peer.outdate = NtpInstant::from_seconds(100);
        peer.ppoll = 7;

        peer.poll_update(NtpInstant::from_seconds(100), PollInterval::from_log2(9));

        // min(7, 9) = 7 -> 128 seconds
        assert_eq!(peer.hpoll, PollInterval::from_log2(9));
        assert_eq!(peer.nextdate, NtpInstant::from_seconds(228));
    }

    #[test]
    fn poll_update_clamps_to_legal_range() {
        let mut peer = Peer::test_peer();
        peer.outdate = NtpInstant::from_seconds(100);
        peer.ppoll = 1;

        peer.poll_update(NtpInstant::from_seconds(100), PollInterval::from_log2(2));

        assert_eq!(peer.hpoll, PollInterval::MIN);
        // min(ppoll, hpoll) clamped to MINPOLL -> 64 seconds
        assert_eq!(peer.nextdate, NtpInstant::from_seconds(164));
    }

    #[test]
    fn poll_update_during_burst() {
        let mut peer = Peer::test_peer();
        peer.burst = 3;
        peer.outdate = NtpInstant::from_seconds(100);
        peer.nextdate = NtpInstant::from_seconds(100);

        // scheduled now: the next burst packet follows after BTIME
        peer.poll_update(NtpInstant::from_seconds(100), PollInterval::MIN);
        assert_eq!(peer.nextdate, NtpInstant::from_seconds(102));

        // not scheduled now: the schedule is left alone
        peer.poll_update(NtpInstant::from_seconds(101), PollInterval::MIN);
        assert_eq!(peer.nextdate, NtpInstant::from_seconds(102));
    }

    #[test]
    fn poll_update_never_schedules_in_the_past() {
        let mut peer = Peer::test_peer();
        peer.outdate = NtpInstant::from_seconds(100);
        peer.ppoll = PollInterval::MIN.as_log2();

        peer.poll_update(NtpInstant::from_seconds(500), PollInterval::MIN);

        assert_eq!(peer.nextdate, NtpInstant::from_seconds(501));
    }
}
