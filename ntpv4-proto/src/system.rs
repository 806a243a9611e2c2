// The system process: one owning value for the association table, the
// system record and the clock discipline. The receive, selection and poll
// paths all run through this, serialized by the caller.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::auth::{AuthResult, KeyStore};
use crate::clock::{ClockDiscipline, ClockState, ClockUpdateResult, NtpClock};
use crate::clock_select::{clock_combine, select_survivors};
use crate::config::SystemConfig;
use crate::filter::{Decision, FilterTuple};
use crate::packet::{NtpAssociationMode, NtpHeader, NtpLeapIndicator, NtpMac, NtpPacket};
use crate::peer::{
    multiply_by_phi, ClearReason, HostMode, Peer, PeerFlags, PeerSnapshot, MAX_STRATUM,
};
use crate::receive::ReceivedPacket;
use crate::time_types::{NtpDuration, NtpInstant, NtpTimestamp, PollInterval};
use crate::ReferenceId;

/// maximum number of associations (NMAX)
const MAX_PEERS: usize = 50;
/// manycast: stop expanding the search once this many survivors chime
/// (MINCLOCK)
const MIN_CLOCK: usize = 3;
/// manycast: maximum number of ephemeral client associations (MAXCLOCK)
pub(crate) const MAX_CLOCK: usize = 10;
/// manycast: maximum time-to-live (TTLMAX)
const TTL_MAX: u8 = 8;
/// manycast: maximum interval between beacons (BEACON)
const BEACON: u32 = 15;
/// unreach counter threshold before the poll interval is doubled (UNREACH)
const UNREACH: u32 = 12;
/// packets in a burst (BCOUNT)
const BURST_COUNT: u8 = 8;

/// Weak reference to an association: a slot index plus a generation
/// counter. Demobilizing an association bumps the slot generation, so a
/// stale handle is detected on re-lookup instead of silently resolving to
/// an unrelated newer association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerHandle {
    pub(crate) index: usize,
    pub(crate) generation: u64,
}

#[derive(Debug)]
struct Slot {
    generation: u64,
    peer: Option<Peer>,
}

/// The system record: status derived from the current synchronization
/// source, served to downstream clients in every reply.
#[derive(Debug)]
pub(crate) struct System {
    pub(crate) leap: NtpLeapIndicator,
    pub(crate) stratum: u8,
    pub(crate) precision: i8,
    pub(crate) rootdelay: NtpDuration,
    pub(crate) rootdisp: NtpDuration,
    pub(crate) refid: ReferenceId,
    pub(crate) reftime: NtpTimestamp,
    /// the current synchronization source
    pub(crate) peer: Option<PeerHandle>,
    /// combined offset of the survivors
    pub(crate) offset: NtpDuration,
    /// combined jitter of the survivors
    pub(crate) jitter: f64,
    /// survivors of the last selection run
    pub(crate) survivor_count: usize,
}

impl System {
    fn new(precision: i8) -> Self {
        Self {
            leap: NtpLeapIndicator::Unknown,
            stratum: MAX_STRATUM,
            precision,
            rootdelay: NtpDuration::ZERO,
            rootdisp: NtpDuration::ZERO,
            refid: ReferenceId::NONE,
            reftime: NtpTimestamp::ZERO,
            peer: None,
            offset: NtpDuration::ZERO,
            jitter: 0.0,
            survivor_count: 0,
        }
    }
}

/// System state as exposed on the observability socket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SystemSnapshot {
    pub leap: NtpLeapIndicator,
    pub stratum: u8,
    pub precision: i8,
    pub root_delay: NtpDuration,
    pub root_dispersion: NtpDuration,
    pub reference_id: ReferenceId,
    pub offset: NtpDuration,
    pub jitter: f64,
    pub poll_interval: i8,
    pub frequency: f64,
    pub clock_state: ClockState,
    pub survivors: usize,
}

/// A packet the caller must put on the wire
#[derive(Debug, Clone)]
pub struct OutgoingPacket {
    pub destination: SocketAddr,
    pub packet: NtpPacket,
}

/// The owning value for all protocol state. The embedded kernel clock is
/// the only side-effecting collaborator; everything else is driven by the
/// receive pipeline and [`clock_adjust`](Self::clock_adjust).
#[derive(Debug)]
pub struct NtpCore<C> {
    pub(crate) clock: C,
    pub(crate) config: SystemConfig,
    pub(crate) keys: KeyStore,
    pub(crate) system: System,
    pub(crate) discipline: ClockDiscipline,
    slots: Vec<Slot>,
    /// process time c.t, advanced once per tick of the one-hertz timer
    pub(crate) time: NtpInstant,
}

impl<C: NtpClock> NtpCore<C> {
    /// A core without any knowledge of the oscillator frequency; the
    /// discipline starts in NSET
    pub fn new(clock: C, config: SystemConfig, keys: KeyStore, precision: i8) -> Self {
        let precision_seconds = 2.0f64.powi(precision as i32);
        Self {
            clock,
            config,
            keys,
            system: System::new(precision),
            discipline: ClockDiscipline::new(precision_seconds),
            slots: vec![],
            time: NtpInstant::ZERO,
        }
    }

    /// A core starting from a frequency estimate read back from the
    /// frequency file; the discipline starts in FSET
    pub fn with_frequency(
        clock: C,
        config: SystemConfig,
        keys: KeyStore,
        precision: i8,
        frequency: f64,
    ) -> Self {
        let precision_seconds = 2.0f64.powi(precision as i32);
        Self {
            discipline: ClockDiscipline::with_frequency(precision_seconds, frequency),
            ..Self::new(clock, config, keys, precision)
        }
    }

    pub fn process_time(&self) -> NtpInstant {
        self.time
    }

    /// The current frequency estimate, for persisting to the frequency file
    pub fn frequency(&self) -> f64 {
        self.discipline.frequency()
    }

    /// True once per hour; the caller should then persist
    /// [`frequency`](Self::frequency)
    pub fn should_write_frequency(&self) -> bool {
        self.time.as_seconds() % 3600 == 3599
    }

    pub fn observe_system(&self) -> SystemSnapshot {
        SystemSnapshot {
            leap: self.system.leap,
            stratum: self.system.stratum,
            precision: self.system.precision,
            root_delay: self.system.rootdelay,
            root_dispersion: self.system.rootdisp,
            reference_id: self.system.refid,
            offset: self.system.offset,
            jitter: self.system.jitter,
            poll_interval: self.discipline.poll_interval().as_log2(),
            frequency: self.discipline.frequency(),
            clock_state: self.discipline.state(),
            survivors: self.system.survivor_count,
        }
    }

    pub fn observe_peers(&self) -> Vec<PeerSnapshot> {
        self.slots
            .iter()
            .filter_map(|slot| slot.peer.as_ref())
            .map(Peer::observe)
            .collect()
    }

    pub(crate) fn precision_seconds(&self) -> f64 {
        2.0f64.powi(self.system.precision as i32)
    }

    pub(crate) fn peer(&self, handle: PeerHandle) -> Option<&Peer> {
        let slot = self.slots.get(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.peer.as_ref()
    }

    pub(crate) fn peer_mut(&mut self, handle: PeerHandle) -> Option<&mut Peer> {
        let slot = self.slots.get_mut(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.peer.as_mut()
    }

    pub(crate) fn handles(&self) -> Vec<PeerHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.peer.is_some())
            .map(|(index, slot)| PeerHandle {
                index,
                generation: slot.generation,
            })
            .collect()
    }

    /// Find the association matching the source address of a received
    /// packet. Must return an explicit no-match so the dispatcher can use
    /// the no-association row of its matrix.
    pub(crate) fn find_assoc(&self, source_address: SocketAddr) -> Option<PeerHandle> {
        self.handles()
            .into_iter()
            .find(|handle| match self.peer(*handle) {
                Some(peer) => peer.source_address == source_address,
                None => false,
            })
    }

    /// Allocate and initialize a new association. Fails when the table is
    /// full.
    pub fn mobilize(
        &mut self,
        source_address: SocketAddr,
        destination_address: SocketAddr,
        version: u8,
        hmode: HostMode,
        keyid: u32,
        flags: PeerFlags,
    ) -> Option<PeerHandle> {
        let active = self.slots.iter().filter(|s| s.peer.is_some()).count();
        if active >= MAX_PEERS {
            warn!(
                address = ?source_address,
                "association table full, refusing to mobilize"
            );
            return None;
        }

        debug!(address = ?source_address, ?hmode, "mobilizing association");

        let peer = Peer::new(
            source_address,
            destination_address,
            version,
            hmode,
            keyid,
            flags,
            self.time,
            self.precision_seconds(),
        );

        let index = match self.slots.iter().position(|s| s.peer.is_none()) {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    peer: None,
                });
                self.slots.len() - 1
            }
        };

        let slot = &mut self.slots[index];
        slot.peer = Some(peer);
        Some(PeerHandle {
            index,
            generation: slot.generation,
        })
    }

    /// The number of ephemeral manycast client associations; mobilization
    /// stops at MAXCLOCK of them.
    pub(crate) fn ephemeral_client_count(&self) -> usize {
        self.slots
            .iter()
            .filter_map(|slot| slot.peer.as_ref())
            .filter(|peer| peer.flags.ephemeral && peer.hmode == HostMode::Client)
            .count()
    }

    /// Reinitialize an association for the given kiss code; an ephemeral
    /// association is demobilized entirely unless the kiss is INIT.
    pub(crate) fn clear_peer(&mut self, handle: PeerHandle, kiss: ClearReason) {
        // the system peer is a weak reference and must not survive a reset
        // of its target
        if self.system.peer == Some(handle) {
            self.system.peer = None;
        }

        let ephemeral = match self.peer(handle) {
            Some(peer) => peer.flags.ephemeral,
            None => return,
        };

        if kiss != ClearReason::Init && ephemeral {
            if let Some(peer) = self.peer_mut(handle) {
                debug!(address = ?peer.source_address, ?kiss, "demobilizing ephemeral association");
            }
            self.demobilize(handle);
            return;
        }

        let time = self.time;
        let precision = self.precision_seconds();
        if let Some(peer) = self.peer_mut(handle) {
            peer.clear(kiss, time, precision);
        }
    }

    fn demobilize(&mut self, handle: PeerHandle) {
        if let Some(slot) = self.slots.get_mut(handle.index) {
            if slot.generation == handle.generation {
                slot.peer = None;
                slot.generation += 1;
            }
        }
    }

    /// Feed a validated PROC packet into the association and onwards
    /// through the clock filter and, when a new peer update results, the
    /// selection machinery.
    pub(crate) fn process_packet(
        &mut self,
        handle: PeerHandle,
        header: &NtpHeader,
        destination_timestamp: NtpTimestamp,
    ) -> Result<(), C::Error> {
        let now = self.time;
        let system_leap = self.system.leap;
        let system_poll = self.discipline.poll_interval();
        let precision_duration = NtpDuration::from_exponent(self.system.precision);
        let precision_seconds = self.precision_seconds();

        let peer = match self.peer_mut(handle) {
            Some(peer) => peer,
            None => return Ok(()),
        };

        let tuple =
            match peer.update_from_packet(header, destination_timestamp, now, precision_duration) {
                Some(tuple) => tuple,
                None => return Ok(()),
            };

        let decision = peer.clock_filter(tuple, system_leap, precision_seconds, system_poll);
        let in_burst = peer.burst > 0;

        // a better sample arrived; shake out the truechimers, unless a
        // burst is in progress and more samples are imminent
        if decision == Decision::Process && !in_burst {
            self.clock_select()?;
        }

        Ok(())
    }

    /// Find the best clocks: cull the falsetickers, reduce the survivors by
    /// selection jitter and nominate the system peer.
    pub(crate) fn clock_select(&mut self) -> Result<(), C::Error> {
        let local_clock_time = self.time;
        let system_poll = self.discipline.poll_interval();
        let system_refid = self.system.refid;

        let previous_system_peer = self.system.peer;
        self.system.peer = None;

        let candidates: Vec<(PeerHandle, &Peer)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let peer = slot.peer.as_ref()?;
                peer.accept_synchronization(local_clock_time, system_poll, system_refid)
                    .ok()?;
                Some((
                    PeerHandle {
                        index,
                        generation: slot.generation,
                    },
                    peer,
                ))
            })
            .collect();

        let survivors = select_survivors(&candidates, local_clock_time, &self.config);

        self.system.survivor_count = survivors.len();
        if survivors.len() < self.config.min_intersection_survivors {
            // not enough truechimers to decide anything; leave the previous
            // system peer in place
            debug!(survivors = survivors.len(), "selection aborted");
            self.system.peer = previous_system_peer;
            return Ok(());
        }

        // Pick the best clock. If the old system peer is on the survivor
        // list and at the same stratum as the first survivor on the list,
        // then don't do a clock hop.
        let head = survivors[0];
        let head_stratum = match self.peer(head) {
            Some(peer) => peer.stratum,
            None => return Ok(()),
        };
        let system_peer = match previous_system_peer {
            Some(old) if survivors.contains(&old) => {
                let old_stratum = self.peer(old).map(|p| p.stratum);
                if old_stratum == Some(head_stratum) {
                    old
                } else {
                    head
                }
            }
            _ => head,
        };

        self.system.peer = Some(system_peer);
        self.clock_update(system_peer, &survivors)
    }

    /// Update the system clock from the chosen peer and the combined
    /// survivor offsets; the discipline will tell us the good or bad news.
    fn clock_update(&mut self, handle: PeerHandle, survivors: &[PeerHandle]) -> Result<(), C::Error> {
        let (peer_time, update) = match self.peer(handle) {
            Some(peer) => (
                peer.time,
                (
                    peer.leap,
                    peer.stratum,
                    peer.refid,
                    peer.reftime,
                    peer.rootdelay + peer.statistics.delay,
                    peer.rootdisp,
                    peer.statistics,
                ),
            ),
            None => return Ok(()),
        };

        // If this is an old update, for instance, as the result of a system
        // peer change, avoid it. We never use an old sample or the same
        // sample twice.
        if self.discipline.last_update() >= peer_time {
            return Ok(());
        }

        // Combine the survivor offsets; the weights decay with root
        // distance.
        let survivor_peers: Vec<&Peer> = survivors.iter().filter_map(|h| self.peer(*h)).collect();
        if survivor_peers.is_empty() {
            return Ok(());
        }
        let (offset, jitter) = clock_combine(&survivor_peers, self.time);
        drop(survivor_peers);
        self.system.offset = offset;
        self.system.jitter = jitter;

        let precision_seconds = self.precision_seconds();
        let result = self.discipline.update(
            &self.clock,
            offset.to_seconds(),
            peer_time,
            self.time,
            precision_seconds,
        )?;

        let (p_leap, p_stratum, p_refid, p_reftime, p_rootdelay, p_rootdisp, p_statistics) = update;

        match result {
            // The offset is too large and probably bogus. Complain to the
            // system log and order the operator to set the clock manually
            // within panic range. The configuration can waive this check
            // and keep the process alive.
            ClockUpdateResult::Panic => {
                if self.config.ignore_panic {
                    warn!(
                        offset = offset.to_seconds(),
                        "offset exceeds the panic threshold; check waived by configuration"
                    );
                } else {
                    error!(
                        offset = offset.to_seconds(),
                        "offset exceeds the panic threshold: set the clock manually, then restart"
                    );
                    std::process::exit(exitcode::SOFTWARE);
                }
            }

            // The clock was stepped. All associations now have inconsistent
            // time values, so they are reset and started fresh.
            ClockUpdateResult::Step => {
                for handle in self.handles() {
                    self.clear_peer(handle, ClearReason::Step);
                }
                self.system.peer = None;
                self.system.stratum = MAX_STRATUM;
            }

            // The offset was less than the step threshold, which is the
            // normal case. Update the system variables from the peer
            // variables. The lower clamp on the dispersion increase avoids
            // timing loops and clockhopping when highly precise sources
            // are in play.
            ClockUpdateResult::Slew => {
                self.system.leap = p_leap;
                self.system.stratum = p_stratum + 1;
                self.system.refid = p_refid;
                self.system.reftime = p_reftime;
                self.system.rootdelay = p_rootdelay;

                let jitter_term = NtpDuration::from_seconds(
                    (p_statistics.jitter.powi(2) + self.system.jitter.powi(2)).sqrt(),
                );
                let dispersion_term = (p_statistics.dispersion
                    + multiply_by_phi(self.time - peer_time)
                    + p_statistics.offset.abs())
                .max(NtpDuration::MIN_DISPERSION);
                self.system.rootdisp = p_rootdisp + dispersion_term + jitter_term;
            }

            // Some samples are discarded while, for instance, a direct
            // frequency measurement is being made.
            ClockUpdateResult::Ignore => {}
        }

        Ok(())
    }

    /// One tick of the one-hertz timer: advance process time, age the root
    /// dispersion, amortize the residual clock offset and poll whichever
    /// associations are due.
    pub fn clock_adjust(&mut self) -> Result<Vec<OutgoingPacket>, C::Error> {
        // In contrast to NTPv3, NTPv4 does not declare unsynchronized
        // after one day, since the dispersion threshold serves this
        // function. When the dispersion exceeds the distance threshold the
        // server is considered unfit for synchronization.
        self.time.tick();
        self.system.rootdisp += multiply_by_phi(NtpDuration::ONE);

        self.discipline.adjust(&self.clock)?;

        let mut transmits = vec![];
        for handle in self.handles() {
            let due = match self.peer(handle) {
                Some(peer) => self.time >= peer.nextdate,
                None => false,
            };
            if due {
                if let Some(packet) = self.poll_peer(handle)? {
                    transmits.push(packet);
                }
            }
        }

        Ok(transmits)
    }

    /// Determine whether and how to send a poll for an association whose
    /// next-poll time has arrived.
    pub(crate) fn poll_peer(&mut self, handle: PeerHandle) -> Result<Option<OutgoingPacket>, C::Error> {
        let now = self.time;
        let system_leap = self.system.leap;
        let system_poll = self.discipline.poll_interval();
        let system_refid = self.system.refid;
        let survivor_count = self.system.survivor_count;
        let has_system_peer = self.system.peer.is_some();
        let precision_seconds = self.precision_seconds();

        let peer = match self.peer_mut(handle) {
            Some(peer) => peer,
            None => return Ok(None),
        };

        let mut hpoll = peer.hpoll;

        // If broadcasting, just do it, but only if we are synchronized.
        if peer.hmode == HostMode::Broadcast {
            peer.outdate = now;
            let out = if has_system_peer {
                self.peer_xmit(handle)?
            } else {
                None
            };
            if let Some(peer) = self.peer_mut(handle) {
                peer.poll_update(now, hpoll);
            }
            return Ok(out);
        }

        // If manycasting, start with ttl = 1. The ttl is increased by one
        // for each poll until enough servers have been found or the ttl
        // reaches its maximum. Every BEACON polls the search starts over.
        if peer.hmode == HostMode::Client && peer.flags.manycast {
            peer.outdate = now;
            let mut transmit = false;
            if peer.unreach > BEACON {
                peer.unreach = 0;
                peer.ttl = 1;
                transmit = true;
            } else if survivor_count < MIN_CLOCK {
                if peer.ttl < TTL_MAX {
                    peer.ttl += 1;
                }
                transmit = true;
            }
            peer.unreach += 1;

            let out = if transmit { self.peer_xmit(handle)? } else { None };
            if let Some(peer) = self.peer_mut(handle) {
                peer.poll_update(now, hpoll);
            }
            return Ok(out);
        }

        if peer.burst == 0 {
            // We are not in a burst. Shift the reachability register to
            // the left. Hopefully, some time before the next poll a packet
            // will arrive and set the rightmost bit.
            peer.outdate = now;
            peer.reach.poll();

            // Three consecutive misses: feed the filter a dead sample so
            // the stale statistics age out.
            if peer.reach.missed_three() {
                let decision = peer.clock_filter(
                    FilterTuple::dead(now),
                    system_leap,
                    precision_seconds,
                    system_poll,
                );
                if decision == Decision::Process {
                    self.clock_select()?;
                }
            }

            // An ephemeral association that has been dark past the unreach
            // threshold is torn down rather than polled forever.
            let stale = match self.peer(handle) {
                Some(peer) => {
                    !peer.reach.is_reachable() && peer.flags.ephemeral && peer.unreach >= UNREACH
                }
                None => return Ok(None),
            };
            if stale {
                self.clear_peer(handle, ClearReason::Stale);
                return Ok(None);
            }

            let peer = match self.peer_mut(handle) {
                Some(peer) => peer,
                None => return Ok(None),
            };

            if !peer.reach.is_reachable() {
                // The server is unreachable, so bump the unreach counter.
                // If the unreach threshold has been reached, double the
                // poll interval to minimize wasted network traffic. Send
                // a burst only if enabled and the unreach threshold has
                // not been reached.
                if peer.flags.iburst && peer.unreach == 0 {
                    peer.burst = BURST_COUNT;
                } else if peer.unreach < UNREACH {
                    peer.unreach += 1;
                } else {
                    hpoll = PollInterval::from_log2(hpoll.as_log2() + 1);
                }
                peer.unreach += 1;
            } else {
                // The server is reachable. Set the poll interval to the
                // system poll interval. Send a burst only if enabled and
                // the peer is fit.
                peer.unreach = 0;
                hpoll = system_poll;
                let fit = peer
                    .accept_synchronization(now, system_poll, system_refid)
                    .is_ok();
                if peer.flags.burst && fit {
                    peer.burst = BURST_COUNT;
                }
            }
        } else {
            // If in a burst, count it down. When the reply comes back the
            // clock filter will run the selection to process the results
            // of the burst.
            peer.burst -= 1;
        }

        // Do not transmit if in broadcast client mode.
        let out = match self.peer(handle).map(|p| p.hmode) {
            Some(HostMode::BroadcastClient) => None,
            Some(_) => self.peer_xmit(handle)?,
            None => return Ok(None),
        };

        if let Some(peer) = self.peer_mut(handle) {
            peer.poll_update(now, hpoll);
        }

        Ok(out)
    }

    /// Fill a packet from the association and system state and account for
    /// its transmit timestamp. A missing or untrusted key resets the
    /// association instead of sending.
    pub(crate) fn peer_xmit(&mut self, handle: PeerHandle) -> Result<Option<OutgoingPacket>, C::Error> {
        let transmit_timestamp = self.clock.now()?;

        let system = &self.system;
        let (header, destination, keyid) = match self.peer(handle) {
            Some(peer) => {
                let mut header = NtpHeader::new();
                header.version = peer.version;
                header.mode = peer.hmode.to_wire_mode();
                header.leap = system.leap;
                header.stratum = if system.stratum == MAX_STRATUM {
                    0
                } else {
                    system.stratum
                };
                header.poll = peer.hpoll.as_log2();
                header.precision = system.precision;
                header.root_delay = system.rootdelay;
                header.root_dispersion = system.rootdisp;
                header.reference_id = system.refid;
                header.reference_timestamp = system.reftime;
                header.origin_timestamp = peer.org;
                header.receive_timestamp = peer.rec;
                header.transmit_timestamp = transmit_timestamp;

                (header, peer.source_address, peer.keyid)
            }
            None => return Ok(None),
        };

        let mut packet = NtpPacket::header_only(header);

        // If the key ID is nonzero, send a valid MAC using the key ID of
        // the association and the key in the local key cache. If something
        // breaks, like a missing trusted key, don't send the packet; just
        // reset the association and stop until the problem is fixed.
        if keyid != 0 {
            match self.keys.digest(keyid, &packet.digest_input()) {
                Some(digest) => packet.mac = Some(NtpMac::Digest { keyid, digest }),
                None => {
                    warn!(keyid, "transmit key missing or untrusted");
                    self.clear_peer(handle, ClearReason::UntrustedKey);
                    return Ok(None);
                }
            }
        }

        if let Some(peer) = self.peer_mut(handle) {
            peer.xmt = transmit_timestamp;
        }

        Ok(Some(OutgoingPacket {
            destination,
            packet,
        }))
    }

    /// Transmit a stateless reply for a received packet. Note that the
    /// transmit version is copied from the receive version. This is for
    /// backward compatibility.
    pub(crate) fn fast_xmit(
        &self,
        recv: &ReceivedPacket,
        received: &NtpPacket,
        mode: NtpAssociationMode,
        auth: AuthResult,
    ) -> Result<OutgoingPacket, C::Error> {
        let mut header = NtpHeader::new();
        header.version = received.header.version();
        header.mode = mode;
        header.leap = self.system.leap;
        header.stratum = if self.system.stratum == MAX_STRATUM {
            0
        } else {
            self.system.stratum
        };
        header.poll = received.header.poll;
        header.precision = self.system.precision;
        header.root_delay = self.system.rootdelay;
        header.root_dispersion = self.system.rootdisp;
        header.reference_id = self.system.refid;
        header.reference_timestamp = self.system.reftime;
        header.origin_timestamp = received.header.transmit_timestamp;
        header.receive_timestamp = recv.destination_timestamp;
        header.transmit_timestamp = self.clock.now()?;

        let mut packet = NtpPacket::header_only(header);

        // If the authentication code is NONE, include only the header; if
        // CRYPTO, send a crypto-NAK; if OK, send a valid MAC with the key
        // ID of the received packet.
        packet.mac = match auth {
            AuthResult::None | AuthResult::Error => None,
            AuthResult::CryptoNak => Some(NtpMac::CryptoNak { keyid: 0 }),
            AuthResult::Ok => {
                let keyid = match received.mac {
                    Some(NtpMac::Digest { keyid, .. }) => keyid,
                    _ => 0,
                };
                self.keys
                    .digest(keyid, &packet.digest_input())
                    .map(|digest| NtpMac::Digest { keyid, digest })
            }
        };

        Ok(OutgoingPacket {
            destination: recv.source_address,
            packet,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Debug, Default)]
    struct TestClock {
        steps: RefCell<Vec<f64>>,
        adjusts: RefCell<Vec<f64>>,
    }

    impl NtpClock for TestClock {
        type Error = std::io::Error;

        fn now(&self) -> Result<NtpTimestamp, Self::Error> {
            Ok(NtpTimestamp::from_fixed_int(10_000 << 32))
        }

        fn step_clock(&self, offset: NtpDuration) -> Result<(), Self::Error> {
            self.steps.borrow_mut().push(offset.to_seconds());
            Ok(())
        }

        fn adjust_clock(&self, rate: f64) -> Result<(), Self::Error> {
            self.adjusts.borrow_mut().push(rate);
            Ok(())
        }
    }

    const PRECISION: i8 = -18;

    fn test_core() -> NtpCore<TestClock> {
        NtpCore::new(
            TestClock::default(),
            SystemConfig::default(),
            KeyStore::new(),
            PRECISION,
        )
    }

    fn addr(n: u8) -> SocketAddr {
        format!("10.0.0.{}:123", n).parse().unwrap()
    }

    fn client_peer(core: &mut NtpCore<TestClock>, n: u8) -> PeerHandle {
        core.mobilize(
            addr(n),
            "192.168.1.1:123".parse().unwrap(),
            4,
            HostMode::Client,
            0,
            PeerFlags::default(),
        )
        .unwrap()
    }

    #[test]
    fn mobilize_and_find() {
        let mut core = test_core();
        let handle = client_peer(&mut core, 1);

        assert_eq!(core.find_assoc(addr(1)), Some(handle));
        assert_eq!(core.find_assoc(addr(2)), None);
    }

    #[test]
    fn table_is_bounded() {
        let mut core = test_core();
        for n in 0..50 {
            assert!(core
                .mobilize(
                    format!("10.0.{}.{}:123", n / 8, n % 8).parse().unwrap(),
                    "192.168.1.1:123".parse().unwrap(),
                    4,
                    HostMode::Client,
                    0,
                    PeerFlags::default(),
                )
                .is_some());
        }
        assert!(core
            .mobilize(
                "10.9.9.9:123".parse().unwrap(),
                "192.168.1.1:123".parse().unwrap(),
                4,
                HostMode::Client,
                0,
                PeerFlags::default(),
            )
            .is_none());
    }

    #[test]
    fn stale_handles_do_not_resolve() {
        let mut core = test_core();
        let handle = client_peer(&mut core, 1);
        core.peer_mut(handle).unwrap().flags.ephemeral = true;

        core.clear_peer(handle, ClearReason::CryptoNak);
        assert!(core.peer(handle).is_none());

        // the slot may be reused, but the old handle stays dead
        let newer = client_peer(&mut core, 2);
        assert_eq!(newer.index, handle.index);
        assert!(core.peer(handle).is_none());
        assert!(core.peer(newer).is_some());
    }

    #[test]
    fn clear_resets_persistent_association() {
        let mut core = test_core();
        let handle = client_peer(&mut core, 1);
        core.peer_mut(handle).unwrap().stratum = 3;

        core.clear_peer(handle, ClearReason::AuthError);

        // a persistent association survives, reinitialized
        let peer = core.peer(handle).unwrap();
        assert_eq!(peer.stratum, MAX_STRATUM);
    }

    #[test]
    fn reach_shift_and_dead_sample_after_three_misses() {
        let mut core = test_core();
        let handle = client_peer(&mut core, 1);

        {
            let peer = core.peer_mut(handle).unwrap();
            peer.reach = {
                let mut reach = crate::peer::Reach::default();
                reach.received_packet();
                for _ in 0..5 {
                    reach.poll();
                    reach.received_packet();
                }
                reach
            };
            // give the filter a live sample so we can observe the dead one
            peer.statistics.dispersion = NtpDuration::ZERO;
        }
        let bits_before = core.peer(handle).unwrap().reach.as_bits();
        assert_eq!(bits_before, 0b0011_1111);

        core.time = NtpInstant::from_seconds(64);
        core.poll_peer(handle).unwrap();
        assert_eq!(core.peer(handle).unwrap().reach.as_bits(), 0b0111_1110);

        core.time = NtpInstant::from_seconds(128);
        core.poll_peer(handle).unwrap();
        assert_eq!(core.peer(handle).unwrap().reach.as_bits(), 0b1111_1100);

        // after the third consecutive miss the filter is fed a dead sample
        core.time = NtpInstant::from_seconds(192);
        core.poll_peer(handle).unwrap();
        let peer = core.peer(handle).unwrap();
        assert_eq!(peer.reach.as_bits(), 0b1111_1000);
        assert!(peer.statistics.dispersion > NtpDuration::from_seconds(1.0));
    }

    #[test]
    fn iburst_fires_on_first_unreachable_poll() {
        let mut core = test_core();
        let handle = client_peer(&mut core, 1);
        core.peer_mut(handle).unwrap().flags.iburst = true;

        core.time = NtpInstant::from_seconds(64);
        let out = core.poll_peer(handle).unwrap();

        assert!(out.is_some());
        let peer = core.peer(handle).unwrap();
        assert_eq!(peer.burst, BURST_COUNT);
        assert_eq!(peer.unreach, 1);
    }

    #[test]
    fn unreachable_backoff_doubles_poll_interval() {
        let mut core = test_core();
        let handle = client_peer(&mut core, 1);
        core.peer_mut(handle).unwrap().unreach = UNREACH;

        core.time = NtpInstant::from_seconds(64);
        core.poll_peer(handle).unwrap();

        let peer = core.peer(handle).unwrap();
        assert_eq!(peer.hpoll, PollInterval::from_log2(7));
    }

    #[test]
    fn burst_counts_down() {
        let mut core = test_core();
        let handle = client_peer(&mut core, 1);
        core.peer_mut(handle).unwrap().burst = 3;

        core.time = NtpInstant::from_seconds(64);
        let out = core.poll_peer(handle).unwrap();

        assert!(out.is_some());
        assert_eq!(core.peer(handle).unwrap().burst, 2);
    }

    #[test]
    fn ephemeral_peer_times_out() {
        let mut core = test_core();
        let handle = client_peer(&mut core, 1);
        {
            let peer = core.peer_mut(handle).unwrap();
            peer.flags.ephemeral = true;
            peer.unreach = UNREACH;
        }

        core.time = NtpInstant::from_seconds(64);
        let out = core.poll_peer(handle).unwrap();

        assert!(out.is_none());
        assert!(core.peer(handle).is_none());
    }

    #[test]
    fn manycast_expands_ttl_until_enough_survivors() {
        let mut core = test_core();
        let handle = core
            .mobilize(
                "224.0.1.1:123".parse().unwrap(),
                "192.168.1.1:123".parse().unwrap(),
                4,
                HostMode::Client,
                0,
                PeerFlags {
                    manycast: true,
                    ..Default::default()
                },
            )
            .unwrap();

        core.time = NtpInstant::from_seconds(64);
        let out = core.poll_peer(handle).unwrap();
        assert!(out.is_some());
        assert_eq!(core.peer(handle).unwrap().ttl, 1);

        core.time = NtpInstant::from_seconds(128);
        core.poll_peer(handle).unwrap();
        assert_eq!(core.peer(handle).unwrap().ttl, 2);

        // once enough survivors chime, the beacon goes quiet
        core.system.survivor_count = MIN_CLOCK;
        core.time = NtpInstant::from_seconds(192);
        let out = core.poll_peer(handle).unwrap();
        assert!(out.is_none());

        // after a beacon interval of silence the search starts over
        core.peer_mut(handle).unwrap().unreach = BEACON + 1;
        core.time = NtpInstant::from_seconds(256);
        let out = core.poll_peer(handle).unwrap();
        assert!(out.is_some());
        assert_eq!(core.peer(handle).unwrap().ttl, 1);
    }

    #[test]
    fn broadcast_server_transmits_only_when_synchronized() {
        let mut core = test_core();
        let handle = core
            .mobilize(
                "10.0.0.255:123".parse().unwrap(),
                "192.168.1.1:123".parse().unwrap(),
                4,
                HostMode::Broadcast,
                0,
                PeerFlags::default(),
            )
            .unwrap();

        core.time = NtpInstant::from_seconds(64);
        let out = core.poll_peer(handle).unwrap();
        assert!(out.is_none());

        // synchronize: a system peer now exists
        let source = client_peer(&mut core, 1);
        core.system.peer = Some(source);
        core.time = NtpInstant::from_seconds(128);
        let out = core.poll_peer(handle).unwrap().unwrap();
        assert_eq!(out.packet.header.mode, NtpAssociationMode::Broadcast);
    }

    #[test]
    fn peer_xmit_fills_header_and_remembers_xmt() {
        let mut core = test_core();
        let handle = client_peer(&mut core, 1);
        core.system.stratum = 3;

        let out = core.peer_xmit(handle).unwrap().unwrap();

        assert_eq!(out.destination, addr(1));
        assert_eq!(out.packet.header.mode, NtpAssociationMode::Client);
        assert_eq!(out.packet.header.stratum, 3);
        assert!(out.packet.mac.is_none());
        assert_eq!(
            core.peer(handle).unwrap().xmt,
            out.packet.header.transmit_timestamp
        );
    }

    #[test]
    fn peer_xmit_wire_stratum_for_unsynchronized_host() {
        let mut core = test_core();
        let handle = client_peer(&mut core, 1);
        assert_eq!(core.system.stratum, MAX_STRATUM);

        let out = core.peer_xmit(handle).unwrap().unwrap();
        // MAXSTRAT reads as 0 (unspecified) on the wire
        assert_eq!(out.packet.header.stratum, 0);
    }

    #[test]
    fn peer_xmit_appends_mac_for_keyed_association() {
        let mut core = test_core();
        core.keys.insert(7, b"secret".to_vec(), true);
        let handle = core
            .mobilize(
                addr(1),
                "192.168.1.1:123".parse().unwrap(),
                4,
                HostMode::Client,
                7,
                PeerFlags::default(),
            )
            .unwrap();

        let out = core.peer_xmit(handle).unwrap().unwrap();
        assert!(matches!(
            out.packet.mac,
            Some(NtpMac::Digest { keyid: 7, .. })
        ));
    }

    #[test]
    fn peer_xmit_missing_key_resets_association() {
        let mut core = test_core();
        let handle = core
            .mobilize(
                addr(1),
                "192.168.1.1:123".parse().unwrap(),
                4,
                HostMode::Client,
                99,
                PeerFlags::default(),
            )
            .unwrap();

        let out = core.peer_xmit(handle).unwrap();
        assert!(out.is_none());

        let peer = core.peer(handle).unwrap();
        assert_eq!(
            peer.refid,
            ReferenceId::from_int(ClearReason::UntrustedKey as u32)
        );
    }

    #[test]
    fn selection_nominates_system_peer_and_slews() {
        let mut core = NtpCore::with_frequency(
            TestClock::default(),
            SystemConfig::default(),
            KeyStore::new(),
            PRECISION,
            0.0,
        );
        core.time = NtpInstant::from_seconds(128);

        let mut handles = vec![];
        for (n, offset) in [0.001, 0.002, 0.0015].iter().enumerate() {
            let handle = client_peer(&mut core, n as u8 + 1);
            let peer = core.peer_mut(handle).unwrap();
            peer.leap = NtpLeapIndicator::NoWarning;
            peer.stratum = 2;
            peer.refid = ReferenceId::from_int(0x01020304 + n as u32);
            peer.our_id = ReferenceId::from_int(0xAABBCC00 + n as u32);
            peer.reach.received_packet();
            peer.statistics = crate::peer::PeerStatistics {
                offset: NtpDuration::from_seconds(*offset),
                delay: NtpDuration::from_seconds(0.01),
                dispersion: NtpDuration::ZERO,
                jitter: 1e-6,
            };
            peer.time = NtpInstant::from_seconds(64);
            handles.push(handle);
        }

        core.clock_select().unwrap();

        assert!(core.system.peer.is_some());
        assert_eq!(core.system.survivor_count, 3);
        // FSET discipline slews on the first in-range sample and the system
        // variables follow the chosen peer
        assert_eq!(core.system.stratum, 3);
        assert_eq!(core.system.leap, NtpLeapIndicator::NoWarning);
        assert!((core.system.offset.to_seconds() - 0.0015).abs() < 0.001);
    }

    #[test]
    fn selection_failure_keeps_previous_system_peer() {
        let mut core = test_core();
        let good = client_peer(&mut core, 1);
        core.system.peer = Some(good);
        core.system.survivor_count = 1;

        // no fit candidates at all: nothing to select from
        core.clock_select().unwrap();

        assert_eq!(core.system.peer, Some(good));
    }

    #[test]
    fn step_resets_all_associations() {
        let mut core = NtpCore::with_frequency(
            TestClock::default(),
            SystemConfig::default(),
            KeyStore::new(),
            PRECISION,
            0.0,
        );
        core.time = NtpInstant::from_seconds(2000);

        // ephemeral bystander that must be torn down by the step
        let ephemeral = core
            .mobilize(
                addr(9),
                "192.168.1.1:123".parse().unwrap(),
                4,
                HostMode::SymmetricPassive,
                0,
                PeerFlags {
                    ephemeral: true,
                    ..Default::default()
                },
            )
            .unwrap();

        let source = client_peer(&mut core, 1);
        {
            let peer = core.peer_mut(source).unwrap();
            peer.leap = NtpLeapIndicator::NoWarning;
            peer.stratum = 2;
            peer.refid = ReferenceId::from_int(0x01020304);
            peer.our_id = ReferenceId::from_int(0xAABBCCDD);
            peer.reach.received_packet();
            peer.statistics = crate::peer::PeerStatistics {
                offset: NtpDuration::from_seconds(0.5),
                delay: NtpDuration::from_seconds(0.01),
                dispersion: NtpDuration::ZERO,
                jitter: 1e-6,
            };
            peer.time = NtpInstant::from_seconds(1000);
        }

        // FSET + large offset: the discipline steps immediately
        core.clock_select().unwrap();

        assert_eq!(core.clock.steps.borrow().as_slice(), &[0.5]);
        assert_eq!(core.system.stratum, MAX_STRATUM);
        assert_eq!(core.system.peer, None);
        // the persistent association was reset, the ephemeral one destroyed
        assert_eq!(
            core.peer(source).unwrap().refid,
            ReferenceId::from_int(ClearReason::Step as u32)
        );
        assert!(core.peer(ephemeral).is_none());
    }

    #[test]
    fn clock_adjust_ages_rootdisp_and_slews() {
        let mut core = test_core();
        let before = core.system.rootdisp;

        core.clock_adjust().unwrap();

        assert_eq!(core.time, NtpInstant::from_seconds(1));
        assert!(core.system.rootdisp > before);
        assert_eq!(core.clock.adjusts.borrow().len(), 1);
        assert!(core.clock.steps.borrow().is_empty());
    }

    #[test]
    fn clock_adjust_polls_due_peers() {
        let mut core = test_core();
        let handle = client_peer(&mut core, 1);
        core.peer_mut(handle).unwrap().nextdate = NtpInstant::from_seconds(1);

        let transmits = core.clock_adjust().unwrap();

        assert_eq!(transmits.len(), 1);
        // and the next poll was scheduled in the future
        assert!(core.peer(handle).unwrap().nextdate > core.time);
    }

    #[test]
    fn hourly_frequency_write_mark() {
        let mut core = test_core();
        assert!(!core.should_write_frequency());
        core.time = NtpInstant::from_seconds(3599);
        assert!(core.should_write_frequency());
    }
}
