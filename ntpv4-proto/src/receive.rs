// The receive pipeline: classify a captured packet (format,
// authentication, mode-cross-mode dispatch) and either reply immediately,
// mobilize a new association, tear one down, or hand the packet to its
// association for processing.

use std::net::SocketAddr;

use tracing::debug;

use crate::auth::AuthResult;
use crate::clock::NtpClock;
use crate::packet::{NtpAssociationMode, NtpMac, NtpPacket, VERSION};
use crate::peer::{ClearReason, HostMode, PeerFlags};
use crate::system::{NtpCore, OutgoingPacket};
use crate::time_types::NtpTimestamp;

/// A datagram as obtained from the network collaborator. The destination
/// timestamp is captured on arrival; it is not part of the packet itself.
#[derive(Debug)]
pub struct ReceivedPacket<'a> {
    pub data: &'a [u8],
    pub source_address: SocketAddr,
    pub destination_address: SocketAddr,
    /// the packet was addressed to a multicast group rather than to us
    pub multicast: bool,
    pub destination_timestamp: NtpTimestamp,
}

/// What to do with a packet, given the host mode of the matching
/// association (none, if there is no match) and the mode of the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchAction {
    /// invalid mode combination; demobilize the (ephemeral) association
    Err,
    /// drop silently
    Discard,
    /// hand to the association for timestamp checks and processing
    Proc,
    /// client packet and no association: reply without saving state
    FastXmit,
    /// reply from a manycast server: mobilize an ephemeral client
    Many,
    /// mobilize an ephemeral symmetric-passive association
    NewPassive,
    /// mobilize an ephemeral broadcast-client association
    NewBroadcast,
}

/// The mode dispatch matrix. Rows are the host mode of the matched
/// association, columns the packet mode.
fn dispatch(hmode: Option<HostMode>, pmode: NtpAssociationMode) -> DispatchAction {
    use DispatchAction::*;
    use HostMode::*;
    use NtpAssociationMode as Pkt;

    match (hmode, pmode) {
        (None, Pkt::SymmetricActive) => NewPassive,
        (None, Pkt::Client) => FastXmit,
        (None, Pkt::Server) => Many,
        (None, Pkt::Broadcast) => NewBroadcast,

        (Some(SymmetricActive), Pkt::SymmetricActive) => Proc,
        (Some(SymmetricActive), Pkt::SymmetricPassive) => Proc,
        (Some(SymmetricPassive), Pkt::SymmetricActive) => Proc,
        (Some(SymmetricPassive), Pkt::SymmetricPassive) => Err,
        (Some(Client), Pkt::Server) => Proc,
        (Some(BroadcastClient), Pkt::Broadcast) => Proc,

        _ => Discard,
    }
}

fn packet_keyid(packet: &NtpPacket) -> u32 {
    match packet.mac {
        Some(NtpMac::Digest { keyid, .. }) => keyid,
        Some(NtpMac::CryptoNak { keyid }) => keyid,
        None => 0,
    }
}

impl<C: NtpClock> NtpCore<C> {
    /// Receive a packet and decode modes. Access control has already been
    /// applied by the transport layer; format, version and authentication
    /// checks happen here, followed by the dispatch matrix and the
    /// timestamp rigor for packets handed to an association.
    pub fn handle_receive(
        &mut self,
        recv: &ReceivedPacket,
    ) -> Result<Option<OutgoingPacket>, C::Error> {
        // The version must not be in the future. Format checks include
        // packet length and MAC length.
        let packet = match NtpPacket::deserialize(recv.data) {
            Ok(packet) => packet,
            Err(error) => {
                debug!(?error, source = ?recv.source_address, "dropping malformed packet");
                return Ok(None);
            }
        };
        if packet.header.version() > VERSION {
            return Ok(None);
        }

        // Authentication has four outcomes: no MAC, a verified MAC, a MAC
        // that fails verification, and a crypto-NAK.
        let auth = self.keys.classify(&packet);

        let found = self.find_assoc(recv.source_address);
        let hmode = found.and_then(|h| self.peer(h)).map(|p| p.hmode);

        let handle = match dispatch(hmode, packet.header.mode) {
            // Client packet and no association. Send a server reply
            // without saving state.
            DispatchAction::FastXmit => {
                if !recv.multicast {
                    // If unicast destination address, send a server packet.
                    // If authentication fails, send a crypto-NAK packet.
                    if auth.acceptable(self.config.no_trust) {
                        let reply =
                            self.fast_xmit(recv, &packet, NtpAssociationMode::Server, auth)?;
                        return Ok(Some(reply));
                    } else if auth == AuthResult::Error {
                        let reply = self.fast_xmit(
                            recv,
                            &packet,
                            NtpAssociationMode::Server,
                            AuthResult::CryptoNak,
                        )?;
                        return Ok(Some(reply));
                    }
                    return Ok(None);
                }

                // This must be manycast. Do not respond if we are not
                // synchronized or if our stratum is above the manycaster.
                if !self.system.leap.is_synchronized()
                    || self.system.stratum > packet.header.stratum
                {
                    return Ok(None);
                }

                // Respond only if authentication is OK. Note that the
                // unicast source address is used, not the multicast group.
                if auth.acceptable(self.config.no_trust) {
                    let reply = self.fast_xmit(recv, &packet, NtpAssociationMode::Server, auth)?;
                    return Ok(Some(reply));
                }
                return Ok(None);
            }

            // Reply from a manycast server: mobilize a new ephemeral
            // client association in the same version as the packet. If
            // authentication fails, ignore the packet.
            DispatchAction::Many => {
                if !auth.acceptable(self.config.no_trust || self.config.no_peer) {
                    return Ok(None);
                }
                if self.ephemeral_client_count() >= crate::system::MAX_CLOCK {
                    return Ok(None);
                }
                match self.mobilize(
                    recv.source_address,
                    recv.destination_address,
                    packet.header.version(),
                    HostMode::Client,
                    packet_keyid(&packet),
                    PeerFlags {
                        ephemeral: true,
                        ..Default::default()
                    },
                ) {
                    Some(handle) => handle,
                    None => return Ok(None),
                }
            }

            // New symmetric passive association, mobilized in the same
            // version as in the packet. If authentication fails, send a
            // crypto-NAK packet. If restricted from mobilizing, send a
            // symmetric active packet instead.
            DispatchAction::NewPassive => {
                if !auth.acceptable(self.config.no_trust) {
                    if auth == AuthResult::Error {
                        let reply = self.fast_xmit(
                            recv,
                            &packet,
                            NtpAssociationMode::SymmetricActive,
                            AuthResult::CryptoNak,
                        )?;
                        return Ok(Some(reply));
                    }
                    return Ok(None);
                }
                if !auth.acceptable(self.config.no_peer) {
                    let reply =
                        self.fast_xmit(recv, &packet, NtpAssociationMode::SymmetricActive, auth)?;
                    return Ok(Some(reply));
                }
                match self.mobilize(
                    recv.source_address,
                    recv.destination_address,
                    packet.header.version(),
                    HostMode::SymmetricPassive,
                    packet_keyid(&packet),
                    PeerFlags {
                        ephemeral: true,
                        ..Default::default()
                    },
                ) {
                    Some(handle) => handle,
                    None => return Ok(None),
                }
            }

            // New broadcast client association. If authentication fails or
            // the broadcast client is not enabled, ignore the packet.
            DispatchAction::NewBroadcast => {
                if !auth.acceptable(self.config.no_trust || self.config.no_peer) {
                    return Ok(None);
                }
                if !self.config.broadcast_client {
                    return Ok(None);
                }
                match self.mobilize(
                    recv.source_address,
                    recv.destination_address,
                    packet.header.version(),
                    HostMode::BroadcastClient,
                    packet_keyid(&packet),
                    PeerFlags {
                        ephemeral: true,
                        ..Default::default()
                    },
                ) {
                    Some(handle) => handle,
                    None => return Ok(None),
                }
            }

            // Invalid mode combination. We get here only in case of
            // ephemeral associations, so the correct action is simply to
            // toss it.
            DispatchAction::Err => {
                if let Some(handle) = found {
                    self.clear_peer(handle, ClearReason::AuthError);
                }
                return Ok(None);
            }

            DispatchAction::Discard => return Ok(None),

            DispatchAction::Proc => match found {
                Some(handle) => handle,
                None => return Ok(None),
            },
        };

        // Next comes a rigorous schedule of timestamp checking.
        let header = &packet.header;
        let (required, synch) = {
            let peer = match self.peer_mut(handle) {
                Some(peer) => peer,
                None => return Ok(None),
            };

            // If the transmit timestamp is zero, the server is horribly
            // broken; if it duplicates a previous one, the packet is a
            // replay. Neither may touch any state.
            if header.transmit_timestamp == NtpTimestamp::ZERO {
                return Ok(None);
            }
            if header.transmit_timestamp == peer.xmt {
                return Ok(None);
            }

            // If this is a broadcast mode packet, skip further checking.
            // If the origin timestamp is zero, the sender has not yet
            // heard from us. Otherwise, if the origin timestamp does not
            // match our last transmit timestamp, the packet is bogus.
            let synch = header.mode == NtpAssociationMode::Broadcast
                || (header.origin_timestamp != NtpTimestamp::ZERO
                    && header.origin_timestamp == peer.xmt);

            // Update the origin and destination timestamps regardless, so
            // that a legitimate retry can succeed.
            peer.org = header.transmit_timestamp;
            peer.rec = recv.destination_timestamp;

            let required = peer.keyid != 0 || peer.flags.no_trust;
            (required, synch)
        };

        if !synch {
            return Ok(None); // unsynch
        }

        // The timestamps are valid and the packet matches the last one we
        // sent. If the packet is a crypto-NAK, the server might have just
        // changed keys. We demobilize the association and wait for better
        // times.
        if auth == AuthResult::CryptoNak {
            self.clear_peer(handle, ClearReason::CryptoNak);
            return Ok(None);
        }

        // If the association is authenticated, the key ID is nonzero and
        // received packets must be authenticated. This is designed to
        // avoid a bait-and-switch attack, which was possible in past
        // versions.
        if !auth.acceptable(required) {
            return Ok(None);
        }

        // Everything possible has been done to validate the timestamps and
        // prevent bad guys from disrupting the protocol or injecting bogus
        // data. Earn some revenue.
        self.process_packet(handle, header, recv.destination_timestamp)?;
        Ok(None)
    }
}
