// Server selection: the intersection algorithm culls falsetickers from the
// fit associations, the clustering algorithm trims the survivors by
// selection jitter, and the combine algorithm produces the weighted system
// offset steering the discipline.

use tracing::debug;

use crate::config::SystemConfig;
use crate::peer::{Peer, MAX_DISTANCE};
use crate::system::PeerHandle;
use crate::time_types::{NtpDuration, NtpInstant};

#[derive(Debug, Clone, Copy)]
#[repr(i8)]
enum EndpointType {
    Upper = 1,
    Middle = 0,
    Lower = -1,
}

struct CandidateTuple<'a> {
    peer: &'a Peer,
    endpoint_type: EndpointType,
    /// Correctness interval edge
    edge: NtpDuration,
}

/// First, construct the chime list of tuples (p, type, edge) as
/// shown below, then sort the list by edge from lowest to
/// highest.
fn construct_candidate_list<'a>(
    valid_associations: impl IntoIterator<Item = &'a Peer>,
    local_clock_time: NtpInstant,
) -> Vec<CandidateTuple<'a>> {
    let mut candidate_list = Vec::new();

    for peer in valid_associations {
        let offset = peer.statistics.offset;

        let tuples = [
            CandidateTuple {
                peer,
                endpoint_type: EndpointType::Upper,
                edge: offset + peer.root_distance(local_clock_time),
            },
            CandidateTuple {
                peer,
                endpoint_type: EndpointType::Middle,
                edge: offset,
            },
            CandidateTuple {
                peer,
                endpoint_type: EndpointType::Lower,
                edge: offset - peer.root_distance(local_clock_time),
            },
        ];

        candidate_list.extend(tuples)
    }

    candidate_list.sort_by(|a, b| a.edge.cmp(&b.edge));

    candidate_list
}

/// Find the largest contiguous intersection of correctness intervals: an
/// intersection covering more than half the server population. Allow is
/// the number of allowed falsetickers; found is the number of midpoints
/// left outside the candidate interval. Note that the edge values are
/// limited to the range +-(2 ^ 30) < +-2e9 by the timestamp calculations.
fn find_interval(chime_list: &[CandidateTuple]) -> Option<(NtpDuration, NtpDuration)> {
    let n = chime_list.len() / 3;

    for allow in (0..).take_while(|allow| 2 * allow < n) {
        // truechimers with no midpoint inside the current interval
        let mut found = 0;

        // the number of intervals entered but not yet exited
        let mut chime = 0;

        // Scan the chime list from lowest to highest to find the lower endpoint.
        let mut low = None;
        for tuple in chime_list {
            chime -= tuple.endpoint_type as i32;
            if chime >= (n - allow) as i32 {
                low = Some(tuple.edge);
                break;
            }

            if let EndpointType::Middle = tuple.endpoint_type {
                found += 1;
            }
        }

        // Scan the chime list from highest to lowest to find the upper endpoint.
        let mut high = None;
        chime = 0;
        for tuple in chime_list.iter().rev() {
            chime += tuple.endpoint_type as i32;
            if chime >= (n - allow) as i32 {
                high = Some(tuple.edge);
                break;
            }

            if let EndpointType::Middle = tuple.endpoint_type {
                found += 1;
            }
        }

        //  If the number of midpoints is greater than the number
        //  of allowed falsetickers, the intersection contains at
        //  least one truechimer with no midpoint.  If so,
        //  increment the number of allowed falsetickers and go
        //  around again.  If not and the intersection is
        //  non-empty, declare success.
        if found > allow {
            continue;
        }

        if let (Some(low), Some(high)) = (low, high) {
            if high > low {
                return Some((low, high));
            }
        }
    }

    None
}

/// Run intersection and clustering over the fit associations. The result
/// is ordered by the selection metric (stratum first, root distance
/// second); it can hold fewer survivors than the sanity minimum, in which
/// case the caller must discard the outcome.
pub(crate) fn select_survivors(
    candidates: &[(PeerHandle, &Peer)],
    local_clock_time: NtpInstant,
    config: &SystemConfig,
) -> Vec<PeerHandle> {
    let chime_list =
        construct_candidate_list(candidates.iter().map(|(_, peer)| *peer), local_clock_time);

    let (low, high) = match find_interval(&chime_list) {
        Some(interval) => interval,
        None => {
            debug!("no majority intersection of correctness intervals");
            return vec![];
        }
    };

    // Survivors are the candidates whose midpoint lies within the
    // intersection, ranked first by stratum and then by root distance.
    let mut survivors: Vec<(PeerHandle, &Peer, NtpDuration)> = candidates
        .iter()
        .filter(|(_, peer)| peer.statistics.offset >= low && peer.statistics.offset <= high)
        .map(|(handle, peer)| {
            let metric = MAX_DISTANCE * (peer.stratum as i64) + peer.root_distance(local_clock_time);
            (*handle, *peer, metric)
        })
        .collect();
    survivors.sort_by(|a, b| a.2.cmp(&b.2));

    // There must be at least NSANE survivors to satisfy the correctness
    // assertions. Clustering fewer makes no sense; bail out and let the
    // caller keep the previous synchronization source.
    if survivors.len() < config.min_intersection_survivors {
        return survivors.iter().map(|(handle, _, _)| *handle).collect();
    }

    // Clustering algorithm: repeatedly discard the survivor with the
    // largest selection jitter, until that no longer improves the result
    // or the minimum number of survivors is reached.
    loop {
        let mut max_selection_jitter_index = 0;
        let mut max_selection_jitter = f64::MIN;
        let mut min_peer_jitter = f64::MAX;

        for (index, (_, survivor, _)) in survivors.iter().enumerate() {
            min_peer_jitter = min_peer_jitter.min(survivor.statistics.jitter);

            let selection_jitter = survivors
                .iter()
                .map(|(_, other, _)| {
                    (survivor.statistics.offset - other.statistics.offset)
                        .to_seconds()
                        .powi(2)
                })
                .sum::<f64>()
                .sqrt();

            if selection_jitter > max_selection_jitter {
                max_selection_jitter = selection_jitter;
                max_selection_jitter_index = index;
            }
        }

        // If the maximum selection jitter is less than the minimum peer
        // jitter, then tossing out more survivors will not lower the
        // minimum peer jitter, so we might as well stop. We also stop
        // when only the minimum number of survivors is left.
        if survivors.len() <= config.min_cluster_survivors
            || max_selection_jitter < min_peer_jitter
        {
            break;
        }

        survivors.remove(max_selection_jitter_index);
    }

    survivors.iter().map(|(handle, _, _)| *handle).collect()
}

/// Combine the offsets of the clustering algorithm survivors using a
/// weighted average with weight determined by the root distance. Compute
/// the selection jitter as the weighted RMS difference between the first
/// survivor and the remaining survivors.
pub(crate) fn clock_combine(
    survivors: &[&Peer],
    local_clock_time: NtpInstant,
) -> (NtpDuration, f64) {
    let mut weight_sum = 0.0;
    let mut offset_sum = 0.0;
    let mut jitter_sum = 0.0;

    let head_offset = survivors[0].statistics.offset.to_seconds();

    for peer in survivors {
        let weight = 1.0 / peer.root_distance(local_clock_time).to_seconds();
        let offset = peer.statistics.offset.to_seconds();

        weight_sum += weight;
        offset_sum += offset * weight;
        jitter_sum += (offset - head_offset).powi(2) * weight;
    }

    let offset = NtpDuration::from_seconds(offset_sum / weight_sum);
    let jitter = (jitter_sum / weight_sum).sqrt();

    (offset, jitter)
}

/// Exercise the intersection algorithm with arbitrary offsets and root
/// dispersions; it must never panic, and any interval it produces must be
/// properly ordered.
#[cfg(feature = "fuzz")]
pub fn fuzz_find_interval(spec: &[(i64, u64)]) {
    let peers: Vec<Peer> = spec
        .iter()
        .map(|(offset, dispersion)| {
            let mut peer = Peer::test_peer();
            peer.statistics.offset = NtpDuration::from_fixed_int(*offset);
            peer.rootdisp = NtpDuration::from_fixed_int((dispersion & (i64::MAX as u64)) as i64);
            peer
        })
        .collect();

    let chime_list = construct_candidate_list(peers.iter(), NtpInstant::ZERO);
    if let Some((low, high)) = find_interval(&chime_list) {
        assert!(low < high);
    }
}
