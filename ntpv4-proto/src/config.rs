use serde::Deserialize;

use crate::time_types::NtpDuration;

fn default_min_intersection_survivors() -> usize {
    1
}

fn default_min_cluster_survivors() -> usize {
    3
}

fn default_distance_threshold() -> NtpDuration {
    NtpDuration::ONE
}

/// Protocol tunables of the system process. The defaults match the
/// constants of the protocol specification; deployments mostly only touch
/// the access policy switches.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SystemConfig {
    /// Minimum number of survivors the intersection algorithm must leave
    /// for its result to be trusted (NSANE)
    #[serde(default = "default_min_intersection_survivors")]
    pub min_intersection_survivors: usize,

    /// Number of survivors the clustering algorithm will not reduce below
    /// (NMIN)
    #[serde(default = "default_min_cluster_survivors")]
    pub min_cluster_survivors: usize,

    /// A peer whose root distance exceeds this threshold (plus one poll
    /// interval of oscillator drift) is unfit for synchronization (MAXDIST)
    #[serde(default = "default_distance_threshold")]
    pub distance_threshold: NtpDuration,

    /// Accept broadcast server packets and mobilize ephemeral broadcast
    /// client associations for them
    #[serde(default)]
    pub broadcast_client: bool,

    /// Do not serve time to, or accept symmetric mobilization from,
    /// unauthenticated remotes that have no configured association
    #[serde(default)]
    pub no_trust: bool,

    /// Do not mobilize ephemeral associations for unauthenticated remotes
    #[serde(default)]
    pub no_peer: bool,

    /// Keep running when the measured offset exceeds the panic threshold.
    /// Normally such an offset terminates the process so an operator can
    /// set the clock manually.
    #[serde(default)]
    pub ignore_panic: bool,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            min_intersection_survivors: default_min_intersection_survivors(),
            min_cluster_survivors: default_min_cluster_survivors(),
            distance_threshold: default_distance_threshold(),
            broadcast_client: false,
            no_trust: false,
            no_peer: false,
            ignore_panic: false,
        }
    }
}
