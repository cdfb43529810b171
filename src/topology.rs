use crate::error::{IpcError, Result};
use crate::transport::Bootstrap;
use crate::types::Rank;

/// Host layout of a group from this rank's perspective.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTopology {
    /// Hostname of this rank.
    pub hostname: String,
    /// Hostname of every rank, indexed by rank.
    pub rank_hosts: Vec<String>,
    /// All ranks on this host, sorted ascending.
    pub local_ranks: Vec<Rank>,
    /// This rank's index within `local_ranks`.
    pub local_rank_idx: usize,
    /// This host's index among all hosts, in order of first appearance.
    pub node_idx: usize,
    pub num_nodes: usize,
}

impl NodeTopology {
    /// Build the topology from the gathered per-rank hostnames.
    pub fn from_hostnames(rank: Rank, rank_hosts: Vec<String>) -> Result<Self> {
        let hostname = rank_hosts
            .get(rank as usize)
            .cloned()
            .ok_or(IpcError::InvalidRank {
                rank,
                world_size: rank_hosts.len() as u32,
            })?;

        let seen_hosts: indexmap::IndexSet<&str> = rank_hosts.iter().map(String::as_str).collect();
        let node_idx = seen_hosts
            .get_index_of(hostname.as_str())
            .ok_or_else(|| IpcError::invalid("own hostname not found in gathered data"))?;

        let local_ranks: Vec<Rank> = rank_hosts
            .iter()
            .enumerate()
            .filter(|(_, h)| **h == hostname)
            .map(|(r, _)| r as Rank)
            .collect();
        let local_rank_idx = local_ranks
            .iter()
            .position(|&r| r == rank)
            .ok_or_else(|| IpcError::invalid("own rank not in local ranks"))?;

        Ok(Self {
            num_nodes: seen_hosts.len(),
            hostname,
            rank_hosts,
            local_ranks,
            local_rank_idx,
            node_idx,
        })
    }

    /// Number of ranks sharing this host.
    pub fn local_world_size(&self) -> usize {
        self.local_ranks.len()
    }

    pub fn is_single_node(&self) -> bool {
        self.num_nodes == 1
    }

    pub fn host_of(&self, rank: Rank) -> Option<&str> {
        self.rank_hosts.get(rank as usize).map(String::as_str)
    }
}

/// Discover the group topology by exchanging hostnames.
///
/// All ranks must call this collectively.
pub async fn discover_topology(bootstrap: &dyn Bootstrap, hostname: &str) -> Result<NodeTopology> {
    let gathered = bootstrap.all_gather(hostname.as_bytes()).await?;
    let rank_hosts = gathered
        .into_iter()
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .collect();
    NodeTopology::from_hostnames(bootstrap.rank(), rank_hosts)
}
