//! Topology derivations over a [`CassandraCluster`].
//!
//! Everything here is pure: names, per-DC overrides, seed list computation
//! and the initial shape of the rack status map.

use super::cluster::{
    ActionKind, ActionStatus, CassandraCluster, CassandraClusterStatus, ClusterPhase, Dc,
    LastAction, Rack, RackStatus,
};
use crate::error::OperatorResult;
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;

/// Default datacenter name.
pub const DEFAULT_DC: &str = "dc1";
/// Default rack name.
pub const DEFAULT_RACK: &str = "rack1";
/// Tokens per node when no DC sets it.
pub const DEFAULT_NUM_TOKENS: i32 = 256;
/// Seeds wanted per datacenter.
pub const MAX_SEEDS_PER_DC: usize = 3;
/// Annotation holding the last configuration the operator acted upon.
pub const ANNOTATION_LAST_APPLIED: &str =
    "cassandraclusters.db.orange.com/last-applied-configuration";

static DNS_1035: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[a-z]([-a-z0-9]*[a-z0-9])?$").expect("static regex is valid"));

/// Whether `name` is a DNS-1035 label.
pub fn is_dns_1035(name: &str) -> bool {
    DNS_1035.is_match(name)
}

/// `<dc>-<rack>`, or an empty string when the result is not a DNS-1035 label.
pub fn dc_rack_name(dc: &str, rack: &str) -> String {
    let name = format!("{dc}-{rack}");
    if !is_dns_1035(&name) {
        tracing::error!(
            dc_rack = %name,
            "not a valid DNS-1035 label: lower case alphanumerics or '-', starting with a letter"
        );
        return String::new();
    }
    name
}

/// Keep stored seeds that are still wanted, in stored order, then append the
/// wanted seeds not yet present.
pub fn merge_seed_list(stored: &[String], desired: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(desired.len());
    let kept = stored.iter().filter(|s| desired.contains(s));
    for seed in kept.chain(desired) {
        if !merged.contains(seed) {
            merged.push(seed.clone());
        }
    }
    merged
}

/// Whether every element of `a` is in `b`.
pub(crate) fn contains_all(a: &[String], b: &[String]) -> bool {
    a.iter().all(|s| b.contains(s))
}

/// A fresh rack status in its initial phase.
pub fn initial_rack_status(now: DateTime<Utc>) -> RackStatus {
    RackStatus {
        phase: ClusterPhase::Initializing,
        cassandra_last_action: LastAction {
            name: Some(ActionKind::Initializing),
            status: Some(ActionStatus::Ongoing),
            start_time: Some(now),
            ..Default::default()
        },
        ..Default::default()
    }
}

impl CassandraCluster {
    /// Declared datacenters.
    pub fn dcs(&self) -> &[Dc] {
        &self.spec.topology.dc
    }

    /// Number of declared datacenters.
    pub fn dc_size(&self) -> usize {
        self.spec.topology.dc.len()
    }

    /// Number of racks in the DC at `dc`.
    pub fn rack_size(&self, dc: usize) -> usize {
        self.spec.topology.dc.get(dc).map_or(0, |d| d.rack.len())
    }

    /// Total number of racks.
    pub fn dc_rack_size(&self) -> usize {
        self.spec.topology.dc.iter().map(|d| d.rack.len()).sum()
    }

    /// `(dc, rack)` pairs in declaration order.
    ///
    /// An empty topology reads as `dc1/rack1` and a DC without racks as
    /// `<dc>/rack1`.
    pub fn dc_rack_pairs(&self) -> Vec<(String, String)> {
        if self.spec.topology.dc.is_empty() {
            return vec![(DEFAULT_DC.to_string(), DEFAULT_RACK.to_string())];
        }
        let mut pairs = Vec::new();
        for dc in &self.spec.topology.dc {
            if dc.rack.is_empty() {
                pairs.push((dc.name.clone(), DEFAULT_RACK.to_string()));
            }
            for rack in &dc.rack {
                pairs.push((dc.name.clone(), rack.name.clone()));
            }
        }
        pairs
    }

    fn dc_index(&self, dc_name: &str) -> Option<usize> {
        self.spec.topology.dc.iter().position(|d| d.name == dc_name)
    }

    fn dc_for_dc_rack(&self, dc_rack: &str) -> Option<(&Dc, Option<&Rack>)> {
        for dc in &self.spec.topology.dc {
            if dc.rack.is_empty() && format!("{}-{DEFAULT_RACK}", dc.name) == dc_rack {
                return Some((dc, None));
            }
            for rack in &dc.rack {
                if format!("{}-{}", dc.name, rack.name) == dc_rack {
                    return Some((dc, Some(rack)));
                }
            }
        }
        None
    }

    fn dc_nodes_per_racks(&self, dc: &Dc) -> i32 {
        dc.nodes_per_racks.unwrap_or(self.spec.nodes_per_racks)
    }

    /// Desired nodes for a `<dc>-<rack>`.
    pub fn nodes_per_racks(&self, dc_rack: &str) -> i32 {
        self.dc_for_dc_rack(dc_rack)
            .map_or(self.spec.nodes_per_racks, |(dc, _)| self.dc_nodes_per_racks(dc))
    }

    /// Tokens per node for a `<dc>-<rack>`.
    pub fn num_tokens(&self, dc_rack: &str) -> i32 {
        self.dc_for_dc_rack(dc_rack)
            .and_then(|(dc, _)| dc.num_tokens)
            .unwrap_or(DEFAULT_NUM_TOKENS)
    }

    /// RollingUpdate partition for a `<dc>-<rack>`.
    pub fn rolling_partition(&self, dc_rack: &str) -> i32 {
        self.dc_for_dc_rack(dc_rack)
            .and_then(|(_, rack)| rack.map(|r| r.rolling_partition))
            .unwrap_or(0)
    }

    /// Rolling restart requested on a `<dc>-<rack>`.
    pub fn rolling_restart(&self, dc_rack: &str) -> bool {
        self.dc_for_dc_rack(dc_rack)
            .and_then(|(_, rack)| rack.map(|r| r.rolling_restart))
            .unwrap_or(false)
    }

    /// Clear the rolling restart request of a `<dc>-<rack>`.
    pub fn clear_rolling_restart(&mut self, dc_rack: &str) {
        for dc in &mut self.spec.topology.dc {
            let dc_name = dc.name.clone();
            for rack in &mut dc.rack {
                if format!("{dc_name}-{}", rack.name) == dc_rack {
                    rack.rolling_restart = false;
                }
            }
        }
    }

    /// Node selector labels for a `<dc>-<rack>` (DC labels, then rack labels).
    pub fn node_selector(&self, dc_rack: &str) -> std::collections::BTreeMap<String, String> {
        let mut labels = std::collections::BTreeMap::new();
        if let Some((dc, rack)) = self.dc_for_dc_rack(dc_rack) {
            labels.extend(dc.labels.clone());
            if let Some(rack) = rack {
                labels.extend(rack.labels.clone());
            }
        }
        labels
    }

    /// `(found, nodes)` for the DC named `dc_name`.
    pub fn dc_nodes_per_racks_from_name(&self, dc_name: &str) -> (bool, i32) {
        match self.dc_index(dc_name) {
            Some(i) => (true, self.dc_nodes_per_racks(&self.spec.topology.dc[i])),
            None => (false, self.spec.nodes_per_racks),
        }
    }

    /// The first DC whose explicit nodesPerRacks is 0.
    pub fn find_dc_with_nodes_to_0(&self) -> Option<(String, usize)> {
        self.spec
            .topology
            .dc
            .iter()
            .enumerate()
            .find(|(_, dc)| dc.nodes_per_racks == Some(0))
            .map(|(i, dc)| (dc.name.clone(), i))
    }

    /// Whether a DC with this name is declared.
    pub fn is_valid_dc(&self, dc_name: &str) -> bool {
        self.dc_index(dc_name).is_some()
    }

    /// DC part of a `<dc>-<rack>` name, matched against known DC names since
    /// both parts may contain `-`. Falls back to the first segment.
    pub fn dc_from_dc_rack_name<'a>(dc_rack: &'a str, dcs: &[&str]) -> &'a str {
        dcs.iter()
            .filter(|dc| {
                dc_rack.len() > dc.len() + 1
                    && dc_rack.starts_with(*dc)
                    && dc_rack.as_bytes()[dc.len()] == b'-'
            })
            .map(|dc| &dc_rack[..dc.len()])
            .max_by_key(|dc| dc.len())
            .unwrap_or_else(|| dc_rack.split('-').next().unwrap_or(dc_rack))
    }

    /// ConfigMap mounted into the pods; an empty name means none.
    pub fn config_map_name(&self) -> Option<&str> {
        self.spec.config_map_name.as_deref().filter(|n| !n.is_empty())
    }

    /// Data volume size for a DC.
    pub fn data_capacity_for_dc(&self, dc_name: &str) -> String {
        self.dc_index(dc_name)
            .and_then(|i| self.spec.topology.dc[i].data_capacity.clone())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| self.spec.data_capacity.clone())
    }

    /// Storage class for a DC.
    pub fn data_storage_class_for_dc(&self, dc_name: &str) -> Option<String> {
        self.dc_index(dc_name)
            .and_then(|i| self.spec.topology.dc[i].data_storage_class.clone())
            .or_else(|| self.spec.data_storage_class.clone())
    }

    /// Name of the DC present in `old` but no longer here.
    pub fn removed_dc_name(&self, old: &CassandraCluster) -> Option<String> {
        old.spec
            .topology
            .dc
            .iter()
            .enumerate()
            .find(|(i, old_dc)| {
                self.spec.topology.dc.get(*i).map(|d| d.name.as_str()) != Some(old_dc.name.as_str())
            })
            .map(|(_, dc)| dc.name.clone())
    }

    fn seed_address(&self, dc: &str, rack: &str, index: i32) -> String {
        let dc_rack = dc_rack_name(dc, rack);
        let name = self.name_any();
        let namespace = self.namespace().unwrap_or_default();
        format!("{name}-{dc_rack}-{index}.{name}-{dc_rack}.{namespace}")
    }

    /// Seed addresses for the current topology, at most three per DC.
    ///
    /// One rack contributes up to three nodes, two racks up to two nodes each,
    /// and with more racks the first node of each rack is taken.
    pub fn init_seed_list(&self) -> Vec<String> {
        let mut seeds = Vec::new();
        if self.spec.topology.dc.is_empty() {
            for i in 0..self.spec.nodes_per_racks.clamp(0, MAX_SEEDS_PER_DC as i32) {
                seeds.push(self.seed_address(DEFAULT_DC, DEFAULT_RACK, i));
            }
            return seeds;
        }

        for dc in &self.spec.topology.dc {
            if dc.rack.is_empty() {
                for i in 0..self.spec.nodes_per_racks.clamp(0, MAX_SEEDS_PER_DC as i32) {
                    seeds.push(self.seed_address(&dc.name, DEFAULT_RACK, i));
                }
                continue;
            }

            let nodes = self.dc_nodes_per_racks(dc);
            let per_rack = match dc.rack.len() {
                1 => MAX_SEEDS_PER_DC as i32,
                2 => 2,
                _ => 1,
            };
            let mut in_dc = 0;
            for rack in &dc.rack {
                let mut i = 0;
                while i < nodes && i < per_rack && in_dc < MAX_SEEDS_PER_DC {
                    seeds.push(self.seed_address(&dc.name, &rack.name, i));
                    in_dc += 1;
                    i += 1;
                }
            }
        }
        seeds
    }

    /// Insert a fresh rack status for `dc`/`rack` into `status`.
    pub fn init_rack_status(
        status: &mut CassandraClusterStatus,
        dc: &str,
        rack: &str,
        now: DateTime<Utc>,
    ) {
        status
            .cassandra_rack_status
            .insert(dc_rack_name(dc, rack), initial_rack_status(now));
    }

    /// Rebuild the rack status map from the topology. Returns the rack count.
    ///
    /// An empty topology becomes `dc1/rack1`, a DC without racks gets `rack1`.
    pub fn init_rack_status_list(&mut self, now: DateTime<Utc>) -> usize {
        if self.spec.topology.dc.is_empty() {
            self.spec.topology.dc.push(Dc {
                name: DEFAULT_DC.to_string(),
                ..Default::default()
            });
        }
        for dc in &mut self.spec.topology.dc {
            if dc.rack.is_empty() {
                dc.rack.push(Rack {
                    name: DEFAULT_RACK.to_string(),
                    ..Default::default()
                });
            }
        }

        let pairs = self.dc_rack_pairs();
        let status = self.status.get_or_insert_with(Default::default);
        status.cassandra_rack_status.clear();
        for (dc, rack) in &pairs {
            Self::init_rack_status(status, dc, rack, now);
        }
        pairs.len()
    }

    /// Drop status entries whose rack left the topology; returns their names.
    pub fn fix_rack_list(&self, status: &mut CassandraClusterStatus) -> Vec<String> {
        let wanted: Vec<String> = self
            .dc_rack_pairs()
            .iter()
            .map(|(dc, rack)| dc_rack_name(dc, rack))
            .collect();
        let removed: Vec<String> = status
            .cassandra_rack_status
            .keys()
            .filter(|k| !wanted.contains(k))
            .cloned()
            .collect();
        for name in &removed {
            status.cassandra_rack_status.remove(name);
        }
        removed
    }

    /// Fill defaulted fields; returns whether anything changed.
    pub fn set_defaults(&mut self, now: DateTime<Utc>) -> bool {
        let mut changed = false;
        if self.spec.nodes_per_racks == 0 {
            self.spec.nodes_per_racks = 1;
            changed = true;
        }
        if self.status.as_ref().and_then(|s| s.phase).is_none() {
            if self.init_rack_status_list(now) < 1 {
                tracing::error!(cluster = %self.name_any(), "at least one rack is required");
            }
            let seeds = self.init_seed_list();
            let status = self.status.get_or_insert_with(Default::default);
            status.phase = Some(ClusterPhase::Initializing);
            if status.seedlist.is_empty() {
                status.seedlist = seeds;
            }
            changed = true;
        }
        if self.spec.max_pod_unavailable == 0 {
            self.spec.max_pod_unavailable = 1;
            changed = true;
        }
        if self.spec.resources.limits.is_none() && self.spec.resources.requests.is_some() {
            self.spec.resources.limits = self.spec.resources.requests.clone();
            changed = true;
        }
        changed
    }

    /// Payload of the last-applied annotation: identity and spec only.
    pub fn last_applied_configuration(&self) -> OperatorResult<String> {
        let value = json!({
            "apiVersion": "db.orange.com/v1alpha1",
            "kind": "CassandraCluster",
            "metadata": {
                "name": self.name_any(),
                "namespace": self.namespace(),
            },
            "spec": self.spec,
        });
        Ok(serde_json::to_string(&value)?)
    }

    /// Stored last-applied annotation, if any.
    pub fn stored_last_applied(&self) -> Option<&str> {
        self.annotations()
            .get(ANNOTATION_LAST_APPLIED)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }
}
