//! Witness graph accumulated during one arbitration episode

use std::collections::BTreeMap;

use tracing::trace;

use super::strategy::ArbitrationStrategy;
use crate::messaging::{FaultMessage, SiteFailureMessage};
use crate::types::{SiteId, SiteSet};

/// Directed multi-valued relation from a site to a set of sites.
/// Keys with no values are never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiteGraph {
    edges: BTreeMap<SiteId, SiteSet>,
}

impl SiteGraph {
    /// Add `value` under `key`
    pub fn put(&mut self, key: SiteId, value: SiteId) {
        self.edges.entry(key).or_default().insert(value);
    }

    /// Values stored under `key`
    pub fn get(&self, key: SiteId) -> Option<&SiteSet> {
        self.edges.get(&key)
    }

    /// Whether `value` is stored under `key`
    pub fn contains(&self, key: SiteId, value: SiteId) -> bool {
        self.edges.get(&key).is_some_and(|values| values.contains(&value))
    }

    /// Keys in ascending order
    pub fn keys(&self) -> impl Iterator<Item = SiteId> + '_ {
        self.edges.keys().copied()
    }

    /// Key/value-set pairs in ascending key order
    pub fn iter(&self) -> impl Iterator<Item = (SiteId, &SiteSet)> + '_ {
        self.edges.iter().map(|(key, values)| (*key, values))
    }

    /// Remove `value` from every key, dropping keys left empty
    pub fn remove_value(&mut self, value: SiteId) {
        self.edges.retain(|_, values| {
            values.remove(&value);
            !values.is_empty()
        });
    }

    /// Remove a key with all its values
    pub fn remove_key(&mut self, key: SiteId) -> SiteSet {
        self.edges.remove(&key).unwrap_or_default()
    }

    /// Whether `value` appears under any key
    pub fn has_value(&self, value: SiteId) -> bool {
        self.edges.values().any(|values| values.contains(&value))
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn clear(&mut self) {
        self.edges.clear();
    }
}

/// Point-in-time copy of the witness graph.
///
/// `reported`: site → sites that reported it in trouble.
/// `dead`: site → sites that witnessed it dead.
/// `alive`: site → sites that currently vouch for it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scenario {
    pub reported: SiteGraph,
    pub dead: SiteGraph,
    pub alive: SiteGraph,
    pub survivors: SiteSet,
}

impl Scenario {
    /// Vouched-for sites that are also survivors
    pub fn quorum(&self) -> SiteSet {
        self.alive
            .keys()
            .filter(|site| self.survivors.contains(site))
            .collect()
    }

    /// Whether `site` has testified, directly or through a relay
    pub fn has_testified(&self, site: SiteId) -> bool {
        self.alive.has_value(site) || self.dead.has_value(site)
    }

    /// Drop `site`'s testimony and turn everyone still vouching for it
    /// into witnesses of its death
    pub(crate) fn evict(&mut self, site: SiteId) {
        self.dead.remove_value(site);
        self.alive.remove_value(site);
        for voucher in self.alive.remove_key(site) {
            self.dead.put(site, voucher);
        }
        self.survivors.remove(&site);
    }
}

/// Accumulates every site's failure view and answers whether, and how,
/// the mesh can settle.
///
/// `dead` is append-only until [`AgreementSeeker::clear`]; a reporter's
/// `alive` edges are replaced wholesale on each of its updates.
#[derive(Debug, Clone)]
pub struct AgreementSeeker {
    strategy: ArbitrationStrategy,
    self_site: SiteId,
    mesh: SiteSet,
    current: Scenario,
}

impl AgreementSeeker {
    /// Create an empty seeker for `self_site`
    pub fn new(strategy: ArbitrationStrategy, self_site: SiteId) -> Self {
        Self {
            strategy,
            self_site,
            mesh: SiteSet::new(),
            current: Scenario::default(),
        }
    }

    /// Forget every relation and the episode mesh
    pub fn clear(&mut self) {
        self.mesh.clear();
        self.current = Scenario::default();
    }

    /// Begin or continue an episode over `mesh` with this site's troubles
    pub fn start_seeking_for(&mut self, mesh: &SiteSet, in_trouble: &BTreeMap<SiteId, bool>) {
        if *mesh != self.mesh {
            if !self.mesh.is_empty() {
                trace!(site = self.self_site, old = ?self.mesh, new = ?mesh, "Mesh changed, resetting witness graph");
            }
            self.clear();
            self.mesh = mesh.clone();
        }
        self.current.survivors = self.strategy.survivors(mesh, in_trouble);
        self.add(self.self_site, in_trouble);
    }

    /// Record a reporter's trouble map
    pub fn add(&mut self, reporting: SiteId, in_trouble: &BTreeMap<SiteId, bool>) {
        if !self.mesh.contains(&reporting) || in_trouble.get(&reporting) == Some(&true) {
            return;
        }

        let mut dead = SiteSet::new();
        for (&site, &witnessed) in in_trouble {
            if !self.mesh.contains(&site) {
                continue;
            }
            self.current.reported.put(site, reporting);
            if witnessed {
                self.current.dead.put(site, reporting);
                dead.insert(site);
            }
        }
        self.replace_alive(reporting, &dead);
    }

    /// Record a reporter's broadcast view
    pub fn add_view(&mut self, reporting: SiteId, view: &SiteFailureMessage) {
        if !self.mesh.contains(&reporting) || !view.survivors.contains(&reporting) {
            return;
        }

        let failed: SiteSet = view.failed_sites.intersection(&self.mesh).copied().collect();
        let dead: SiteSet = if failed.is_empty() {
            SiteSet::new()
        } else {
            self.mesh.difference(&view.survivors).copied().collect()
        };

        for &site in &failed {
            self.current.reported.put(site, reporting);
        }
        for &site in &dead {
            self.current.dead.put(site, reporting);
        }
        self.replace_alive(reporting, &dead);
    }

    fn replace_alive(&mut self, reporting: SiteId, dead: &SiteSet) {
        self.current.alive.remove_value(reporting);
        for &site in self.mesh.difference(dead) {
            self.current.alive.put(site, reporting);
        }
    }

    /// Whether the live graph has settled
    pub fn have_agreement(&self) -> bool {
        self.strategy.have_agreement(&self.current)
    }

    /// Sites to evict; empty when none can be chosen without evicting this site
    pub fn next_kill(&self) -> SiteSet {
        self.strategy.next_kill(self.self_site, &self.current)
    }

    /// Whether some site this node cannot reach is still vouched for by a
    /// reachable survivor and its own view has not arrived yet
    pub fn need_forward(&self) -> bool {
        if self.strategy != ArbitrationStrategy::MatchingCardinality {
            return false;
        }
        let sc = &self.current;
        if sc.survivors.len() <= 1 && sc.survivors.iter().all(|&s| s == self.self_site) {
            return false;
        }

        let vouched: SiteSet = self
            .mesh
            .difference(&sc.survivors)
            .filter(|&&site| sc.alive.get(site).is_some_and(|v| !v.is_empty()))
            .copied()
            .collect();
        if vouched.is_empty() {
            return false;
        }

        // Walk vouch edges outward from the survivors until nothing new is reached
        let mut reached = sc.survivors.clone();
        loop {
            let grown: Vec<SiteId> = sc
                .alive
                .iter()
                .filter(|(site, vouchers)| !reached.contains(site) && !vouchers.is_disjoint(&reached))
                .map(|(site, _)| site)
                .collect();
            if grown.is_empty() {
                break;
            }
            reached.extend(grown);
            if vouched.is_subset(&reached) {
                break;
            }
        }

        vouched.intersection(&reached).any(|&site| {
            let dead_to_all = sc
                .dead
                .get(site)
                .is_some_and(|witnesses| witnesses.is_superset(&sc.survivors));
            !dead_to_all && !sc.has_testified(site)
        })
    }

    /// [`need_forward`](Self::need_forward), spending one unit of `budget`
    /// per positive answer; false once the budget is exhausted
    pub fn need_forward_within(&self, budget: &mut u32) -> bool {
        if *budget == 0 {
            return false;
        }
        if self.need_forward() {
            *budget -= 1;
            true
        } else {
            false
        }
    }

    /// Survivors that witnessed `site` dead
    pub fn for_whom_site_is_dead(&self, site: SiteId) -> SiteSet {
        self.current
            .dead
            .get(site)
            .map(|witnesses| witnesses.intersection(&self.current.survivors).copied().collect())
            .unwrap_or_default()
    }

    /// Whether the fault adds nothing to what its reporter already testified
    pub fn already_know(&self, fault: &FaultMessage) -> bool {
        let reporter = fault.reporting_site;
        fault
            .survivors
            .iter()
            .all(|&site| self.current.alive.contains(site, reporter))
            && self.current.dead.contains(fault.failed_site, reporter)
    }

    /// Current survivor estimate
    pub fn survivors(&self) -> &SiteSet {
        &self.current.survivors
    }

    /// Read-only view of the live relations; clone it to simulate
    pub fn scenario(&self) -> &Scenario {
        &self.current
    }

    /// Mesh of the episode in progress
    pub fn mesh(&self) -> &SiteSet {
        &self.mesh
    }

    pub fn strategy(&self) -> ArbitrationStrategy {
        self.strategy
    }
}
