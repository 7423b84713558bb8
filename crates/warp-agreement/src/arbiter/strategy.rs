//! Voting policies that turn a witness graph into a kill decision

use std::collections::BTreeMap;

use tracing::debug;
use warp_config::StrategyKind;

use super::seeker::Scenario;
use crate::types::{SiteId, SiteSet};

/// Voting policy, selected once per cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArbitrationStrategy {
    /// Survivors exclude only witnessed failures; the kill set is the
    /// smallest eviction that makes every witness set equal the quorum
    #[default]
    MatchingCardinality,
    /// Survivors exclude every reported failure; the kill set is every
    /// reported site once all survivors report it
    NoQuarter,
}

impl From<StrategyKind> for ArbitrationStrategy {
    fn from(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::MatchingCardinality => Self::MatchingCardinality,
            StrategyKind::NoQuarter => Self::NoQuarter,
        }
    }
}

impl ArbitrationStrategy {
    /// Sites still considered part of the mesh given this site's troubles
    pub fn survivors(&self, mesh: &SiteSet, in_trouble: &BTreeMap<SiteId, bool>) -> SiteSet {
        match self {
            Self::MatchingCardinality => mesh
                .iter()
                .filter(|site| in_trouble.get(site) != Some(&true))
                .copied()
                .collect(),
            Self::NoQuarter => mesh
                .iter()
                .filter(|site| !in_trouble.contains_key(site))
                .copied()
                .collect(),
        }
    }

    /// Whether the scenario describes a settled view
    pub fn have_agreement(&self, scenario: &Scenario) -> bool {
        match self {
            Self::MatchingCardinality => {
                let quorum = scenario.quorum();
                scenario
                    .dead
                    .iter()
                    .all(|(_, witnesses)| *witnesses == quorum)
            }
            Self::NoQuarter => scenario
                .reported
                .iter()
                .all(|(_, reporters)| reporters.is_superset(&scenario.survivors)),
        }
    }

    /// Sites to evict, or an empty set when no consistent eviction excludes `self_site`
    pub fn next_kill(&self, self_site: SiteId, scenario: &Scenario) -> SiteSet {
        match self {
            Self::MatchingCardinality => self.matching_kill(self_site, scenario),
            Self::NoQuarter => {
                if self.have_agreement(scenario) {
                    scenario.reported.keys().collect()
                } else {
                    debug!(site = self_site, "Reports not yet unanimous");
                    SiteSet::new()
                }
            }
        }
    }

    /// Evict the most-witnessed site, larger id on ties, until the
    /// simulated graph agrees. Each site is picked at most once.
    fn matching_kill(&self, self_site: SiteId, scenario: &Scenario) -> SiteSet {
        let mut sc = scenario.clone();
        let mut picked = SiteSet::new();

        while !self.have_agreement(&sc) {
            let pick = sc
                .dead
                .iter()
                .filter(|(site, witnesses)| {
                    *site != self_site && !picked.contains(site) && !witnesses.is_empty()
                })
                .max_by_key(|(site, witnesses)| (witnesses.len(), *site))
                .map(|(site, _)| site);

            let Some(pick) = pick else {
                debug!(
                    site = self_site,
                    ?picked,
                    "No eligible site left to evict; expecting removal by peers"
                );
                return SiteSet::new();
            };

            picked.insert(pick);
            sc.evict(pick);
        }

        sc.dead.keys().collect()
    }
}
