//! Classification of incoming fault reports

use std::collections::BTreeMap;

use tracing::info;

use crate::messaging::FaultMessage;
use crate::types::{SiteId, SiteSet};

/// Why a fault report is dropped, or `DoNot` when it is accepted.
///
/// Checks run in declaration order; the first match wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discard {
    /// Someone witnessed this site dead; it cannot arbitrate its own death
    Suicide,
    /// Failed site already confirmed dead
    AlreadyFailed,
    /// Failed site is not in the mesh
    Unknown,
    /// Reporter already confirmed dead
    ReporterFailed,
    /// Reporter is not in the mesh
    ReporterUnknown,
    /// Reporter sees no one but itself
    SoleSurvivor,
    /// Reporter is itself under suspicion
    ReporterInTrouble,
    /// Remote site relaying unwitnessed suspicion of itself
    SelfUnwitnessed,
    /// Failed site already in trouble with equal or stronger evidence
    AlreadyKnow,
    /// Reporter still counts the failed site among its survivors
    ReporterSurvivor,
    /// Accept the report
    DoNot,
}

/// Arbiter state a fault report is judged against
pub struct DiscardContext<'a> {
    pub self_site: SiteId,
    pub mesh: &'a SiteSet,
    pub failed_sites: &'a SiteSet,
    pub in_trouble: &'a BTreeMap<SiteId, bool>,
}

impl Discard {
    /// Classify `fault` against the arbiter's current state
    pub fn classify(fault: &FaultMessage, ctx: &DiscardContext<'_>) -> Self {
        let failed = fault.failed_site;
        let reporter = fault.reporting_site;

        if failed == ctx.self_site && fault.witnessed {
            Self::Suicide
        } else if ctx.failed_sites.contains(&failed) {
            Self::AlreadyFailed
        } else if !ctx.mesh.contains(&failed) {
            Self::Unknown
        } else if ctx.failed_sites.contains(&reporter) {
            Self::ReporterFailed
        } else if !ctx.mesh.contains(&reporter) {
            Self::ReporterUnknown
        } else if fault.survivors.len() == 1 && fault.survivors.contains(&reporter) {
            Self::SoleSurvivor
        } else if reporter != ctx.self_site && ctx.in_trouble.contains_key(&reporter) {
            Self::ReporterInTrouble
        } else if reporter == failed && reporter != ctx.self_site && !fault.witnessed {
            Self::SelfUnwitnessed
        } else if let Some(&known) = ctx.in_trouble.get(&failed) {
            if known || !Self::locally_witnessed(fault, ctx.self_site) {
                Self::AlreadyKnow
            } else if fault.survivors.contains(&failed) {
                Self::ReporterSurvivor
            } else {
                Self::DoNot
            }
        } else if fault.survivors.contains(&failed) {
            Self::ReporterSurvivor
        } else {
            Self::DoNot
        }
    }

    /// Whether the fault counts as witnessed by this site for its trouble map
    pub fn locally_witnessed(fault: &FaultMessage, self_site: SiteId) -> bool {
        fault.witnessed && fault.reporting_site == self_site
    }

    pub fn is_accepted(&self) -> bool {
        *self == Self::DoNot
    }

    /// Log a dropped report
    pub fn log(&self, self_site: SiteId, fault: &FaultMessage) {
        if self.is_accepted() {
            return;
        }
        info!(
            site = self_site,
            failed = fault.failed_site,
            reporter = fault.reporting_site,
            witnessed = fault.witnessed,
            reason = ?self,
            "Discarding fault report"
        );
    }
}
