//! Safety watermark: newest transaction known committed at every site

use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::types::{SiteId, TxnId, UNKNOWN_TXN_ID};

/// Per-site confirmation ids and their global minimum.
///
/// Each executor confirms the newest transaction it has received from this
/// site; once every site confirmed an id, it is safe everywhere. The global
/// minimum never moves backward.
#[derive(Debug, Clone)]
pub struct TxnIdSafetyState {
    site_id: SiteId,
    newest_confirmed: BTreeMap<SiteId, TxnId>,
    newest_globally_safe: TxnId,
}

impl TxnIdSafetyState {
    /// Track `sites`, none confirmed yet
    pub fn new(site_id: SiteId, sites: impl IntoIterator<Item = SiteId>) -> Self {
        Self {
            site_id,
            newest_confirmed: sites.into_iter().map(|s| (s, UNKNOWN_TXN_ID)).collect(),
            newest_globally_safe: UNKNOWN_TXN_ID,
        }
    }

    /// Record that `site` has received everything up to `txn_id`
    pub fn update_last_seen_txn_id_from_executor_by_site_id(&mut self, site: SiteId, txn_id: TxnId) {
        if txn_id == UNKNOWN_TXN_ID {
            return;
        }
        let Some(confirmed) = self.newest_confirmed.get_mut(&site) else {
            trace!(site = self.site_id, executor = site, "Ignoring confirmation from unknown site");
            return;
        };
        if txn_id > *confirmed {
            *confirmed = txn_id;
            self.recompute();
        }
    }

    /// Track a joining site, starting it at the current global watermark
    pub fn add_state(&mut self, site: SiteId) {
        let start = self.newest_globally_safe;
        self.newest_confirmed.entry(site).or_insert(start);
        debug!(site = self.site_id, joined = site, start, "Tracking safety for site");
    }

    /// Stop tracking a removed site
    pub fn remove_state(&mut self, site: SiteId) {
        if self.newest_confirmed.remove(&site).is_some() {
            self.recompute();
            debug!(
                site = self.site_id,
                removed = site,
                newest_globally_safe = self.newest_globally_safe,
                "Dropped safety state for site"
            );
        }
    }

    /// Newest id that is safe to tell `site` about, `UNKNOWN_TXN_ID` for
    /// untracked sites
    pub fn get_newest_safe_txn_id_for_executor_by_site_id(&self, site: SiteId) -> TxnId {
        if self.newest_confirmed.contains_key(&site) {
            self.newest_globally_safe
        } else {
            UNKNOWN_TXN_ID
        }
    }

    pub fn get_newest_globally_safe_txn_id(&self) -> TxnId {
        self.newest_globally_safe
    }

    /// Sites currently tracked
    pub fn sites(&self) -> impl Iterator<Item = SiteId> + '_ {
        self.newest_confirmed.keys().copied()
    }

    fn recompute(&mut self) {
        if let Some(min) = self.newest_confirmed.values().copied().min() {
            self.newest_globally_safe = self.newest_globally_safe.max(min);
        }
    }
}
