//! In-process message routing between agreement sites
//!
//! Stands in for the cluster transport in simulations and tests. Links
//! can be severed per site pair to model partial partitions.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tracing::trace;

use super::{LocalMailbox, Mailbox, Message};
use crate::types::SiteId;

/// Routes messages between registered [`LocalMailbox`]es
pub struct MeshRouter {
    /// Mailbox for each site
    mailboxes: DashMap<SiteId, Arc<LocalMailbox>>,

    /// Directed links that drop traffic
    severed: DashSet<(SiteId, SiteId)>,
}

impl MeshRouter {
    /// Create a new router
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mailboxes: DashMap::new(),
            severed: DashSet::new(),
        })
    }

    /// Create and register a mailbox for `site_id`
    pub fn connect(self: &Arc<Self>, site_id: SiteId) -> Arc<LocalMailbox> {
        let mailbox = Arc::new(LocalMailbox::with_router(site_id, Arc::downgrade(self)));
        self.mailboxes.insert(site_id, Arc::clone(&mailbox));
        mailbox
    }

    /// Unregister a site; traffic to it is dropped from now on
    pub fn unregister(&self, site_id: SiteId) -> Option<Arc<LocalMailbox>> {
        self.mailboxes.remove(&site_id).map(|(_, mailbox)| mailbox)
    }

    /// Mailbox registered for a site
    pub fn mailbox(&self, site_id: SiteId) -> Option<Arc<LocalMailbox>> {
        self.mailboxes.get(&site_id).map(|r| Arc::clone(r.value()))
    }

    /// Check if a site is registered
    pub fn contains(&self, site_id: SiteId) -> bool {
        self.mailboxes.contains_key(&site_id)
    }

    /// All registered site ids
    pub fn sites(&self) -> BTreeSet<SiteId> {
        self.mailboxes.iter().map(|r| *r.key()).collect()
    }

    /// Drop traffic between `a` and `b` in both directions
    pub fn sever(&self, a: SiteId, b: SiteId) {
        self.severed.insert((a, b));
        self.severed.insert((b, a));
    }

    /// Restore traffic between `a` and `b`
    pub fn heal(&self, a: SiteId, b: SiteId) {
        self.severed.remove(&(a, b));
        self.severed.remove(&(b, a));
    }

    /// Whether traffic from `from` to `to` is dropped
    pub fn is_severed(&self, from: SiteId, to: SiteId) -> bool {
        self.severed.contains(&(from, to))
    }

    pub(crate) fn route(&self, from: SiteId, destinations: &[SiteId], message: &Message) {
        for &to in destinations {
            if self.is_severed(from, to) {
                trace!(from, to, subject = ?message.subject(), "Severed link dropped message");
                continue;
            }
            match self.mailboxes.get(&to) {
                Some(mailbox) => mailbox.deliver(message.clone()),
                None => trace!(from, to, "No mailbox registered, message dropped"),
            }
        }
    }
}
