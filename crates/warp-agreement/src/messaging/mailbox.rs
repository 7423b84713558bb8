//! Inbound queues for agreement sites

use std::collections::VecDeque;
use std::sync::Weak;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use super::{Message, MeshRouter, Subject};
use crate::types::SiteId;

/// Message delivery as seen by one site.
///
/// Sends are fire-and-forget. Receives filter on [`Subject`]; messages of
/// other subjects stay queued in arrival order for a later receive.
pub trait Mailbox: Send + Sync {
    /// Site owning this mailbox
    fn site_id(&self) -> SiteId;

    /// Send a copy of `message` to every destination
    fn send(&self, destinations: &[SiteId], message: Message);

    /// Wait up to `timeout` for the oldest message matching `subjects`.
    /// An empty filter matches every subject.
    fn recv_blocking(&self, subjects: &[Subject], timeout: Duration) -> Option<Message>;

    /// Oldest matching message without waiting
    fn recv(&self, subjects: &[Subject]) -> Option<Message> {
        self.recv_blocking(subjects, Duration::ZERO)
    }

    /// Append to this site's own inbound queue
    fn deliver(&self, message: Message);

    /// Re-inject at the head of this site's own inbound queue
    fn deliver_front(&self, message: Message);
}

fn matches(subjects: &[Subject], message: &Message) -> bool {
    subjects.is_empty() || subjects.contains(&message.subject())
}

/// In-process mailbox: a FIFO with push-front re-injection, optionally
/// attached to a [`MeshRouter`] for outbound delivery
pub struct LocalMailbox {
    site_id: SiteId,
    inbox: Mutex<VecDeque<Message>>,
    arrived: Condvar,
    router: Weak<MeshRouter>,
}

impl LocalMailbox {
    /// Mailbox with no outbound route; sends are dropped
    pub fn detached(site_id: SiteId) -> Self {
        Self::with_router(site_id, Weak::new())
    }

    pub(crate) fn with_router(site_id: SiteId, router: Weak<MeshRouter>) -> Self {
        Self {
            site_id,
            inbox: Mutex::new(VecDeque::new()),
            arrived: Condvar::new(),
            router,
        }
    }

    /// Messages waiting in the inbox
    pub fn len(&self) -> usize {
        self.inbox.lock().len()
    }

    /// Whether the inbox is empty
    pub fn is_empty(&self) -> bool {
        self.inbox.lock().is_empty()
    }

    fn take_first(inbox: &mut VecDeque<Message>, subjects: &[Subject]) -> Option<Message> {
        let pos = inbox.iter().position(|m| matches(subjects, m))?;
        inbox.remove(pos)
    }
}

impl Mailbox for LocalMailbox {
    fn site_id(&self) -> SiteId {
        self.site_id
    }

    fn send(&self, destinations: &[SiteId], message: Message) {
        match self.router.upgrade() {
            Some(router) => router.route(self.site_id, destinations, &message),
            None => trace!(site = self.site_id, ?destinations, "Detached mailbox dropped send"),
        }
    }

    fn recv_blocking(&self, subjects: &[Subject], timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        let mut inbox = self.inbox.lock();
        loop {
            if let Some(message) = Self::take_first(&mut inbox, subjects) {
                return Some(message);
            }
            if self.arrived.wait_until(&mut inbox, deadline).timed_out() {
                return Self::take_first(&mut inbox, subjects);
            }
        }
    }

    fn deliver(&self, message: Message) {
        self.inbox.lock().push_back(message);
        self.arrived.notify_all();
    }

    fn deliver_front(&self, message: Message) {
        self.inbox.lock().push_front(message);
        self.arrived.notify_all();
    }
}
