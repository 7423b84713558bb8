//! Deterministic mailbox for unit tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use super::{Mailbox, Message, Subject};
use crate::types::SiteId;

/// Consecutive empty polls tolerated before a scripted run is declared stuck
const IDLE_POLL_LIMIT: usize = 10_000;

/// A message recorded by [`ScriptedMailbox::send`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    /// Destinations in the order given
    pub destinations: Vec<SiteId>,
    /// Message sent
    pub message: Message,
}

/// Mailbox that replays a fixed inbound script and records everything sent.
///
/// Script entries are either messages or explicit timeouts. A blocking
/// receive consumes a leading timeout; a zero-timeout poll stops at it.
/// Otherwise a receive takes the first message matching the filter that
/// appears before the next timeout. Receives never block.
pub struct ScriptedMailbox {
    site_id: SiteId,
    script: Mutex<VecDeque<Option<Message>>>,
    sent: Mutex<Vec<SentMessage>>,
    redelivered: Mutex<Vec<Message>>,
    blocking_receives: AtomicUsize,
    idle_polls: AtomicUsize,
}

impl ScriptedMailbox {
    /// Empty script for `site_id`
    pub fn new(site_id: SiteId) -> Self {
        Self {
            site_id,
            script: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            redelivered: Mutex::new(Vec::new()),
            blocking_receives: AtomicUsize::new(0),
            idle_polls: AtomicUsize::new(0),
        }
    }

    /// Append a message to the script
    pub fn push(&self, message: Message) -> &Self {
        self.script.lock().push_back(Some(message));
        self
    }

    /// Append a receive timeout to the script
    pub fn push_timeout(&self) -> &Self {
        self.script.lock().push_back(None);
        self
    }

    /// Everything sent so far
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    /// Drain the record of sent messages
    pub fn take_sent(&self) -> Vec<SentMessage> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Messages passed to `deliver_front`
    pub fn redelivered(&self) -> Vec<Message> {
        self.redelivered.lock().clone()
    }

    /// Receives issued with a non-zero timeout
    pub fn blocking_receives(&self) -> usize {
        self.blocking_receives.load(Ordering::Relaxed)
    }

    /// Entries not yet consumed
    pub fn remaining(&self) -> usize {
        self.script.lock().len()
    }
}

impl Mailbox for ScriptedMailbox {
    fn site_id(&self) -> SiteId {
        self.site_id
    }

    fn send(&self, destinations: &[SiteId], message: Message) {
        self.sent.lock().push(SentMessage {
            destinations: destinations.to_vec(),
            message,
        });
    }

    fn recv_blocking(&self, subjects: &[Subject], timeout: Duration) -> Option<Message> {
        let blocking = !timeout.is_zero();
        if blocking {
            self.blocking_receives.fetch_add(1, Ordering::Relaxed);
        }
        let mut script = self.script.lock();
        if blocking && matches!(script.front(), Some(None)) {
            script.pop_front();
            self.idle_polls.store(0, Ordering::Relaxed);
            return None;
        }
        let found = script
            .iter()
            .take_while(|entry| entry.is_some())
            .position(|entry| {
                entry
                    .as_ref()
                    .is_some_and(|m| subjects.is_empty() || subjects.contains(&m.subject()))
            });
        match found.and_then(|pos| script.remove(pos)).flatten() {
            Some(message) => {
                self.idle_polls.store(0, Ordering::Relaxed);
                Some(message)
            }
            None => {
                let idle = self.idle_polls.fetch_add(1, Ordering::Relaxed) + 1;
                assert!(
                    idle < IDLE_POLL_LIMIT,
                    "site {} polled an exhausted script {} times; remaining {:?}",
                    self.site_id,
                    idle,
                    script
                );
                None
            }
        }
    }

    fn deliver(&self, message: Message) {
        self.script.lock().push_back(Some(message));
    }

    fn deliver_front(&self, message: Message) {
        self.redelivered.lock().push(message.clone());
        self.script.lock().push_front(Some(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::FaultMessage;

    fn fault(failed: SiteId) -> Message {
        Message::Fault(FaultMessage::local(0, failed, true))
    }

    #[test]
    fn test_replays_script_with_timeouts() {
        let mailbox = ScriptedMailbox::new(0);
        mailbox.push(fault(1)).push_timeout().push(fault(2));

        assert_eq!(mailbox.recv_blocking(&[], Duration::from_millis(5)), Some(fault(1)));
        assert_eq!(mailbox.recv_blocking(&[], Duration::from_millis(5)), None);
        assert_eq!(mailbox.recv(&[Subject::Failure]), Some(fault(2)));
        assert_eq!(mailbox.blocking_receives(), 2);
        assert_eq!(mailbox.remaining(), 0);
    }

    #[test]
    fn test_filter_does_not_cross_timeouts() {
        let mailbox = ScriptedMailbox::new(0);
        mailbox.push_timeout().push(fault(1));
        assert_eq!(mailbox.recv(&[Subject::Failure]), None);
        assert_eq!(mailbox.remaining(), 2);
        assert_eq!(mailbox.recv_blocking(&[Subject::Heartbeat], Duration::from_millis(5)), None);
        assert_eq!(mailbox.recv(&[Subject::Heartbeat]), None);
        assert_eq!(mailbox.recv(&[Subject::Failure]), Some(fault(1)));
    }

    #[test]
    fn test_deliver_front_is_recorded() {
        let mailbox = ScriptedMailbox::new(0);
        mailbox.push(fault(1));
        mailbox.deliver_front(fault(2));
        assert_eq!(mailbox.redelivered(), vec![fault(2)]);
        assert_eq!(mailbox.recv(&[]), Some(fault(2)));
    }

    #[test]
    #[should_panic(expected = "exhausted script")]
    fn test_exhausted_script_panics() {
        let mailbox = ScriptedMailbox::new(0);
        loop {
            mailbox.recv(&[]);
        }
    }
}
