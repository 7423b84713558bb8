//! Restricted priority queue
//!
//! Transactions leave the queue smallest id first, and a write leaves only
//! once every known initiator has been heard from at or beyond its id
//! (ordering) and, with the safety gate on, once its initiator has
//! reported it committed everywhere (safety).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, trace};

use crate::messaging::{HeartbeatResponse, Mailbox, Message};
use crate::types::{SiteId, TxnId, TxnIdDisplay, UNKNOWN_TXN_ID};

/// Release state of the queue head
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Head may be released
    Unblocked,
    /// Nothing queued
    BlockedEmpty,
    /// Some initiator has not been heard from up to the head's id
    BlockedOrdering,
    /// Head's initiator has not confirmed it safe
    BlockedSafety,
    /// Shut down; never leaves this state
    BlockedClosed,
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unblocked => "unblocked",
            Self::BlockedEmpty => "blocked_empty",
            Self::BlockedOrdering => "blocked_ordering",
            Self::BlockedSafety => "blocked_safety",
            Self::BlockedClosed => "blocked_closed",
        };
        f.write_str(name)
    }
}

/// A queued transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderableTransaction {
    /// Globally unique, totally ordered id
    pub txn_id: TxnId,
    /// Site that created the transaction
    pub initiator: SiteId,
    /// Read-only transactions skip the ordering and safety gates
    pub read_only: bool,
}

impl OrderableTransaction {
    /// A write transaction
    pub fn new(txn_id: TxnId, initiator: SiteId) -> Self {
        Self {
            txn_id,
            initiator,
            read_only: false,
        }
    }

    /// A read-only transaction
    pub fn read_only(txn_id: TxnId, initiator: SiteId) -> Self {
        Self {
            txn_id,
            initiator,
            read_only: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InitiatorState {
    last_seen: TxnId,
    last_safe: TxnId,
}

impl Default for InitiatorState {
    fn default() -> Self {
        Self {
            last_seen: UNKNOWN_TXN_ID,
            last_safe: UNKNOWN_TXN_ID,
        }
    }
}

/// Globally ordered release queue gated by per-initiator watermarks
pub struct RestrictedPriorityQueue {
    site_id: SiteId,
    mailbox: Arc<dyn Mailbox>,
    use_safety: bool,
    queue: BTreeMap<TxnId, OrderableTransaction>,
    initiators: BTreeMap<SiteId, InitiatorState>,
    /// Smallest last-seen id over known initiators
    newest_candidate: TxnId,
    state: QueueState,
}

impl RestrictedPriorityQueue {
    /// Create a queue tracking `initiators`, none heard from yet
    pub fn new(
        site_id: SiteId,
        initiators: impl IntoIterator<Item = SiteId>,
        mailbox: Arc<dyn Mailbox>,
        use_safety: bool,
    ) -> Self {
        let mut queue = Self {
            site_id,
            mailbox,
            use_safety,
            queue: BTreeMap::new(),
            initiators: initiators
                .into_iter()
                .map(|site| (site, InitiatorState::default()))
                .collect(),
            newest_candidate: UNKNOWN_TXN_ID,
            state: QueueState::BlockedEmpty,
        };
        queue.recompute_newest_candidate();
        queue
    }

    /// Record traffic from `initiator`, raising its watermarks.
    ///
    /// Returns the initiator's newest seen id, or `UNKNOWN_TXN_ID` if the
    /// initiator is not tracked (its data is dropped).
    pub fn note_transaction_received_and_return_last_seen(
        &mut self,
        initiator: SiteId,
        txn_id: TxnId,
        is_heartbeat: bool,
        last_safe_txn_id: TxnId,
    ) -> TxnId {
        let Some(lid) = self.initiators.get_mut(&initiator) else {
            trace!(site = self.site_id, initiator, txn_id, "Dropping traffic from unknown initiator");
            return UNKNOWN_TXN_ID;
        };
        lid.last_seen = lid.last_seen.max(txn_id);
        lid.last_safe = lid.last_safe.max(last_safe_txn_id);
        let last_seen = lid.last_seen;
        trace!(
            site = self.site_id,
            initiator,
            txn_id,
            is_heartbeat,
            last_safe = lid.last_safe,
            "Noted initiator traffic"
        );

        self.recompute_newest_candidate();
        self.check_queue_state();
        last_seen
    }

    /// Queue a transaction; false if its initiator is not tracked or the
    /// queue is closed
    pub fn add(&mut self, txn: OrderableTransaction) -> bool {
        if self.state == QueueState::BlockedClosed {
            return false;
        }
        if !self.initiators.contains_key(&txn.initiator) {
            debug!(
                site = self.site_id,
                initiator = txn.initiator,
                txn = %TxnIdDisplay(txn.txn_id),
                "Dropping transaction from unknown initiator"
            );
            return false;
        }
        if self.queue.contains_key(&txn.txn_id) {
            debug!(site = self.site_id, txn = %TxnIdDisplay(txn.txn_id), "Dropping duplicate transaction");
            return false;
        }
        self.queue.insert(txn.txn_id, txn);
        self.check_queue_state();
        true
    }

    /// Head transaction if it may be released
    pub fn peek(&mut self) -> Option<&OrderableTransaction> {
        if self.check_queue_state() != QueueState::Unblocked {
            return None;
        }
        self.queue.values().next()
    }

    /// Remove and return the head transaction if it may be released
    pub fn poll(&mut self) -> Option<OrderableTransaction> {
        if self.check_queue_state() != QueueState::Unblocked {
            return None;
        }
        let (_, txn) = self.queue.pop_first()?;
        self.check_queue_state();
        Some(txn)
    }

    /// Stop waiting on a failed initiator
    pub fn got_fault_for_initiator(&mut self, initiator: SiteId) {
        self.note_transaction_received_and_return_last_seen(initiator, TxnId::MAX, true, TxnId::MAX);
        self.initiators.remove(&initiator);
        self.recompute_newest_candidate();
        let state = self.check_queue_state();
        info!(site = self.site_id, initiator, %state, "Initiator faulted out of ordering");
    }

    /// Drop a queued transaction
    pub fn fault_transaction(&mut self, txn_id: TxnId) -> Option<OrderableTransaction> {
        let removed = self.queue.remove(&txn_id);
        if removed.is_some() {
            debug!(site = self.site_id, txn = %TxnIdDisplay(txn_id), "Faulted queued transaction");
            self.check_queue_state();
        }
        removed
    }

    /// Start tracking `initiator` if it is not tracked yet
    pub fn ensure_initiator_is_known(&mut self, initiator: SiteId) {
        if self.initiators.contains_key(&initiator) {
            return;
        }
        self.initiators.insert(initiator, InitiatorState::default());
        self.recompute_newest_candidate();
        self.check_queue_state();
        debug!(site = self.site_id, initiator, "Tracking new initiator");
    }

    /// Newest id `initiator` has confirmed safe
    pub fn get_newest_safe_transaction_for_initiator(&self, initiator: SiteId) -> Option<TxnId> {
        self.initiators.get(&initiator).map(|lid| lid.last_safe)
    }

    /// Newest id seen from `initiator`
    pub fn last_seen(&self, initiator: SiteId) -> Option<TxnId> {
        self.initiators.get(&initiator).map(|lid| lid.last_seen)
    }

    pub fn get_queue_state(&self) -> QueueState {
        self.state
    }

    pub fn newest_candidate(&self) -> TxnId {
        self.newest_candidate
    }

    /// Close the queue for good
    pub fn shutdown(&mut self) {
        self.state = QueueState::BlockedClosed;
        info!(site = self.site_id, queued = self.queue.len(), "Ordering queue closed");
    }

    /// Point from which a recovering site can take over ordering, once
    /// every initiator has been heard from
    pub fn safe_to_recover(&mut self) -> Option<TxnId> {
        if self
            .initiators
            .values()
            .any(|lid| lid.last_seen == UNKNOWN_TXN_ID)
        {
            return None;
        }
        match self.check_queue_state() {
            QueueState::BlockedEmpty => Some(self.newest_candidate),
            QueueState::Unblocked => self.queue.keys().next().copied(),
            QueueState::BlockedOrdering | QueueState::BlockedSafety | QueueState::BlockedClosed => None,
        }
    }

    /// Queued transactions, smallest id first
    pub fn iter(&self) -> impl Iterator<Item = &OrderableTransaction> {
        self.queue.values()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn recompute_newest_candidate(&mut self) {
        self.newest_candidate = self
            .initiators
            .values()
            .map(|lid| lid.last_seen)
            .min()
            .unwrap_or(TxnId::MAX);
    }

    fn check_queue_state(&mut self) -> QueueState {
        if self.state == QueueState::BlockedClosed {
            return self.state;
        }

        let next = match self.queue.values().next() {
            None => QueueState::BlockedEmpty,
            Some(head) if head.read_only => QueueState::Unblocked,
            Some(head) if head.txn_id > self.newest_candidate => QueueState::BlockedOrdering,
            Some(head) => match self.initiators.get(&head.initiator) {
                Some(lid) if self.use_safety && head.txn_id > lid.last_safe => {
                    if self.state != QueueState::BlockedSafety {
                        self.request_safety(head.initiator, lid.last_seen);
                    }
                    QueueState::BlockedSafety
                }
                _ => QueueState::Unblocked,
            },
        };

        if next != self.state {
            trace!(site = self.site_id, from = %self.state, to = %next, "Queue state change");
        }
        self.state = next;
        next
    }

    /// Nudge a head initiator that has not confirmed safety yet
    fn request_safety(&self, initiator: SiteId, last_seen: TxnId) {
        self.mailbox.send(
            &[initiator],
            Message::HeartbeatResponse(HeartbeatResponse {
                source_site: self.site_id,
                last_received_txn_id: last_seen,
                blocked: true,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::ScriptedMailbox;
    use proptest::prelude::*;

    const SELF: SiteId = 0;
    const X: SiteId = 1;
    const Y: SiteId = 2;

    fn queue(use_safety: bool) -> (Arc<ScriptedMailbox>, RestrictedPriorityQueue) {
        let mailbox = Arc::new(ScriptedMailbox::new(SELF));
        let queue = RestrictedPriorityQueue::new(SELF, [X, Y], mailbox.clone(), use_safety);
        (mailbox, queue)
    }

    #[test]
    fn test_empty_queue_is_blocked() {
        let (_, mut q) = queue(true);
        assert_eq!(q.get_queue_state(), QueueState::BlockedEmpty);
        assert!(q.peek().is_none());
        assert!(q.poll().is_none());
        assert_eq!(q.newest_candidate(), UNKNOWN_TXN_ID);
    }

    #[test]
    fn test_ordering_then_safety_gate() {
        let (mailbox, mut q) = queue(true);

        q.note_transaction_received_and_return_last_seen(X, 100, false, UNKNOWN_TXN_ID);
        assert!(q.add(OrderableTransaction::new(100, X)));
        assert_eq!(q.get_queue_state(), QueueState::BlockedOrdering);

        q.note_transaction_received_and_return_last_seen(Y, 50, false, 0);
        assert_eq!(q.newest_candidate(), 50);
        assert_eq!(q.get_queue_state(), QueueState::BlockedOrdering);

        q.note_transaction_received_and_return_last_seen(Y, 150, true, 100);
        assert_eq!(q.newest_candidate(), 100);
        assert_eq!(q.get_queue_state(), QueueState::BlockedSafety);
        assert!(q.poll().is_none());

        let sent = mailbox.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destinations, vec![X]);
        assert_eq!(
            sent[0].message,
            Message::HeartbeatResponse(HeartbeatResponse {
                source_site: SELF,
                last_received_txn_id: 100,
                blocked: true,
            })
        );

        q.note_transaction_received_and_return_last_seen(X, 120, true, 100);
        assert_eq!(q.get_queue_state(), QueueState::Unblocked);
        assert_eq!(q.poll(), Some(OrderableTransaction::new(100, X)));
        assert_eq!(q.get_queue_state(), QueueState::BlockedEmpty);
        assert_eq!(mailbox.sent().len(), 1);
    }

    #[test]
    fn test_safety_gate_reads_head_initiator_only() {
        let (_mailbox, mut q) = queue(true);
        q.note_transaction_received_and_return_last_seen(X, 100, false, 40);
        q.add(OrderableTransaction::new(100, X));

        q.note_transaction_received_and_return_last_seen(Y, 500, true, 500);
        assert_eq!(q.newest_candidate(), 100);
        assert_eq!(q.get_queue_state(), QueueState::BlockedSafety);
        assert_eq!(q.get_newest_safe_transaction_for_initiator(X), Some(40));
        assert!(q.poll().is_none());

        q.note_transaction_received_and_return_last_seen(X, 110, true, 100);
        assert_eq!(q.poll(), Some(OrderableTransaction::new(100, X)));
    }

    #[test]
    fn test_without_safety_gate() {
        let (mailbox, mut q) = queue(false);
        q.note_transaction_received_and_return_last_seen(X, 100, false, UNKNOWN_TXN_ID);
        q.add(OrderableTransaction::new(100, X));
        q.note_transaction_received_and_return_last_seen(Y, 150, true, UNKNOWN_TXN_ID);
        assert_eq!(q.poll(), Some(OrderableTransaction::new(100, X)));
        assert!(mailbox.sent().is_empty());
    }

    #[test]
    fn test_watermarks_never_decrease() {
        let (_, mut q) = queue(true);
        assert_eq!(q.note_transaction_received_and_return_last_seen(X, 100, false, 90), 100);
        assert_eq!(q.note_transaction_received_and_return_last_seen(X, 80, true, 10), 100);
        assert_eq!(q.last_seen(X), Some(100));
        assert_eq!(q.get_newest_safe_transaction_for_initiator(X), Some(90));
    }

    #[test]
    fn test_unknown_initiator_is_dropped() {
        let (_, mut q) = queue(true);
        assert_eq!(
            q.note_transaction_received_and_return_last_seen(7, 10, false, 10),
            UNKNOWN_TXN_ID
        );
        assert!(!q.add(OrderableTransaction::new(10, 7)));
        assert!(q.is_empty());
        assert_eq!(q.get_newest_safe_transaction_for_initiator(7), None);
    }

    #[test]
    fn test_read_only_bypasses_gates() {
        let (_, mut q) = queue(true);
        q.add(OrderableTransaction::read_only(5, X));
        q.add(OrderableTransaction::new(6, X));
        assert_eq!(q.poll(), Some(OrderableTransaction::read_only(5, X)));
        assert_eq!(q.get_queue_state(), QueueState::BlockedOrdering);
    }

    #[test]
    fn test_releases_smallest_first() {
        let (_, mut q) = queue(false);
        q.add(OrderableTransaction::new(30, Y));
        q.add(OrderableTransaction::new(10, X));
        q.add(OrderableTransaction::new(20, Y));
        assert!(!q.add(OrderableTransaction::new(20, Y)));
        q.note_transaction_received_and_return_last_seen(X, 40, true, 40);
        q.note_transaction_received_and_return_last_seen(Y, 40, true, 40);

        let released: Vec<TxnId> = std::iter::from_fn(|| q.poll()).map(|t| t.txn_id).collect();
        assert_eq!(released, vec![10, 20, 30]);
    }

    #[test]
    fn test_fault_unblocks_ordering() {
        let (_, mut q) = queue(true);
        q.note_transaction_received_and_return_last_seen(X, 100, false, 100);
        q.add(OrderableTransaction::new(100, X));
        assert_eq!(q.get_queue_state(), QueueState::BlockedOrdering);

        q.got_fault_for_initiator(Y);
        assert_eq!(q.newest_candidate(), 100);
        assert_eq!(q.get_queue_state(), QueueState::Unblocked);
        assert_eq!(q.last_seen(Y), None);
    }

    #[test]
    fn test_fault_unblocks_safety() {
        let (_, mut q) = queue(true);
        q.note_transaction_received_and_return_last_seen(X, 100, false, 100);
        q.note_transaction_received_and_return_last_seen(Y, 100, false, 0);
        q.add(OrderableTransaction::new(90, Y));
        assert_eq!(q.get_queue_state(), QueueState::BlockedSafety);

        q.got_fault_for_initiator(Y);
        assert_eq!(q.get_queue_state(), QueueState::Unblocked);
        assert_eq!(q.poll().map(|t| t.txn_id), Some(90));
    }

    #[test]
    fn test_fault_transaction() {
        let (_, mut q) = queue(true);
        q.add(OrderableTransaction::new(10, X));
        assert_eq!(q.fault_transaction(10), Some(OrderableTransaction::new(10, X)));
        assert_eq!(q.fault_transaction(10), None);
        assert_eq!(q.get_queue_state(), QueueState::BlockedEmpty);
    }

    #[test]
    fn test_new_initiator_blocks_until_heard() {
        let (_, mut q) = queue(false);
        q.note_transaction_received_and_return_last_seen(X, 50, true, 50);
        q.note_transaction_received_and_return_last_seen(Y, 50, true, 50);
        q.add(OrderableTransaction::new(40, X));
        assert_eq!(q.get_queue_state(), QueueState::Unblocked);

        q.ensure_initiator_is_known(3);
        assert_eq!(q.get_queue_state(), QueueState::BlockedOrdering);
        q.ensure_initiator_is_known(3);
        q.note_transaction_received_and_return_last_seen(3, 45, true, 45);
        assert_eq!(q.poll().map(|t| t.txn_id), Some(40));
    }

    #[test]
    fn test_safe_to_recover() {
        let (_, mut q) = queue(true);
        assert_eq!(q.safe_to_recover(), None);

        q.note_transaction_received_and_return_last_seen(X, 70, true, 70);
        assert_eq!(q.safe_to_recover(), None);

        q.note_transaction_received_and_return_last_seen(Y, 60, true, 60);
        assert_eq!(q.safe_to_recover(), Some(60));

        q.add(OrderableTransaction::new(65, X));
        assert_eq!(q.safe_to_recover(), None);

        q.add(OrderableTransaction::new(55, Y));
        assert_eq!(q.safe_to_recover(), Some(55));
    }

    #[test]
    fn test_shutdown_is_terminal() {
        let (_, mut q) = queue(false);
        q.note_transaction_received_and_return_last_seen(X, 50, true, 50);
        q.note_transaction_received_and_return_last_seen(Y, 50, true, 50);
        q.add(OrderableTransaction::new(40, X));
        q.shutdown();

        assert_eq!(q.get_queue_state(), QueueState::BlockedClosed);
        assert!(q.poll().is_none());
        assert!(!q.add(OrderableTransaction::new(41, X)));
        q.note_transaction_received_and_return_last_seen(X, 60, true, 60);
        assert_eq!(q.get_queue_state(), QueueState::BlockedClosed);
        assert_eq!(q.safe_to_recover(), None);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Note { initiator: SiteId, txn_id: TxnId, last_safe: TxnId },
        Add { initiator: SiteId, txn_id: TxnId, read_only: bool },
        Poll,
        Fault { initiator: SiteId },
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        let site = prop_oneof![Just(X), Just(Y), Just(3)];
        prop_oneof![
            (site.clone(), 0..200i64, 0..200i64).prop_map(|(initiator, txn_id, last_safe)| Op::Note {
                initiator,
                txn_id,
                last_safe,
            }),
            (site.clone(), 0..200i64, any::<bool>()).prop_map(|(initiator, txn_id, read_only)| Op::Add {
                initiator,
                txn_id,
                read_only,
            }),
            Just(Op::Poll),
            site.prop_map(|initiator| Op::Fault { initiator }),
        ]
    }

    proptest! {
        #[test]
        fn prop_poll_respects_watermarks(ops in prop::collection::vec(arb_op(), 1..80)) {
            let mailbox = Arc::new(ScriptedMailbox::new(SELF));
            let mut q = RestrictedPriorityQueue::new(SELF, [X, Y, 3], mailbox, true);

            for op in ops {
                match op {
                    Op::Note { initiator, txn_id, last_safe } => {
                        q.note_transaction_received_and_return_last_seen(initiator, txn_id, false, last_safe);
                    }
                    Op::Add { initiator, txn_id, read_only } => {
                        let txn = OrderableTransaction { txn_id, initiator, read_only };
                        q.add(txn);
                    }
                    Op::Poll => {
                        let candidate = q.newest_candidate();
                        let safe: BTreeMap<SiteId, TxnId> = [X, Y, 3]
                            .into_iter()
                            .filter_map(|s| q.get_newest_safe_transaction_for_initiator(s).map(|t| (s, t)))
                            .collect();
                        if let Some(txn) = q.poll() {
                            if !txn.read_only {
                                prop_assert!(txn.txn_id <= candidate);
                                if let Some(&last_safe) = safe.get(&txn.initiator) {
                                    prop_assert!(txn.txn_id <= last_safe);
                                }
                            }
                        }
                    }
                    Op::Fault { initiator } => q.got_fault_for_initiator(initiator),
                }
            }
        }
    }
}
