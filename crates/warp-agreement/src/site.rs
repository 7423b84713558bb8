//! Per-site agreement runtime
//!
//! [`AgreementSite`] owns one site's mailbox, ordering queue, safety
//! watermark and mesh arbiter, and is stepped by its host with
//! [`AgreementSite::run_once`]. Each step:
//!
//! 1. drains the inbound queue (ordering traffic, faults, recovery)
//! 2. sends heartbeats to the mesh once `heartbeat_interval` has elapsed
//! 3. hands every releasable transaction to the [`TransactionExecutor`]
//!
//! A fault blocks the step until the arbiter decides or restarts.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, error, info, trace, warn};
use warp_config::{AgreementConfig, SiteConfig, Validate};

use crate::arbiter::{MeshAide, MeshArbiter, Reconfiguration};
use crate::error::{AgreementError, Result};
use crate::messaging::{
    AgreementTask, Heartbeat, HeartbeatResponse, JoinRequest, Mailbox, Message, RecoveryMessage,
};
use crate::ordering::{OrderableTransaction, QueueState, RestrictedPriorityQueue, TxnIdSafetyState};
use crate::types::{SiteId, SiteSet, TxnId, TxnIdDisplay, TxnIdGenerator, UNKNOWN_TXN_ID};

/// A transaction released in global order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderedTransaction {
    /// Replicated operation
    Task(AgreementTask),
    /// Mesh membership change
    Join(JoinRequest),
}

impl OrderedTransaction {
    pub fn txn_id(&self) -> TxnId {
        match self {
            Self::Task(task) => task.txn_id,
            Self::Join(join) => join.txn_id,
        }
    }

    pub fn initiator(&self) -> SiteId {
        match self {
            Self::Task(task) => task.source_site,
            Self::Join(join) => join.source_site,
        }
    }

    fn orderable(&self) -> OrderableTransaction {
        match self {
            Self::Task(task) => OrderableTransaction {
                txn_id: task.txn_id,
                initiator: task.source_site,
                read_only: task.read_only,
            },
            Self::Join(join) => OrderableTransaction::new(join.txn_id, join.source_site),
        }
    }
}

/// Receives released transactions and membership changes
pub trait TransactionExecutor {
    /// Run a transaction; called in the same order on every site
    fn execute(&mut self, txn: &OrderedTransaction);

    /// Sites removed by arbitration, with the newest transaction kept from each
    fn sites_failed(&mut self, decision: &BTreeMap<SiteId, TxnId>) {
        let _ = decision;
    }
}

/// Send one heartbeat per destination, each with a fresh id
fn send_heartbeats(
    site_id: SiteId,
    mailbox: &dyn Mailbox,
    safety: &TxnIdSafetyState,
    ids: &mut TxnIdGenerator,
    destinations: &SiteSet,
) {
    for &dest in destinations {
        let heartbeat = Heartbeat {
            source_site: site_id,
            txn_id: ids.next_id(),
            last_safe_txn_id: safety.get_newest_safe_txn_id_for_executor_by_site_id(dest),
        };
        mailbox.send(&[dest], Message::Heartbeat(heartbeat));
    }
}

/// Site services lent to the arbiter for the duration of a round
struct SiteAide<'a> {
    site_id: SiteId,
    mailbox: &'a dyn Mailbox,
    queue: &'a RestrictedPriorityQueue,
    safety: &'a TxnIdSafetyState,
    ids: &'a mut TxnIdGenerator,
}

impl MeshAide for SiteAide<'_> {
    fn send_heartbeats(&mut self, destinations: &SiteSet) {
        send_heartbeats(self.site_id, self.mailbox, self.safety, self.ids, destinations);
    }

    fn newest_safe_transaction_for_initiator(&self, initiator: SiteId) -> TxnId {
        self.queue
            .get_newest_safe_transaction_for_initiator(initiator)
            .unwrap_or(UNKNOWN_TXN_ID)
    }
}

/// One site of the agreement mesh
pub struct AgreementSite<E> {
    site_id: SiteId,
    config: SiteConfig,
    mailbox: Arc<dyn Mailbox>,
    mesh: SiteSet,
    queue: RestrictedPriorityQueue,
    safety: TxnIdSafetyState,
    arbiter: MeshArbiter,
    ids: TxnIdGenerator,
    /// Queued transaction bodies
    transactions_by_id: BTreeMap<TxnId, OrderedTransaction>,
    last_heartbeat: Option<Instant>,
    /// Cut-point proposed to a recovery source, awaiting its answer
    pending_recovery: Option<TxnId>,
    /// Transactions at or below this id are covered by a recovered snapshot
    min_txn_id_after_recovery: Option<TxnId>,
    executor: E,
    closed: bool,
}

impl<E: TransactionExecutor> AgreementSite<E> {
    /// Create a site from validated configuration
    pub fn new(config: &AgreementConfig, mailbox: Arc<dyn Mailbox>, executor: E) -> Result<Self> {
        config.validate()?;
        let site_id = config.site.site_id;
        let mesh: SiteSet = config.site.mesh.iter().copied().collect();
        let queue = RestrictedPriorityQueue::new(
            site_id,
            mesh.iter().copied(),
            Arc::clone(&mailbox),
            config.site.use_safety_gate,
        );
        let safety = TxnIdSafetyState::new(site_id, mesh.iter().copied());
        let arbiter = MeshArbiter::new(site_id, Arc::clone(&mailbox), config.arbiter.clone());

        info!(site = site_id, ?mesh, strategy = ?config.arbiter.strategy, "Agreement site started");
        Ok(Self {
            site_id,
            config: config.site.clone(),
            mailbox,
            mesh,
            queue,
            safety,
            arbiter,
            ids: TxnIdGenerator::new(site_id),
            transactions_by_id: BTreeMap::new(),
            last_heartbeat: None,
            pending_recovery: None,
            min_txn_id_after_recovery: None,
            executor,
            closed: false,
        })
    }

    pub fn site_id(&self) -> SiteId {
        self.site_id
    }

    /// Current mesh
    pub fn mesh(&self) -> &SiteSet {
        &self.mesh
    }

    pub fn queue_state(&self) -> QueueState {
        self.queue.get_queue_state()
    }

    /// Whether a failure episode is unresolved
    pub fn is_in_arbitration(&self) -> bool {
        self.arbiter.is_in_arbitration()
    }

    pub fn newest_globally_safe_txn_id(&self) -> TxnId {
        self.safety.get_newest_globally_safe_txn_id()
    }

    pub fn min_txn_id_after_recovery(&self) -> Option<TxnId> {
        self.min_txn_id_after_recovery
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn executor_mut(&mut self) -> &mut E {
        &mut self.executor
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// One step of the site loop; returns the number of transactions released
    pub fn run_once(&mut self) -> Result<usize> {
        if self.closed {
            return Err(AgreementError::Closed);
        }

        let step = self.step();
        if let Err(e) = &step {
            if e.is_fatal() {
                error!(site = self.site_id, error = %e, "Fatal agreement error, closing site");
                self.shutdown();
            }
        }
        step
    }

    fn step(&mut self) -> Result<usize> {
        self.drain()?;
        self.maybe_send_heartbeats();
        self.release()
    }

    /// Order a replicated operation; returns its transaction id
    pub fn propose(&mut self, payload: Bytes, read_only: bool) -> Result<TxnId> {
        if self.closed {
            return Err(AgreementError::Closed);
        }
        let task = AgreementTask {
            source_site: self.site_id,
            txn_id: self.ids.next_id(),
            last_safe_txn_id: self.safety.get_newest_globally_safe_txn_id(),
            read_only,
            payload,
        };
        let txn_id = task.txn_id;
        trace!(site = self.site_id, txn = %TxnIdDisplay(txn_id), read_only, "Proposing task");
        self.broadcast(Message::Task(task));
        Ok(txn_id)
    }

    /// Order the admission of `joining_site` into the mesh
    pub fn request_join(&mut self, joining_site: SiteId) -> Result<TxnId> {
        if self.closed {
            return Err(AgreementError::Closed);
        }
        let join = JoinRequest {
            source_site: self.site_id,
            txn_id: self.ids.next_id(),
            last_safe_txn_id: self.safety.get_newest_globally_safe_txn_id(),
            joining_site,
        };
        info!(site = self.site_id, joining_site, txn = %TxnIdDisplay(join.txn_id), "Requesting join");
        self.broadcast(Message::Join(join));
        Ok(join.txn_id)
    }

    /// Ask `source` to agree on a recovery cut-point. None until this site
    /// has heard from every initiator and is not blocked.
    pub fn request_recovery(&mut self, source: SiteId) -> Result<Option<TxnId>> {
        if self.closed {
            return Err(AgreementError::Closed);
        }
        if !self.mesh.contains(&source) {
            return Err(AgreementError::UnknownInitiator(source));
        }
        let Some(proposed) = self.queue.safe_to_recover() else {
            return Ok(None);
        };
        self.pending_recovery = Some(proposed);
        info!(site = self.site_id, source, proposed = %TxnIdDisplay(proposed), "Proposing recovery cut-point");
        self.mailbox.send(
            &[source],
            Message::Recovery(RecoveryMessage::Request {
                source_site: self.site_id,
                txn_id: proposed,
            }),
        );
        Ok(Some(proposed))
    }

    /// Stop releasing transactions for good
    pub fn shutdown(&mut self) {
        if !self.closed {
            self.closed = true;
            self.queue.shutdown();
            info!(site = self.site_id, "Agreement site shut down");
        }
    }

    fn broadcast(&self, message: Message) {
        let destinations: Vec<SiteId> = self.mesh.iter().copied().collect();
        self.mailbox.send(&destinations, message);
    }

    fn drain(&mut self) -> Result<()> {
        let mut next = self.mailbox.recv_blocking(&[], self.config.receive_timeout);
        while let Some(message) = next {
            self.handle(message)?;
            if self.closed {
                break;
            }
            next = self.mailbox.recv(&[]);
        }
        Ok(())
    }

    fn handle(&mut self, message: Message) -> Result<()> {
        let source = message.source_site();
        let admission = matches!(message, Message::Join(_) | Message::Recovery(RecoveryMessage::Request { .. }));
        if !admission && !self.mesh.contains(&source) {
            debug!(site = self.site_id, source, subject = ?message.subject(), "Dropping message from outside the mesh");
            return Ok(());
        }
        match message {
            Message::Heartbeat(heartbeat) => self.handle_heartbeat(heartbeat),
            Message::HeartbeatResponse(response) => self.handle_heartbeat_response(response),
            Message::Task(task) => self.enqueue(OrderedTransaction::Task(task)),
            Message::Join(join) => self.enqueue(OrderedTransaction::Join(join)),
            Message::Recovery(recovery) => return self.handle_recovery(recovery),
            failure @ (Message::Fault(_)
            | Message::SiteFailure(_)
            | Message::SiteFailureForward(_)) => return self.handle_failure(failure),
        }
        Ok(())
    }

    fn handle_heartbeat(&mut self, heartbeat: Heartbeat) {
        let last_seen = self.queue.note_transaction_received_and_return_last_seen(
            heartbeat.source_site,
            heartbeat.txn_id,
            true,
            heartbeat.last_safe_txn_id,
        );
        if last_seen == UNKNOWN_TXN_ID {
            return;
        }
        self.mailbox.send(
            &[heartbeat.source_site],
            Message::HeartbeatResponse(HeartbeatResponse {
                source_site: self.site_id,
                last_received_txn_id: last_seen,
                blocked: false,
            }),
        );
    }

    fn handle_heartbeat_response(&mut self, response: HeartbeatResponse) {
        self.safety
            .update_last_seen_txn_id_from_executor_by_site_id(response.source_site, response.last_received_txn_id);
        if response.blocked && self.mesh.contains(&response.source_site) {
            trace!(site = self.site_id, executor = response.source_site, "Executor blocked on safety, sending heartbeat");
            let destinations: SiteSet = [response.source_site].into_iter().collect();
            send_heartbeats(self.site_id, &*self.mailbox, &self.safety, &mut self.ids, &destinations);
        }
    }

    fn enqueue(&mut self, txn: OrderedTransaction) {
        let txn_id = txn.txn_id();
        if self.transactions_by_id.contains_key(&txn_id) {
            debug!(site = self.site_id, txn = %TxnIdDisplay(txn_id), "Dropping duplicate transaction");
            return;
        }
        let last_safe = match &txn {
            OrderedTransaction::Task(task) => task.last_safe_txn_id,
            OrderedTransaction::Join(join) => join.last_safe_txn_id,
        };
        self.queue
            .note_transaction_received_and_return_last_seen(txn.initiator(), txn_id, false, last_safe);
        if self.queue.add(txn.orderable()) {
            self.transactions_by_id.insert(txn_id, txn);
        }
    }

    fn handle_recovery(&mut self, message: RecoveryMessage) -> Result<()> {
        match message {
            RecoveryMessage::Request { source_site, txn_id } => {
                let selected = self
                    .queue
                    .safe_to_recover()
                    .map_or(txn_id, |own| own.max(txn_id));
                info!(site = self.site_id, rejoining = source_site, proposed = txn_id, selected, "Answering recovery request");
                self.mailbox.send(
                    &[source_site],
                    Message::Recovery(RecoveryMessage::Point {
                        source_site: self.site_id,
                        txn_id: selected,
                    }),
                );
            }
            RecoveryMessage::Point { source_site, txn_id } => {
                let Some(proposed) = self.pending_recovery else {
                    debug!(site = self.site_id, source_site, "Ignoring unsolicited recovery point");
                    return Ok(());
                };
                if txn_id < proposed {
                    error!(site = self.site_id, source_site, proposed, selected = txn_id, "Recovery point moved backward");
                    return Err(AgreementError::RecoveryPointRegressed {
                        proposed,
                        selected: txn_id,
                    });
                }
                self.pending_recovery = None;
                self.min_txn_id_after_recovery = Some(txn_id);
                info!(site = self.site_id, source_site, cut_point = %TxnIdDisplay(txn_id), "Recovery cut-point agreed");
            }
        }
        Ok(())
    }

    fn handle_failure(&mut self, message: Message) -> Result<()> {
        let mut aide = SiteAide {
            site_id: self.site_id,
            mailbox: &*self.mailbox,
            queue: &self.queue,
            safety: &self.safety,
            ids: &mut self.ids,
        };
        let reconfiguration = self
            .arbiter
            .reconfigure_on_message(&self.mesh, message, &mut aide)?;

        if !reconfiguration.unknown_sites.is_empty() {
            warn!(site = self.site_id, unknown = ?reconfiguration.unknown_sites, "Fault reported for sites outside the mesh");
        }
        if reconfiguration.is_decided() {
            self.apply_decision(&reconfiguration);
        }
        Ok(())
    }

    fn apply_decision(&mut self, reconfiguration: &Reconfiguration) {
        for (&failed, &safe_txn_id) in &reconfiguration.decision {
            self.mesh.remove(&failed);
            self.safety.remove_state(failed);
            self.queue.got_fault_for_initiator(failed);

            let doomed: Vec<TxnId> = self
                .queue
                .iter()
                .filter(|txn| txn.initiator == failed && txn.txn_id > safe_txn_id)
                .filter(|txn| {
                    !matches!(self.transactions_by_id.get(&txn.txn_id), Some(OrderedTransaction::Join(_)))
                })
                .map(|txn| txn.txn_id)
                .collect();
            for txn_id in &doomed {
                self.queue.fault_transaction(*txn_id);
                self.transactions_by_id.remove(txn_id);
            }
            info!(
                site = self.site_id,
                failed,
                safe_txn_id,
                faulted = doomed.len(),
                "Removed failed site"
            );
        }
        self.executor.sites_failed(&reconfiguration.decision);
    }

    fn maybe_send_heartbeats(&mut self) {
        let due = self
            .last_heartbeat
            .map_or(true, |at| at.elapsed() >= self.config.heartbeat_interval);
        if !due {
            return;
        }
        send_heartbeats(self.site_id, &*self.mailbox, &self.safety, &mut self.ids, &self.mesh);
        self.last_heartbeat = Some(Instant::now());
    }

    fn release(&mut self) -> Result<usize> {
        let mut released = 0;
        while let Some(txn) = self.queue.poll() {
            let ordered = self.transactions_by_id.remove(&txn.txn_id).ok_or_else(|| {
                AgreementError::Invariant(format!("released txn {} has no body", txn.txn_id))
            })?;

            if self
                .min_txn_id_after_recovery
                .is_some_and(|floor| txn.txn_id <= floor)
            {
                trace!(site = self.site_id, txn = %TxnIdDisplay(txn.txn_id), "Skipping transaction covered by recovery");
                continue;
            }

            if let OrderedTransaction::Join(join) = &ordered {
                self.admit_site(join.joining_site);
            }
            self.executor.execute(&ordered);
            released += 1;
        }
        Ok(released)
    }

    fn admit_site(&mut self, site: SiteId) {
        if self.mesh.insert(site) {
            self.safety.add_state(site);
            self.queue.ensure_initiator_is_known(site);
            info!(site = self.site_id, joined = site, mesh = ?self.mesh, "Site joined mesh");
        }
    }
}
