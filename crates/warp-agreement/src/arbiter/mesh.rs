//! Fault-resolution protocol driver
//!
//! One call to [`MeshArbiter::reconfigure_on_fault`] runs one arbitration
//! round on the caller's thread:
//!
//! 1. drain queued fault reports and merge the accepted ones into the
//!    in-trouble map
//! 2. broadcast this site's view to the survivors
//! 3. collect peer views until every survivor has reported on every
//!    site in trouble and no relayed view is still expected
//! 4. pick the kill set and the newest safe transaction per killed site
//! 5. exchange decisions with the survivors, recomputing on dissent until
//!    a survivor set repeats
//!
//! A genuinely new fault seen during 3 or 5 is pushed back to the front
//! of the mailbox and the round returns undecided; the caller runs the
//! next round when it receives that fault again. A peer decision naming
//! this site puts the decider in trouble and reruns the round at once.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use warp_config::ArbiterConfig;

use super::discard::{Discard, DiscardContext};
use super::seeker::AgreementSeeker;
use crate::error::{AgreementError, Result};
use crate::messaging::{
    FaultMessage, Mailbox, Message, SiteFailureForwardMessage, SiteFailureMessage, Subject,
    ARBITRATION_SUBJECTS,
};
use crate::types::{SiteId, SiteSet, TxnId};

/// Services the arbiter borrows from its host while it blocks
pub trait MeshAide {
    /// Keep failure detectors on `destinations` fed while arbitration blocks
    fn send_heartbeats(&mut self, destinations: &SiteSet);

    /// Newest transaction from `initiator` this site knows is safe,
    /// `UNKNOWN_TXN_ID` if none
    fn newest_safe_transaction_for_initiator(&self, initiator: SiteId) -> TxnId;
}

/// Outcome of one arbitration round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconfiguration {
    /// Killed site → newest safe transaction id; empty when undecided
    pub decision: BTreeMap<SiteId, TxnId>,
    /// Survivors after the decision, or the current estimate when undecided
    pub survivors: SiteSet,
    /// Failed sites reported that are not part of the mesh
    pub unknown_sites: SiteSet,
    /// Times a survivor announced a different survivor set before this
    /// decision was confirmed
    pub dissent_rounds: u32,
}

impl Reconfiguration {
    pub fn is_decided(&self) -> bool {
        !self.decision.is_empty()
    }
}

enum Flow {
    Continue,
    /// A new fault was pushed back to the mailbox; give up the round
    Restart,
    /// The trouble map changed in place; run the round again now
    Rerun,
}

enum Notify {
    Confirmed,
    /// Some survivor settled on another set; recompute from the enriched graph
    Dissent,
    Restart,
    Rerun,
}

/// Drives fault arbitration for one site
pub struct MeshArbiter {
    /// This site
    site_id: SiteId,

    /// Inbound queue shared with the host
    mailbox: Arc<dyn Mailbox>,

    /// Tuning
    config: ArbiterConfig,

    /// Witness graph of the episode in flight
    seeker: AgreementSeeker,

    /// Suspected sites → witnessed by this site
    in_trouble: BTreeMap<SiteId, bool>,

    /// Sites removed by earlier decisions
    failed_sites: SiteSet,

    /// (reporter, failed) → newest safe transaction id reported
    ledger: BTreeMap<(SiteId, SiteId), TxnId>,

    /// Latest direct view per reporter, awaiting relay
    forward_candidates: BTreeMap<SiteId, SiteFailureMessage>,

    /// Survivor sets announced by peers
    decided_survivors: BTreeMap<SiteId, SiteSet>,

    /// Survivor sets this site decided during the episode
    decision_history: VecDeque<SiteSet>,
}

impl MeshArbiter {
    /// Create an arbiter for `site_id`
    pub fn new(site_id: SiteId, mailbox: Arc<dyn Mailbox>, config: ArbiterConfig) -> Self {
        let seeker = AgreementSeeker::new(config.strategy.into(), site_id);
        Self {
            site_id,
            mailbox,
            config,
            seeker,
            in_trouble: BTreeMap::new(),
            failed_sites: SiteSet::new(),
            ledger: BTreeMap::new(),
            forward_candidates: BTreeMap::new(),
            decided_survivors: BTreeMap::new(),
            decision_history: VecDeque::new(),
        }
    }

    pub fn site_id(&self) -> SiteId {
        self.site_id
    }

    /// Whether a failure episode is unresolved
    pub fn is_in_arbitration(&self) -> bool {
        !self.in_trouble.is_empty()
    }

    /// Sites removed by confirmed decisions
    pub fn failed_sites(&self) -> &SiteSet {
        &self.failed_sites
    }

    /// Suspected sites of the episode in flight
    pub fn in_trouble(&self) -> &BTreeMap<SiteId, bool> {
        &self.in_trouble
    }

    /// Run one arbitration round triggered by `fault`
    pub fn reconfigure_on_fault(
        &mut self,
        mesh: &SiteSet,
        fault: FaultMessage,
        aide: &mut dyn MeshAide,
    ) -> Result<Reconfiguration> {
        let mesh: SiteSet = mesh.difference(&self.failed_sites).copied().collect();
        let mut unknown_sites = SiteSet::new();

        let mut accepted = self.admit(&mesh, &fault, &mut unknown_sites);
        while let Some(Message::Fault(queued)) = self.mailbox.recv(&[Subject::Failure]) {
            accepted |= self.admit(&mesh, &queued, &mut unknown_sites);
        }
        if !accepted {
            return Ok(self.undecided(&mesh, unknown_sites));
        }
        self.run_round(&mesh, unknown_sites, aide)
    }

    /// Run a round triggered by a peer's failure view.
    ///
    /// Outside an episode the view must carry a failure this site accepts,
    /// otherwise it is stale and dropped. During a stalled episode the view
    /// is absorbed and the round rerun.
    pub fn reconfigure_on_message(
        &mut self,
        mesh: &SiteSet,
        message: Message,
        aide: &mut dyn MeshAide,
    ) -> Result<Reconfiguration> {
        let mesh: SiteSet = mesh.difference(&self.failed_sites).copied().collect();
        if let Message::Fault(fault) = message {
            return self.reconfigure_on_fault(&mesh, fault, aide);
        }

        if !self.is_in_arbitration() {
            let trigger = match &message {
                Message::SiteFailure(view) => self.first_new_fault(&mesh, view),
                Message::SiteFailureForward(forward) => self.first_new_fault(&mesh, &forward.view),
                _ => None,
            };
            let Some(fault) = trigger else {
                debug!(
                    site = self.site_id,
                    source = message.source_site(),
                    "Dropping failure view with nothing new"
                );
                return Ok(self.undecided(&mesh, SiteSet::new()));
            };
            self.mailbox.deliver_front(message);
            return self.reconfigure_on_fault(&mesh, fault, aide);
        }

        match self.absorb(&mesh, message) {
            Flow::Restart => Ok(self.undecided(&mesh, SiteSet::new())),
            Flow::Continue | Flow::Rerun => self.run_round(&mesh, SiteSet::new(), aide),
        }
    }

    /// Steps 2 to 5 over the current in-trouble map
    fn run_round(
        &mut self,
        mesh: &SiteSet,
        unknown_sites: SiteSet,
        aide: &mut dyn MeshAide,
    ) -> Result<Reconfiguration> {
        let mut dissent_rounds = 0;
        let (kill, decision) = 'round: loop {
            info!(site = self.site_id, in_trouble = ?self.in_trouble, "Starting arbitration round");
            self.seeker.start_seeking_for(mesh, &self.in_trouble);
            let peers = self.peers(self.seeker.survivors());
            self.broadcast(&peers, SiteSet::new(), aide);

            match self.discover_global_fault_data(mesh, aide) {
                Flow::Continue => {}
                Flow::Rerun => continue 'round,
                Flow::Restart => return Ok(self.undecided(mesh, unknown_sites)),
            }

            loop {
                let kill = self.seeker.next_kill();
                if kill.is_empty() || kill.contains(&self.site_id) {
                    info!(site = self.site_id, ?kill, "No kill decision this site can act on");
                    return Ok(self.undecided(mesh, unknown_sites));
                }

                let decision = self.extract_global_fault_data(mesh, &kill)?;
                match self.notify_on_kill(mesh, &kill, aide) {
                    Notify::Confirmed => break 'round (kill, decision),
                    Notify::Dissent => dissent_rounds += 1,
                    Notify::Rerun => continue 'round,
                    Notify::Restart => return Ok(self.undecided(mesh, unknown_sites)),
                }
            }
        };

        info!(site = self.site_id, ?decision, dissent_rounds, "Arbitration decided");
        self.failed_sites.extend(kill.iter().copied());
        self.clear_episode();
        Ok(Reconfiguration {
            decision,
            survivors: mesh.difference(&kill).copied().collect(),
            unknown_sites,
            dissent_rounds,
        })
    }

    fn undecided(&self, mesh: &SiteSet, unknown_sites: SiteSet) -> Reconfiguration {
        let survivors = if self.seeker.mesh().is_empty() {
            mesh.clone()
        } else {
            self.seeker.survivors().clone()
        };
        Reconfiguration {
            decision: BTreeMap::new(),
            survivors,
            unknown_sites,
            dissent_rounds: 0,
        }
    }

    fn clear_episode(&mut self) {
        self.seeker.clear();
        self.in_trouble.clear();
        self.ledger.clear();
        self.forward_candidates.clear();
        self.decided_survivors.clear();
        self.decision_history.clear();
    }

    fn peers(&self, sites: &SiteSet) -> Vec<SiteId> {
        sites.iter().copied().filter(|&s| s != self.site_id).collect()
    }

    fn classify(&self, mesh: &SiteSet, fault: &FaultMessage) -> Discard {
        Discard::classify(
            fault,
            &DiscardContext {
                self_site: self.site_id,
                mesh,
                failed_sites: &self.failed_sites,
                in_trouble: &self.in_trouble,
            },
        )
    }

    fn admit(&mut self, mesh: &SiteSet, fault: &FaultMessage, unknown: &mut SiteSet) -> bool {
        let discard = self.classify(mesh, fault);
        match discard {
            Discard::DoNot => {
                let witnessed = Discard::locally_witnessed(fault, self.site_id);
                let entry = self.in_trouble.entry(fault.failed_site).or_insert(false);
                *entry |= witnessed;
                debug!(site = self.site_id, failed = fault.failed_site, witnessed, "Fault accepted");
                true
            }
            Discard::Unknown => {
                unknown.insert(fault.failed_site);
                discard.log(self.site_id, fault);
                false
            }
            _ => {
                discard.log(self.site_id, fault);
                false
            }
        }
    }

    fn record_safe_txn_id(&mut self, reporter: SiteId, failed: SiteId, txn_id: TxnId) {
        let entry = self.ledger.entry((reporter, failed)).or_insert(txn_id);
        *entry = (*entry).max(txn_id);
    }

    fn broadcast(&mut self, destinations: &[SiteId], decision: SiteSet, aide: &dyn MeshAide) {
        let mut failed_sites: SiteSet = self.in_trouble.keys().copied().collect();
        failed_sites.extend(decision.iter().copied());
        let safe_txn_ids: BTreeMap<SiteId, TxnId> = failed_sites
            .iter()
            .map(|&failed| (failed, aide.newest_safe_transaction_for_initiator(failed)))
            .collect();
        for (&failed, &txn_id) in &safe_txn_ids {
            self.record_safe_txn_id(self.site_id, failed, txn_id);
        }

        let view = SiteFailureMessage {
            source_site: self.site_id,
            survivors: self.seeker.survivors().clone(),
            failed_sites,
            decision,
            safe_txn_ids,
        };
        if destinations.is_empty() {
            return;
        }
        debug!(site = self.site_id, ?destinations, ?view, "Sending failure view");
        self.mailbox.send(destinations, Message::SiteFailure(view));
    }

    /// (survivor, in-trouble) pairs with no ledger entry. A site never
    /// reports on itself.
    fn missing_ledger_entries(&self, survivors: &SiteSet, failed: &SiteSet) -> Vec<(SiteId, SiteId)> {
        survivors
            .iter()
            .flat_map(|&s| failed.iter().filter(move |&&f| f != s).map(move |&f| (s, f)))
            .filter(|pair| !self.ledger.contains_key(pair))
            .collect()
    }

    /// Step 3: gather views. `Continue` once the ledger is complete.
    fn discover_global_fault_data(&mut self, mesh: &SiteSet, aide: &mut dyn MeshAide) -> Flow {
        let mut budget = self.config.forward_budget;
        let stall_ticks = self.config.stall_log_ticks();
        let mut idle_polls: u64 = 0;

        loop {
            let troubled: SiteSet = self.in_trouble.keys().copied().collect();
            let missing = self.missing_ledger_entries(self.seeker.survivors(), &troubled);
            if missing.is_empty() && !self.seeker.need_forward_within(&mut budget) {
                break;
            }

            match self
                .mailbox
                .recv_blocking(&ARBITRATION_SUBJECTS, self.config.receive_timeout)
            {
                Some(message) => match self.absorb(mesh, message) {
                    Flow::Continue => {}
                    interrupted => return interrupted,
                },
                None => {
                    idle_polls += 1;
                    aide.send_heartbeats(mesh);
                    if idle_polls % stall_ticks == 0 {
                        info!(
                            site = self.site_id,
                            ?missing,
                            forward_budget = budget,
                            "Still waiting for peer failure views"
                        );
                        self.forward_candidates();
                    }
                }
            }
        }

        self.forward_candidates();
        Flow::Continue
    }

    /// Relay each cached view to the survivors that witnessed its reporter dead
    fn forward_candidates(&mut self) {
        let candidates = std::mem::take(&mut self.forward_candidates);
        for (reporter, view) in candidates {
            let destinations: Vec<SiteId> = self
                .seeker
                .for_whom_site_is_dead(reporter)
                .into_iter()
                .filter(|&s| s != self.site_id && s != reporter)
                .collect();
            if destinations.is_empty() {
                continue;
            }
            debug!(site = self.site_id, reporter, ?destinations, "Forwarding failure view");
            self.mailbox.send(
                &destinations,
                Message::SiteFailureForward(SiteFailureForwardMessage {
                    forwarding_site: self.site_id,
                    view,
                }),
            );
        }
    }

    fn absorb(&mut self, mesh: &SiteSet, message: Message) -> Flow {
        match message {
            Message::Fault(fault) => self.absorb_fault(mesh, fault),
            Message::SiteFailure(view) => self.absorb_view(mesh, view),
            Message::SiteFailureForward(forward) => self.absorb_forward(mesh, forward),
            other => {
                debug!(site = self.site_id, subject = ?other.subject(), "Ignoring message during arbitration");
                Flow::Continue
            }
        }
    }

    fn absorb_fault(&mut self, mesh: &SiteSet, fault: FaultMessage) -> Flow {
        let discard = self.classify(mesh, &fault);
        if !discard.is_accepted() {
            discard.log(self.site_id, &fault);
            return Flow::Continue;
        }
        if self.seeker.already_know(&fault) {
            debug!(site = self.site_id, failed = fault.failed_site, "Fault already reflected in witness graph");
            return Flow::Continue;
        }
        info!(
            site = self.site_id,
            failed = fault.failed_site,
            reporter = fault.reporting_site,
            "New fault during arbitration, restarting round"
        );
        self.mailbox.deliver_front(Message::Fault(fault));
        Flow::Restart
    }

    fn first_new_fault(&self, mesh: &SiteSet, view: &SiteFailureMessage) -> Option<FaultMessage> {
        view.faults()
            .find(|fault| self.classify(mesh, fault).is_accepted() && !self.seeker.already_know(fault))
    }

    fn record_view(&mut self, reporter: SiteId, view: &SiteFailureMessage) {
        self.seeker.add_view(reporter, view);
        for (&failed, &txn_id) in &view.safe_txn_ids {
            self.record_safe_txn_id(reporter, failed, txn_id);
        }
    }

    fn absorb_view(&mut self, mesh: &SiteSet, view: SiteFailureMessage) -> Flow {
        let source = view.source_site;
        if source == self.site_id || !mesh.contains(&source) {
            debug!(site = self.site_id, source, "Ignoring failure view from outside the mesh");
            return Flow::Continue;
        }

        if view.decision.contains(&self.site_id) {
            warn!(
                site = self.site_id,
                decider = source,
                "Peer decided this site is dead; treating it as failed"
            );
            let fault = FaultMessage::local(self.site_id, source, true);
            self.admit(mesh, &fault, &mut SiteSet::new());
            if self.in_trouble.get(&source) == Some(&true) {
                return Flow::Rerun;
            }
            return Flow::Continue;
        }

        if let Some(fault) = self.first_new_fault(mesh, &view) {
            info!(
                site = self.site_id,
                source,
                failed = fault.failed_site,
                "Peer view reports a new failure, restarting round"
            );
            self.mailbox.deliver_front(Message::SiteFailure(view));
            self.mailbox.deliver_front(Message::Fault(fault));
            return Flow::Restart;
        }

        self.record_view(source, &view);
        if view.is_decision() {
            self.decided_survivors
                .insert(source, mesh.difference(&view.decision).copied().collect());
        }
        match self.forward_candidates.get(&source) {
            Some(cached) if !view.supersedes(cached) => {}
            _ => {
                self.forward_candidates.insert(source, view);
            }
        }
        Flow::Continue
    }

    fn absorb_forward(&mut self, mesh: &SiteSet, forward: SiteFailureForwardMessage) -> Flow {
        let reporter = forward.reporting_site();
        if reporter == self.site_id
            || !mesh.contains(&reporter)
            || !mesh.contains(&forward.forwarding_site)
        {
            return Flow::Continue;
        }

        if let Some(fault) = self.first_new_fault(mesh, &forward.view) {
            info!(
                site = self.site_id,
                reporter,
                failed = fault.failed_site,
                "Relayed view reports a new failure, restarting round"
            );
            self.mailbox.deliver_front(Message::SiteFailureForward(forward));
            self.mailbox.deliver_front(Message::Fault(fault));
            return Flow::Restart;
        }

        self.record_view(reporter, &forward.view);
        Flow::Continue
    }

    /// Step 4: newest safe transaction per killed site, as reported by the mesh
    fn extract_global_fault_data(
        &self,
        mesh: &SiteSet,
        kill: &SiteSet,
    ) -> Result<BTreeMap<SiteId, TxnId>> {
        let survivors: SiteSet = mesh.difference(kill).copied().collect();
        let missing = self.missing_ledger_entries(&survivors, kill);
        if !missing.is_empty() {
            error!(site = self.site_id, ?kill, ?missing, "Kill decision without full ledger coverage");
            return Err(AgreementError::IncompleteLedger {
                site: self.site_id,
                missing,
            });
        }

        let mut safe: BTreeMap<SiteId, TxnId> = kill.iter().map(|&k| (k, TxnId::MIN)).collect();
        for (&(reporter, failed), &txn_id) in &self.ledger {
            if !mesh.contains(&reporter) {
                continue;
            }
            if let Some(newest) = safe.get_mut(&failed) {
                *newest = (*newest).max(txn_id);
            }
        }

        if let Some((&failed, _)) = safe.iter().find(|(_, &txn_id)| txn_id == TxnId::MIN) {
            error!(site = self.site_id, failed, "Safe transaction id unresolved");
            return Err(AgreementError::UnresolvedSafePoint { failed });
        }
        Ok(safe)
    }

    /// Step 5: announce the decision and wait for every survivor's
    fn notify_on_kill(&mut self, mesh: &SiteSet, kill: &SiteSet, aide: &mut dyn MeshAide) -> Notify {
        let survivors: SiteSet = mesh.difference(kill).copied().collect();
        if self.decision_history.contains(&survivors) {
            info!(
                site = self.site_id,
                ?survivors,
                "Survivor set already decided this episode, treating as converged"
            );
            return Notify::Confirmed;
        }
        self.decision_history.push_back(survivors.clone());
        while self.decision_history.len() > self.config.decision_history {
            self.decision_history.pop_front();
        }

        let expected = self.peers(&survivors);
        self.broadcast(&expected, kill.clone(), aide);

        let stall_ticks = self.config.stall_log_ticks();
        let mut idle_polls: u64 = 0;
        loop {
            let waiting: Vec<SiteId> = expected
                .iter()
                .copied()
                .filter(|s| !self.decided_survivors.contains_key(s))
                .collect();
            if waiting.is_empty() {
                break;
            }

            match self
                .mailbox
                .recv_blocking(&ARBITRATION_SUBJECTS, self.config.receive_timeout)
            {
                Some(message) => match self.absorb(mesh, message) {
                    Flow::Continue => {}
                    Flow::Restart => return Notify::Restart,
                    Flow::Rerun => return Notify::Rerun,
                },
                None => {
                    idle_polls += 1;
                    aide.send_heartbeats(mesh);
                    if idle_polls % stall_ticks == 0 {
                        info!(site = self.site_id, ?waiting, "Still waiting for peer decisions");
                    }
                }
            }
        }

        let dissent: Vec<SiteId> = expected
            .iter()
            .copied()
            .filter(|s| self.decided_survivors.get(s) != Some(&survivors))
            .collect();
        if dissent.is_empty() {
            return Notify::Confirmed;
        }
        warn!(
            site = self.site_id,
            ?dissent,
            ?survivors,
            "Peers decided different survivor sets, recomputing"
        );
        Notify::Dissent
    }
}
