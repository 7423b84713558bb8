//! Messages exchanged between agreement sites
//!
//! Transport and wire encoding live outside this crate; messages are plain
//! serde-derivable values handed to a [`Mailbox`].

mod mailbox;
mod router;
#[cfg(test)]
mod script;

pub use mailbox::{LocalMailbox, Mailbox};
pub use router::MeshRouter;
#[cfg(test)]
pub(crate) use script::{ScriptedMailbox, SentMessage};

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::{SiteId, SiteSet, TxnId};

/// Message category used to filter blocking receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Subject {
    /// Locally raised or relayed failure suspicion
    Failure,
    /// A peer's failure view or decision
    SiteFailureUpdate,
    /// A peer's failure view relayed by a third site
    SiteFailureForward,
    /// Ordering keep-alive
    Heartbeat,
    /// Receipt confirmation for heartbeats and transactions
    HeartbeatResponse,
    /// Globally ordered transaction (task or join)
    Transaction,
    /// Recovery cut-point negotiation
    Recovery,
}

/// Subjects the arbiter consumes while an episode is in flight
pub const ARBITRATION_SUBJECTS: [Subject; 3] = [
    Subject::Failure,
    Subject::SiteFailureUpdate,
    Subject::SiteFailureForward,
];

/// Suspicion that a site has failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultMessage {
    /// Site suspected of failure
    pub failed_site: SiteId,
    /// Reporter observed the failure directly
    pub witnessed: bool,
    /// Site raising the suspicion
    pub reporting_site: SiteId,
    /// Reporter's survivor view; empty for locally raised faults
    pub survivors: SiteSet,
}

impl FaultMessage {
    /// Fault raised by this site's own failure detector
    pub fn local(reporting_site: SiteId, failed_site: SiteId, witnessed: bool) -> Self {
        Self {
            failed_site,
            witnessed,
            reporting_site,
            survivors: SiteSet::new(),
        }
    }

    /// Fault implied by another site's view
    pub fn relayed(reporting_site: SiteId, failed_site: SiteId, survivors: SiteSet) -> Self {
        Self {
            failed_site,
            witnessed: !survivors.contains(&failed_site),
            reporting_site,
            survivors,
        }
    }
}

/// A site's view of an in-flight failure episode, optionally carrying its decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteFailureMessage {
    /// Site whose view this is
    pub source_site: SiteId,
    /// Sites the source still considers alive
    pub survivors: SiteSet,
    /// Sites the source has in trouble
    pub failed_sites: SiteSet,
    /// Kill set decided by the source; empty while still seeking
    pub decision: SiteSet,
    /// Newest safe transaction id the source holds per failed site
    pub safe_txn_ids: BTreeMap<SiteId, TxnId>,
}

impl SiteFailureMessage {
    /// Whether this message announces a decision
    pub fn is_decision(&self) -> bool {
        !self.decision.is_empty()
    }

    /// One relayed fault per failed site in this view
    pub fn faults(&self) -> impl Iterator<Item = FaultMessage> + '_ {
        self.failed_sites
            .iter()
            .map(|&failed| FaultMessage::relayed(self.source_site, failed, self.survivors.clone()))
    }

    /// Whether this view carries at least as much failure knowledge as `other`
    pub fn supersedes(&self, other: &SiteFailureMessage) -> bool {
        self.failed_sites.len() >= other.failed_sites.len()
    }
}

/// Another site's view relayed unmodified
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteFailureForwardMessage {
    /// Site relaying the view
    pub forwarding_site: SiteId,
    /// The relayed view; `view.source_site` is the original reporter
    pub view: SiteFailureMessage,
}

impl SiteFailureForwardMessage {
    /// Original reporter of the relayed view
    pub fn reporting_site(&self) -> SiteId {
        self.view.source_site
    }
}

/// Ordering keep-alive from an initiator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Initiator
    pub source_site: SiteId,
    /// Freshly issued id; nothing older will follow from this initiator
    pub txn_id: TxnId,
    /// Newest id the initiator knows every site has received
    pub last_safe_txn_id: TxnId,
}

/// Executor's confirmation of what it has received from an initiator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// Executing site
    pub source_site: SiteId,
    /// Newest id the executor has seen from the recipient
    pub last_received_txn_id: TxnId,
    /// Executor is waiting on the recipient's safety watermark
    pub blocked: bool,
}

/// Replicated operation to run in global order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgreementTask {
    /// Initiator
    pub source_site: SiteId,
    /// Id fixing the position in the global order
    pub txn_id: TxnId,
    /// Initiator's safety watermark at send time
    pub last_safe_txn_id: TxnId,
    /// Skips ordering and safety gating
    pub read_only: bool,
    /// Opaque operation body
    pub payload: Bytes,
}

/// Ordered request to add a site to the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Initiator
    pub source_site: SiteId,
    /// Id fixing the position in the global order
    pub txn_id: TxnId,
    /// Initiator's safety watermark at send time
    pub last_safe_txn_id: TxnId,
    /// Site being admitted
    pub joining_site: SiteId,
}

/// Recovery cut-point negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryMessage {
    /// Rejoining site asks to recover from `txn_id`
    Request {
        /// Rejoining site
        source_site: SiteId,
        /// Proposed cut-point
        txn_id: TxnId,
    },
    /// Source site names the cut-point its snapshot will reflect
    Point {
        /// Source site
        source_site: SiteId,
        /// Selected cut-point
        txn_id: TxnId,
    },
}

/// Every message an agreement site sends or receives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Fault(FaultMessage),
    SiteFailure(SiteFailureMessage),
    SiteFailureForward(SiteFailureForwardMessage),
    Heartbeat(Heartbeat),
    HeartbeatResponse(HeartbeatResponse),
    Task(AgreementTask),
    Join(JoinRequest),
    Recovery(RecoveryMessage),
}

impl Message {
    /// Subject used for receive filtering
    pub fn subject(&self) -> Subject {
        match self {
            Message::Fault(_) => Subject::Failure,
            Message::SiteFailure(_) => Subject::SiteFailureUpdate,
            Message::SiteFailureForward(_) => Subject::SiteFailureForward,
            Message::Heartbeat(_) => Subject::Heartbeat,
            Message::HeartbeatResponse(_) => Subject::HeartbeatResponse,
            Message::Task(_) | Message::Join(_) => Subject::Transaction,
            Message::Recovery(_) => Subject::Recovery,
        }
    }

    /// Site that produced the message
    pub fn source_site(&self) -> SiteId {
        match self {
            Message::Fault(m) => m.reporting_site,
            Message::SiteFailure(m) => m.source_site,
            Message::SiteFailureForward(m) => m.forwarding_site,
            Message::Heartbeat(m) => m.source_site,
            Message::HeartbeatResponse(m) => m.source_site,
            Message::Task(m) => m.source_site,
            Message::Join(m) => m.source_site,
            Message::Recovery(RecoveryMessage::Request { source_site, .. })
            | Message::Recovery(RecoveryMessage::Point { source_site, .. }) => *source_site,
        }
    }
}
