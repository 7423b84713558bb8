//! Membership Arbitration and Global Ordering for warp clusters
//!
//! When sites suspect each other of failure, every surviving site agrees on
//! exactly which sites are dead and on the newest transaction kept from
//! each. Independently, transactions are released for execution in one
//! global order that every surviving replica observes.
//!
//! # Key Components
//!
//! - **Witness graph** ([`AgreementSeeker`]): who reported, witnessed or
//!   vouches for whom during a failure episode
//! - **Arbitration strategy** ([`ArbitrationStrategy`]): turns the witness
//!   graph into survivors and a deterministic kill set
//! - **Mesh arbiter** ([`MeshArbiter`]): exchanges views with the
//!   survivors and confirms the decision
//! - **Ordering queue** ([`RestrictedPriorityQueue`]): releases transactions
//!   behind ordering and safety watermarks
//! - **Safety watermark** ([`TxnIdSafetyState`]): newest transaction
//!   confirmed by every site
//! - **Site runtime** ([`AgreementSite`]): one site's loop tying these
//!   together over a [`Mailbox`]

pub mod arbiter;
pub mod error;
pub mod messaging;
pub mod ordering;
pub mod site;
pub mod types;

pub use arbiter::{
    AgreementSeeker, ArbitrationStrategy, Discard, MeshAide, MeshArbiter, Reconfiguration,
    Scenario, SiteGraph,
};
pub use error::{AgreementError, Result};
pub use messaging::{
    AgreementTask, FaultMessage, Heartbeat, HeartbeatResponse, JoinRequest, LocalMailbox, Mailbox,
    MeshRouter, Message, RecoveryMessage, SiteFailureForwardMessage, SiteFailureMessage, Subject,
};
pub use ordering::{OrderableTransaction, QueueState, RestrictedPriorityQueue, TxnIdSafetyState};
pub use site::{AgreementSite, OrderedTransaction, TransactionExecutor};
pub use types::{initiator_of, SiteId, SiteSet, TxnId, TxnIdDisplay, TxnIdGenerator, UNKNOWN_TXN_ID};
