//! Error types for the agreement core

use thiserror::Error;

use crate::types::{SiteId, TxnId};

/// Agreement errors
///
/// Fatal variants mean local state contradicts what the protocol
/// guarantees; the site must stop rather than retry.
#[derive(Debug, Error)]
pub enum AgreementError {
    /// A kill decision was reached without a safe point from every survivor
    #[error("site {site}: ledger missing (reporter, failed) entries {missing:?}")]
    IncompleteLedger {
        /// Site that extracted the decision
        site: SiteId,
        /// Pairs with no ledger entry
        missing: Vec<(SiteId, SiteId)>,
    },

    /// No safe transaction id could be resolved for a killed site
    #[error("no safe transaction id resolved for failed site {failed}")]
    UnresolvedSafePoint {
        /// Killed site
        failed: SiteId,
    },

    /// Recovery cut-point selected below the one proposed
    #[error("recovery point regressed from proposed {proposed} to {selected}")]
    RecoveryPointRegressed {
        /// Cut-point the rejoining site asked for
        proposed: TxnId,
        /// Cut-point the source replied with
        selected: TxnId,
    },

    /// Internal invariant violated
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Operation referenced an initiator this site does not track
    #[error("unknown initiator: {0}")]
    UnknownInitiator(SiteId),

    /// Site has been shut down
    #[error("agreement site is closed")]
    Closed,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] warp_config::ConfigError),
}

impl AgreementError {
    /// Whether the site must abort instead of retrying
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::IncompleteLedger { .. }
                | Self::UnresolvedSafePoint { .. }
                | Self::RecoveryPointRegressed { .. }
                | Self::Invariant(_)
        )
    }
}

/// Result type for agreement operations
pub type Result<T> = std::result::Result<T, AgreementError>;
