//! Global transaction ordering
//!
//! [`RestrictedPriorityQueue`] releases transactions in one order shared by
//! every site; [`TxnIdSafetyState`] tracks how far each site has confirmed
//! receipt so heartbeats can tell initiators what is safe.

mod queue;
mod safety;

pub use queue::{OrderableTransaction, QueueState, RestrictedPriorityQueue};
pub use safety::TxnIdSafetyState;
