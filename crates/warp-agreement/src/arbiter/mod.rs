//! Membership arbitration
//!
//! When sites suspect each other of failure, every surviving site runs the
//! same deterministic protocol and removes the same set of sites, each
//! with the newest transaction known safe from it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                   MeshArbiter                        │
//! ├──────────────────────────────────────────────────────┤
//! │  fault reports ──▶ Discard ──▶ in-trouble map        │
//! │                                    │                 │
//! │  peer views ─────────────┐         ▼                 │
//! │  relayed views ──────────┼──▶ AgreementSeeker        │
//! │                          │    (reported/dead/alive)  │
//! │                          │         │                 │
//! │                          │         ▼                 │
//! │                          │  ArbitrationStrategy      │
//! │                          │    (kill set)             │
//! │                          ▼         │                 │
//! │                   safe-point ledger ◀┘               │
//! │                          │                           │
//! │                          ▼                           │
//! │              decision exchange ──▶ Reconfiguration   │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Strategies
//!
//! - `MatchingCardinality`: only witnessed failures shrink the survivor
//!   set; the kill set is the smallest eviction that makes every witness
//!   set equal the quorum
//! - `NoQuarter`: any report shrinks the survivor set; every reported site
//!   is killed once all survivors report it

mod discard;
mod mesh;
mod seeker;
mod strategy;

pub use discard::{Discard, DiscardContext};
pub use mesh::{MeshAide, MeshArbiter, Reconfiguration};
pub use seeker::{AgreementSeeker, Scenario, SiteGraph};
pub use strategy::ArbitrationStrategy;
