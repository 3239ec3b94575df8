//! # Plexus Verifier
//!
//! Property-based verification and fuzz-testing harness for the Plexus
//! ledger's state transitions. Two cooperating duties:
//!
//! - **Invariant verification**: scan ledger storage and assert a catalog of
//!   structural and numeric invariants across subnets, accounts and
//!   delegation graphs ([`invariants`]).
//! - **Contract fuzzing**: drive randomized, parameterized state-mutating
//!   operations through a fixed precondition -> action -> postcondition
//!   pipeline and verify each produced exactly the expected state delta
//!   ([`contracts`]).
//!
//! Both sides share the numeric primitives in `plexus_common` (fixed-point
//! decoding, tolerance comparison, seeded sampling) and reach the chain only
//! through the [`client`] traits. Checks are point-in-time: the harness keeps
//! no state across runs and detects violations at the block it scanned, not
//! in real time.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use plexus_verifier::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = VerifierConfig::default();
//!     let engine = default_engine();
//!     let report = engine.run_all(&ledger, &config.tolerance).await;
//!     assert!(report.passed());
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]

/// Ledger query/mutation traits and wire types
pub mod client;
/// Verifier and tolerance configuration
pub mod config;
/// Transactional contract framework
pub mod contracts;
/// Invariant engine and rule catalog
pub mod invariants;
/// Append-only run journal
pub mod journal;
/// Paged storage scanning
pub mod scanner;
/// Point-in-time storage snapshots
pub mod snapshot;

// Convenient re-exports for common usage
pub mod prelude;

pub use invariants::{default_engine, InvariantEngine, InvariantReport, Violation};

/// Harness version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
