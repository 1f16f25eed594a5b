//! Routing Engine
//!
//! Picks the (instance, model) pair best suited to a request, or explains
//! why none fits.
//!
//! # Algorithm
//!
//! ```text
//! snapshot ──► capable pairs ──► healthy, not excluded ──► within budget ──► score ──► rank
//!                  │                      │                       │
//!                  ▼                      ▼                       ▼
//!           NoCapableModel       NoHealthyInstance         BudgetExceeded
//! ```
//!
//! - **Capable**: the instance advertises the model, the model matches the
//!   explicit model (if any), its tier matches the requested tier (if any)
//!   and its tags intersect the required tags (if any)
//! - **Score**: `locality bonus + warm bonus - load penalty - latency penalty`
//! - **Rank**: score descending, then load ascending, then instance identity
//!
//! Routing is a pure function of the snapshot, the capability model and the
//! request. It takes no locks and performs no I/O.

mod config;
mod policy;
mod scoring;

pub use config::{RoutingConfig, ScoringWeights};
pub use policy::{
    Infeasibility, Rejection, RoutingDecision, RoutingEngine, RoutingRequest, ScoredCandidate,
};
pub use scoring::{Candidate, CandidateScorer, ScoreBreakdown, ScoringContext, WeightedScorer};
