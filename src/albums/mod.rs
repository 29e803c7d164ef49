//! Folder-derived albums.
//!
//! The builder groups media by folder key into candidate albums. The
//! reconciler compares those candidates with the stored albums and plans the
//! writes that bring the two in line. Albums without a folder key belong to
//! the user and are never touched here.

mod builder;
mod reconciler;

pub use builder::{build_candidates, Candidate, CandidateMap};
pub use reconciler::{
    apply_plan, is_default_title, majority_key, plan_reconcile, reconcile, AlbumOp,
    ReconcilePlan, ReconcileStats,
};
