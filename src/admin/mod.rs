#![forbid(unsafe_code)]

//! Structural verification of a graph.
//!
//! Both checks scan the records visible to the caller once and compare them
//! against maps built up front, so they run in time linear in the graph size.

mod verify;

/// Graph integrity verification.
///
/// Reports list up to 32 findings and are serializable for tooling.
pub use verify::{
    ensure_valid, verify_chronological_order, verify_double_linking, VerifyCheck, VerifyCounts, VerifyFinding,
    VerifyReport, VerifySeverity,
};
