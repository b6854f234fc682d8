use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::{debug, error};

use crate::storage::blob::Blob;
use crate::storage::edges;
use crate::storage::{Graph, GraphState};
use crate::types::{BlobIndex, Result, StrataError, TimeSlice};

const MAX_FINDINGS: usize = 32;

/// Which structural property a report covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyCheck {
    /// Every edge is referenced from both ends and every reference points back.
    DoubleLinking,
    /// Time slices grow along the tx chain and instance lifetimes are ordered.
    ChronologicalOrder,
}

/// Indicates the severity level of a verification finding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifySeverity {
    /// Suspicious but tolerated, such as a wall clock running backwards.
    Warning,
    /// The graph violates a structural invariant.
    Error,
}

/// Represents a single issue discovered during verification.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyFinding {
    /// Whether the finding fails the check.
    pub severity: VerifySeverity,
    /// Record the finding is about.
    pub index: i32,
    /// Human-readable description of the issue.
    pub message: String,
}

/// Statistics collected during the verification process.
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyCounts {
    /// Records inspected.
    pub records: u64,
    /// Edge-like records, including relations.
    pub edges: u64,
    /// Edge-list references inspected.
    pub edge_refs: u64,
    /// Non-delegate tx markers found.
    pub tx_markers: u64,
}

/// Complete report of a verification operation.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyReport {
    /// Check the report covers.
    pub check: VerifyCheck,
    /// Whether verification found no errors. Warnings do not count.
    pub success: bool,
    /// At most 32 findings; later ones are dropped.
    pub findings: Vec<VerifyFinding>,
    /// What the check looked at.
    pub counts: VerifyCounts,
}

struct Findings {
    list: Vec<VerifyFinding>,
    errors: usize,
}

impl Findings {
    fn new() -> Self {
        Self {
            list: Vec::new(),
            errors: 0,
        }
    }

    fn push(&mut self, severity: VerifySeverity, index: BlobIndex, message: impl Into<String>) {
        if severity == VerifySeverity::Error {
            self.errors += 1;
        }
        if self.list.len() < MAX_FINDINGS {
            self.list.push(VerifyFinding {
                severity,
                index: index.0,
                message: message.into(),
            });
        }
    }

    fn error(&mut self, index: BlobIndex, message: impl Into<String>) {
        self.push(VerifySeverity::Error, index, message);
    }

    fn into_report(self, check: VerifyCheck, counts: VerifyCounts) -> VerifyReport {
        VerifyReport {
            check,
            success: self.errors == 0,
            findings: self.list,
            counts,
        }
    }
}

/// Records visible to the caller, decoded once.
fn load_records(graph: &Graph, state: &GraphState) -> Result<Vec<(BlobIndex, Blob)>> {
    let hi = graph.visible_head(state);
    let store = state.store();
    store
        .indices(BlobIndex::ROOT, hi)?
        .into_iter()
        .map(|index| Ok((index, store.blob(index)?)))
        .collect()
}

/// Checks that every edge record sits in the edge list of its source as `+index`
/// and of its target as `-index`, and that every list entry names an edge whose
/// matching end is the list's holder.
pub fn verify_double_linking(graph: &Graph) -> Result<VerifyReport> {
    let state = graph.read();
    let store = state.store();
    let records = load_records(graph, &state)?;
    let mut findings = Findings::new();
    let mut counts = VerifyCounts::default();

    let ends: HashMap<BlobIndex, (BlobIndex, BlobIndex)> = records
        .iter()
        .filter_map(|(index, blob)| blob.source_target().map(|st| (*index, st)))
        .collect();
    let mut listed: HashSet<(BlobIndex, i32)> = HashSet::new();

    for (index, blob) in &records {
        counts.records += 1;
        if matches!(blob, Blob::DeferredEdgeList(_)) || blob.blob_type().edge_segment_at().is_none() {
            continue;
        }
        for signed in edges::edge_refs(store, *index)? {
            counts.edge_refs += 1;
            if !listed.insert((*index, signed)) {
                findings.error(*index, format!("reference {signed} listed twice"));
                continue;
            }
            let Ok(edge) = edges::referenced(*index, signed) else {
                findings.error(*index, format!("reference {signed} cannot name a record"));
                continue;
            };
            match ends.get(&edge) {
                None => findings.error(*index, format!("reference {signed} does not name an edge record")),
                Some(&(source, target)) => {
                    let end = if signed > 0 { source } else { target };
                    if end != *index {
                        findings.error(*index, format!("reference {signed} names an edge whose end is {end}"));
                    }
                }
            }
        }
    }

    for (index, blob) in &records {
        match blob {
            Blob::DeferredEdgeList(list) => {
                if !edges::deferred_chain(store, list.first_blob)?.contains(index) {
                    findings.error(*index, format!("deferred list is not chained from {}", list.first_blob));
                }
            }
            _ => {
                let Some((source, target)) = blob.source_target() else {
                    continue;
                };
                counts.edges += 1;
                if !listed.contains(&(source, index.0)) {
                    findings.error(*index, format!("missing +{index} in the edge list of {source}"));
                }
                if !listed.contains(&(target, -index.0)) {
                    findings.error(*index, format!("missing -{index} in the edge list of {target}"));
                }
            }
        }
    }

    let report = findings.into_report(VerifyCheck::DoubleLinking, counts);
    debug!(success = report.success, edges = report.counts.edges, "admin.verify.double_linking");
    Ok(report)
}

/// Checks that tx markers carry strictly increasing time slices along the tx chain,
/// that instance lifetimes agree with the instantiation and termination edges that
/// produced them, and that lifetime events appear in every instance and delegate
/// edge list with non-decreasing slices.
pub fn verify_chronological_order(graph: &Graph) -> Result<VerifyReport> {
    let state = graph.read();
    let store = state.store();
    let records = load_records(graph, &state)?;
    let by_index: HashMap<BlobIndex, &Blob> = records.iter().map(|(i, b)| (*i, b)).collect();
    let mut findings = Findings::new();
    let mut counts = VerifyCounts::default();

    let mut next_tx: HashMap<BlobIndex, BlobIndex> = HashMap::new();
    let mut delegates: HashSet<BlobIndex> = HashSet::new();
    for (_, blob) in &records {
        counts.records += 1;
        match blob {
            Blob::NextTx(link) => {
                if next_tx.insert(link.source, link.target).is_some() {
                    findings.error(link.source, "tx marker has two successors");
                }
            }
            Blob::ToDelegate(link) => {
                delegates.insert(link.target);
            }
            _ => {}
        }
    }
    let mut tx_slices: HashMap<BlobIndex, TimeSlice> = HashMap::new();
    tx_slices.insert(BlobIndex::ROOT, TimeSlice(0));
    for (index, blob) in &records {
        if let Blob::TxEvent(tx) = blob {
            if !delegates.contains(index) {
                counts.tx_markers += 1;
                tx_slices.insert(*index, tx.time_slice);
            }
        }
    }

    // The chain from the root must visit every marker with growing slices.
    let mut cursor = BlobIndex::ROOT;
    let (mut last_slice, mut last_time) = (TimeSlice(0), i64::MIN);
    let mut visited = 0u64;
    while let Some(&next) = next_tx.get(&cursor) {
        let Some(Blob::TxEvent(tx)) = by_index.get(&next).copied() else {
            findings.error(next, "tx chain leads to a record that is not a tx marker");
            break;
        };
        if tx.time_slice <= last_slice {
            findings.error(next, format!("time slice {} does not follow {}", tx.time_slice, last_slice));
        }
        if tx.time.0 < last_time {
            findings.push(VerifySeverity::Warning, next, "wall clock runs backwards");
        }
        (last_slice, last_time) = (tx.time_slice, tx.time.0);
        visited += 1;
        if visited > counts.tx_markers {
            findings.error(next, "tx chain loops");
            break;
        }
        cursor = next;
    }
    if visited != counts.tx_markers {
        findings.error(
            BlobIndex::ROOT,
            format!("{} of {} tx markers are reachable from the root", visited, counts.tx_markers),
        );
    }

    let instance_of = |rae: BlobIndex| match by_index.get(&rae) {
        Some(Blob::RaeInstance(link)) => Some(link.target),
        _ => None,
    };
    let mut instantiated: HashMap<BlobIndex, u32> = HashMap::new();
    for (index, blob) in &records {
        let (link, terminating) = match blob {
            Blob::Instantiation(link) => (link, false),
            Blob::Termination(link) => (link, true),
            _ => continue,
        };
        let Some(&slice) = tx_slices.get(&link.source) else {
            findings.error(*index, format!("source {} is not a tx marker", link.source));
            continue;
        };
        let Some(instance) = instance_of(link.target) else {
            findings.error(*index, format!("target {} is not an RAE instance edge", link.target));
            continue;
        };
        let Some((inst, term)) = by_index.get(&instance).and_then(|b| b.lifetime()) else {
            findings.error(*index, format!("{instance} is not an instance record"));
            continue;
        };
        if terminating {
            if term != slice {
                findings.error(instance, format!("termination slice {term} differs from its tx slice {slice}"));
            }
        } else {
            *instantiated.entry(instance).or_default() += 1;
            if inst != slice {
                findings.error(instance, format!("instantiation slice {inst} differs from its tx slice {slice}"));
            }
        }
    }

    // Lifetime events sit in the holder's edge list in the order they happened.
    for (index, blob) in &records {
        let delegate_events = match blob {
            Blob::RaeInstance(_) => false,
            Blob::ToDelegate(_) => true,
            _ => continue,
        };
        let mut last = TimeSlice(0);
        for signed in edges::edge_refs(store, *index)? {
            let Ok(event) = edges::referenced(*index, signed) else {
                continue;
            };
            let link = match (by_index.get(&event).copied(), delegate_events) {
                (Some(Blob::Instantiation(link) | Blob::Termination(link)), false) => link,
                (Some(Blob::DelegateInstantiation(link) | Blob::DelegateRetirement(link)), true) => link,
                _ => continue,
            };
            let Some(&slice) = tx_slices.get(&link.source) else {
                continue;
            };
            if slice < last {
                findings.error(*index, format!("event {event} at slice {slice} is listed after slice {last}"));
            }
            last = last.max(slice);
        }
    }

    for (index, blob) in &records {
        let Some((inst, term)) = blob.lifetime() else {
            continue;
        };
        if delegates.contains(index) {
            continue;
        }
        if term.0 != 0 && term <= inst {
            findings.error(*index, format!("terminated at {term}, not after instantiation at {inst}"));
        }
        if instantiated.get(index).copied().unwrap_or(0) != 1 {
            findings.error(*index, "instance needs exactly one instantiation edge");
        }
    }

    let report = findings.into_report(VerifyCheck::ChronologicalOrder, counts);
    debug!(
        success = report.success,
        tx_markers = report.counts.tx_markers,
        "admin.verify.chronological_order"
    );
    Ok(report)
}

/// Runs both checks and turns the first failure into a
/// [`StrataError::StructuralViolation`].
pub fn ensure_valid(graph: &Graph) -> Result<()> {
    for report in [verify_double_linking(graph)?, verify_chronological_order(graph)?] {
        if report.success {
            continue;
        }
        let first = report
            .findings
            .iter()
            .find(|f| f.severity == VerifySeverity::Error);
        let (index, reason) = match first {
            Some(f) => (BlobIndex(f.index), f.message.clone()),
            None => (BlobIndex::ROOT, "verification failed".to_owned()),
        };
        error!(check = ?report.check, index = index.0, reason = %reason, "admin.verify.failed");
        return Err(StrataError::StructuralViolation { index, reason });
    }
    Ok(())
}
