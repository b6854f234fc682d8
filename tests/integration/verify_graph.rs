#![allow(missing_docs)]

use std::sync::Once;

use strata::{
    admin::{ensure_valid, verify_chronological_order, verify_double_linking, VerifyCheck, VerifySeverity},
    primitives::arena::MemArena,
    storage::{blob::Blob, layout::BlobType, Delegate, DelegateKind, Graph, GraphOptions},
    types::{BlobIndex, EntityType, RelationType, Result, StrataError, Value, ValueRepType},
};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("strata=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn busy_graph() -> Result<(Graph, BlobIndex)> {
    let graph = Graph::create(GraphOptions::new().uid_seed(41))?;
    let (a, b) = {
        let _tx = graph.begin_tx();
        let a = graph.instantiate_entity(EntityType(1), None)?;
        let b = graph.instantiate_entity(EntityType(2), None)?;
        graph.instantiate_relation(RelationType(1), a, b, None)?;
        graph.assign_tag(a, "a")?;
        (a, b)
    };
    {
        let _tx = graph.begin_tx();
        let ae = graph.instantiate_attribute_entity(ValueRepType::STRING, None)?;
        graph.assign_value_node(ae, &Value::Str("x".into()))?;
        graph.assign_value_node(ae, &Value::Str("y".into()))?;
        for _ in 0..10 {
            let c = graph.instantiate_entity(EntityType(3), None)?;
            graph.instantiate_relation(RelationType(2), a, c, None)?;
        }
        graph.assign_tag(b, "a")?;
    }
    {
        let _tx = graph.begin_tx();
        graph.terminate(b)?;
        graph.retire_delegate(&Delegate::new(1, DelegateKind::Entity(EntityType(2))))?;
    }
    Ok((graph, a))
}

fn flip_i32(image: &mut [u8], at: usize, change: impl Fn(i32) -> i32) {
    let raw: [u8; 4] = image[at..at + 4].try_into().unwrap();
    let value = change(i32::from_be_bytes(raw));
    image[at..at + 4].copy_from_slice(&value.to_be_bytes());
}

fn reopen(image: Vec<u8>) -> Result<Graph> {
    Graph::open_arena(Box::new(MemArena::from_bytes(image)), GraphOptions::new())
}

#[test]
fn healthy_graphs_pass_both_checks() -> Result<()> {
    init_tracing();
    let (graph, _) = busy_graph()?;
    let linking = verify_double_linking(&graph)?;
    assert!(linking.success, "{:?}", linking.findings);
    assert_eq!(linking.check, VerifyCheck::DoubleLinking);
    assert!(linking.counts.edge_refs > 0);

    let chronology = verify_chronological_order(&graph)?;
    assert!(chronology.success, "{:?}", chronology.findings);
    assert_eq!(chronology.counts.tx_markers, 3);
    assert!(chronology
        .findings
        .iter()
        .all(|f| f.severity == VerifySeverity::Warning));
    ensure_valid(&graph)
}

#[test]
fn flipped_edge_reference_is_reported() -> Result<()> {
    init_tracing();
    let (graph, a) = busy_graph()?;
    let mut image = graph.arena_image()?;
    let segment = BlobType::Entity.edge_segment_at().ok_or(StrataError::NotFound)?;
    flip_i32(&mut image, a.offset() + segment + 8, |r| -r);

    let broken = reopen(image)?;
    let report = verify_double_linking(&broken)?;
    assert!(!report.success);
    assert!(report
        .findings
        .iter()
        .any(|f| f.severity == VerifySeverity::Error));
    match ensure_valid(&broken) {
        Err(StrataError::StructuralViolation { index, .. }) => assert!(index >= BlobIndex::ROOT),
        other => panic!("expected a structural violation, got {other:?}"),
    }
    Ok(())
}

#[test]
fn instantiation_outside_its_tx_is_reported() -> Result<()> {
    init_tracing();
    let (graph, a) = busy_graph()?;
    let mut image = graph.arena_image()?;
    flip_i32(&mut image, a.offset() + 8, |_| 5);

    let broken = reopen(image)?;
    assert!(verify_double_linking(&broken)?.success);
    let report = verify_chronological_order(&broken)?;
    assert!(!report.success);
    assert!(report.findings.iter().any(|f| f.index == a.0));
    assert!(matches!(
        ensure_valid(&broken),
        Err(StrataError::StructuralViolation { .. })
    ));
    Ok(())
}

#[test]
fn reference_without_a_record_is_corruption() -> Result<()> {
    init_tracing();
    let (graph, a) = busy_graph()?;
    let mut image = graph.arena_image()?;
    let segment = BlobType::Entity.edge_segment_at().ok_or(StrataError::NotFound)?;
    flip_i32(&mut image, a.offset() + segment + 8, |_| i32::MIN);
    // Rebuilding the caches walks the list while looking for a to-delegate edge.
    assert!(matches!(reopen(image), Err(StrataError::Corruption(_))));
    Ok(())
}

#[test]
fn lifetime_events_listed_out_of_order_are_reported() -> Result<()> {
    init_tracing();
    let (graph, _) = busy_graph()?;
    let (termination, rae) = graph
        .indices()?
        .into_iter()
        .find_map(|index| match graph.blob(index) {
            Ok(Blob::Termination(link)) => Some((index, link.target)),
            _ => None,
        })
        .ok_or(StrataError::NotFound)?;
    let instantiation = graph
        .indices()?
        .into_iter()
        .find(|index| matches!(graph.blob(*index), Ok(Blob::Instantiation(link)) if link.target == rae))
        .ok_or(StrataError::NotFound)?;

    let refs = graph.edge_refs(rae)?;
    let position = |event: BlobIndex| refs.iter().position(|r| *r == -event.0).ok_or(StrataError::NotFound);
    let (first, second) = (position(instantiation)?, position(termination)?);
    assert!(first < second && second < 6);

    let mut image = graph.arena_image()?;
    let slots = rae.offset() + BlobType::RaeInstance.edge_segment_at().ok_or(StrataError::NotFound)? + 8;
    flip_i32(&mut image, slots + 4 * first, |_| -termination.0);
    flip_i32(&mut image, slots + 4 * second, |_| -instantiation.0);

    let broken = reopen(image)?;
    assert!(verify_double_linking(&broken)?.success);
    let report = verify_chronological_order(&broken)?;
    assert!(!report.success);
    assert!(report
        .findings
        .iter()
        .any(|f| f.index == rae.0 && f.severity == VerifySeverity::Error));
    Ok(())
}

#[test]
fn reports_serialize_for_tooling() -> Result<()> {
    init_tracing();
    let (graph, _) = busy_graph()?;
    let report = verify_double_linking(&graph)?;
    let json = serde_json::to_value(&report)?;
    assert_eq!(json["check"], "double_linking");
    assert_eq!(json["success"], true);
    assert!(json["counts"]["records"].as_u64().is_some_and(|n| n > 0));
    Ok(())
}
