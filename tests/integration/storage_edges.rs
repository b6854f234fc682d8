#![allow(missing_docs)]

use std::sync::Once;

use strata::{
    admin::verify_double_linking,
    primitives::arena::MemArena,
    storage::{
        blob::{Blob, EntityNode, Link},
        edges, BlobStore, Graph, GraphOptions,
    },
    types::{BaseUid, BlobIndex, EntityType, RelationType, Result, StrataError, TimeSlice},
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

fn store_with_entity() -> Result<(BlobStore, BlobIndex)> {
    let mut store = BlobStore::new(Box::new(MemArena::new(1024, 1024, 1 << 20)));
    let entity = store.append_blob(&Blob::Entity(EntityNode {
        entity_type: EntityType(1),
        instantiation: TimeSlice(1),
        termination: TimeSlice(0),
        uid: BaseUid([1; 16]),
    }))?;
    Ok((store, entity))
}

#[test]
fn deferred_lists_grow_geometrically() -> Result<()> {
    init_tracing();
    let (mut store, entity) = store_with_entity()?;
    let mut expected = Vec::new();
    for _ in 0..40 {
        let link = store.append_blob(&Blob::NextTx(Link {
            source: entity,
            target: entity,
        }))?;
        edges::append(&mut store, entity, link.0, true)?;
        expected.push(link.0);
    }
    assert_eq!(edges::edge_refs(&store, entity)?, expected);
    let capacities: Vec<usize> = edges::segments(&store, entity)?.iter().map(|s| s.capacity).collect();
    assert_eq!(capacities, vec![7, 21, 84]);
    assert_eq!(edges::total_capacity(&store, entity)?, 112);
    assert_eq!(edges::deferred_chain(&store, entity)?.len(), 2);
    Ok(())
}

#[test]
fn full_chain_refuses_without_overflow() -> Result<()> {
    init_tracing();
    let (mut store, entity) = store_with_entity()?;
    let mut links = Vec::new();
    for _ in 0..8 {
        links.push(store.append_blob(&Blob::NextTx(Link {
            source: entity,
            target: entity,
        }))?);
    }
    for link in &links[..7] {
        edges::append(&mut store, entity, link.0, false)?;
    }
    let err = edges::append(&mut store, entity, links[7].0, false);
    assert!(matches!(err, Err(StrataError::CapacityExceeded { .. })));
    assert!(matches!(
        edges::idempotent_append(&mut store, entity, links[7].0, None),
        Err(StrataError::CapacityExceeded { .. })
    ));
    // Values already present are found instead of written again.
    let hint = edges::idempotent_append(&mut store, entity, links[3].0, None)?;
    assert_eq!(hint, entity);
    assert_eq!(edges::edge_refs(&store, entity)?.len(), 7);
    assert!(matches!(
        edges::append(&mut store, entity, 9_999, true),
        Err(StrataError::RangeError { .. })
    ));
    Ok(())
}

#[test]
fn busy_entity_keeps_every_relation_linked() -> Result<()> {
    init_tracing();
    let graph = Graph::create(GraphOptions::new().uid_seed(3))?;
    let _tx = graph.begin_tx();
    let hub = graph.instantiate_entity(EntityType(1), None)?;
    let mut relations = Vec::new();
    for _ in 0..30 {
        let spoke = graph.instantiate_entity(EntityType(2), None)?;
        relations.push(graph.instantiate_relation(RelationType(1), hub, spoke, None)?);
    }
    let refs = graph.edge_refs(hub)?;
    assert_eq!(refs.len(), 31);
    for rel in &relations {
        assert!(refs.contains(&rel.0));
    }
    let report = verify_double_linking(&graph)?;
    assert!(report.success, "{:?}", report.findings);
    assert!(report.counts.edges > 60);
    Ok(())
}
