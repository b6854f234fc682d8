#![allow(missing_docs)]

use std::sync::Once;

use strata::{
    admin::{ensure_valid, verify_double_linking},
    storage::{blob::Blob, Graph, GraphOptions},
    types::{BaseUid, BlobIndex, EntityType, RelationType, Result, StrataError, TimeSlice, Value, ValueRepType},
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

struct Base {
    graph: Graph,
    hub: BlobIndex,
    ae: BlobIndex,
    uid: BaseUid,
}

fn base_graph() -> Result<Base> {
    let graph = Graph::create(GraphOptions::new().uid_seed(21))?;
    let uid = BaseUid([8; 16]);
    let (hub, ae) = {
        let _tx = graph.begin_tx();
        let hub = graph.instantiate_entity(EntityType(1), Some(uid))?;
        graph.assign_tag(hub, "hub")?;
        let ae = graph.instantiate_attribute_entity(ValueRepType::STRING, None)?;
        graph.assign_value_node(ae, &Value::Str("before".into()))?;
        (hub, ae)
    };
    Ok(Base { graph, hub, ae, uid })
}

#[test]
fn rollback_restores_bytes_and_lookups() -> Result<()> {
    init_tracing();
    let Base { graph, hub, ae, uid } = base_graph()?;
    let k = graph.write_head();
    let image = graph.arena_image()?;
    let latest = graph.latest_complete_tx();
    let ets = graph.ets_used();

    {
        let _tx = graph.begin_tx();
        // Enough relations to push the hub's list into deferred lists.
        for i in 0..20 {
            let spoke = graph.instantiate_entity(EntityType(2 + i % 3), None)?;
            graph.instantiate_relation(RelationType(4), hub, spoke, None)?;
        }
        let other = graph.instantiate_entity(EntityType(1), None)?;
        graph.assign_tag(other, "hub")?;
        graph.assign_value_node(ae, &Value::Str("after".into()))?;
    }
    {
        let _tx = graph.begin_tx();
        graph.terminate(hub)?;
    }
    assert_ne!(graph.lookup_tag("hub"), Some(hub));
    assert!(graph.ets_used().len() > ets.len());

    let _tx = graph.begin_tx();
    graph.roll_back_to(k)?;
    drop(_tx);

    assert_eq!(graph.write_head(), k);
    assert_eq!(graph.read_head(), k);
    assert_eq!(graph.arena_image()?, image);
    assert_eq!(graph.latest_complete_tx(), latest);
    assert_eq!(graph.lookup_tag("hub"), Some(hub));
    assert_eq!(graph.lookup_uid(uid), Some(hub));
    assert_eq!(graph.ets_used(), ets);
    assert!(graph.exists_at(hub, TimeSlice(3))?);
    assert_eq!(graph.value_of(ae, TimeSlice(9))?, Some(Value::Str("before".into())));
    ensure_valid(&graph)?;
    Ok(())
}

#[test]
fn graph_keeps_working_after_rollback() -> Result<()> {
    init_tracing();
    let Base { graph, hub, .. } = base_graph()?;
    let k = graph.write_head();
    {
        let _tx = graph.begin_tx();
        graph.instantiate_entity(EntityType(5), None)?;
    }
    {
        let _tx = graph.begin_tx();
        graph.roll_back_to(k)?;
        let spoke = graph.instantiate_entity(EntityType(5), None)?;
        graph.instantiate_relation(RelationType(1), hub, spoke, None)?;
        let tx = graph.get_or_open_tx()?;
        assert_eq!(graph.time_slice_of(tx)?, TimeSlice(2));
    }
    ensure_valid(&graph)?;
    Ok(())
}

#[test]
fn rollback_bounds_are_checked() -> Result<()> {
    init_tracing();
    let Base { graph, .. } = base_graph()?;
    assert!(matches!(graph.roll_back_to(graph.write_head()), Err(StrataError::ConcurrencyViolation)));
    let _tx = graph.begin_tx();
    assert!(matches!(graph.roll_back_to(BlobIndex::ROOT), Err(StrataError::RangeError { .. })));
    assert!(graph.roll_back_to(graph.write_head().advance(4)).is_err());
    // One step into the root record is not a record boundary.
    assert!(matches!(
        graph.roll_back_to(BlobIndex::ROOT.advance(1)),
        Err(StrataError::Invalid(_))
    ));
    Ok(())
}

#[test]
fn replaying_a_range_twice_changes_nothing() -> Result<()> {
    init_tracing();
    let Base { graph, hub, uid, .. } = base_graph()?;
    let lo = graph.write_head();
    {
        let _tx = graph.begin_tx();
        // Thirty relations continue the hub's list in deferred lists inside the range.
        for _ in 0..30 {
            let spoke = graph.instantiate_entity(EntityType(2), None)?;
            graph.instantiate_relation(RelationType(4), hub, spoke, None)?;
        }
        graph.assign_tag(hub, "spoked")?;
    }
    let hi = graph.write_head();
    let deferred = graph
        .indices()?
        .into_iter()
        .filter(|index| *index >= lo)
        .filter(|index| matches!(graph.blob(*index), Ok(Blob::DeferredEdgeList(d)) if d.first_blob == hub))
        .count();
    assert!(deferred > 0);
    let image = graph.arena_image()?;

    {
        let _tx = graph.begin_tx();
        graph.apply_double_linking(lo, hi)?;
        graph.apply_double_linking(lo, hi)?;
        graph.rebuild_caches()?;
        graph.rebuild_caches()?;
    }
    assert_eq!(graph.arena_image()?, image);
    assert_eq!(graph.edge_refs(hub)?.iter().filter(|r| **r > 0).count(), 30);
    assert_eq!(graph.lookup_tag("spoked"), Some(hub));
    assert_eq!(graph.lookup_uid(uid), Some(hub));
    assert!(verify_double_linking(&graph)?.success);
    Ok(())
}
