#![allow(missing_docs)]

use std::sync::Once;

use strata::{
    primitives::arena::MemArena,
    storage::{blob::Blob, Graph, GraphOptions},
    types::{BaseUid, BlobIndex, EntityType, Result, StrataError, TimeSlice, Value, ValueRepType},
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

#[test]
fn one_marker_per_batch() -> Result<()> {
    init_tracing();
    let graph = Graph::create(GraphOptions::new().uid_seed(1))?;
    let mut markers = Vec::new();
    for _ in 0..3 {
        let _tx = graph.begin_tx();
        graph.instantiate_entity(EntityType(1), None)?;
        graph.instantiate_entity(EntityType(2), None)?;
        let tx = graph.get_or_open_tx()?;
        assert_eq!(graph.get_or_open_tx()?, tx);
        markers.push(tx);
    }
    let slices = markers
        .iter()
        .map(|tx| graph.time_slice_of(*tx))
        .collect::<Result<Vec<_>>>()?;
    assert_eq!(slices, vec![TimeSlice(1), TimeSlice(2), TimeSlice(3)]);
    assert_eq!(graph.latest_complete_tx(), markers[2]);

    let Blob::TxEvent(first) = graph.blob(markers[0])? else {
        panic!("not a tx marker");
    };
    let Blob::TxEvent(last) = graph.blob(markers[2])? else {
        panic!("not a tx marker");
    };
    assert!(last.time >= first.time);
    assert_ne!(first.uid, last.uid);
    Ok(())
}

#[test]
fn empty_batches_leave_no_marker() -> Result<()> {
    init_tracing();
    let graph = Graph::create(GraphOptions::new())?;
    let head = graph.write_head();
    {
        let _tx = graph.begin_tx();
    }
    assert_eq!(graph.write_head(), head);
    assert_eq!(graph.latest_complete_tx(), BlobIndex::ROOT);
    Ok(())
}

#[test]
fn frames_need_a_tx_marker() -> Result<()> {
    init_tracing();
    let graph = Graph::create(GraphOptions::new())?;
    let _tx = graph.begin_tx();
    let entity = graph.instantiate_entity(EntityType(1), None)?;
    let tx = graph.get_or_open_tx()?;
    let frame = graph.to_frame(entity, tx, false)?;
    assert_eq!((frame.blob, frame.tx, frame.time_slice), (entity, tx, TimeSlice(1)));
    assert!(matches!(
        graph.to_frame(entity, entity, false),
        Err(StrataError::TypeMismatch { .. })
    ));
    assert!(graph.exists_at(BlobIndex::ROOT, TimeSlice(0))?);
    assert!(matches!(
        graph.exists_at(graph.write_head(), TimeSlice(1)),
        Err(StrataError::RangeError { .. })
    ));
    Ok(())
}

#[test]
fn reopened_arena_rebuilds_lookups() -> Result<()> {
    init_tracing();
    let graph = Graph::create(GraphOptions::new().uid_seed(5).revision_info("rev-7"))?;
    let uid = BaseUid([4; 16]);
    let (entity, ae) = {
        let _tx = graph.begin_tx();
        let entity = graph.instantiate_entity(EntityType(9), Some(uid))?;
        graph.assign_tag(entity, "home")?;
        let ae = graph.instantiate_attribute_entity(ValueRepType::INT, None)?;
        graph.assign_value(ae, &Value::Int(42))?;
        (entity, ae)
    };

    let image = graph.arena_image()?;
    let reopened = Graph::open_arena(Box::new(MemArena::from_bytes(image)), GraphOptions::new())?;
    assert_eq!(reopened.uid(), graph.uid());
    assert_eq!(reopened.write_head(), graph.write_head());
    assert_eq!(reopened.latest_complete_tx(), graph.latest_complete_tx());
    assert_eq!(reopened.lookup_uid(uid), Some(entity));
    assert_eq!(reopened.lookup_tag("home"), Some(entity));
    assert_eq!(reopened.ets_used(), graph.ets_used());
    assert_eq!(reopened.value_of(ae, TimeSlice(1))?, Some(Value::Int(42)));
    assert_eq!(reopened.root_info()?.revision, "rev-7");

    // The next batch continues the tx chain.
    let _tx = reopened.begin_tx();
    let tx = reopened.get_or_open_tx()?;
    assert_eq!(reopened.time_slice_of(tx)?, TimeSlice(2));
    Ok(())
}

#[test]
fn options_load_from_toml() -> Result<()> {
    let options = GraphOptions::from_toml_str(
        r#"
        initial_capacity_bytes = 4096
        verify_on_apply = true
        uid_seed = 12
        "#,
    )?;
    assert_eq!(options.initial_capacity_bytes, 4096);
    assert!(options.verify_on_apply);
    assert_eq!(options.uid_seed, Some(12));
    assert_eq!(options.delegate_cache_capacity, GraphOptions::default().delegate_cache_capacity);
    assert!(matches!(
        GraphOptions::from_toml_str("initial_capacity_bytes = \"lots\""),
        Err(StrataError::Config(_))
    ));

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("strata.toml");
    std::fs::write(&path, "revision_info = \"nightly\"\n")?;
    assert_eq!(GraphOptions::load(&path)?.revision_info, "nightly");
    Ok(())
}
