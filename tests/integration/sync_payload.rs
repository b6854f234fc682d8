#![allow(missing_docs)]

use std::sync::Once;

use strata::{
    storage::{blob::Blob, Graph, GraphOptions},
    sync::{
        apply_payload, create_heads, full_graph_heads, is_up_to_date, load_snapshot, mark_synced, save_snapshot,
        serialize, LayoutVersion, UpdatePayload,
    },
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

const HUB_UID: BaseUid = BaseUid([7; 16]);

fn populated() -> Result<(Graph, BlobIndex)> {
    let graph = Graph::create(GraphOptions::new().uid_seed(31).revision_info("origin"))?;
    let hub = {
        let _tx = graph.begin_tx();
        let hub = graph.instantiate_entity(EntityType(1), Some(HUB_UID))?;
        graph.assign_tag(hub, "hub")?;
        for _ in 0..3 {
            let spoke = graph.instantiate_entity(EntityType(2), None)?;
            graph.instantiate_relation(RelationType(3), hub, spoke, None)?;
        }
        let ae = graph.instantiate_attribute_entity(ValueRepType::INT, None)?;
        graph.assign_value(ae, &Value::Int(17))?;
        hub
    };
    Ok((graph, hub))
}

/// Ships everything the sender has not externalized yet.
fn ship(sender: &Graph, target: LayoutVersion) -> Result<UpdatePayload> {
    let heads = create_heads(sender)?;
    let payload = serialize(sender, &heads, target)?;
    mark_synced(sender, &heads)?;
    Ok(payload)
}

fn assert_same(sender: &Graph, replica: &Graph) -> Result<()> {
    assert_eq!(replica.uid(), sender.uid());
    assert_eq!(replica.write_head(), sender.write_head());
    assert_eq!(replica.latest_complete_tx(), sender.latest_complete_tx());
    assert_eq!(replica.arena_image()?, sender.arena_image()?);
    assert_eq!(replica.ets_used(), sender.ets_used());
    assert_eq!(replica.rts_used(), sender.rts_used());
    Ok(())
}

#[test]
fn empty_replica_catches_up_from_full_payload() -> Result<()> {
    init_tracing();
    let (sender, hub) = populated()?;
    let payload = serialize(&sender, &full_graph_heads(&sender)?, LayoutVersion::CURRENT)?;
    assert_eq!(payload.lo(), BlobIndex::ROOT);
    assert_eq!(payload.hi(), sender.write_head());

    let replica = Graph::empty(GraphOptions::new())?;
    assert!(replica.uid().is_zero());
    apply_payload(&replica, payload)?;
    assert_same(&sender, &replica)?;
    assert_eq!(replica.lookup_uid(HUB_UID), Some(hub));
    assert_eq!(replica.lookup_tag("hub"), Some(hub));
    assert_eq!(replica.root_info()?.revision, "origin");
    assert_eq!(replica.sync_head(), replica.write_head());
    Ok(())
}

#[test]
fn incremental_payloads_keep_replicas_identical() -> Result<()> {
    init_tracing();
    let (sender, hub) = populated()?;
    let replica = Graph::empty(GraphOptions::new())?;
    apply_payload(&replica, ship(&sender, LayoutVersion::CURRENT)?)?;
    assert!(is_up_to_date(&create_heads(&sender)?));
    // Synced bytes may go cold; edge lists in them still take new references.
    sender.page_out();

    let newcomer = {
        let _tx = sender.begin_tx();
        // Relations on an old record grow its list past the inline slots.
        for _ in 0..12 {
            let spoke = sender.instantiate_entity(EntityType(4), None)?;
            sender.instantiate_relation(RelationType(3), hub, spoke, None)?;
        }
        let newcomer = sender.instantiate_entity(EntityType(1), None)?;
        sender.assign_tag(newcomer, "hub")?;
        let ae = sender.instantiate_attribute_entity(ValueRepType::STRING, None)?;
        sender.assign_value_node(ae, &Value::Str("shared".into()))?;
        newcomer
    };
    let heads = create_heads(&sender)?;
    assert!(!is_up_to_date(&heads));
    assert!(heads.blob_from() > BlobIndex::ROOT);
    apply_payload(&replica, ship(&sender, LayoutVersion::CURRENT)?)?;
    assert_same(&sender, &replica)?;
    assert_eq!(replica.lookup_tag("hub"), Some(newcomer));
    let image = replica.arena_image()?;
    {
        let _tx = replica.begin_tx();
        replica.apply_double_linking(heads.blob_from(), heads.blob_to())?;
    }
    assert_eq!(replica.arena_image()?, image);

    {
        let _tx = sender.begin_tx();
        sender.terminate(hub)?;
    }
    apply_payload(&replica, ship(&sender, LayoutVersion::CURRENT)?)?;
    assert_same(&sender, &replica)?;
    let slice = replica.time_slice_of(replica.latest_complete_tx())?;
    assert!(!replica.exists_at(hub, slice)?);
    assert!(replica.exists_at(hub, TimeSlice(slice.0 - 1))?);
    Ok(())
}

#[test]
fn duplicates_are_ignored_and_gaps_refused() -> Result<()> {
    init_tracing();
    let (sender, _) = populated()?;
    let first = ship(&sender, LayoutVersion::CURRENT)?;
    {
        let _tx = sender.begin_tx();
        sender.instantiate_entity(EntityType(9), None)?;
    }
    let second = ship(&sender, LayoutVersion::CURRENT)?;

    let replica = Graph::empty(GraphOptions::new())?;
    assert!(matches!(
        apply_payload(&replica, second.clone()),
        Err(StrataError::HeadsMismatch(_))
    ));
    assert_eq!(replica.write_head(), BlobIndex::ROOT);

    apply_payload(&replica, first.clone())?;
    let head = replica.write_head();
    apply_payload(&replica, first.clone())?;
    let first_again = first;
    assert_eq!(replica.write_head(), head);

    apply_payload(&replica, second)?;
    assert_same(&sender, &replica)?;
    // Edge lists below the head have grown since, yet the records still match.
    apply_payload(&replica, first_again)?;
    assert_same(&sender, &replica)?;
    Ok(())
}

#[test]
fn duplicates_must_match_the_local_records() -> Result<()> {
    init_tracing();
    let (sender, hub) = populated()?;
    let payload = ship(&sender, LayoutVersion::CURRENT)?;
    let replica = Graph::empty(GraphOptions::new())?;
    apply_payload(&replica, payload.clone())?;
    let image = replica.arena_image()?;

    let mut rewritten = payload.clone();
    let at = hub.offset() - payload.lo().offset() + 8;
    rewritten.blocks[0][at..at + 4].copy_from_slice(&5i32.to_be_bytes());
    assert!(matches!(
        apply_payload(&replica, rewritten),
        Err(StrataError::HeadsMismatch(_))
    ));

    let mut rehashed = payload;
    rehashed.meta.hash_full_graph ^= 1;
    assert!(matches!(apply_payload(&replica, rehashed), Err(StrataError::Corruption(_))));
    assert_eq!(replica.arena_image()?, image);
    Ok(())
}

#[test]
fn failed_payload_is_discarded_and_the_genuine_one_applies() -> Result<()> {
    init_tracing();
    let (sender, hub) = populated()?;
    let replica = Graph::empty(GraphOptions::new())?;
    apply_payload(&replica, ship(&sender, LayoutVersion::CURRENT)?)?;
    let image = replica.arena_image()?;
    let (head, latest) = (replica.write_head(), replica.latest_complete_tx());

    {
        let _tx = sender.begin_tx();
        sender.terminate(hub)?;
    }
    let genuine = ship(&sender, LayoutVersion::CURRENT)?;
    let lo = genuine.lo();
    let last_termination = sender
        .indices()?
        .into_iter()
        .filter(|index| *index >= lo && matches!(sender.blob(*index), Ok(Blob::Termination(_))))
        .last()
        .ok_or(StrataError::NotFound)?;

    // Earlier terminations patch records and edge lists below the payload before
    // the last one turns out to target the root.
    let mut broken = genuine.clone();
    let at = last_termination.offset() - lo.offset() + 8;
    broken.blocks[0][at..at + 4].copy_from_slice(&BlobIndex::ROOT.0.to_be_bytes());
    assert!(apply_payload(&replica, broken).is_err());
    assert_eq!(replica.write_head(), head);
    assert_eq!(replica.read_head(), head);
    assert_eq!(replica.latest_complete_tx(), latest);
    assert_eq!(replica.arena_image()?, image);
    assert_eq!(replica.lookup_uid(HUB_UID), Some(hub));

    apply_payload(&replica, genuine)?;
    assert_same(&sender, &replica)?;
    let slice = replica.time_slice_of(replica.latest_complete_tx())?;
    assert!(!replica.exists_at(hub, slice)?);
    Ok(())
}

#[test]
fn tampered_payloads_leave_the_replica_untouched() -> Result<()> {
    init_tracing();
    let (sender, _) = populated()?;
    let replica = Graph::empty(GraphOptions::new())?;
    apply_payload(&replica, ship(&sender, LayoutVersion::CURRENT)?)?;
    let image = replica.arena_image()?;
    let head = replica.write_head();

    {
        let _tx = sender.begin_tx();
        let spoke = sender.instantiate_entity(EntityType(2), None)?;
        sender.assign_tag(spoke, "spoke")?;
    }
    let mut payload = ship(&sender, LayoutVersion::CURRENT)?;
    payload.meta.hash_full_graph ^= 1;
    assert!(matches!(
        apply_payload(&replica, payload),
        Err(StrataError::Corruption(_))
    ));
    assert_eq!(replica.write_head(), head);
    assert_eq!(replica.arena_image()?, image);
    assert_eq!(replica.lookup_tag("spoke"), None);

    let mut foreign = serialize(&sender, &full_graph_heads(&sender)?, LayoutVersion::CURRENT)?;
    foreign.meta.graph_uid = BaseUid([1; 16]).to_string();
    let fresh = Graph::empty(GraphOptions::new())?;
    assert!(matches!(apply_payload(&fresh, foreign), Err(StrataError::Corruption(_))));
    assert_eq!(fresh.write_head(), BlobIndex::ROOT);
    assert!(fresh.uid().is_zero());
    Ok(())
}

#[test]
fn payloads_survive_the_wire() -> Result<()> {
    init_tracing();
    let (sender, _) = populated()?;
    let payload = ship(&sender, LayoutVersion::CURRENT)?;
    let bytes = payload.encode()?;
    let decoded = UpdatePayload::decode(&bytes)?;
    assert_eq!(decoded, payload);
    assert!(UpdatePayload::decode(&bytes[..bytes.len() - 1]).is_err());

    let replica = Graph::empty(GraphOptions::new())?;
    apply_payload(&replica, decoded)?;
    assert_same(&sender, &replica)?;
    Ok(())
}

#[test]
fn older_layouts_carry_graphs_without_value_nodes() -> Result<()> {
    init_tracing();
    let (sender, _) = populated()?;
    let payload = serialize(&sender, &full_graph_heads(&sender)?, LayoutVersion::V0_2_0)?;
    assert_eq!(payload.meta.data_layout_version, LayoutVersion::V0_2_0);
    let replica = Graph::empty(GraphOptions::new())?;
    apply_payload(&replica, payload)?;
    assert_same(&sender, &replica)?;
    assert_eq!(replica.root_info()?.layout_version, LayoutVersion::CURRENT.as_str());

    {
        let _tx = sender.begin_tx();
        let ae = sender.instantiate_attribute_entity(ValueRepType::STRING, None)?;
        sender.assign_value_node(ae, &Value::Str("node".into()))?;
    }
    assert!(matches!(
        serialize(&sender, &full_graph_heads(&sender)?, LayoutVersion::V0_2_0),
        Err(StrataError::LayoutMismatch(_))
    ));
    Ok(())
}

#[test]
fn verifying_replicas_check_every_payload() -> Result<()> {
    init_tracing();
    let (sender, _) = populated()?;
    let replica = Graph::empty(GraphOptions::new().verify_on_apply(true))?;
    apply_payload(&replica, ship(&sender, LayoutVersion::CURRENT)?)?;
    assert_same(&sender, &replica)?;
    Ok(())
}

#[test]
fn snapshots_round_trip_through_files() -> Result<()> {
    init_tracing();
    let (sender, hub) = populated()?;
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("graph.snapshot");
    save_snapshot(&sender, &path)?;

    let restored = load_snapshot(&path, GraphOptions::new())?;
    assert_same(&sender, &restored)?;
    assert_eq!(restored.lookup_tag("hub"), Some(hub));

    let mut bytes = std::fs::read(&path)?;
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0x5a;
    std::fs::write(&path, &bytes)?;
    assert!(matches!(
        load_snapshot(&path, GraphOptions::new()),
        Err(StrataError::Corruption(_))
    ));
    Ok(())
}
