use proptest::prelude::*;
use strata::admin::ensure_valid;
use strata::storage::{Graph, GraphOptions};
use strata::sync::{apply_payload, create_heads, mark_synced, serialize, LayoutVersion};
use strata::types::{BlobIndex, EntityType, RelationType, Value, ValueRepType};

#[derive(Debug, Clone)]
enum Operation {
    CreateEntity { entity_type: u32 },
    CreateRelation { from: usize, to: usize, relation_type: u32 },
    Terminate { pick: usize },
    Tag { pick: usize, tag: String },
    SetValue { value: i64 },
    SetValueNode { value: String },
}

fn arb_operation() -> impl Strategy<Value = Operation> {
    prop_oneof![
        3 => (1u32..=4).prop_map(|entity_type| Operation::CreateEntity { entity_type }),
        4 => (0usize..64, 0usize..64, 1u32..=3).prop_map(|(from, to, relation_type)| {
            Operation::CreateRelation { from, to, relation_type }
        }),
        1 => (0usize..64).prop_map(|pick| Operation::Terminate { pick }),
        1 => (0usize..64, "[a-c]{1,2}").prop_map(|(pick, tag)| Operation::Tag { pick, tag }),
        1 => any::<i64>().prop_map(|value| Operation::SetValue { value }),
        1 => "[a-d]{1,3}".prop_map(|value| Operation::SetValueNode { value }),
    ]
}

/// Runs `batches` against `graph`, one tx per batch. Operations on records that
/// are gone are skipped.
fn run(graph: &Graph, batches: &[Vec<Operation>]) {
    let mut alive: Vec<BlobIndex> = Vec::new();
    let ae = {
        let _tx = graph.begin_tx();
        graph.instantiate_attribute_entity(ValueRepType::INT, None).unwrap()
    };
    let node_ae = {
        let _tx = graph.begin_tx();
        graph.instantiate_attribute_entity(ValueRepType::STRING, None).unwrap()
    };
    for batch in batches {
        let _tx = graph.begin_tx();
        for op in batch {
            match op {
                Operation::CreateEntity { entity_type } => {
                    alive.push(graph.instantiate_entity(EntityType(*entity_type), None).unwrap());
                }
                Operation::CreateRelation { from, to, relation_type } => {
                    if alive.is_empty() {
                        continue;
                    }
                    let (a, b) = (alive[from % alive.len()], alive[to % alive.len()]);
                    // Terminated records leave `alive`, so both ends are live.
                    let rel = graph
                        .instantiate_relation(RelationType(*relation_type), a, b, None)
                        .unwrap();
                    alive.push(rel);
                }
                Operation::Terminate { pick } => {
                    if alive.is_empty() {
                        continue;
                    }
                    let record = alive[pick % alive.len()];
                    if let Ok(gone) = graph.terminate(record) {
                        alive.retain(|r| !gone.contains(r));
                    }
                }
                Operation::Tag { pick, tag } => {
                    if alive.is_empty() {
                        continue;
                    }
                    graph.assign_tag(alive[pick % alive.len()], tag).unwrap();
                }
                Operation::SetValue { value } => {
                    graph.assign_value(ae, &Value::Int(*value)).unwrap();
                }
                Operation::SetValueNode { value } => {
                    graph.assign_value_node(node_ae, &Value::Str(value.clone())).unwrap();
                }
            }
        }
    }
}

fn arb_batches() -> impl Strategy<Value = Vec<Vec<Operation>>> {
    prop::collection::vec(prop::collection::vec(arb_operation(), 1..12), 1..6)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_any_history_verifies(batches in arb_batches()) {
        let graph = Graph::create(GraphOptions::new().uid_seed(1)).unwrap();
        run(&graph, &batches);
        prop_assert!(ensure_valid(&graph).is_ok());
    }

    #[test]
    fn prop_rollback_restores_prefix(
        before in arb_batches(),
        after in arb_batches(),
    ) {
        let graph = Graph::create(GraphOptions::new().uid_seed(2)).unwrap();
        run(&graph, &before);
        let k = graph.write_head();
        let image = graph.arena_image().unwrap();
        let latest = graph.latest_complete_tx();
        let ets = graph.ets_used();

        run(&graph, &after);
        {
            let _tx = graph.begin_tx();
            graph.roll_back_to(k).unwrap();
        }
        prop_assert_eq!(graph.arena_image().unwrap(), image);
        prop_assert_eq!(graph.latest_complete_tx(), latest);
        prop_assert_eq!(graph.ets_used(), ets);
        prop_assert!(ensure_valid(&graph).is_ok());
    }

    #[test]
    fn prop_replica_follows_every_batch(batches in arb_batches()) {
        let sender = Graph::create(GraphOptions::new().uid_seed(3)).unwrap();
        let replica = Graph::empty(GraphOptions::new()).unwrap();
        for batch in &batches {
            run(&sender, std::slice::from_ref(batch));
            let heads = create_heads(&sender).unwrap();
            let payload = serialize(&sender, &heads, LayoutVersion::CURRENT).unwrap();
            mark_synced(&sender, &heads).unwrap();
            apply_payload(&replica, payload).unwrap();
            prop_assert_eq!(replica.arena_image().unwrap(), sender.arena_image().unwrap());
        }
        prop_assert_eq!(replica.latest_complete_tx(), sender.latest_complete_tx());
        prop_assert!(ensure_valid(&replica).is_ok());
    }
}
