//! Property-based tests for multi-device convergence
//!
//! Two devices share one remote and one clock. A random script of edits,
//! deletions, clock ticks and sync passes runs against them; once both have
//! synced twice with no further edits they must hold the same entities as the
//! remote.

use crate::common::*;
use proptest::prelude::*;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use uuid::Uuid;
use xfsync::shared::SyncError;

#[derive(Debug, Clone)]
enum Step {
    Create { device: usize },
    Update { device: usize, slot: usize, value: u8 },
    Delete { device: usize, slot: usize },
    Sync { device: usize },
    Tick { millis: i64 },
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        2 => (0..2usize).prop_map(|device| Step::Create { device }),
        4 => (0..2usize, 0..4usize, any::<u8>())
            .prop_map(|(device, slot, value)| Step::Update { device, slot, value }),
        1 => (0..2usize, 0..4usize).prop_map(|(device, slot)| Step::Delete { device, slot }),
        3 => (0..2usize).prop_map(|device| Step::Sync { device }),
        2 => (0i64..3).prop_map(|millis| Step::Tick { millis }),
    ]
}

async fn pick(device: &Device, slot: usize) -> Option<Uuid> {
    let mut ids: Vec<Uuid> = device
        .store
        .list_entities(None)
        .await
        .unwrap()
        .into_iter()
        .map(|entity| entity.id)
        .collect();
    if ids.is_empty() {
        return None;
    }
    ids.sort();
    Some(ids[slot % ids.len()])
}

fn tolerate_missing(result: Result<(), SyncError>) {
    match result {
        Ok(()) | Err(SyncError::NotFound(_)) => {}
        Err(e) => panic!("Unexpected mutation failure: {:?}", e),
    }
}

async fn snapshot(device: &Device) -> BTreeMap<Uuid, Value> {
    device
        .store
        .list_entities(None)
        .await
        .unwrap()
        .into_iter()
        .map(|entity| (entity.id, entity.data))
        .collect()
}

struct Converged {
    a: BTreeMap<Uuid, Value>,
    b: BTreeMap<Uuid, Value>,
    remote: BTreeMap<Uuid, Value>,
    leftover_ops: usize,
}

async fn run_script(steps: Vec<Step>) -> Converged {
    let (gateway, clock) = shared_remote();
    let devices = [Device::memory(&gateway, &clock, 3), Device::memory(&gateway, &clock, 3)];

    for step in steps {
        match step {
            Step::Create { device } => {
                devices[device]
                    .manager
                    .create("todos", &json!({ "value": 0 }))
                    .await
                    .unwrap();
            }
            Step::Update { device, slot, value } => {
                if let Some(id) = pick(&devices[device], slot).await {
                    let result = devices[device]
                        .manager
                        .update(id, &json!({ "value": value }))
                        .await
                        .map(|_| ());
                    tolerate_missing(result);
                }
            }
            Step::Delete { device, slot } => {
                if let Some(id) = pick(&devices[device], slot).await {
                    tolerate_missing(devices[device].manager.delete(id).await);
                }
            }
            Step::Sync { device } => {
                devices[device].sync().await;
            }
            Step::Tick { millis } => clock.advance(chrono::Duration::milliseconds(millis)),
        }
    }

    for device in [0, 1, 0, 1] {
        devices[device].sync().await;
    }

    let mut leftover_ops = 0;
    for device in &devices {
        leftover_ops += device.store.list_pending().await.unwrap().len();
        leftover_ops += device.store.list_failed().await.unwrap().len();
    }

    Converged {
        a: snapshot(&devices[0]).await,
        b: snapshot(&devices[1]).await,
        remote: gateway
            .entities()
            .await
            .into_iter()
            .filter_map(|remote| remote.client_id.map(|id| (id, remote.data)))
            .collect(),
        leftover_ops,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_devices_converge_after_quiescence(steps in prop::collection::vec(step(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let converged = runtime.block_on(run_script(steps));

        prop_assert_eq!(converged.leftover_ops, 0);
        prop_assert_eq!(&converged.a, &converged.b);
        prop_assert_eq!(&converged.a, &converged.remote);
    }
}
