use alpine_operator::owner_index::OwnerIndex;
use alpine_operator::Alpine;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::runtime::watcher::Event;
use proptest::prelude::*;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
enum Op {
    Apply { ns: u8, pod: u8, owner: Option<(u8, bool)> },
    Delete { ns: u8, pod: u8 },
    Restart,
}

fn make_pod(ns: u8, pod: u8, owner: Option<(u8, bool)>) -> Pod {
    let owner_references = owner.map(|(owner, is_alpine)| {
        let (api_version, kind) = if is_alpine { ("staight.k8s.io/v1", "Alpine") } else { ("apps/v1", "ReplicaSet") };
        vec![OwnerReference {
            api_version: api_version.into(),
            kind: kind.into(),
            name: format!("owner-{owner}"),
            uid: format!("uid-{owner}"),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }]
    });
    Pod {
        metadata: ObjectMeta {
            name: Some(format!("pod-{pod}")),
            namespace: Some(format!("ns-{ns}")),
            owner_references,
            ..ObjectMeta::default()
        },
        ..Pod::default()
    }
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0..2u8, 0..6u8, proptest::option::of((0..3u8, any::<bool>())))
            .prop_map(|(ns, pod, owner)| Op::Apply { ns, pod, owner }),
        3 => (0..2u8, 0..6u8).prop_map(|(ns, pod)| Op::Delete { ns, pod }),
        1 => Just(Op::Restart),
    ]
}

proptest! {
    #[test]
    fn incremental_index_matches_full_rebuild(ops in proptest::collection::vec(op(), 0..60)) {
        let index = OwnerIndex::<Alpine>::new();
        index.apply(&Event::Restarted(vec![]));
        // the pod set the API server would list after each step
        let mut live: BTreeMap<(u8, u8), Pod> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Apply { ns, pod, owner } => {
                    let p = make_pod(ns, pod, owner);
                    live.insert((ns, pod), p.clone());
                    index.apply(&Event::Applied(p));
                }
                Op::Delete { ns, pod } => {
                    if let Some(p) = live.remove(&(ns, pod)) {
                        index.apply(&Event::Deleted(p));
                    }
                }
                Op::Restart => index.apply(&Event::Restarted(live.values().cloned().collect())),
            }
        }

        let rebuilt = OwnerIndex::<Alpine>::new();
        rebuilt.apply(&Event::Restarted(live.values().cloned().collect()));
        prop_assert_eq!(index.entries(), rebuilt.entries());
    }
}
