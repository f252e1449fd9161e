mod common;

use common::{cluster, config, eventually, txn};
use std::collections::BTreeSet;
use strata_kernel::{FetchOutcome, ReconRequest};
use strata_model::{PeerId, Predicate, TrustCondition, TrustConditions, Value};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stale_trust_conditions_are_refused() {
    let cluster = cluster(3, config(3));
    let v2 = TrustConditions::new("bob", 2, vec![TrustCondition::new(None, "R", 2)]);
    let v1 = TrustConditions::new("bob", 1, vec![TrustCondition::new(None, "R", 9)]);

    assert!(cluster.node(0).publish_trust_conditions(&v2).await.unwrap());
    assert!(!cluster.node(1).publish_trust_conditions(&v1).await.unwrap());
    assert!(!cluster.node(2).publish_trust_conditions(&v2).await.unwrap());
    assert_eq!(cluster.node(2).fetch_trust_conditions(&"bob".into()).await.unwrap(), Some(v2.clone()));
    assert_eq!(cluster.node(2).fetch_trust_conditions(&"nobody".into()).await.unwrap(), None);

    let bob = PeerId::from("bob");
    assert!(eventually(|| cluster.nodes.iter().all(|n| n.peers().conditions(&bob).unwrap() == Some(v2.clone()))).await);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_newer_conditions_change_priority() {
    let cluster = cluster(2, config(2));
    let t = txn(7, "alice", &[]);
    cluster.node(0).publish_transaction(&t).await.unwrap();

    // Field 0 of the tuple is the transaction number
    let matching = TrustCondition::new(Some("alice".into()), "R", 3)
        .with_predicate(Predicate::FieldEquals { index: 0, value: Value::Int(7) });
    let other = TrustCondition::new(Some("alice".into()), "R", 8)
        .with_predicate(Predicate::FieldEquals { index: 0, value: Value::Int(8) });
    let v1 = TrustConditions::new("bob", 1, vec![matching.clone(), other]);
    cluster.node(1).publish_trust_conditions(&v1).await.unwrap();

    let request = ReconRequest {
        tpi: t.id.clone(),
        peer: "bob".into(),
        recno: 1,
        exclude: BTreeSet::new(),
        filter: true,
    };
    let fetch = cluster.node(1).fetch_for_reconciliation(request.clone()).await.unwrap();
    assert_eq!(fetch.outcome(&t.id), Some(&FetchOutcome::Delivered { transaction: t.clone(), priority: Some(3) }));

    let v2 = TrustConditions::new("bob", 2, vec![TrustCondition::new(None, "R", 6), matching]);
    assert!(cluster.node(0).publish_trust_conditions(&v2).await.unwrap());
    let bob = PeerId::from("bob");
    assert!(eventually(|| cluster.nodes.iter().all(|n| n.peers().conditions(&bob).unwrap() == Some(v2.clone()))).await);
    cluster.flush_all().await;

    let fetch = cluster.node(0).fetch_for_reconciliation(request).await.unwrap();
    assert_eq!(fetch.outcome(&t.id), Some(&FetchOutcome::Delivered { transaction: t, priority: Some(6) }));

    cluster.shutdown().await;
}
