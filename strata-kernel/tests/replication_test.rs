mod common;

use common::{cluster, config, eventually, txn};
use std::collections::BTreeSet;
use strata_kernel::replication::index;
use strata_model::{
    AcceptanceStatus, DataItem, DataToAdd, Decision, Encode, Epoch, Id, IdRange, Item, PeerId, PidAndRecno,
    TrustCondition, TrustConditions, TxnPeerId,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fetch_now_merges_every_replica() {
    let cluster = cluster(3, config(3));
    let t = txn(1, "alice", &[]);
    let bob_v1 = TrustConditions::new("bob", 1, vec![TrustCondition::new(None, "R", 1)]);
    let bob_v2 = TrustConditions::new("bob", 2, vec![TrustCondition::new(None, "R", 2)]);
    let first: BTreeSet<_> = [TxnPeerId::new(1, "alice")].into_iter().collect();
    let second: BTreeSet<_> = [TxnPeerId::new(2, "carol")].into_iter().collect();

    let on_node0 = DataToAdd(vec![
        DataItem::Transaction {
            tpi: t.id.clone(),
            contents: Some(t.to_bytes()),
            decisions: vec![(PidAndRecno::new("bob", 1), Decision::Accepted)],
        },
        DataItem::Peer { conditions: bob_v1 },
        DataItem::Epoch { epoch: Epoch(1), contents: first.clone() },
    ]);
    let on_node1 = DataToAdd(vec![
        DataItem::Transaction {
            tpi: t.id.clone(),
            contents: None,
            decisions: vec![(PidAndRecno::new("carol", 2), Decision::Rejected)],
        },
        DataItem::Peer { conditions: bob_v2.clone() },
        DataItem::Epoch { epoch: Epoch(2), contents: second.clone() },
    ]);
    assert_eq!(cluster.node(0).replication().merge_data(&on_node0).unwrap(), 3);
    assert_eq!(cluster.node(1).replication().merge_data(&on_node1).unwrap(), 3);
    // Merging the same data again changes nothing
    assert_eq!(cluster.node(1).replication().merge_data(&on_node1).unwrap(), 0);

    let node = cluster.node(2);
    let bob = PeerId::from("bob");
    for item in [Item::Transaction(t.id.clone()), Item::Peer(bob.clone()), Item::Epoch(Epoch(1))] {
        assert!(node.replication().fetch_now(node.id_of(&item)).await.unwrap(), "nothing fetched for {:?}", item);
    }

    assert_eq!(node.transactions().get_transaction(&t.id).unwrap(), Some(t.to_bytes()));
    let recon = node.reconciliations();
    assert_eq!(recon.status(&t.id, &bob, 1).unwrap(), AcceptanceStatus::Accepted);
    assert_eq!(recon.status(&t.id, &"carol".into(), 2).unwrap(), AcceptanceStatus::Rejected);
    assert_eq!(node.peers().conditions(&bob).unwrap(), Some(bob_v2));
    assert_eq!(node.epochs().get_epoch(Epoch(1)).unwrap(), Some(first));
    assert_eq!(node.epochs().get_epoch(Epoch(2)).unwrap(), Some(second));
    assert_eq!(node.epochs().most_recent_epoch().unwrap(), Some(Epoch(2)));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remove_is_all_or_nothing() {
    let cluster = cluster(1, config(1));
    let node = cluster.node(0);
    let kept = txn(1, "alice", &[]);
    let dropped = txn(2, "alice", &[]);
    for t in [&kept, &dropped] {
        assert!(node.transactions().add_transaction(&t.id, &t.to_bytes()).unwrap());
    }

    // An epoch indexed at the transaction's id with no epoch stored
    let kept_id = node.id_of(&Item::Transaction(kept.id.clone()));
    let write = node.store().begin().unwrap();
    assert!(index::add(&write, &kept_id, Item::Epoch(Epoch(9))).unwrap());
    write.commit().unwrap();

    node.replication().remove(kept_id);
    node.flush().await.unwrap();
    assert!(node.replication().has_entries_for_id(&kept_id).unwrap());
    assert_eq!(node.transactions().get_transaction(&kept.id).unwrap(), Some(kept.to_bytes()));

    let dropped_id = node.id_of(&Item::Transaction(dropped.id.clone()));
    node.replication().remove(dropped_id);
    node.flush().await.unwrap();
    assert!(!node.replication().has_entries_for_id(&dropped_id).unwrap());
    assert_eq!(node.transactions().get_transaction(&dropped.id).unwrap(), None);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_join_moves_data_to_new_primary() {
    let mut cluster = cluster(2, config(1));
    let txns: Vec<_> = (0..20).map(|i| txn(i, "alice", &[])).collect();
    for t in &txns {
        assert!(cluster.node(0).publish_transaction(t).await.unwrap());
    }
    let ids: Vec<_> = txns.iter().map(|t| cluster.txn_id(&t.id)).collect();
    for id in &ids {
        assert_eq!(cluster.holders_of(id), vec![cluster.primary_of(id)]);
    }

    cluster.add_node();
    let settled = eventually(|| ids.iter().all(|id| cluster.holders_of(id) == vec![cluster.primary_of(id)])).await;
    assert!(settled, "every id should end up only at its new primary");

    for t in &txns {
        assert_eq!(cluster.node(2).fetch_transaction(&t.id).await.unwrap(), Some(t.clone()));
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_departure_refills_replica_sets() {
    let cluster = cluster(3, config(2));
    let txns: Vec<_> = (0..10).map(|i| txn(i, "carol", &[])).collect();
    for t in &txns {
        cluster.node(1).publish_transaction(t).await.unwrap();
    }
    let ids: Vec<_> = txns.iter().map(|t| cluster.txn_id(&t.id)).collect();
    assert!(eventually(|| ids.iter().all(|id| cluster.holders_of(id).len() == 2)).await);

    assert!(cluster.net.leave("node-2"));
    let refilled = eventually(|| {
        ids.iter().all(|id| {
            let holders = cluster.holders_of(id);
            holders.contains(&0) && holders.contains(&1)
        })
    })
    .await;
    assert!(refilled, "both remaining nodes should hold every id");

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreachable_joiner_evicts_nothing() {
    let cluster = cluster(2, config(1));
    let txns: Vec<_> = (0..20).map(|i| txn(i, "alice", &[])).collect();
    for t in &txns {
        assert!(cluster.node(0).publish_transaction(t).await.unwrap());
    }
    let ids: Vec<_> = txns.iter().map(|t| cluster.txn_id(&t.id)).collect();

    // Its inbound queue is gone, so every route to it fails
    let (_joiner, inbound) = cluster.net.join("crashed-joiner");
    drop(inbound);
    cluster.settle().await;

    for (t, id) in txns.iter().zip(&ids) {
        assert!(!cluster.holders_of(id).is_empty(), "{} held by no node", t.id);
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_silent_joiner_evicts_nothing() {
    let cluster = cluster(2, config(1));
    let txns: Vec<_> = (0..20).map(|i| txn(i, "carol", &[])).collect();
    for t in &txns {
        cluster.node(1).publish_transaction(t).await.unwrap();
    }

    // Routes succeed but nothing ever answers the existence checks
    let (_joiner, _inbound) = cluster.net.join("silent-joiner");
    cluster.settle().await;

    for t in &txns {
        let id = cluster.txn_id(&t.id);
        assert!(!cluster.holders_of(&id).is_empty(), "{} held by no node", t.id);
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_fetch_refills_an_emptied_replica() {
    let cluster = cluster(3, config(3));
    let t = txn(7, "alice", &[]);
    cluster.node(0).publish_transaction(&t).await.unwrap();
    let id = cluster.txn_id(&t.id);
    assert!(eventually(|| cluster.holders_of(&id).len() == 3).await);

    let node = cluster.node(1);
    node.replication().remove(id);
    node.flush().await.unwrap();
    assert!(!node.replication().has_entries_for_id(&id).unwrap());
    assert_eq!(node.transactions().get_transaction(&t.id).unwrap(), None);

    node.replication().fetch(id, Some(cluster.node(2).handle()));
    node.flush().await.unwrap();
    assert!(node.replication().has_entries_for_id(&id).unwrap());
    assert_eq!(node.transactions().get_transaction(&t.id).unwrap(), Some(t.to_bytes()));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_controller_range_queries_wrap_the_ring() {
    let cluster = cluster(1, config(1));
    let node = cluster.node(0);
    let txns: Vec<_> = (0..12).map(|i| txn(i, "alice", &[])).collect();
    for t in &txns {
        assert!(node.transactions().add_transaction(&t.id, &t.to_bytes()).unwrap());
    }
    let mut ids: Vec<Id> = txns.iter().map(|t| cluster.txn_id(&t.id)).collect();
    ids.sort();

    // After the ninth id, round the origin, up to the third
    let range = IdRange::new(ids[8], ids[2]);
    assert!(range.wraps());
    let expected: Vec<Id> = ids[9..].iter().chain(&ids[..3]).copied().collect();

    let replication = node.replication();
    assert_eq!(replication.get_ids(&range).unwrap(), expected);
    let rows: Vec<Id> = replication.get_entries_for_ids(&range).unwrap().into_iter().map(|(id, _)| id).collect();
    assert_eq!(rows, expected);

    let scanned = replication.scan(&range).unwrap();
    assert_eq!(scanned.iter().map(|(id, _)| *id).collect::<Vec<_>>(), expected);
    for (id, entries) in &scanned {
        assert_eq!(replication.get_entries_for_id(id).unwrap().as_ref(), Some(entries));
    }
    assert_eq!(replication.get_ids(&IdRange::full()).unwrap(), ids);

    cluster.shutdown().await;
}
