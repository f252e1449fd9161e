mod common;

use common::{cluster, config, eventually};
use std::collections::BTreeSet;
use strata_kernel::EpochPublish;
use strata_model::{Epoch, TxnPeerId};

fn batch(ids: &[i32]) -> BTreeSet<TxnPeerId> {
    ids.iter().map(|&i| TxnPeerId::new(i, "alice")).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_epoch_publish_collision_reports_last_epoch() {
    let cluster = cluster(3, config(3));
    let node = cluster.node(1);

    assert_eq!(node.publish_epoch(Epoch(5), batch(&[1, 2])).await.unwrap(), EpochPublish::Published);
    assert_eq!(
        node.publish_epoch(Epoch(5), batch(&[3])).await.unwrap(),
        EpochPublish::Exists { last_epoch: Some(Epoch(5)) }
    );

    // The first contents win
    assert_eq!(node.fetch_epoch(Epoch(5)).await.unwrap(), Some(batch(&[1, 2])));
    assert_eq!(node.fetch_epoch(Epoch(6)).await.unwrap(), None);
    assert_eq!(node.most_recent_epoch().await.unwrap(), Some(Epoch(5)));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_publish_next_epoch_skips_taken_numbers() {
    let cluster = cluster(3, config(3));

    assert_eq!(cluster.node(0).publish_next_epoch(batch(&[1])).await.unwrap(), Epoch(0));
    assert_eq!(cluster.node(2).publish_next_epoch(batch(&[2])).await.unwrap(), Epoch(1));

    cluster.node(1).publish_epoch(Epoch(7), batch(&[3])).await.unwrap();
    assert_eq!(cluster.node(0).publish_next_epoch(batch(&[4])).await.unwrap(), Epoch(8));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_published_epoch_is_shared_with_replica_set() {
    let cluster = cluster(3, config(3));
    cluster.node(0).publish_epoch(Epoch(1), batch(&[9])).await.unwrap();

    let shared = eventually(|| {
        cluster.nodes.iter().all(|n| n.epochs().get_epoch(Epoch(1)).unwrap() == Some(batch(&[9])))
    })
    .await;
    assert!(shared, "every replica should hold epoch 1");

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_add_epoch_has_one_winner() {
    let cluster = cluster(1, config(1));
    let epochs = cluster.node(0).epochs().clone();

    let results: Vec<bool> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|i| {
                let epochs = epochs.clone();
                s.spawn(move || epochs.add_epoch(Epoch(3), &batch(&[i])).unwrap())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|won| **won).count(), 1);
    let stored = epochs.get_epoch(Epoch(3)).unwrap().unwrap();
    assert!(stored == batch(&[0]) || stored == batch(&[1]));

    cluster.shutdown().await;
}
