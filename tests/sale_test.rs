use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use stockmesh_tests::{closed_port, eventually, seed, TestCluster};
use futures::future::join_all;
use stockmesh::coordinator::{CoordinatorError, SaleCoordinator, SHIPMENT_CODE_LEN};
use stockmesh::network::{
    Directory, ErrorKind, InventoryUpdate, Message, NodeId, PeerAddress, SaleRequest, Transport,
};
use stockmesh::storage::{InventoryStore, MemoryStore};

fn sell(item_id: i64, qty: u64) -> Message {
    Message::Sell(SaleRequest {
        item_id,
        client_id: 1,
        qty,
    })
}

#[tokio::test]
async fn oversized_sale_fails_and_changes_nothing() {
    let cluster = TestCluster::start(&[1, 2], &[]).await;
    let store = cluster.node(2).store();
    let item = seed(store.as_ref(), "lamp", &[(2, 3)]).await;

    let reply = cluster.operator().send(NodeId(2), sell(item, 5)).await;
    match reply {
        Some(Message::Error(e)) => {
            assert_eq!(e.kind, ErrorKind::Business);
            assert!(e.message.contains("Insufficient stock"), "{}", e.message);
        }
        other => panic!("unexpected reply: {:?}", other),
    }

    assert_eq!(store.branch_stock(item, NodeId(2)).await.unwrap().unwrap().qty, 3);
    assert_eq!(store.item(item).await.unwrap().unwrap().available_qty, 3);
    assert!(store.sales().await.unwrap().is_empty());
}

#[tokio::test]
async fn sale_is_replicated_to_peers() {
    let cluster = TestCluster::start(&[1, 2, 3], &[]).await;
    let mut item = 0;
    for id in 1..=3 {
        item = seed(cluster.node(id).store().as_ref(), "chair", &[(1, 4), (2, 6), (3, 2)]).await;
    }

    let reply = cluster.operator().send(NodeId(2), sell(item, 2)).await;
    let receipt = match reply {
        Some(Message::SaleCompleted(receipt)) => receipt,
        other => panic!("unexpected reply: {:?}", other),
    };
    assert_eq!(receipt.remaining_qty, 4);
    assert_eq!(receipt.sale.branch_id, NodeId(2));
    assert_eq!(receipt.sale.shipment_code.len(), SHIPMENT_CODE_LEN);

    let local = cluster.node(2).store();
    assert_eq!(local.branch_stock(item, NodeId(2)).await.unwrap().unwrap().qty, 4);
    assert_eq!(local.item(item).await.unwrap().unwrap().available_qty, 10);

    for peer in [1, 3] {
        let store = cluster.node(peer).store().clone();
        let code = receipt.sale.shipment_code.clone();
        assert!(
            eventually(|| {
                let store = store.clone();
                let code = code.clone();
                async move {
                    let sales = store.sales().await.unwrap();
                    sales.iter().any(|s| s.shipment_code == code)
                }
            })
            .await,
            "sale never reached node {}",
            peer
        );
        assert_eq!(store.branch_stock(item, NodeId(2)).await.unwrap().unwrap().qty, 4);
        assert_eq!(store.item(item).await.unwrap().unwrap().available_qty, 10);
    }
}

#[tokio::test]
async fn sale_succeeds_while_peers_are_down() {
    let cluster = TestCluster::start(&[1], &[2, 3]).await;
    let item = seed(cluster.node(1).store().as_ref(), "desk", &[(1, 5)]).await;

    let reply = cluster.operator().send(NodeId(1), sell(item, 5)).await;
    assert!(matches!(reply, Some(Message::SaleCompleted(ref r)) if r.remaining_qty == 0));
}

#[tokio::test]
async fn concurrent_sales_never_oversell() {
    let cluster = TestCluster::start(&[1], &[]).await;
    let item = seed(cluster.node(1).store().as_ref(), "mug", &[(1, 10)]).await;
    let operator = cluster.operator();

    let replies = join_all((0..25).map(|_| operator.send(NodeId(1), sell(item, 1)))).await;

    let codes: HashSet<String> = replies
        .iter()
        .filter_map(|reply| match reply {
            Some(Message::SaleCompleted(receipt)) => Some(receipt.sale.shipment_code.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(codes.len(), 10);

    let store = cluster.node(1).store();
    assert_eq!(store.branch_stock(item, NodeId(1)).await.unwrap().unwrap().qty, 0);
    assert_eq!(store.sales().await.unwrap().len(), 10);
}

#[tokio::test]
async fn unstocked_item_is_a_business_error() {
    let cluster = TestCluster::start(&[1, 2], &[]).await;
    let item = seed(cluster.node(2).store().as_ref(), "rug", &[(1, 3)]).await;

    match cluster.operator().send(NodeId(2), sell(item, 1)).await {
        Some(Message::Error(e)) => assert_eq!(e.kind, ErrorKind::Business),
        other => panic!("unexpected reply: {:?}", other),
    }
    match cluster.operator().send(NodeId(2), sell(item, 0)).await {
        Some(Message::Error(e)) => assert_eq!(e.kind, ErrorKind::Business),
        other => panic!("unexpected reply: {:?}", other),
    }
}

#[tokio::test]
async fn redelivered_update_is_ignored() {
    let cluster = TestCluster::start(&[1], &[]).await;
    let store = cluster.node(1).store();
    let item = seed(store.as_ref(), "vase", &[(1, 3), (2, 8)]).await;

    let update = Message::InventoryUpdate(InventoryUpdate {
        item_id: item,
        branch_id: NodeId(2),
        new_qty: 5,
        qty: 3,
        client_id: 4,
        shipment_code: "0123456789ABCDEF0123".to_string(),
        timestamp: chrono::Utc::now(),
    });

    let operator = cluster.operator();
    assert_eq!(operator.send(NodeId(1), update.clone()).await, Some(Message::Ack));
    assert_eq!(operator.send(NodeId(1), update).await, Some(Message::Ack));

    assert_eq!(store.sales().await.unwrap().len(), 1);
    assert_eq!(store.branch_stock(item, NodeId(2)).await.unwrap().unwrap().qty, 5);
    assert_eq!(store.item(item).await.unwrap().unwrap().available_qty, 8);
}

#[tokio::test]
async fn ten_thousand_sales_get_distinct_shipment_codes() {
    let store = Arc::new(MemoryStore::new());
    let item = seed(store.as_ref(), "screw", &[(1, 10_000)]).await;

    let directory = Directory::new([(NodeId(1), PeerAddress::new("127.0.0.1", closed_port()))]);
    let transport = Transport::new(NodeId(1), Arc::new(directory), Duration::from_millis(200));
    let sales = SaleCoordinator::new(store.clone(), transport);

    let mut codes = HashSet::new();
    for _ in 0..10_000 {
        let receipt = sales
            .sell(SaleRequest {
                item_id: item,
                client_id: 1,
                qty: 1,
            })
            .await
            .unwrap();
        assert!(codes.insert(receipt.sale.shipment_code));
    }
    assert_eq!(codes.len(), 10_000);

    let err = sales
        .sell(SaleRequest {
            item_id: item,
            client_id: 1,
            qty: 1,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::InsufficientStock { available: 0, .. }));
}
