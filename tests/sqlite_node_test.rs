use std::sync::Arc;
use std::time::Duration;

use stockmesh_tests::article;
use stockmesh::network::{Directory, Message, NodeId, PeerAddress, RpcServer, SaleRequest, Transport};
use stockmesh::storage::{InventoryStore, NewClient, SqliteStore};
use stockmesh::{Config, Node};

#[tokio::test]
async fn single_node_on_sqlite_serves_the_full_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("branch-1.db");

    let server = RpcServer::bind(NodeId(1), "127.0.0.1:0").await.unwrap();
    let port = server.local_addr().unwrap().port();
    let address = PeerAddress::new("127.0.0.1", port);

    let mut config = Config::new(NodeId(1), [(NodeId(1), address.clone())]);
    config.database = path.to_string_lossy().into_owned();
    let store = SqliteStore::open_with_capacity(&config.database, config.default_branch_capacity).unwrap();
    let node = Node::new(config, store).unwrap();
    tokio::spawn(node.clone().run(server));

    let operator = Transport::new(
        NodeId::OPERATOR,
        Arc::new(Directory::new([(NodeId(1), address)])),
        Duration::from_secs(5),
    );

    let item = match operator.send(NodeId(1), Message::AddArticle(article("drill", 8))).await {
        Some(Message::ArticleAdded(announcement)) => announcement.item.id,
        other => panic!("unexpected reply: {:?}", other),
    };

    let client = match operator
        .send(
            NodeId(1),
            Message::RegisterClient(NewClient {
                name: "Ana".to_string(),
                address: "Calle Mayor 1".to_string(),
                phone: None,
                email: Some("ana@example.com".to_string()),
                home_branch: NodeId(1),
            }),
        )
        .await
    {
        Some(Message::ClientRegistered(client)) => client,
        other => panic!("unexpected reply: {:?}", other),
    };

    let receipt = match operator
        .send(
            NodeId(1),
            Message::Sell(SaleRequest {
                item_id: item,
                client_id: client.id,
                qty: 3,
            }),
        )
        .await
    {
        Some(Message::SaleCompleted(receipt)) => receipt,
        other => panic!("unexpected reply: {:?}", other),
    };
    assert_eq!(receipt.remaining_qty, 5);

    match operator.send(NodeId(1), Message::QueryInventory).await {
        Some(Message::Inventory(report)) => {
            assert_eq!(report.branch, NodeId(1));
            assert_eq!(report.lines.len(), 1);
            assert_eq!(report.lines[0].branch_qty, 5);
            assert_eq!(report.lines[0].total_qty, 8);
        }
        other => panic!("unexpected reply: {:?}", other),
    }

    match operator.send(NodeId(1), Message::QueryClients).await {
        Some(Message::Clients(list)) => assert_eq!(list.clients, vec![client]),
        other => panic!("unexpected reply: {:?}", other),
    }

    node.shutdown();

    // Everything above was committed to the file.
    let reopened = SqliteStore::open(path.to_str().unwrap()).unwrap();
    let sales = reopened.sales().await.unwrap();
    assert_eq!(sales.len(), 1);
    assert_eq!(sales[0].shipment_code, receipt.sale.shipment_code);
    assert_eq!(reopened.item(item).await.unwrap().unwrap().available_qty, 5);
}
