use stockmesh_tests::TestCluster;
use stockmesh::network::{ErrorKind, LockRequest, Message, NodeId};

fn granted(reply: &Option<Message>) -> bool {
    match reply {
        Some(Message::LockReply(reply)) => reply.granted,
        other => panic!("unexpected reply: {:?}", other),
    }
}

#[tokio::test]
async fn concurrent_acquires_grant_exactly_one() {
    let cluster = TestCluster::start(&[1, 2, 3], &[]).await;
    let acquire = Message::LockAcquire(LockRequest { resource: 42 });

    let (from_two, from_three) = tokio::join!(
        cluster.node(2).transport().send(NodeId(1), acquire.clone()),
        cluster.node(3).transport().send(NodeId(1), acquire.clone()),
    );

    assert!(granted(&from_two) ^ granted(&from_three));
}

#[tokio::test]
async fn only_the_holder_can_release() {
    let cluster = TestCluster::start(&[1, 2, 3], &[]).await;
    let two = cluster.node(2).transport();
    let three = cluster.node(3).transport();

    assert!(granted(&two.send(NodeId(1), Message::LockAcquire(LockRequest { resource: 7 })).await));

    let reply = three.send(NodeId(1), Message::LockRelease(LockRequest { resource: 7 })).await;
    assert!(!granted(&reply));
    match reply {
        Some(Message::LockReply(reply)) => assert_eq!(reply.holder, Some(NodeId(2))),
        other => panic!("unexpected reply: {:?}", other),
    }

    assert!(!granted(&three.send(NodeId(1), Message::LockAcquire(LockRequest { resource: 7 })).await));
    assert!(granted(&two.send(NodeId(1), Message::LockRelease(LockRequest { resource: 7 })).await));
    assert!(granted(&three.send(NodeId(1), Message::LockAcquire(LockRequest { resource: 7 })).await));
}

#[tokio::test]
async fn followers_refuse_to_host_locks() {
    let cluster = TestCluster::start(&[1, 2], &[]).await;

    let reply = cluster
        .node(1)
        .transport()
        .send(NodeId(2), Message::LockAcquire(LockRequest { resource: 1 }))
        .await;

    match reply {
        Some(Message::Error(e)) => {
            assert_eq!(e.kind, ErrorKind::Business);
            assert!(e.message.contains("not the leader"));
        }
        other => panic!("unexpected reply: {:?}", other),
    }
}

#[tokio::test]
async fn lock_client_goes_through_the_leader() {
    let cluster = TestCluster::start(&[1, 2, 3], &[]).await;

    assert!(cluster.node(2).consensus().acquire(5).await.unwrap());
    assert!(!cluster.node(3).consensus().acquire(5).await.unwrap());
    assert!(!cluster.node(1).consensus().acquire(5).await.unwrap());

    assert!(!cluster.node(3).consensus().release(5).await.unwrap());
    assert!(cluster.node(2).consensus().release(5).await.unwrap());

    // The leader takes locks from its own table.
    assert!(cluster.node(1).consensus().acquire(5).await.unwrap());
    assert!(!cluster.node(2).consensus().acquire(5).await.unwrap());
    assert!(cluster.node(1).consensus().release(5).await.unwrap());
}

#[tokio::test]
async fn lock_client_reports_unreachable_leader() {
    let cluster = TestCluster::start(&[2], &[3]).await;

    // Node 2 starts as leader; point it at the dead node instead.
    cluster
        .node(2)
        .consensus()
        .handle_leader_confirmed(NodeId(3))
        .await;

    let err = cluster.node(2).consensus().acquire(9).await.unwrap_err();
    assert!(matches!(err, stockmesh::consensus::ConsensusError::LeaderUnreachable(id) if id == NodeId(3)));
}
