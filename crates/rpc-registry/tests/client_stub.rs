//! Client stub behaviour over channel-backed connections

mod common;

use common::*;
use rpc_registry::{
    ChildEvent, ClientConfig, ClientStub, Endpoint, MessageKind, NotifyEvent, Registration,
    RegistryPush, ServiceKey,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn stub() -> ClientStub {
    ClientStub::new(&ClientConfig::new("127.0.0.1:20001"))
}

fn recorder() -> (Arc<Mutex<Vec<NotifyEvent>>>, impl Fn(&NotifyEvent) + Send + Sync) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    (events, move |event: &NotifyEvent| {
        sink.lock().unwrap().push(event.clone())
    })
}

fn push(
    sequence_id: i64,
    kind: MessageKind,
    key: &ServiceKey,
    registrations: Vec<Registration>,
    version: i64,
) -> rpc_registry::Envelope {
    request(
        sequence_id,
        kind,
        &RegistryPush {
            service_key: key.clone(),
            registrations,
            version,
        },
    )
}

#[test]
fn test_requests_before_connect_are_replayed_once() {
    let stub = stub();
    let greeter = key("Greeter");
    let reg = registration(&greeter, "10.0.0.5", 9000);
    let (_events, listener) = recorder();
    stub.subscribe(greeter.clone(), Arc::new(listener)).unwrap();
    stub.register(reg.clone()).unwrap();
    assert_eq!(stub.pending_acks(), 0);

    let mut server = ChannelPeer::new(100, 20001);
    stub.connection_active(server.connection.clone()).unwrap();

    let sent = server.drain();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].kind, MessageKind::SubscribeService);
    assert_eq!(sent[0].payload::<ServiceKey>().unwrap(), greeter);
    assert_eq!(sent[1].kind, MessageKind::PublishService);
    assert_eq!(sent[1].payload::<Registration>().unwrap(), reg);
    assert_eq!(stub.pending_acks(), 2);

    // explicit calls for state already sent on this connection are not repeated
    let (_more, listener) = recorder();
    stub.subscribe(greeter.clone(), Arc::new(listener)).unwrap();
    stub.register(reg).unwrap();
    assert!(server.drain().is_empty());

    stub.handle(ack(sent[0].sequence_id)).unwrap();
    stub.handle(ack(sent[1].sequence_id)).unwrap();
    assert_eq!(stub.pending_acks(), 0);
}

#[test]
fn test_reconnect_replays_desired_state() {
    let stub = stub();
    let greeter = key("Greeter");
    let reg = registration(&greeter, "10.0.0.5", 9000);

    let mut first = ChannelPeer::new(100, 20001);
    stub.connection_active(first.connection.clone()).unwrap();
    let (_events, listener) = recorder();
    stub.subscribe(greeter.clone(), Arc::new(listener)).unwrap();
    stub.register(reg.clone()).unwrap();
    assert_eq!(first.drain().len(), 2);

    stub.connection_inactive(first.connection.id());
    assert!(!stub.is_connected());

    let mut second = ChannelPeer::new(100, 20001);
    stub.connection_active(second.connection.clone()).unwrap();
    assert!(stub.is_connected());
    let replayed = second.drain();
    let kinds: Vec<MessageKind> = replayed.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![MessageKind::SubscribeService, MessageKind::PublishService]
    );

    // requests from the dead connection are not resent
    let later = Instant::now() + Duration::from_secs(11);
    assert_eq!(stub.retransmit_expired(later), 2);
    assert!(first.drain().is_empty());
    assert_eq!(second.drain().len(), 2);
}

#[test]
fn test_unregister_is_not_replayed() {
    let stub = stub();
    let greeter = key("Greeter");
    let reg = registration(&greeter, "10.0.0.5", 9000);

    let mut first = ChannelPeer::new(100, 20001);
    stub.connection_active(first.connection.clone()).unwrap();
    stub.register(reg.clone()).unwrap();
    stub.unregister(reg.clone()).unwrap();
    let sent = first.drain();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].kind, MessageKind::PublishCancelService);

    stub.connection_inactive(first.connection.id());
    let mut second = ChannelPeer::new(100, 20001);
    stub.connection_active(second.connection.clone()).unwrap();
    assert!(second.drain().is_empty());
}

#[test]
fn test_push_is_acked_and_applied() {
    let stub = stub();
    let greeter = key("Greeter");
    let (events, listener) = recorder();
    stub.subscribe(greeter.clone(), Arc::new(listener)).unwrap();

    let mut server = ChannelPeer::new(100, 20001);
    stub.connection_active(server.connection.clone()).unwrap();
    server.drain();

    let a = registration(&greeter, "10.0.0.1", 9000);
    stub.handle(push(
        41,
        MessageKind::PublishService,
        &greeter,
        vec![a.clone()],
        1,
    ))
    .unwrap();

    let acks = server.drain_kind(MessageKind::Ack);
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].sequence_id, 41);
    assert_eq!(stub.lookup(&greeter), vec![a.clone()]);

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, ChildEvent::ChildAdded);
    assert_eq!(events[0].registrations, vec![a]);
    assert_eq!(events[0].version, 1);
}

#[test]
fn test_stale_push_is_acked_but_ignored() {
    let stub = stub();
    let greeter = key("Greeter");
    let (events, listener) = recorder();
    stub.subscribe(greeter.clone(), Arc::new(listener)).unwrap();
    let mut server = ChannelPeer::new(100, 20001);
    stub.connection_active(server.connection.clone()).unwrap();
    server.drain();

    let a = registration(&greeter, "10.0.0.1", 9000);
    let b = registration(&greeter, "10.0.0.1", 9001);
    stub.handle(push(
        1,
        MessageKind::PublishService,
        &greeter,
        vec![a.clone(), b.clone()],
        2,
    ))
    .unwrap();
    stub.handle(push(2, MessageKind::PublishService, &greeter, vec![a], 1))
        .unwrap();
    stub.handle(push(
        3,
        MessageKind::PublishService,
        &greeter,
        vec![b.clone()],
        2,
    ))
    .unwrap();

    assert_eq!(server.drain_kind(MessageKind::Ack).len(), 3);
    assert_eq!(events.lock().unwrap().len(), 1);
    assert_eq!(stub.lookup(&greeter).len(), 2);
}

#[test]
fn test_version_gate_resets_on_reconnect() {
    let stub = stub();
    let greeter = key("Greeter");
    let (events, listener) = recorder();
    stub.subscribe(greeter.clone(), Arc::new(listener)).unwrap();

    let first = ChannelPeer::new(100, 20001);
    stub.connection_active(first.connection.clone()).unwrap();
    let a = registration(&greeter, "10.0.0.1", 9000);
    stub.handle(push(1, MessageKind::PublishService, &greeter, vec![a.clone()], 5))
        .unwrap();

    // a restarted registry starts counting again
    stub.connection_inactive(first.connection.id());
    let second = ChannelPeer::new(100, 20001);
    stub.connection_active(second.connection.clone()).unwrap();
    stub.handle(push(1, MessageKind::PublishService, &greeter, vec![a], 1))
        .unwrap();

    assert_eq!(events.lock().unwrap().len(), 2);
}

#[test]
fn test_cancel_surfaces_removed_registrations() {
    let stub = stub();
    let greeter = key("Greeter");
    let (events, listener) = recorder();
    stub.subscribe(greeter.clone(), Arc::new(listener)).unwrap();
    let server = ChannelPeer::new(100, 20001);
    stub.connection_active(server.connection.clone()).unwrap();

    let a = registration(&greeter, "10.0.0.1", 9000);
    let b = registration(&greeter, "10.0.0.2", 9000);
    stub.handle(push(
        1,
        MessageKind::PublishService,
        &greeter,
        vec![a.clone(), b.clone()],
        2,
    ))
    .unwrap();
    stub.handle(push(
        2,
        MessageKind::PublishCancelService,
        &greeter,
        vec![b.clone()],
        3,
    ))
    .unwrap();

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].kind, ChildEvent::ChildRemoved);
    assert_eq!(events[1].registrations, vec![a]);
    assert_eq!(events[1].version, 3);
    assert_eq!(stub.lookup(&greeter), vec![b]);
}

#[test]
fn test_removals_missed_while_disconnected_are_surfaced() {
    let stub = stub();
    let greeter = key("Greeter");
    let (events, listener) = recorder();
    stub.subscribe(greeter.clone(), Arc::new(listener)).unwrap();

    let first = ChannelPeer::new(100, 20001);
    stub.connection_active(first.connection.clone()).unwrap();
    let a = registration(&greeter, "10.0.0.1", 9000);
    let b = registration(&greeter, "10.0.0.2", 9000);
    stub.handle(push(
        1,
        MessageKind::PublishService,
        &greeter,
        vec![a.clone(), b.clone()],
        2,
    ))
    .unwrap();

    // a went away during the outage; the restarted registry only knows b
    stub.connection_inactive(first.connection.id());
    let second = ChannelPeer::new(100, 20001);
    stub.connection_active(second.connection.clone()).unwrap();
    stub.handle(push(1, MessageKind::PublishService, &greeter, vec![b.clone()], 1))
        .unwrap();

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].kind, ChildEvent::ChildAdded);
    assert_eq!(events[1].kind, ChildEvent::ChildRemoved);
    assert_eq!(events[1].registrations, vec![a]);
    assert_eq!(events[1].version, 1);
    assert_eq!(events[2].kind, ChildEvent::ChildAdded);
    assert_eq!(events[2].registrations, vec![b.clone()]);
    assert_eq!(stub.lookup(&greeter), vec![b]);
}

#[test]
fn test_cancel_push_with_unseen_registrations_surfaces_them() {
    let stub = stub();
    let greeter = key("Greeter");
    let (events, listener) = recorder();
    stub.subscribe(greeter.clone(), Arc::new(listener)).unwrap();
    let server = ChannelPeer::new(100, 20001);
    stub.connection_active(server.connection.clone()).unwrap();

    let a = registration(&greeter, "10.0.0.1", 9000);
    let b = registration(&greeter, "10.0.0.2", 9000);
    stub.handle(push(1, MessageKind::PublishService, &greeter, vec![a.clone()], 1))
        .unwrap();
    // the push announcing b was superseded before it arrived
    stub.handle(push(
        2,
        MessageKind::PublishCancelService,
        &greeter,
        vec![b.clone()],
        3,
    ))
    .unwrap();

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(events[1].kind, ChildEvent::ChildRemoved);
    assert_eq!(events[1].registrations, vec![a]);
    assert_eq!(events[2].kind, ChildEvent::ChildAdded);
    assert_eq!(events[2].registrations, vec![b.clone()]);
    assert_eq!(stub.lookup(&greeter), vec![b]);
}

#[test]
fn test_offline_listeners_are_called() {
    let stub = stub();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    stub.add_offline_listener(Arc::new(move |endpoint: &Endpoint| {
        sink.lock().unwrap().push(endpoint.clone())
    }));

    let mut server = ChannelPeer::new(100, 20001);
    stub.connection_active(server.connection.clone()).unwrap();
    let gone = Endpoint::new("10.0.0.1", 9000);
    stub.handle(request(9, MessageKind::OfflineNotice, &gone))
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![gone]);
    // offline notices are not acknowledged
    assert!(server.drain().is_empty());
}

#[test]
fn test_retransmit_skips_superseded_requests() {
    let stub = stub();
    let greeter = key("Greeter");
    let reg = registration(&greeter, "10.0.0.5", 9000);
    let mut server = ChannelPeer::new(100, 20001);
    stub.connection_active(server.connection.clone()).unwrap();

    stub.register(reg.clone()).unwrap();
    stub.unregister(reg.clone()).unwrap();
    server.drain();
    assert_eq!(stub.pending_acks(), 2);

    let later = Instant::now() + Duration::from_secs(11);
    assert_eq!(stub.retransmit_expired(later), 1);
    let resent = server.drain();
    assert_eq!(resent.len(), 1);
    assert_eq!(resent[0].kind, MessageKind::PublishCancelService);
    assert_eq!(stub.pending_acks(), 1);
}

#[test]
fn test_shutdown_withdraws_without_tracking() {
    let stub = stub();
    let reg = registration(&key("Greeter"), "10.0.0.5", 9000);
    let mut server = ChannelPeer::new(100, 20001);
    stub.connection_active(server.connection.clone()).unwrap();
    stub.register(reg.clone()).unwrap();
    let published = server.drain();
    stub.handle(ack(published[0].sequence_id)).unwrap();

    stub.shutdown();
    assert!(stub.is_shutdown());
    assert!(!server.connection.is_active());
    assert_eq!(stub.pending_acks(), 0);

    let withdrawn = server.drain();
    assert_eq!(withdrawn.len(), 1);
    assert_eq!(withdrawn[0].kind, MessageKind::PublishCancelService);
    assert_eq!(withdrawn[0].payload::<Registration>().unwrap(), reg);

    stub.unregister(reg).unwrap();
    assert_eq!(stub.pending_acks(), 0);

    // connections arriving after shutdown are closed straight away
    let late = ChannelPeer::new(100, 20001);
    stub.connection_active(late.connection.clone()).unwrap();
    assert!(!late.connection.is_active());
}
