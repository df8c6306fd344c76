//! State replication over loopback UDP

use std::net::UdpSocket;
use std::thread;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};
use weave::{
    Domain, DomainContext, DomainError, JsonCodec, StateReceiveConfig, StateReceiveDomain,
    StateRole, StateSendConfig, StateSendDomain, StateSimulationDomain, StateSnapshot,
    SynchronousDomain,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Scene {
    frame: u64,
    position: [f32; 3],
    label: String,
    active: Vec<u16>,
}

fn scene() -> Scene {
    Scene {
        frame: 42,
        position: [0.5, -1.25, 3.0],
        label: "orbit".to_string(),
        active: vec![1, 3, 5],
    }
}

fn free_port() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

fn up<D: Domain>(domain: &mut D) {
    domain.initialize(&DomainContext::default()).unwrap();
    domain.start().unwrap();
}

fn receiver_on_any_port<C: weave::StateCodec>(
    snapshot: StateSnapshot<Scene>,
) -> (StateReceiveDomain<Scene, C>, String) {
    let mut receiver: StateReceiveDomain<Scene, C> = StateReceiveDomain::new(
        StateReceiveConfig {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
        },
        snapshot,
    );
    up(&mut receiver);
    let destination = receiver.local_addr().unwrap().to_string();
    (receiver, destination)
}

fn sender_to<C: weave::StateCodec>(
    destination: String,
    snapshot: StateSnapshot<Scene>,
) -> StateSendDomain<Scene, C> {
    let mut sender: StateSendDomain<Scene, C> = StateSendDomain::new(
        StateSendConfig {
            destinations: vec![destination],
            ..StateSendConfig::default()
        },
        snapshot,
    );
    up(&mut sender);
    sender
}

/// Poll until a state arrives, or give up after about a second.
fn poll_until_received<C: weave::StateCodec>(receiver: &mut StateReceiveDomain<Scene, C>) -> bool {
    for _ in 0..100 {
        if receiver.poll().unwrap() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn test_msgpack_state_arrives_intact() {
    let inbound = StateSnapshot::new();
    let (mut receiver, destination) = receiver_on_any_port::<weave::MsgPackCodec>(inbound.clone());

    let outbound = StateSnapshot::new();
    let mut sender = sender_to::<weave::MsgPackCodec>(destination, outbound.clone());

    sender.tick(0.016).unwrap();
    assert_eq!(sender.sequence(), 0, "nothing published yet");

    outbound.publish(scene());
    sender.tick(0.016).unwrap();

    assert!(poll_until_received(&mut receiver));
    assert_eq!(*inbound.latest().unwrap(), scene());
    assert_eq!(receiver.last_packet(), Some((sender.sender_id(), 0)));
}

#[test]
fn test_json_codec_and_latest_wins() {
    let inbound = StateSnapshot::new();
    let (mut receiver, destination) = receiver_on_any_port::<JsonCodec>(inbound.clone());
    let outbound = StateSnapshot::new();
    let mut sender = sender_to::<JsonCodec>(destination, outbound.clone());

    for frame in 1..=3 {
        outbound.publish(Scene {
            frame,
            ..scene()
        });
        sender.tick(0.016).unwrap();
    }
    // Give all three datagrams time to land so one poll drains them.
    thread::sleep(Duration::from_millis(50));

    assert!(poll_until_received(&mut receiver));
    assert_eq!(inbound.latest().unwrap().frame, 3);
    assert_eq!(sender.sequence(), 3);
}

#[test]
fn test_oversized_state_is_rejected() {
    let (_receiver, destination) = receiver_on_any_port::<weave::MsgPackCodec>(StateSnapshot::new());
    let outbound = StateSnapshot::new();
    let mut sender: StateSendDomain<Scene> = StateSendDomain::new(
        StateSendConfig {
            destinations: vec![destination],
            max_packet_size: 16,
        },
        outbound.clone(),
    );
    up(&mut sender);

    outbound.publish(scene());
    let err = sender.tick(0.016).unwrap_err();
    assert!(matches!(err, DomainError::PacketTooLarge { limit: 16, .. }));
    assert_eq!(sender.sequence(), 0);
}

#[test]
fn test_unresolvable_destination_fails_initialize() {
    let mut sender: StateSendDomain<Scene> = StateSendDomain::new(
        StateSendConfig {
            destinations: vec!["not an address".to_string()],
            ..StateSendConfig::default()
        },
        StateSnapshot::new(),
    );
    let err = sender.initialize(&DomainContext::default()).unwrap_err();
    assert!(matches!(err, DomainError::ResourceUnavailable { .. }));
}

#[test]
fn test_replica_follows_primary() {
    let port = free_port();

    let mut replica = StateSimulationDomain::new("replica", StateRole::Replica, Scene::default())
        .with_simulation(|scene: &mut Scene, _| scene.label = "replica ran".to_string());
    replica.add_state_receiver(StateReceiveConfig {
        bind_address: "127.0.0.1".to_string(),
        port,
    });
    up(&mut replica);

    let mut primary = StateSimulationDomain::new("primary", StateRole::Primary, scene())
        .with_simulation(|scene: &mut Scene, _| scene.frame += 1);
    primary.add_state_sender(StateSendConfig {
        destinations: vec![format!("127.0.0.1:{}", port)],
        ..StateSendConfig::default()
    });
    up(&mut primary);

    primary.tick(1.0 / 60.0).unwrap();
    primary.tick(1.0 / 60.0).unwrap();

    let mut caught_up = false;
    for _ in 0..100 {
        replica.tick(1.0 / 60.0).unwrap();
        if replica.shared_state().frame == 44 {
            caught_up = true;
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }

    assert!(caught_up, "replica never saw frame 44");
    assert_eq!(replica.shared_state(), primary.shared_state());
    assert_eq!(replica.outbound().latest().unwrap().label, "orbit");

    primary.stop().unwrap();
    replica.stop().unwrap();
    primary.cleanup().unwrap();
    replica.cleanup().unwrap();
}
