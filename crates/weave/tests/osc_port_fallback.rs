//! Two OSC domains competing for one port

use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rosc::{OscMessage, OscPacket, OscType};
use weave::osc::{encode_message, HANDSHAKE_ACK_ADDR, HANDSHAKE_ADDR};
use weave::{AppHooks, Domain, DomainContext, OscConfig, OscDomain, OscRole, Parameter};

fn free_port() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

fn config(port: u16) -> OscConfig {
    OscConfig {
        port,
        bind_address: "127.0.0.1".to_string(),
        max_port_offset: 100,
    }
}

fn started(config: OscConfig) -> OscDomain {
    let mut osc = OscDomain::new(config);
    osc.initialize(&DomainContext::default()).unwrap();
    osc.start().unwrap();
    osc
}

fn client() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    socket
}

fn request(socket: &UdpSocket, port: u16, msg: OscMessage) -> OscMessage {
    let to: SocketAddr = ([127, 0, 0, 1], port).into();
    socket.send_to(&encode_message(&msg).unwrap(), to).unwrap();
    let mut buf = [0u8; 1024];
    let (len, _) = socket.recv_from(&mut buf).unwrap();
    match rosc::decoder::decode_udp(&buf[..len]).unwrap().1 {
        OscPacket::Message(reply) => reply,
        other => panic!("expected a message, got {:?}", other),
    }
}

#[test]
fn test_second_domain_falls_back_to_a_higher_port() {
    let port = free_port();
    let mut first = started(config(port));
    let mut second = started(config(port));

    assert_eq!(first.role(), OscRole::Primary);
    assert_eq!(first.resolved_port(), Some(port));

    assert_eq!(second.role(), OscRole::Command);
    let resolved = second.resolved_port().unwrap();
    assert!(resolved > port && resolved <= port + 100);
    assert_eq!(second.config().port, resolved);

    second.stop().unwrap();
    first.stop().unwrap();
    second.cleanup().unwrap();
    first.cleanup().unwrap();
}

#[test]
fn test_command_instance_answers_handshake_with_its_port() {
    let port = free_port();
    let mut first = started(config(port));
    let mut second = started(config(port));
    let resolved = second.resolved_port().unwrap();

    let socket = client();
    let ack = request(
        &socket,
        resolved,
        OscMessage {
            addr: HANDSHAKE_ADDR.to_string(),
            args: vec![],
        },
    );

    assert_eq!(ack.addr, HANDSHAKE_ACK_ADDR);
    assert_eq!(
        ack.args,
        vec![
            OscType::String("command".to_string()),
            OscType::Int(i32::from(resolved)),
        ]
    );
    assert_eq!(second.peers(), vec![socket.local_addr().unwrap()]);

    second.cleanup().unwrap();
    first.cleanup().unwrap();
}

#[test]
fn test_parameters_and_hook_over_udp() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let mut hooks = AppHooks::new().on_message(move |msg, _from| {
        sink.lock().unwrap().push(msg.addr.clone());
    });

    let mut osc = OscDomain::new(config(free_port()));
    osc.bind_callbacks(&mut hooks);
    let level = Parameter::new("/level", 0.0, 0.0, 10.0);
    osc.register_parameter(level.clone());
    osc.initialize(&DomainContext::default()).unwrap();
    osc.start().unwrap();
    let port = osc.resolved_port().unwrap();

    let socket = client();
    let to: SocketAddr = ([127, 0, 0, 1], port).into();
    let set = OscMessage {
        addr: "/level".to_string(),
        args: vec![OscType::Float(4.0)],
    };
    socket.send_to(&encode_message(&set).unwrap(), to).unwrap();
    let free = OscMessage {
        addr: "/free".to_string(),
        args: vec![OscType::Int(1)],
    };
    socket.send_to(&encode_message(&free).unwrap(), to).unwrap();

    // The query is answered after the set and the free message were handled.
    let reply = request(
        &socket,
        port,
        OscMessage {
            addr: "/level".to_string(),
            args: vec![],
        },
    );
    assert_eq!(reply.args, vec![OscType::Float(4.0)]);
    assert_eq!(level.get(), 4.0);
    assert_eq!(*seen.lock().unwrap(), vec!["/free"]);

    osc.stop().unwrap();
    osc.cleanup().unwrap();
}

#[test]
fn test_exhausted_range_fails_start() {
    let taken = UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();
    let mut osc = OscDomain::new(OscConfig {
        max_port_offset: 0,
        ..config(port)
    });
    osc.initialize(&DomainContext::default()).unwrap();

    let err = osc.start().unwrap_err();
    assert!(matches!(err, weave::DomainError::PortRangeExhausted { .. }));
    osc.cleanup().unwrap();
}

#[test]
fn test_restart_searches_from_the_configured_port() {
    let port = free_port();
    let mut first = started(config(port));
    let mut second = started(config(port));
    let fallback = second.resolved_port().unwrap();
    assert_eq!(second.role(), OscRole::Command);

    second.stop().unwrap();
    second.start().unwrap();

    assert_eq!(second.base_port(), port);
    assert_eq!(second.role(), OscRole::Command);
    let resolved = second.resolved_port().unwrap();
    assert!(resolved > port && resolved <= port + 100);
    assert_eq!(second.config().port, resolved);

    let socket = client();
    let ack = request(
        &socket,
        resolved,
        OscMessage {
            addr: HANDSHAKE_ADDR.to_string(),
            args: vec![],
        },
    );
    assert_eq!(ack.args[0], OscType::String("command".to_string()));

    // With the primary gone, a restart takes the configured port again.
    first.stop().unwrap();
    second.stop().unwrap();
    second.start().unwrap();
    assert_eq!(second.role(), OscRole::Primary);
    assert_eq!(second.resolved_port(), Some(port));
    assert_ne!(second.resolved_port(), Some(fallback));

    second.cleanup().unwrap();
    first.cleanup().unwrap();
}

#[test]
fn test_stopped_listener_delivers_nothing() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let mut osc = OscDomain::new(config(free_port()));
    osc.set_message_hook(move |msg, _from| {
        sink.lock().unwrap().push(msg.addr.clone());
    });
    osc.initialize(&DomainContext::default()).unwrap();
    osc.start().unwrap();
    let to: SocketAddr = ([127, 0, 0, 1], osc.resolved_port().unwrap()).into();

    osc.stop().unwrap();

    let socket = client();
    let late = OscMessage {
        addr: "/late".to_string(),
        args: vec![OscType::Int(1)],
    };
    // The port may already be closed; a refused send is fine here.
    let _ = socket.send_to(&encode_message(&late).unwrap(), to);
    thread::sleep(Duration::from_millis(100));

    assert!(seen.lock().unwrap().is_empty());
    osc.cleanup().unwrap();
}
