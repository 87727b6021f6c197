//! Multiplexer-level tests: a `Server` talking to several plain `Peer`
//! clients over an in-memory address-tagged bus, exercising admission,
//! concurrent connections, and timeout reaping.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;

use kcp_transport::{Channel, KcpConfig, Peer, Role, Server, ServerEvent};

type Datagram = Vec<u8>;
type Bus = Rc<RefCell<VecDeque<Datagram>>>;

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{}", port).parse().unwrap()
}

fn config() -> KcpConfig {
    KcpConfig {
        timeout: std::time::Duration::from_millis(2000),
        ..Default::default()
    }
}

struct ClientHarness {
    peer: Peer,
    outbox: Bus,
}

fn make_client(conv: u32) -> ClientHarness {
    let outbox: Bus = Rc::new(RefCell::new(VecDeque::new()));
    let sink = Rc::clone(&outbox);
    let peer = Peer::new(
        Role::Client,
        0,
        conv,
        &config(),
        0,
        move |buf: &[u8]| {
            sink.borrow_mut().push_back(buf.to_vec());
            Ok(())
        },
        |_| {},
    );
    ClientHarness { peer, outbox }
}

/// Drives one client against the server for `ticks` rounds, starting at
/// `start_ms` and advancing by 1ms each round.
fn pump(server: &mut Server, client: &mut ClientHarness, client_addr: SocketAddr, start_ms: u32, ticks: u32) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    for i in 0..ticks {
        let now = start_ms + i;
        events.extend(client.peer.tick_outgoing(now).unwrap());
        while let Some(datagram) = client.outbox.borrow_mut().pop_front() {
            events.extend(server.handle_datagram(client_addr, &datagram, now).unwrap());
        }
        events.extend(server.tick_outgoing(now).unwrap());
    }
    events
}

#[test]
fn handshake_admits_new_connection() {
    let to_clients: Rc<RefCell<Vec<(SocketAddr, Datagram)>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&to_clients);
    let mut server = Server::new(
        config(),
        move |addr, buf: &[u8]| {
            sink.borrow_mut().push((addr, buf.to_vec()));
            Ok(())
        },
        |_| {},
    );

    let mut client = make_client(0xAAAA);
    let client_addr = addr(10001);

    let events = pump(&mut server, &mut client, client_addr, 0, 10);

    assert_eq!(server.connection_count(), 1);
    assert!(events.iter().any(|e| matches!(e, ServerEvent::Connected(_))));
    assert!(client.peer.is_authenticated());
}

#[test]
fn two_clients_get_independent_connection_ids() {
    let mut server = Server::new(config(), |_addr, _buf: &[u8]| Ok(()), |_| {});

    let mut client_a = make_client(1);
    let mut client_b = make_client(2);
    let addr_a = addr(20001);
    let addr_b = addr(20002);

    pump(&mut server, &mut client_a, addr_a, 0, 10);
    pump(&mut server, &mut client_b, addr_b, 0, 10);

    assert_eq!(server.connection_count(), 2);
    assert!(client_a.peer.is_authenticated());
    assert!(client_b.peer.is_authenticated());
}

#[test]
fn message_from_client_surfaces_as_server_event() {
    let to_clients: Rc<RefCell<Vec<(SocketAddr, Datagram)>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&to_clients);
    let mut server = Server::new(
        config(),
        move |addr, buf: &[u8]| {
            sink.borrow_mut().push((addr, buf.to_vec()));
            Ok(())
        },
        |_| {},
    );

    let mut client = make_client(0xBEEF);
    let client_addr = addr(30001);
    pump(&mut server, &mut client, client_addr, 0, 10);
    assert!(client.peer.is_authenticated());

    client.peer.send(b"hello server", Channel::Reliable).unwrap();
    let events = pump(&mut server, &mut client, client_addr, 10, 20);

    let payloads: Vec<_> = events
        .into_iter()
        .filter_map(|e| match e {
            ServerEvent::Message { payload, .. } => Some(payload),
            _ => None,
        })
        .collect();
    assert_eq!(payloads, vec![b"hello server".to_vec()]);
}

#[test]
fn silent_connection_is_reaped_after_timeout() {
    let mut server = Server::new(config(), |_addr, _buf: &[u8]| Ok(()), |_| {});

    let mut client = make_client(7);
    let client_addr = addr(40001);
    pump(&mut server, &mut client, client_addr, 0, 10);
    assert_eq!(server.connection_count(), 1);

    let events = server.tick_outgoing(3000).unwrap();
    assert!(events.iter().any(|e| matches!(e, ServerEvent::Disconnected(_, _))));
    assert_eq!(server.connection_count(), 0);
}

#[test]
fn unauthenticated_garbage_does_not_create_a_connection() {
    let mut server = Server::new(config(), |_addr, _buf: &[u8]| Ok(()), |_| {});
    let from = addr(50001);

    let events = server.handle_datagram(from, &[0xFF; 3], 0).unwrap();
    assert!(events.is_empty());
    assert_eq!(server.connection_count(), 0);
}
