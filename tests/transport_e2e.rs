//! End-to-end transport scenarios over loopback TCP.

use std::sync::Barrier;
use std::thread;
use std::time::Duration;

use netmux::{
    ConnectError, ConnectHints, Connection, EndPoint, EndPointAddr, Event, Reliability, SendError,
    TcpTransport,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

fn transport() -> TcpTransport {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    TcpTransport::bind("127.0.0.1", "0").expect("bind transport")
}

fn connect(from: &EndPoint, to_addr: &EndPointAddr) -> Connection {
    from.connect(to_addr, Reliability::ReliableOrdered, ConnectHints::default())
        .expect("connect")
}

fn next_event(endpoint: &EndPoint) -> Event {
    endpoint
        .receive_timeout(EVENT_TIMEOUT)
        .expect("timed out waiting for event")
}

/// Drain events until the endpoint reports closed; teardown order between
/// peers on one transport is not deterministic.
fn drain_until_closed(endpoint: &EndPoint) {
    for _ in 0..100 {
        if next_event(endpoint) == Event::EndPointClosed {
            return;
        }
    }
    panic!("endpoint never reported EndPointClosed");
}

#[test]
fn loopback_ping() {
    let transport = transport();
    let e1 = transport.new_endpoint().expect("endpoint");
    let e2 = transport.new_endpoint().expect("endpoint");

    let conn = connect(&e1, e2.address());
    conn.send(&[b"ping"]).expect("send");

    match next_event(&e2) {
        Event::ConnectionOpened {
            id,
            reliability,
            peer,
        } => {
            assert_eq!(id, conn.id());
            assert_eq!(reliability, Reliability::ReliableOrdered);
            assert_eq!(&peer, e1.address());
        }
        other => panic!("expected ConnectionOpened, got {other:?}"),
    }
    assert_eq!(
        next_event(&e2),
        Event::Received {
            id: conn.id(),
            payload: b"ping".to_vec(),
        }
    );

    transport.close();
}

#[test]
fn messages_arrive_in_send_order() {
    let transport = transport();
    let e1 = transport.new_endpoint().expect("endpoint");
    let e2 = transport.new_endpoint().expect("endpoint");

    let conn = connect(&e1, e2.address());
    for seq in 0..32u8 {
        conn.send(&[b"msg-", &[seq]]).expect("send");
    }

    assert!(matches!(next_event(&e2), Event::ConnectionOpened { .. }));
    for seq in 0..32u8 {
        let mut expected = b"msg-".to_vec();
        expected.push(seq);
        assert_eq!(
            next_event(&e2),
            Event::Received {
                id: conn.id(),
                payload: expected,
            }
        );
    }

    transport.close();
}

#[test]
fn self_connect_bypasses_the_network() {
    let transport = transport();
    let endpoint = transport.new_endpoint().expect("endpoint");

    let self_addr = endpoint.address().clone();
    let conn = endpoint
        .connect(&self_addr, Reliability::ReliableOrdered, ConnectHints::default())
        .expect("self connect");

    match next_event(&endpoint) {
        Event::ConnectionOpened {
            id,
            reliability,
            peer,
        } => {
            assert_eq!(id, conn.id());
            assert_eq!(reliability, Reliability::ReliableOrdered);
            assert_eq!(&peer, endpoint.address());
        }
        other => panic!("expected ConnectionOpened, got {other:?}"),
    }

    conn.send(&[b"x"]).expect("send");
    assert_eq!(
        next_event(&endpoint),
        Event::Received {
            id: conn.id(),
            payload: b"x".to_vec(),
        }
    );

    conn.close();
    conn.close();
    assert_eq!(
        next_event(&endpoint),
        Event::ConnectionClosed { id: conn.id() }
    );
    assert_eq!(conn.send(&[b"late"]), Err(SendError::Closed));

    transport.close();
}

#[test]
fn socket_is_reused_across_reopen() {
    let transport = transport();
    let e1 = transport.new_endpoint().expect("endpoint");
    let e2 = transport.new_endpoint().expect("endpoint");

    let first = connect(&e1, e2.address());
    first.send(&[b"one"]).expect("send");
    let first_id = match next_event(&e2) {
        Event::ConnectionOpened { id, .. } => id,
        other => panic!("expected ConnectionOpened, got {other:?}"),
    };
    assert_eq!(
        next_event(&e2),
        Event::Received {
            id: first_id,
            payload: b"one".to_vec(),
        }
    );

    first.close();
    assert_eq!(next_event(&e2), Event::ConnectionClosed { id: first_id });

    let second = connect(&e1, e2.address());
    second.send(&[b"two"]).expect("send");
    let second_id = match next_event(&e2) {
        Event::ConnectionOpened { id, .. } => id,
        other => panic!("expected ConnectionOpened, got {other:?}"),
    };
    assert_ne!(second_id, first_id, "connection ids are never reused");
    assert_eq!(
        next_event(&e2),
        Event::Received {
            id: second_id,
            payload: b"two".to_vec(),
        }
    );

    transport.close();
}

#[test]
fn both_directions_share_the_physical_socket() {
    let transport = transport();
    let e1 = transport.new_endpoint().expect("endpoint");
    let e2 = transport.new_endpoint().expect("endpoint");

    let to_e2 = connect(&e1, e2.address());
    assert!(matches!(next_event(&e2), Event::ConnectionOpened { .. }));

    // The reverse direction rides the socket the first connect established.
    let to_e1 = connect(&e2, e1.address());
    assert!(matches!(next_event(&e1), Event::ConnectionOpened { .. }));

    to_e2.send(&[b"forward"]).expect("send");
    to_e1.send(&[b"backward"]).expect("send");
    assert_eq!(
        next_event(&e2),
        Event::Received {
            id: to_e2.id(),
            payload: b"forward".to_vec(),
        }
    );
    assert_eq!(
        next_event(&e1),
        Event::Received {
            id: to_e1.id(),
            payload: b"backward".to_vec(),
        }
    );

    transport.close();
}

#[test]
fn simultaneous_connect_resolves_by_address_tiebreak() {
    let transport = transport();
    let e1 = transport.new_endpoint().expect("endpoint");
    let e2 = transport.new_endpoint().expect("endpoint");
    assert!(e1.address() < e2.address());

    let barrier = Barrier::new(2);
    let (from_e1, from_e2) = thread::scope(|scope| {
        let first = scope.spawn(|| {
            barrier.wait();
            connect(&e1, e2.address())
        });
        let second = scope.spawn(|| {
            barrier.wait();
            connect(&e2, e1.address())
        });
        (first.join().expect("join"), second.join().expect("join"))
    });

    // Both endpoints see exactly one inbound connection over the single
    // surviving socket, and traffic flows both ways.
    assert!(matches!(next_event(&e1), Event::ConnectionOpened { .. }));
    assert!(matches!(next_event(&e2), Event::ConnectionOpened { .. }));

    from_e1.send(&[b"from-e1"]).expect("send");
    from_e2.send(&[b"from-e2"]).expect("send");
    assert_eq!(
        next_event(&e2),
        Event::Received {
            id: from_e1.id(),
            payload: b"from-e1".to_vec(),
        }
    );
    assert_eq!(
        next_event(&e1),
        Event::Received {
            id: from_e2.id(),
            payload: b"from-e2".to_vec(),
        }
    );

    transport.close();
}

#[test]
fn peer_loss_emits_a_single_connection_lost() {
    let near = transport();
    let far = transport();
    let e1 = near.new_endpoint().expect("endpoint");
    let e2 = far.new_endpoint().expect("endpoint");
    let peer_addr = e2.address().clone();

    let conn = connect(&e1, &peer_addr);
    assert!(matches!(next_event(&e2), Event::ConnectionOpened { .. }));

    // The far side goes away while we still hold an open connection; its
    // close offer cannot be accepted and the socket dies under us.
    far.close();

    assert_eq!(
        next_event(&e1),
        Event::ConnectionLost {
            peer: peer_addr.clone(),
            ids: vec![conn.id()],
        }
    );
    assert!(matches!(conn.send(&[b"x"]), Err(SendError::Failed { .. })));
    conn.close();

    let err = e1
        .connect(
            &peer_addr,
            Reliability::ReliableOrdered,
            ConnectHints {
                timeout: Some(Duration::from_secs(2)),
            },
        )
        .expect_err("peer is gone");
    assert!(matches!(
        err,
        ConnectError::Failed { .. } | ConnectError::NotFound | ConnectError::Timeout
    ));

    near.close();
}

#[test]
fn unknown_endpoint_id_is_rejected_as_not_found() {
    let near = transport();
    let far = transport();
    let e1 = near.new_endpoint().expect("endpoint");
    let e2 = far.new_endpoint().expect("endpoint");

    let ghost = EndPointAddr::new(e2.address().host(), e2.address().service(), 99)
        .expect("ghost address");
    let err = e1
        .connect(&ghost, Reliability::ReliableOrdered, ConnectHints::default())
        .expect_err("no such endpoint");
    assert_eq!(err, ConnectError::NotFound);

    near.close();
    far.close();
}

#[test]
fn endpoint_close_is_idempotent_and_terminal() {
    let transport = transport();
    let e1 = transport.new_endpoint().expect("endpoint");
    let e2 = transport.new_endpoint().expect("endpoint");

    let conn = connect(&e1, e2.address());
    let opened = match next_event(&e2) {
        Event::ConnectionOpened { id, .. } => id,
        other => panic!("expected ConnectionOpened, got {other:?}"),
    };

    e1.close();
    e1.close();

    drain_until_closed(&e1);
    // Terminal: the mailbox keeps reporting closed.
    assert_eq!(e1.receive(), Event::EndPointClosed);
    assert_eq!(e1.receive(), Event::EndPointClosed);

    assert!(matches!(conn.send(&[b"x"]), Err(SendError::Failed { .. })));

    // The peer observes an orderly close of the inbound connection.
    assert_eq!(next_event(&e2), Event::ConnectionClosed { id: opened });

    transport.close();
}

#[test]
fn transport_close_retires_every_endpoint() {
    let transport = transport();
    let e1 = transport.new_endpoint().expect("endpoint");
    let e2 = transport.new_endpoint().expect("endpoint");

    let _conn = connect(&e1, e2.address());
    assert!(matches!(next_event(&e2), Event::ConnectionOpened { .. }));

    transport.close();
    transport.close();

    drain_until_closed(&e1);
    drain_until_closed(&e2);
    assert!(transport.new_endpoint().is_err());
}

#[test]
fn rapid_close_and_reopen_cycles() {
    let transport = transport();
    let e1 = transport.new_endpoint().expect("endpoint");
    let e2 = transport.new_endpoint().expect("endpoint");

    // Each cycle lands somewhere in the CloseSocket negotiation: before the
    // offer, while Closing, or after the socket retired. All must yield a
    // working connection.
    for round in 0..20u8 {
        let conn = connect(&e1, e2.address());
        conn.send(&[b"round-", &[round]]).expect("send");

        let id = match next_event(&e2) {
            Event::ConnectionOpened { id, .. } => id,
            other => panic!("expected ConnectionOpened, got {other:?}"),
        };
        let mut expected = b"round-".to_vec();
        expected.push(round);
        assert_eq!(
            next_event(&e2),
            Event::Received {
                id,
                payload: expected,
            }
        );

        conn.close();
        assert_eq!(next_event(&e2), Event::ConnectionClosed { id });
    }

    transport.close();
}

#[test]
fn connect_to_dead_port_fails() {
    let transport = transport();
    let endpoint = transport.new_endpoint().expect("endpoint");

    // Bind-then-drop guarantees an unused port.
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("probe bind");
        probe.local_addr().expect("probe addr").port()
    };
    let ghost = EndPointAddr::new("127.0.0.1", &port.to_string(), 0).expect("addr");
    let err = endpoint
        .connect(&ghost, Reliability::ReliableOrdered, ConnectHints::default())
        .expect_err("nothing listens there");
    assert!(matches!(
        err,
        ConnectError::Failed { .. } | ConnectError::Timeout
    ));

    transport.close();
}

#[test]
fn multicast_surface_is_unsupported() {
    let transport = transport();
    let endpoint = transport.new_endpoint().expect("endpoint");
    let group = endpoint.address().clone();
    assert!(endpoint.new_multicast_group().is_err());
    assert!(endpoint.resolve_multicast_group(&group).is_err());
    transport.close();
}
