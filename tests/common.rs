//! Shared helpers for the loopback integration tests.

#![allow(dead_code)]

use std::sync::Once;
use std::time::{Duration, Instant};

use cci::{ConnAttribute, Connection, Endpoint, Event, EventKind, Status, ABI_VERSION};

static INIT: Once = Once::new();

/// Write a loopback config file and initialize the library once per test
/// binary.
pub fn init_once() {
    INIT.call_once(|| {
        let path = std::env::temp_dir().join(format!("cci-test-{}.ini", std::process::id()));
        std::fs::write(
            &path,
            "# loopback test devices\n\
             [lo0]\n\
             transport = sock\n\
             ip = 127.0.0.1\n\
             default = 1\n\
             \n\
             [lo-threaded]\n\
             transport = sock\n\
             ip = 127.0.0.1\n\
             priority = 10\n\
             progress = thread\n",
        )
        .expect("write test config");
        std::env::set_var("CCI_CONFIG", &path);
        cci::init(ABI_VERSION, 0).expect("init");
    });
}

pub fn make_endpoint() -> Endpoint {
    init_once();
    cci::create_endpoint(None, 0).expect("create endpoint")
}

/// Poll the endpoints round-robin until the closure reports done or the
/// timeout expires. Every event is handed to the closure and then
/// returned.
pub fn poll_until(
    eps: &[&Endpoint],
    timeout: Duration,
    mut f: impl FnMut(usize, &Event) -> bool,
) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        let mut idle = true;
        for (i, ep) in eps.iter().enumerate() {
            match ep.get_event() {
                Ok(Some(ev)) => {
                    idle = false;
                    let done = f(i, &ev);
                    ep.return_event(ev).expect("return event");
                    if done {
                        return true;
                    }
                }
                Ok(None) | Err(Status::NoBufferSpace) => {}
                Err(e) => panic!("get_event failed: {e}"),
            }
        }
        if idle {
            std::thread::sleep(Duration::from_micros(200));
        }
    }
    false
}

/// Establish a connection pair over loopback.
///
/// Returns (client endpoint, client connection, server endpoint, server
/// connection).
pub fn connect_pair(attr: ConnAttribute) -> (Endpoint, Connection, Endpoint, Connection) {
    let server = make_endpoint();
    let client = make_endpoint();
    let (client_conn, server_conn) = handshake(&client, &server, attr, b"hello");
    (client, client_conn, server, server_conn)
}

/// Run the handshake between two existing endpoints.
pub fn handshake(
    client: &Endpoint,
    server: &Endpoint,
    attr: ConnAttribute,
    payload: &[u8],
) -> (Connection, Connection) {
    client
        .connect(&server.uri(), payload, attr, 7, None)
        .expect("connect");

    let mut client_conn: Option<Connection> = None;
    let mut server_conn: Option<Connection> = None;
    let ok = poll_until(&[client, server], Duration::from_secs(5), |i, ev| {
        match (i, ev.kind()) {
            (1, EventKind::ConnectRequest { .. }) => {
                server.accept(ev, 9).expect("accept");
            }
            (1, EventKind::Accept { status, connection, .. }) => {
                assert_eq!(*status, Status::Success);
                server_conn = connection.clone();
            }
            (0, EventKind::Connect { status, connection, .. }) => {
                assert_eq!(*status, Status::Success);
                client_conn = connection.clone();
            }
            _ => {}
        }
        client_conn.is_some() && server_conn.is_some()
    });
    assert!(ok, "handshake did not complete");
    (client_conn.unwrap(), server_conn.unwrap())
}
