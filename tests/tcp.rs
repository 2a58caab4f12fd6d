use std::sync::{Arc, Mutex};
use std::time::Duration;

use netpoll::net::{TcpListenerHandler, TcpProtocol, TcpSocketHandler};
use netpoll::{Poller, SocketHandler};

/// Server side protocol: mirror every received byte back to the peer.
struct Echo;

impl TcpProtocol for Echo {
    fn on_data(&mut self, out: &mut Vec<u8>, data: &[u8]) {
        out.extend_from_slice(data);
    }
}

/// Client side protocol: greet on connect and collect everything echoed back.
struct Greeter {
    received: Arc<Mutex<Vec<u8>>>,
}

impl TcpProtocol for Greeter {
    fn on_connected(&mut self, out: &mut Vec<u8>) {
        out.extend_from_slice(b"hello");
    }

    fn on_data(&mut self, _out: &mut Vec<u8>, data: &[u8]) {
        self.received.lock().unwrap().extend_from_slice(data);
    }
}

fn poll_until(poller: &Poller, mut done: impl FnMut() -> bool) {
    for _ in 0..200 {
        if done() {
            return;
        }

        poller.poll_once(Duration::from_millis(50)).unwrap();
    }

    panic!("timeout waiting for condition");
}

#[test]
fn test_echo() {
    _ = pretty_env_logger::try_init();

    let poller = Poller::new().unwrap();

    let mut listener =
        TcpListenerHandler::new(poller.clone(), "127.0.0.1:0".parse().unwrap(), |_peer| Echo)
            .unwrap();

    listener.connect().unwrap();

    let server_addr = listener.local_addr().unwrap();
    let listener_fd = listener.socket();

    poller
        .add_socket_handler(Arc::new(Mutex::new(listener)))
        .unwrap();

    let received = Arc::new(Mutex::new(vec![]));

    let client = Arc::new(Mutex::new(
        TcpSocketHandler::new(
            poller.clone(),
            server_addr,
            Greeter {
                received: received.clone(),
            },
        )
        .unwrap(),
    ));

    let client_fd = client.lock().unwrap().socket();

    poller.add_socket_handler(client.clone()).unwrap();

    client.lock().unwrap().connect().unwrap();

    // The greeting is queued before the handshake completes and flushed right
    // after it; the echo server sends it back.
    poll_until(&poller, || *received.lock().unwrap() == b"hello");

    assert!(client.lock().unwrap().is_connected());

    // Listener, client and the accepted server side connection.
    assert_eq!(poller.len(), 3);

    client.lock().unwrap().send_data(b" world").unwrap();

    poll_until(&poller, || *received.lock().unwrap() == b"hello world");

    // Local closure deregisters the client at once; the server side handler
    // observes the zero byte read and deregisters itself.
    client.lock().unwrap().close();

    assert!(!client.lock().unwrap().is_connected());
    assert!(!poller.is_registered(client_fd));

    poll_until(&poller, || poller.len() == 1);

    assert!(poller.is_registered(listener_fd));
}

#[test]
fn test_two_clients_get_independent_dispatch() {
    _ = pretty_env_logger::try_init();

    let poller = Poller::new().unwrap();

    let mut listener =
        TcpListenerHandler::new(poller.clone(), "127.0.0.1:0".parse().unwrap(), |_peer| Echo)
            .unwrap();

    listener.connect().unwrap();

    let server_addr = listener.local_addr().unwrap();

    poller
        .add_socket_handler(Arc::new(Mutex::new(listener)))
        .unwrap();

    let mut clients = vec![];
    let mut inboxes = vec![];

    for greeting in [&b"first"[..], &b"second"[..]] {
        let received = Arc::new(Mutex::new(vec![]));

        let client = Arc::new(Mutex::new(
            TcpSocketHandler::new(
                poller.clone(),
                server_addr,
                Greeter {
                    received: received.clone(),
                },
            )
            .unwrap(),
        ));

        poller.add_socket_handler(client.clone()).unwrap();

        client.lock().unwrap().connect().unwrap();

        poll_until(&poller, || client.lock().unwrap().is_connected());

        client.lock().unwrap().send_data(greeting).unwrap();

        clients.push(client);
        inboxes.push((received, greeting));
    }

    for (received, greeting) in &inboxes {
        let expected = [&b"hello"[..], greeting].concat();

        poll_until(&poller, || *received.lock().unwrap() == expected);
    }
}
