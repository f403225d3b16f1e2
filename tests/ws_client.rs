use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use lightev::error::{Error, FrameError, ProtocolError};
use lightev::frame::{mask, Fin, FrameHead, Mask, OpCode, PayloadLen};
use lightev::handshake::derive_accept_key;
use lightev::ws::{Socket, SocketOptions, State};
use lightev::{Dns, EventQueue};

use log::debug;

const PATH: &str = "/chat";

// ---- a minimal scripted server peer ----

fn read_head(sock: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        sock.read_exact(&mut byte).unwrap();
        buf.push(byte[0]);
    }
    String::from_utf8(buf).unwrap()
}

fn accept_upgrade(sock: &mut TcpStream, head: &str) {
    let key = head
        .lines()
        .find_map(|l| l.strip_prefix("Sec-WebSocket-Key: "))
        .expect("request carries a key");
    let accept = derive_accept_key(key.as_bytes());
    write!(
        sock,
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        std::str::from_utf8(&accept).unwrap()
    )
    .unwrap();
}

/// Read one frame, unmasking the payload when a key is present.
fn read_frame(sock: &mut TcpStream) -> (FrameHead, Vec<u8>) {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match FrameHead::decode(&buf) {
            Ok((head, n)) => {
                let len = head.length.to_num() as usize;
                while buf.len() < n + len {
                    sock.read_exact(&mut byte).unwrap();
                    buf.push(byte[0]);
                }
                let mut payload = buf[n..n + len].to_vec();
                if let Mask::Key(key) = head.mask {
                    mask::apply_mask(key, &mut payload);
                }
                return (head, payload);
            }
            Err(FrameError::NotEnoughData) => {
                sock.read_exact(&mut byte).unwrap();
                buf.push(byte[0]);
            }
            Err(e) => panic!("peer sent a malformed frame: {}", e),
        }
    }
}

fn write_frame(sock: &mut TcpStream, opcode: OpCode, payload: &[u8]) {
    let head = FrameHead::new(
        Fin::Y,
        opcode,
        Mask::None,
        PayloadLen::from_num(payload.len() as u64),
    );
    let mut buf = Vec::new();
    head.encode(&mut buf);
    buf.extend_from_slice(payload);
    sock.write_all(&buf).unwrap();
}

// ---- tests ----

#[test]
fn ws_echo() {
    let _ = env_logger::try_init();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        debug!("server: tcp accepted!");

        let head = read_head(&mut sock);
        assert!(head.starts_with(&format!("GET {} HTTP/1.1\r\n", PATH)));
        assert!(head.contains("Upgrade: websocket\r\n"));
        assert!(head.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(head.contains("Sec-WebSocket-Protocol: proto1\r\n"));
        accept_upgrade(&mut sock, &head);
        debug!("server: websocket accepted!");

        let (frame, payload) = read_frame(&mut sock);
        assert_eq!(frame.opcode, OpCode::Text);
        assert!(
            matches!(frame.mask, Mask::Key(_)),
            "client frames must be masked"
        );
        assert_eq!(&payload, b"hello");

        debug!("server: reply..");
        write_frame(&mut sock, OpCode::Text, b"world");

        let (frame, payload) = read_frame(&mut sock);
        assert_eq!(frame.opcode, OpCode::Close);
        assert_eq!(&payload[..2], &1000u16.to_be_bytes());
        write_frame(&mut sock, OpCode::Close, &payload);
        debug!("server: close");
    });

    let queue = Rc::new(EventQueue::new().unwrap());
    let dns = Dns::new(&queue).unwrap();

    let opened = Rc::new(Cell::new(false));
    let messages = Rc::new(RefCell::new(Vec::new()));
    let closed_with = Rc::new(Cell::new(None));

    let socket = Socket::new(SocketOptions {
        protocol: Some("proto1".to_owned()),
        ..Default::default()
    });
    socket.on_open({
        let opened = opened.clone();
        move || opened.set(true)
    });
    socket.on_message({
        let socket = socket.clone();
        let messages = messages.clone();
        move |opcode, payload| {
            assert_eq!(opcode, OpCode::Text);
            assert_eq!(&payload, b"world");
            messages.borrow_mut().push(payload);
            debug!("client: close");
            socket.close(1000, "bye");
        }
    });
    socket.on_close({
        let queue = queue.clone();
        let closed_with = closed_with.clone();
        move |code| {
            closed_with.set(code);
            queue.break_loop();
        }
    });
    socket.on_error(|e| panic!("unexpected websocket error: {}", e));

    socket
        .open(&queue, &dns, &format!("ws://127.0.0.1:{}{}", port, PATH))
        .unwrap();
    assert_eq!(socket.state(), State::Connecting);

    // queued while the handshake is still in flight
    socket.send_text("hello");

    queue.dispatch_timeout(Duration::from_secs(10)).unwrap();
    server.join().unwrap();

    assert!(opened.get());
    assert_eq!(*messages.borrow(), vec![b"world".to_vec()]);
    assert_eq!(closed_with.get(), Some(1000));
    assert_eq!(socket.state(), State::Closed);
}

#[test]
fn ws_upgrade_rejected() {
    let _ = env_logger::try_init();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        let _ = read_head(&mut sock);
        sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
            .unwrap();
    });

    let queue = Rc::new(EventQueue::new().unwrap());
    let dns = Dns::new(&queue).unwrap();

    let rejected = Rc::new(Cell::new(0u16));
    let errors = Rc::new(Cell::new(0u32));

    let socket = Socket::new(SocketOptions::default());
    socket.on_open(|| panic!("a rejected upgrade must not open"));
    socket.on_error({
        let socket = socket.clone();
        let rejected = rejected.clone();
        let errors = errors.clone();
        move |e| {
            errors.set(errors.get() + 1);
            match e {
                Error::Protocol(ProtocolError::UpgradeRejected(code)) => rejected.set(code),
                other => panic!("unexpected error: {}", other),
            }
            // the rejection is observable from inside the callback
            assert_eq!(socket.state(), State::Rejected);
        }
    });

    socket
        .open(&queue, &dns, &format!("ws://127.0.0.1:{}/", port))
        .unwrap();

    // no break from the callback: let any trailing transport events
    // drain, then check the rejection was reported exactly once
    queue.dispatch_timeout(Duration::from_secs(10)).unwrap();
    server.join().unwrap();

    assert_eq!(errors.get(), 1);
    assert_eq!(rejected.get(), 200);
    assert_eq!(socket.state(), State::Closed);
    assert_eq!(socket.reject_status(), Some(200));
}

#[test]
fn ws_message_arriving_with_the_upgrade_reply() {
    let _ = env_logger::try_init();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        let head = read_head(&mut sock);
        let key = head
            .lines()
            .find_map(|l| l.strip_prefix("Sec-WebSocket-Key: "))
            .expect("request carries a key");
        let accept = derive_accept_key(key.as_bytes());

        // reply head and first frame in a single segment
        let mut buf = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            std::str::from_utf8(&accept).unwrap()
        )
        .into_bytes();
        let head = FrameHead::new(Fin::Y, OpCode::Text, Mask::None, PayloadLen::from_num(5));
        head.encode(&mut buf);
        buf.extend_from_slice(b"early");
        sock.write_all(&buf).unwrap();

        let (frame, payload) = read_frame(&mut sock);
        assert_eq!(frame.opcode, OpCode::Close);
        write_frame(&mut sock, OpCode::Close, &payload);
    });

    let queue = Rc::new(EventQueue::new().unwrap());
    let dns = Dns::new(&queue).unwrap();

    let order = Rc::new(RefCell::new(Vec::new()));

    let socket = Socket::new(SocketOptions::default());
    socket.on_open({
        let order = order.clone();
        move || order.borrow_mut().push("open")
    });
    socket.on_message({
        let socket = socket.clone();
        let order = order.clone();
        move |opcode, payload| {
            assert_eq!(opcode, OpCode::Text);
            assert_eq!(&payload, b"early");
            order.borrow_mut().push("message");
            socket.close(1000, "");
        }
    });
    socket.on_close({
        let order = order.clone();
        move |_| order.borrow_mut().push("close")
    });
    socket.on_error(|e| panic!("unexpected websocket error: {}", e));

    socket
        .open(&queue, &dns, &format!("ws://127.0.0.1:{}/", port))
        .unwrap();

    queue.dispatch_timeout(Duration::from_secs(10)).unwrap();
    server.join().unwrap();

    assert_eq!(*order.borrow(), vec!["open", "message", "close"]);
    assert_eq!(socket.state(), State::Closed);
}

#[test]
fn ws_ping_from_server_is_answered() {
    let _ = env_logger::try_init();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        let head = read_head(&mut sock);
        accept_upgrade(&mut sock, &head);

        write_frame(&mut sock, OpCode::Ping, b"ka");

        let (frame, payload) = read_frame(&mut sock);
        assert_eq!(frame.opcode, OpCode::Pong);
        assert_eq!(&payload, b"ka");

        write_frame(&mut sock, OpCode::Close, &1001u16.to_be_bytes());
        let (frame, _) = read_frame(&mut sock);
        assert_eq!(frame.opcode, OpCode::Close);
    });

    let queue = Rc::new(EventQueue::new().unwrap());
    let dns = Dns::new(&queue).unwrap();

    let closed_with = Rc::new(Cell::new(None));

    let socket = Socket::new(SocketOptions::default());
    socket.on_close({
        let closed_with = closed_with.clone();
        move |code| closed_with.set(code)
    });
    socket.on_error(|e| panic!("unexpected websocket error: {}", e));

    socket
        .open(&queue, &dns, &format!("ws://127.0.0.1:{}/", port))
        .unwrap();

    // the close echo still has to flush after on_close fires, so let
    // the loop run dry instead of breaking from the callback
    queue.dispatch().unwrap();
    server.join().unwrap();

    assert_eq!(closed_with.get(), Some(1001));
    assert_eq!(socket.state(), State::Closed);
}
