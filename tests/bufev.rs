use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use lightev::{
    AcceptorHandler, BufferEvent, EventFlags, EventQueue, Listener,
};

use log::debug;

const ECHO_DATA: &[u8] = b"ECHO ECHO ECHO!";

#[test]
fn connect_write_read_eof() {
    let _ = env_logger::try_init();
    let queue = Rc::new(EventQueue::new().unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        debug!("server: tcp accepted!");
        let mut buf = vec![0u8; ECHO_DATA.len()];
        sock.read_exact(&mut buf).unwrap();
        sock.write_all(&buf).unwrap();
        // closing here gives the client its EOF
    });

    let received = Rc::new(RefCell::new(Vec::new()));
    let connected = Rc::new(Cell::new(false));

    let bev = BufferEvent::new(&queue);
    bev.set_callbacks(
        Some(Box::new({
            let received = received.clone();
            move |b| received.borrow_mut().extend(b.read())
        })),
        None,
        Some(Box::new({
            let queue = queue.clone();
            let connected = connected.clone();
            move |b, what| {
                if what.contains(EventFlags::CONNECTED) {
                    debug!("client: connected, sending");
                    connected.set(true);
                    b.write(ECHO_DATA);
                    b.enable(EventFlags::READ);
                }
                if what.contains(EventFlags::EOF) {
                    debug!("client: eof");
                    queue.break_loop();
                }
            }
        })),
    );
    bev.connect(addr).unwrap();

    queue.dispatch().unwrap();
    server.join().unwrap();

    assert!(connected.get());
    assert_eq!(&*received.borrow(), ECHO_DATA);
}

#[test]
fn low_watermark_delays_the_read_callback() {
    let _ = env_logger::try_init();
    let queue = Rc::new(EventQueue::new().unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        sock.write_all(b"abcd").unwrap();
        sock.flush().unwrap();
        thread::sleep(Duration::from_millis(50));
        sock.write_all(b"efgh").unwrap();
    });

    let received = Rc::new(RefCell::new(Vec::new()));

    let bev = BufferEvent::new(&queue);
    bev.set_watermark(8, 0);
    bev.set_callbacks(
        Some(Box::new({
            let received = received.clone();
            move |b| {
                // never below the low watermark
                assert!(b.input_len() >= 8);
                received.borrow_mut().extend(b.read());
            }
        })),
        None,
        Some(Box::new({
            let queue = queue.clone();
            move |b, what| {
                if what.contains(EventFlags::CONNECTED) {
                    b.enable(EventFlags::READ);
                }
                if what.contains(EventFlags::EOF) {
                    queue.break_loop();
                }
            }
        })),
    );
    bev.connect(addr).unwrap();

    queue.dispatch().unwrap();
    server.join().unwrap();

    assert_eq!(&*received.borrow(), b"abcdefgh");
}

#[test]
fn refused_connect_reports_error() {
    let _ = env_logger::try_init();
    let queue = Rc::new(EventQueue::new().unwrap());

    // grab a port nothing listens on
    let addr = {
        let scratch = TcpListener::bind("127.0.0.1:0").unwrap();
        scratch.local_addr().unwrap()
    };

    let failed = Rc::new(Cell::new(false));

    let bev = BufferEvent::new(&queue);
    bev.set_callbacks(
        None,
        None,
        Some(Box::new({
            let queue = queue.clone();
            let failed = failed.clone();
            move |_, what| {
                assert!(!what.contains(EventFlags::CONNECTED));
                if what.contains(EventFlags::ERROR) {
                    failed.set(true);
                    queue.break_loop();
                }
            }
        })),
    );
    if let Err(e) = bev.connect(addr) {
        // refused synchronously, same outcome
        debug!("connect failed without polling: {}", e);
        return;
    }

    queue.dispatch_timeout(Duration::from_secs(5)).unwrap();
    assert!(failed.get());
}

#[test]
fn read_timeout_fires_and_disables() {
    let _ = env_logger::try_init();
    let queue = Rc::new(EventQueue::new().unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    // a peer that accepts and stays silent
    let server = thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        let mut buf = [0u8; 16];
        // unblocks when the client goes away
        let _ = sock.read(&mut buf);
    });

    let timed_out = Rc::new(Cell::new(EventFlags::NONE));

    let bev = BufferEvent::new(&queue);
    bev.set_timeout(Some(Duration::from_millis(30)), None);
    bev.set_callbacks(
        None,
        None,
        Some(Box::new({
            let queue = queue.clone();
            let timed_out = timed_out.clone();
            move |b, what| {
                if what.contains(EventFlags::CONNECTED) {
                    b.enable(EventFlags::READ);
                }
                if what.contains(EventFlags::TIMEOUT) {
                    timed_out.set(what);
                    // only the read direction goes quiet
                    assert!(!b.enabled().contains(EventFlags::READ));
                    assert!(b.enabled().contains(EventFlags::WRITE));
                    queue.break_loop();
                }
            }
        })),
    );
    bev.connect(addr).unwrap();

    queue.dispatch_timeout(Duration::from_secs(5)).unwrap();
    drop(bev);
    server.join().unwrap();

    assert!(timed_out.get().contains(EventFlags::TIMEOUT));
    assert!(timed_out.get().contains(EventFlags::READING));
}

#[test]
fn high_watermark_caps_buffered_input() {
    let _ = env_logger::try_init();
    let queue = Rc::new(EventQueue::new().unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let data: Vec<u8> = (0..64u8).collect();
    let server = {
        let data = data.clone();
        thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(&data).unwrap();
            // closing here gives the client its EOF
        })
    };

    let received = Rc::new(RefCell::new(Vec::new()));

    let bev = BufferEvent::new(&queue);
    bev.set_watermark(0, 16);
    bev.set_callbacks(
        Some(Box::new({
            let received = received.clone();
            move |b| {
                // reading from the socket stops at the high watermark
                assert!(b.input_len() <= 16);
                received.borrow_mut().extend(b.read());
            }
        })),
        None,
        Some(Box::new({
            let queue = queue.clone();
            move |b, what| {
                if what.contains(EventFlags::CONNECTED) {
                    b.enable(EventFlags::READ);
                }
                if what.contains(EventFlags::EOF) {
                    queue.break_loop();
                }
            }
        })),
    );
    bev.connect(addr).unwrap();

    queue.dispatch_timeout(Duration::from_secs(5)).unwrap();
    server.join().unwrap();

    // everything still arrives, sixteen bytes at a time
    assert_eq!(&*received.borrow(), &data);
}

#[test]
fn write_timeout_reports_the_write_direction() {
    let _ = env_logger::try_init();
    let queue = Rc::new(EventQueue::new().unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    // a peer that accepts but never reads
    let server = thread::spawn(move || {
        let (sock, _) = listener.accept().unwrap();
        thread::sleep(Duration::from_millis(300));
        drop(sock);
    });

    let timed_out = Rc::new(Cell::new(EventFlags::NONE));

    let bev = BufferEvent::new(&queue);
    // the read deadline is further out; the write one must win
    bev.set_timeout(Some(Duration::from_secs(5)), Some(Duration::from_millis(50)));
    bev.set_callbacks(
        None,
        None,
        Some(Box::new({
            let queue = queue.clone();
            let timed_out = timed_out.clone();
            move |b, what| {
                if what.contains(EventFlags::CONNECTED) {
                    b.enable(EventFlags::READ);
                    // far more than the socket buffers will take
                    b.write(&vec![0u8; 8 * 1024 * 1024]);
                }
                if what.contains(EventFlags::TIMEOUT) {
                    timed_out.set(what);
                    assert!(!b.enabled().contains(EventFlags::WRITE));
                    assert!(b.enabled().contains(EventFlags::READ));
                    queue.break_loop();
                }
            }
        })),
    );
    bev.connect(addr).unwrap();

    queue.dispatch_timeout(Duration::from_secs(5)).unwrap();
    drop(bev);
    server.join().unwrap();

    assert!(timed_out.get().contains(EventFlags::TIMEOUT));
    assert!(timed_out.get().contains(EventFlags::WRITING));
    assert!(!timed_out.get().contains(EventFlags::READING));
}

#[test]
fn listener_accepts_and_wraps_sockets() {
    let _ = env_logger::try_init();
    let queue = Rc::new(EventQueue::new().unwrap());

    let accepted = Rc::new(RefCell::new(Vec::new()));
    let listener = Listener::bind(
        &queue,
        "127.0.0.1:0".parse().unwrap(),
        16,
        AcceptorHandler::new({
            let queue = queue.clone();
            let accepted = accepted.clone();
            move |sock, peer| {
                debug!("acceptor: connection from {}", peer);
                let bev = BufferEvent::with_socket(&queue, sock).unwrap();
                accepted.borrow_mut().push((bev, peer));
                queue.break_loop();
            }
        }),
    )
    .unwrap();

    let addr = listener.local_addr().unwrap();
    let client = thread::spawn(move || TcpStream::connect(addr).unwrap());

    queue.dispatch_timeout(Duration::from_secs(5)).unwrap();
    let conn = client.join().unwrap();

    let accepted = accepted.borrow();
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].1, conn.local_addr().unwrap());
}
