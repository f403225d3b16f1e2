use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::rc::Rc;
use std::thread;

use lightev::http::{HttpConnection, Request};
use lightev::{BufferEvent, EventQueue};

use log::debug;

fn read_head(sock: &mut std::net::TcpStream) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        sock.read_exact(&mut byte).unwrap();
        buf.push(byte[0]);
    }
    String::from_utf8(buf).unwrap()
}

#[test]
fn request_response_and_detach() {
    let _ = env_logger::try_init();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        let head = read_head(&mut sock);
        assert!(head.starts_with("GET /index HTTP/1.1\r\n"));
        assert!(head.contains("Host: example.com\r\n"));

        sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
            .unwrap();
        // closing delivers EOF, which lets the loop run dry
    });

    let queue = EventQueue::new().unwrap();

    let conn = HttpConnection::new(BufferEvent::new(&queue));
    conn.bev().connect(addr).unwrap();

    let got = Rc::new(RefCell::new(None));
    {
        let got = got.clone();
        let req = Request::get("/index").header("Host", "example.com");
        conn.send_request(&req, move |result| {
            debug!("client: head arrived");
            *got.borrow_mut() = Some(result.unwrap());
        });
    }

    assert!(queue.dispatch().unwrap());
    server.join().unwrap();

    let head = got.borrow_mut().take().expect("response head delivered");
    assert_eq!(head.status, 200);
    assert_eq!(head.reason, "OK");
    assert_eq!(head.header("content-length").unwrap(), b"5");

    // the protocol switch path: the transport comes back with the body
    // still buffered
    let bev = conn.detach();
    assert_eq!(bev.read(), b"hello");
}
