use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use coio::http::{ClientOptions, HttpClient, HttpClientPool, Request, Response, Status};
use coio::net::{Acceptor, Io};
use coio::EventLoop;

mod util;

use util::init;

const TIMEOUT: Duration = Duration::from_secs(5);

/// 10 001 bytes with a non-trivial pattern.
fn upload_payload() -> Vec<u8> {
    (0..10_001u32).map(|i| (i % 251) as u8).collect()
}

#[test]
fn keep_alive_get_reuses_the_connection() {
    init();

    let accepts = Arc::new(AtomicUsize::new(0));
    let server_accepts = accepts.clone();
    let (tx, rx) = mpsc::channel::<SocketAddr>();

    let server = thread::spawn(move || {
        let ev = EventLoop::new().unwrap();
        let handle = ev.handle();
        let acceptor = Acceptor::bind("127.0.0.1:0", &handle).unwrap();
        tx.send(acceptor.local_addr()).unwrap();
        ev.block_on(async move {
            let io = acceptor.accept().await.unwrap();
            server_accepts.fetch_add(1, Ordering::SeqCst);
            let mut req = Request::new(&io);
            for _ in 0..2 {
                assert!(req.parse(TIMEOUT).await.unwrap());
                assert_eq!(req.method(), "GET");
                assert_eq!(req.path(), "/a");
                // The client fills in its default headers.
                assert!(req.headers().contains_key("host"));
                assert_eq!(req.headers().get("connection").unwrap(), "keep-alive");
                let mut res = Response::new(&io);
                res.set_status(Status::Ok)
                    .add_header("Connection", "keep-alive")
                    .set_body(b"ok".to_vec());
                res.send(TIMEOUT).await.unwrap();
                req.clear().await;
            }
            io.close().await;
            acceptor.close().await;
        });
    });

    let addr = rx.recv().unwrap();
    let client = HttpClient::new(ClientOptions::default()).unwrap();
    let url = format!("http://{}/a", addr);

    let first = client.get(&url, Default::default()).unwrap();
    assert_eq!(first.status, 200);
    assert_eq!(first.body, b"ok");

    let second = client.get(&url, Default::default()).unwrap();
    assert_eq!(second.status, 200);
    assert_eq!(second.body, b"ok");

    server.join().unwrap();
    assert_eq!(accepts.load(Ordering::SeqCst), 1, "expected one connect");
}

#[test]
fn chunked_upload_arrives_intact() {
    init();

    let payload = upload_payload();
    let expected = payload.clone();
    let (tx, rx) = mpsc::channel::<SocketAddr>();

    let server = thread::spawn(move || {
        let ev = EventLoop::new().unwrap();
        let handle = ev.handle();
        let acceptor = Acceptor::bind("127.0.0.1:0", &handle).unwrap();
        tx.send(acceptor.local_addr()).unwrap();
        ev.block_on(async move {
            let io = acceptor.accept().await.unwrap();
            let mut req = Request::new(&io);
            assert!(req.parse(TIMEOUT).await.unwrap());
            assert_eq!(
                req.headers().get("transfer-encoding").unwrap(),
                "chunked"
            );
            let body = req.parse_body(TIMEOUT).await.unwrap();
            assert_eq!(body.len(), 10_001);
            assert_eq!(body, expected);
            let mut res = Response::new(&io);
            res.set_status(Status::Ok).set_body(b"done".to_vec());
            res.send(TIMEOUT).await.unwrap();
            io.close().await;
        });
    });

    let addr = rx.recv().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("upload.bin");
    std::fs::write(&path, &payload).unwrap();

    let ev = EventLoop::new().unwrap();
    let handle = ev.handle();
    ev.block_on(async {
        let io = Io::connect(addr, &handle).await.unwrap();
        let mut req = Request::new(&io);
        req.set_req_line(coio::http::Method::Post, "/upload")
            .add_header("Host", "test");
        req.send_chunked(&path, TIMEOUT).await.unwrap();
        let mut res = Response::new(&io);
        assert!(res.parse(TIMEOUT).await.unwrap());
        let data = res.into_data(TIMEOUT).await.unwrap();
        assert_eq!(data.status, 200);
        assert_eq!(data.body, b"done");
        io.close().await;
    });

    server.join().unwrap();
}

#[test]
fn chunked_wire_format_is_exact() {
    init();

    let payload = upload_payload();
    let raw = Arc::new(Mutex::new(Vec::new()));
    let server_raw = raw.clone();
    let (tx, rx) = mpsc::channel::<SocketAddr>();

    let server = thread::spawn(move || {
        let ev = EventLoop::new().unwrap();
        let handle = ev.handle();
        let acceptor = Acceptor::bind("127.0.0.1:0", &handle).unwrap();
        tx.send(acceptor.local_addr()).unwrap();
        ev.block_on(async move {
            let io = acceptor.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            loop {
                let n = io.recv(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                server_raw.lock().unwrap().extend_from_slice(&buf[..n]);
            }
            io.close().await;
        });
    });

    let addr = rx.recv().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("upload.bin");
    std::fs::write(&path, &payload).unwrap();

    let ev = EventLoop::new().unwrap();
    let handle = ev.handle();
    ev.block_on(async {
        let io = Io::connect(addr, &handle).await.unwrap();
        let mut req = Request::new(&io);
        req.set_req_line(coio::http::Method::Post, "/upload")
            .add_header("Host", "test");
        req.send_chunked(&path, TIMEOUT).await.unwrap();
        io.close().await;
    });
    server.join().unwrap();

    let raw = raw.lock().unwrap();
    let head_end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("request head terminator")
        + 4;

    // 10 001 bytes in 4 KiB chunks: 0x1000, 0x1000, 0x711, then the
    // zero chunk.
    let mut expected = Vec::new();
    expected.extend_from_slice(b"1000\r\n");
    expected.extend_from_slice(&payload[..4096]);
    expected.extend_from_slice(b"\r\n1000\r\n");
    expected.extend_from_slice(&payload[4096..8192]);
    expected.extend_from_slice(b"\r\n711\r\n");
    expected.extend_from_slice(&payload[8192..]);
    expected.extend_from_slice(b"\r\n0\r\n\r\n");
    assert_eq!(&raw[head_end..], &expected[..]);
}

#[test]
fn body_streams_to_a_file() {
    init();

    let body: Vec<u8> = (0..50_000u32).map(|i| (i % 97) as u8).collect();
    let expected = body.clone();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("saved.bin");
    let server_path = path.clone();
    let (tx, rx) = mpsc::channel::<SocketAddr>();

    let server = thread::spawn(move || {
        let ev = EventLoop::new().unwrap();
        let handle = ev.handle();
        let acceptor = Acceptor::bind("127.0.0.1:0", &handle).unwrap();
        tx.send(acceptor.local_addr()).unwrap();
        ev.block_on(async move {
            let io = acceptor.accept().await.unwrap();
            let mut req = Request::new(&io);
            assert!(req.parse(TIMEOUT).await.unwrap());
            req.save_to_file(&server_path, TIMEOUT).await.unwrap();
            let mut res = Response::new(&io);
            res.set_status(Status::Ok).set_body(b"saved".to_vec());
            res.send(TIMEOUT).await.unwrap();
            io.close().await;
        });
    });

    let addr = rx.recv().unwrap();
    let client = HttpClient::new(ClientOptions::default()).unwrap();
    let url = format!("http://{}/upload", addr);
    let res = client
        .post(&url, Default::default(), body, Some("application/octet-stream"))
        .unwrap();
    assert_eq!(res.status, 200);
    server.join().unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), expected);
}

#[test]
fn socks5_connect_with_auth_speaks_the_rfc_bytes() {
    init();

    let (tx, rx) = mpsc::channel::<SocketAddr>();

    let proxy = thread::spawn(move || {
        let ev = EventLoop::new().unwrap();
        let handle = ev.handle();
        let acceptor = Acceptor::bind("127.0.0.1:0", &handle).unwrap();
        tx.send(acceptor.local_addr()).unwrap();
        ev.block_on(async move {
            let io = acceptor.accept().await.unwrap();

            // Method negotiation: user/pass required.
            let hello: [u8; 3] = io.recv_array().await.unwrap();
            assert_eq!(hello, [0x05, 0x01, 0x02]);
            io.fully_send(&[0x05, 0x02]).await.unwrap();

            // USER/PASS sub-negotiation.
            let head: [u8; 2] = io.recv_array().await.unwrap();
            assert_eq!(head, [0x01, 0x04]);
            let user: [u8; 4] = io.recv_array().await.unwrap();
            assert_eq!(&user, b"user");
            let plen: [u8; 1] = io.recv_array().await.unwrap();
            assert_eq!(plen[0], 4);
            let pass: [u8; 4] = io.recv_array().await.unwrap();
            assert_eq!(&pass, b"pass");
            io.fully_send(&[0x01, 0x00]).await.unwrap();

            // CONNECT with the domain address type.
            let req: [u8; 5] = io.recv_array().await.unwrap();
            assert_eq!(req, [0x05, 0x01, 0x00, 0x03, 0x04]);
            let host: [u8; 4] = io.recv_array().await.unwrap();
            assert_eq!(&host, b"site");
            let port: [u8; 2] = io.recv_array().await.unwrap();
            assert_eq!(u16::from_be_bytes(port), 80);
            io.fully_send(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();

            // Play origin server through the tunnel.
            let mut req = Request::new(&io);
            assert!(req.parse(TIMEOUT).await.unwrap());
            assert_eq!(req.headers().get("host").unwrap(), "site");
            let mut res = Response::new(&io);
            res.set_status(Status::Ok).set_body(b"tunneled".to_vec());
            res.send(TIMEOUT).await.unwrap();
            io.close().await;
        });
    });

    let addr = rx.recv().unwrap();
    let client = HttpClient::new(ClientOptions {
        proxy: Some(format!("socks5://user:pass@{}", addr)),
        ..ClientOptions::default()
    })
    .unwrap();

    let res = client.get("http://site:80/x", Default::default()).unwrap();
    assert_eq!(res.status, 200);
    assert_eq!(res.body, b"tunneled");
    proxy.join().unwrap();
}

#[test]
fn pool_hands_out_clients_round_robin() {
    init();

    let (tx, rx) = mpsc::channel::<SocketAddr>();
    let server = thread::spawn(move || {
        let ev = EventLoop::new().unwrap();
        let handle = ev.handle();
        let acceptor = Acceptor::bind("127.0.0.1:0", &handle).unwrap();
        tx.send(acceptor.local_addr()).unwrap();
        ev.block_on(async move {
            // Two pooled clients connect once each.
            for _ in 0..2 {
                let io = acceptor.accept().await.unwrap();
                let mut req = Request::new(&io);
                assert!(req.parse(TIMEOUT).await.unwrap());
                let mut res = Response::new(&io);
                res.set_status(Status::Ok).set_body(b"pooled".to_vec());
                res.send(TIMEOUT).await.unwrap();
                io.close().await;
            }
        });
    });

    let addr = rx.recv().unwrap();
    let pool = HttpClientPool::new(2, ClientOptions::default()).unwrap();
    assert_eq!(pool.len(), 2);
    let url = format!("http://{}/p", addr);
    assert_eq!(pool.get(&url, Default::default()).unwrap().body, b"pooled");
    assert_eq!(pool.get(&url, Default::default()).unwrap().body, b"pooled");
    server.join().unwrap();
}
