use std::time::{Duration, Instant};

use coio::net::{Acceptor, Io};
use coio::{Error, EventLoop};

mod util;

use util::init;

#[test]
fn tcp_echo_roundtrip() {
    init();

    let ev = EventLoop::new().unwrap();
    let handle = ev.handle();
    let acceptor = Acceptor::bind("127.0.0.1:0", &handle).unwrap();
    let addr = acceptor.local_addr();

    ev.block_on(async {
        handle.detach(async move {
            let io = acceptor.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = io.recv(&mut buf).await.unwrap();
            io.fully_send(&buf[..n]).await.unwrap();
            io.close().await;
        });

        let io = Io::connect(addr, &handle).await.unwrap();
        io.fully_send(b"hello").await.unwrap();
        let mut buf = [0u8; 64];
        let n = io.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(io.close().await, 0);
    });
}

#[test]
fn fully_recv_reports_peer_close() {
    init();

    let ev = EventLoop::new().unwrap();
    let handle = ev.handle();
    let acceptor = Acceptor::bind("127.0.0.1:0", &handle).unwrap();
    let addr = acceptor.local_addr();

    ev.block_on(async {
        handle.detach(async move {
            let io = acceptor.accept().await.unwrap();
            io.fully_send(b"ab").await.unwrap();
            io.close().await;
        });

        let io = Io::connect(addr, &handle).await.unwrap();
        let mut buf = [0u8; 4];
        let err = io.fully_recv(&mut buf).await.unwrap_err();
        assert!(matches!(err, Error::PeerClosed), "got {err:?}");
        io.close().await;
    });
}

#[test]
fn timeout_cancels_a_silent_recv() {
    init();

    let ev = EventLoop::new().unwrap();
    let handle = ev.handle();
    let acceptor = Acceptor::bind("127.0.0.1:0", &handle).unwrap();
    let addr = acceptor.local_addr();

    ev.block_on(async {
        let server = handle.clone();
        handle.detach(async move {
            // Accept and go quiet; the client must time out on its own.
            let io = acceptor.accept().await.unwrap();
            server.sleep(Duration::from_millis(200)).await;
            io.close().await;
        });

        let io = Io::connect(addr, &handle).await.unwrap();
        let mut buf = vec![0u8; 1024];
        let start = Instant::now();
        let out = io
            .recv_link_timeout(&mut buf, Duration::from_millis(5))
            .await
            .unwrap();
        let elapsed = start.elapsed();
        assert_eq!(out, None);
        assert!(elapsed >= Duration::from_millis(5), "waited {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(50), "waited {:?}", elapsed);
        assert_eq!(io.close().await, 0);
    });
}

#[test]
fn send_link_timeout_moves_data() {
    init();

    let ev = EventLoop::new().unwrap();
    let handle = ev.handle();
    let acceptor = Acceptor::bind("127.0.0.1:0", &handle).unwrap();
    let addr = acceptor.local_addr();

    ev.block_on(async {
        handle.detach(async move {
            let io = acceptor.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let mut got = Vec::new();
            loop {
                let n = io.recv(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                got.extend_from_slice(&buf[..n]);
            }
            assert_eq!(got, b"with a deadline");
            io.close().await;
        });

        let io = Io::connect(addr, &handle).await.unwrap();
        io.send_link_timeout(b"with a deadline", Duration::from_secs(1))
            .await
            .unwrap();
        io.close().await;
        // Let the server finish its assertions.
        handle.sleep(Duration::from_millis(20)).await;
    });
}

#[cfg(unix)]
#[test]
fn poll_readable_wakes_on_data() {
    init();

    let ev = EventLoop::new().unwrap();
    let handle = ev.handle();
    let acceptor = Acceptor::bind("127.0.0.1:0", &handle).unwrap();
    let addr = acceptor.local_addr();

    ev.block_on(async {
        let server = handle.clone();
        handle.detach(async move {
            let io = acceptor.accept().await.unwrap();
            server.sleep(Duration::from_millis(10)).await;
            io.fully_send(b"x").await.unwrap();
            io.close().await;
        });

        let io = Io::connect(addr, &handle).await.unwrap();
        Error::check(handle.poll_readable(io.fd()).await).unwrap();
        let mut buf = [0u8; 4];
        let n = io.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"x");
        io.close().await;
    });
}

#[test]
fn operations_on_a_closed_io_fail_eagerly() {
    init();

    let ev = EventLoop::new().unwrap();
    let handle = ev.handle();
    ev.block_on(async {
        let io = Io::new(coio::INVALID_SOCKET, handle.clone());
        let mut buf = [0u8; 4];
        assert!(io.recv(&mut buf).await.is_err());
        assert!(io.fully_send(b"x").await.is_err());
    });
}
