use std::cell::Cell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use coio::http::{ClientOptions, HttpClient, Request, Response};
use coio::net::Acceptor;
use coio::ws::{OpCode, WebSocketFactory};
use coio::{Error, EventLoop};

mod util;

use util::init;

const TIMEOUT: Duration = Duration::from_secs(5);

/// Serves one WebSocket connection with the given session script.
fn spawn_ws_server<F>(serve: F) -> (SocketAddr, thread::JoinHandle<()>)
where
    F: for<'a> FnOnce(
            coio::ws::WebSocket<'a>,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + 'a>>
        + Send
        + 'static,
{
    let (tx, rx) = mpsc::channel::<SocketAddr>();
    let handle = thread::spawn(move || {
        let ev = EventLoop::new().unwrap();
        let handle = ev.handle();
        let acceptor = Acceptor::bind("127.0.0.1:0", &handle).unwrap();
        tx.send(acceptor.local_addr()).unwrap();
        ev.block_on(async move {
            let io = acceptor.accept().await.unwrap();
            {
                let mut req = Request::new(&io);
                assert!(req.parse(TIMEOUT).await.unwrap());
                let mut res = Response::new(&io);
                let ws = WebSocketFactory::accept(&req, &mut res).await.unwrap();
                serve(ws).await;
            }
            io.close().await;
        });
    });
    (rx.recv().unwrap(), handle)
}

#[test]
fn echo_text_binary_ping_close() {
    init();

    let (addr, server) = spawn_ws_server(|mut ws| {
        Box::pin(async move {
            // Text, then two binary messages sized to use the 16-bit
            // and 64-bit length encodings.
            let text = ws.recv_text().await.unwrap();
            ws.send_text(&text).await.unwrap();
            for _ in 0..2 {
                let bytes = ws.recv_bytes().await.unwrap();
                ws.send_bytes(&bytes).await.unwrap();
            }
            // Pings are answered inside recv; the loop ends when the
            // peer starts the close handshake.
            match ws.recv_text().await {
                Err(Error::WsClosed(1000)) => {}
                other => panic!("expected the close handshake, got {other:?}"),
            }
        })
    });

    let client = HttpClient::new(ClientOptions::default()).unwrap();
    client
        .ws_loop(&format!("ws://{}/echo", addr), |mut ws| {
            Box::pin(async move {
                ws.send_text("héllo").await?;
                assert_eq!(ws.recv_text().await?, "héllo");

                // 126 forces the 16-bit length, 65 536 the 64-bit one.
                let medium: Vec<u8> = (0..126u32).map(|i| i as u8).collect();
                ws.send_bytes(&medium).await?;
                assert_eq!(ws.recv_bytes().await?, medium);

                let large: Vec<u8> = (0..65_536u32).map(|i| (i % 255) as u8).collect();
                ws.send_bytes(&large).await?;
                assert_eq!(ws.recv_bytes().await?, large);

                // A 125-byte ping comes back as an identical pong.
                let probe: Vec<u8> = (0..125u8).collect();
                ws.ping(&probe).await?;
                let pong = ws.recv(OpCode::Pong).await?;
                assert_eq!(pong.payload, probe);

                ws.close().await
            })
        })
        .unwrap();

    server.join().unwrap();
}

#[test]
fn slow_peer_is_probed_with_a_ping() {
    init();

    let (addr, server) = spawn_ws_server(|mut ws| {
        Box::pin(async move {
            // The 40 ms read timeout fires while the client sits
            // quiet; the engine probes with a ping, the client's recv
            // answers it, and the text frame that raced the pong is
            // handed back as the result.
            let packet = ws
                .recv_timeout(OpCode::Text, Duration::from_millis(40))
                .await
                .unwrap();
            ws.send_text(std::str::from_utf8(&packet.payload).unwrap())
                .await
                .unwrap();
            match ws.recv_text().await {
                Err(Error::WsClosed(1000)) => {}
                other => panic!("expected the close handshake, got {other:?}"),
            }
        })
    });

    let woke = Rc::new(Cell::new(false));
    let client = HttpClient::new(ClientOptions::default()).unwrap();
    let woke2 = woke.clone();
    client
        .ws_loop(&format!("ws://{}/slow", addr), move |mut ws| {
            Box::pin(async move {
                // Send after a beat so the server's short recv timeout
                // fires at least once and its ping probe runs.
                ws.io().handle().sleep(Duration::from_millis(60)).await;
                ws.send_text("finally").await?;
                assert_eq!(ws.recv_text().await?, "finally");
                woke2.set(true);
                ws.close().await
            })
        })
        .unwrap();

    assert!(woke.get());
    server.join().unwrap();
}
