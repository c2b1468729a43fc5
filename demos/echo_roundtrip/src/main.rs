use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    sync::Arc,
    thread,
    time::Duration,
};

use arsock::*;
use bytes::{Bytes, BytesMut};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Sends every decoded message straight back, routing id included.
fn serve(mut stream: TcpStream) -> Result<()> {
    let mut inbound = BytesMut::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Ok(());
        }
        inbound.extend_from_slice(&chunk[..n]);
        while let Some(frames) = frame::decode(&mut inbound)? {
            let mut out = BytesMut::new();
            frame::encode(&frames, &mut out);
            stream.write_all(&out)?;
        }
    }
}

fn start_echo_server() -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let address = format!("tcp@{}", listener.local_addr()?);
    thread::spawn(move || {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    thread::spawn(move || {
                        if let Err(err) = serve(stream) {
                            warn!(error = %err, "echo session failed");
                        }
                    });
                }
                Err(err) => warn!(error = %err, "accept failed"),
            }
        }
    });
    Ok(address)
}

#[tokio::main]
pub async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| Error::new(ErrorKind::Other, err))?;

    let address = start_echo_server()?;
    let resolver = Arc::new(StaticResolver::new());
    resolver.set("echo.master", &address);
    resolver.set("echo.replica", &address);

    let poll = Arc::new(PollLoop::new());
    let _driver = poll.spawn(Duration::from_millis(10))?;

    let socket = AsyncRequestSocket::new(
        Arc::new(TcpTransport::new()),
        resolver.clone(),
        poll.clone(),
        vec!["echo.master".to_owned(), "echo.replica".to_owned()],
        SocketConfig::default(),
    )?;
    info!(name = socket.name(), "socket ready");

    let master = socket.request_master(vec![Bytes::from_static(b"hello master")], false);
    let any: Vec<ReplyFuture> = (0..4)
        .map(|i| socket.request_any(vec![Bytes::from(format!("request {}", i))], false))
        .collect();

    let reply = master.await;
    println!("master: {} {:?}", reply.status, reply.frames);
    for reply in futures::future::join_all(any).await {
        println!("any: {} {:?}", reply.status, reply.frames);
    }

    resolver.remove("echo.replica");
    let reply = socket.request_to(1, vec![Bytes::from_static(b"gone")], false).await;
    println!("replica after removal: {}", reply.status);

    socket.teardown();
    Ok(())
}
