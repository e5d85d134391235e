//! Helpers shared by unit tests.

use core::net::SocketAddr;
use std::{
    net::TcpListener as StdTcpListener,
    sync::{Arc, Mutex},
    thread,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use crate::{
    cfg::{Config, WorkerConfig},
    cmd::Invocation,
};

type Reply = dyn Fn(&str) -> Option<String> + Send + Sync;

/// Resolves the command line arguments and returns the configuration of
/// worker 1.
pub fn worker_config(args: &[&str]) -> WorkerConfig {
    config(args).table.resolve(1).unwrap()
}

pub fn config(args: &[&str]) -> Config {
    let args = ["onslaught"].iter().chain(args).copied();
    Config::try_from(Invocation::try_parse_from(args).unwrap()).unwrap()
}

/// URL of a local port nobody listens on.
pub fn closed_url() -> String {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    format!("http://{addr}/")
}

/// Empty-bodied HTTP/1.1 response.
pub fn response(status: u16, headers: &[(&str, &str)]) -> String {
    let mut resp = format!("HTTP/1.1 {status} Whatever\r\ncontent-length: 0\r\n");
    for (name, value) in headers {
        resp.push_str(&format!("{name}: {value}\r\n"));
    }
    resp.push_str("\r\n");
    resp
}

/// Local HTTP/1.1 responder running on its own thread.
///
/// Every request head is recorded lowercased, then answered with whatever the
/// reply function returns. `None` leaves the request hanging.
pub struct TestServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
}

impl TestServer {
    pub fn start<F>(reply: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();

        let requests = Arc::new(Mutex::new(Vec::new()));
        let reply: Arc<Reply> = Arc::new(reply);

        thread::spawn({
            let requests = requests.clone();
            move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();

                rt.block_on(async move {
                    let listener = TcpListener::from_std(listener).unwrap();
                    loop {
                        let Ok((stream, ..)) = listener.accept().await else {
                            continue;
                        };
                        tokio::spawn(serve(stream, reply.clone(), requests.clone()));
                    }
                });
            }
        });

        Self { addr, requests }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

async fn serve(mut stream: TcpStream, reply: Arc<Reply>, requests: Arc<Mutex<Vec<String>>>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) | Err(..) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);

        while let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
            buf.drain(..end + 4);
            requests.lock().unwrap().push(head.clone());

            match reply(&head) {
                Some(resp) => {
                    if stream.write_all(resp.as_bytes()).await.is_err() {
                        return;
                    }
                }
                None => core::future::pending::<()>().await,
            }
        }
    }
}
