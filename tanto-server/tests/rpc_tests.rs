//! Binary RPC surface over a real TCP socket.

use std::sync::Arc;

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use tanto_core::config::Config;
use tanto_server::rpc;
use tanto_storage::Engine;

const OP_CREATE: u8 = 1;
const OP_SET: u8 = 3;
const OP_GET: u8 = 6;
const OP_DEL: u8 = 7;

const STATUS_OK: u8 = 0;
const STATUS_INVALID_ARGUMENT: u8 = 1;

struct Client {
    stream: TcpStream,
}

impl Client {
    async fn connect(addr: std::net::SocketAddr) -> Client {
        Client {
            stream: TcpStream::connect(addr).await.unwrap(),
        }
    }

    async fn call(&mut self, payload: &[u8]) -> Vec<u8> {
        self.stream
            .write_all(&(payload.len() as u32).to_be_bytes())
            .await
            .unwrap();
        self.stream.write_all(payload).await.unwrap();

        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).await.unwrap();
        let mut body = vec![0u8; u32::from_be_bytes(len_buf) as usize];
        self.stream.read_exact(&mut body).await.unwrap();
        body
    }
}

fn request(op: u8, deadline_ms: u32, fields: &[&[u8]]) -> Vec<u8> {
    let mut buf = vec![op];
    buf.extend_from_slice(&deadline_ms.to_be_bytes());
    for field in fields {
        buf.extend_from_slice(&(field.len() as u32).to_be_bytes());
        buf.extend_from_slice(field);
    }
    buf
}

async fn start_server() -> (TempDir, Arc<Engine>, std::net::SocketAddr) {
    let dir = TempDir::new().unwrap();
    let mut cfg = Config::default();
    cfg.storage.db_folder = dir.path().to_path_buf();
    let engine = Arc::new(Engine::new(cfg).unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server_engine = engine.clone();
    tokio::spawn(async move {
        let _ = rpc::serve(listener, server_engine).await;
    });

    (dir, engine, addr)
}

#[tokio::test]
async fn test_full_cycle_over_tcp() {
    let (_dir, engine, addr) = start_server().await;
    let mut client = Client::connect(addr).await;

    let body = client.call(&request(OP_CREATE, 1000, &[b"wiredb"])).await;
    assert_eq!(body[0], STATUS_OK);

    let mut set = request(OP_SET, 1000, &[b"wiredb", b"", b"k", b"v"]);
    set.extend_from_slice(&0i64.to_be_bytes());
    let body = client.call(&set).await;
    assert_eq!(body, vec![STATUS_OK, 1]);

    let body = client.call(&request(OP_GET, 1000, &[b"wiredb", b"", b"k"])).await;
    assert_eq!(body[0], STATUS_OK);
    assert_eq!(body[1], 1, "found");
    assert_eq!(&body[6..], b"v");

    let body = client.call(&request(OP_DEL, 1000, &[b"wiredb", b"", b"k"])).await;
    assert_eq!(body, vec![STATUS_OK, 1]);

    let body = client.call(&request(OP_GET, 1000, &[b"wiredb", b"", b"k"])).await;
    assert_eq!(body[1], 0, "gone");

    engine.close_all();
}

#[tokio::test]
async fn test_requests_pipeline_on_one_connection() {
    let (_dir, engine, addr) = start_server().await;
    let mut client = Client::connect(addr).await;

    client.call(&request(OP_CREATE, 1000, &[b"serial"])).await;
    for i in 0..50u32 {
        let key = format!("k{i}");
        let value = format!("v{i}");
        let mut set = request(
            OP_SET,
            1000,
            &[b"serial", b"", key.as_bytes(), value.as_bytes()],
        );
        set.extend_from_slice(&0i64.to_be_bytes());
        assert_eq!(client.call(&set).await, vec![STATUS_OK, 1]);
    }
    for i in 0..50u32 {
        let key = format!("k{i}");
        let body = client
            .call(&request(OP_GET, 1000, &[b"serial", b"", key.as_bytes()]))
            .await;
        assert_eq!(&body[6..], format!("v{i}").as_bytes());
    }

    engine.close_all();
}

#[tokio::test]
async fn test_missing_deadline_rejected_over_tcp() {
    let (_dir, engine, addr) = start_server().await;
    let mut client = Client::connect(addr).await;

    let body = client.call(&request(OP_CREATE, 0, &[b"nodeadline"])).await;
    assert_eq!(body[0], STATUS_INVALID_ARGUMENT);
    assert!(!engine.db_exists("nodeadline"));

    engine.close_all();
}

#[tokio::test]
async fn test_oversized_frame_closes_connection() {
    let (_dir, engine, addr) = start_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    // announce a frame beyond the 1 MiB cap
    stream
        .write_all(&(2_u32 << 20).to_be_bytes())
        .await
        .unwrap();

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.unwrap();
    let mut body = vec![0u8; u32::from_be_bytes(len_buf) as usize];
    stream.read_exact(&mut body).await.unwrap();
    assert_eq!(body[0], STATUS_INVALID_ARGUMENT);

    // server drops the connection afterwards
    let n = stream.read(&mut [0u8; 1]).await.unwrap();
    assert_eq!(n, 0);

    engine.close_all();
}
