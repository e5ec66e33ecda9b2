//! End-to-end ping over a local server.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use pktwire_protocol::ProtocolRegistry;
use pktwire_session::{
    register_builtin, versions, Connection, ProtocolConfig, Server, ServerConfig, Session,
};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::Mutex;

struct Client {
    stream: TcpStream,
    conn: Connection,
    nonce: u32,
}

impl Client {
    async fn ping(&mut self) {
        self.nonce = self.nonce.wrapping_add(1);
        let frame = self.conn.ping(self.nonce).unwrap();
        self.stream.write_all(&frame).await.unwrap();

        let mut buf = [0u8; 256];
        let before = self.conn.session().stats().frames_in();
        while self.conn.session().stats().frames_in() == before {
            let n = self.stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "server closed the connection");
            self.conn.feed(&buf[..n]);
            self.conn.process().unwrap();
        }
    }
}

fn setup(rt: &Runtime) -> Arc<Mutex<Client>> {
    rt.block_on(async {
        let registry = Arc::new(ProtocolRegistry::new());
        register_builtin(&registry, &ProtocolConfig::default()).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(Server::new(
            ServerConfig::new(addr, versions::FRAMED),
            registry,
        ));
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let protocol = versions::build(versions::FRAMED, 1024).unwrap();
        let mut conn = Connection::new(protocol, Session::new(versions::FRAMED));
        if let Some(intro) = conn.introduce("bench").unwrap() {
            stream.write_all(&intro).await.unwrap();
        }

        Arc::new(Mutex::new(Client {
            stream,
            conn,
            nonce: 0,
        }))
    })
}

fn bench_ping_latency(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let client = setup(&rt);

    let mut group = c.benchmark_group("e2e_ping");
    group.throughput(Throughput::Elements(1));

    group.bench_function("ping", |b| {
        b.to_async(&rt).iter(|| {
            let client = client.clone();
            async move { black_box(client.lock().await.ping().await) }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_ping_latency);
criterion_main!(benches);
