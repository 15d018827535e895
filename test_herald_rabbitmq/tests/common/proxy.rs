use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A local TCP relay in front of the broker that can cut every live
/// connection and refuse new ones, standing in for network failures.
pub struct Proxy {
    port: u16,
    state: Arc<State>,
    accepting: JoinHandle<()>,
}

struct State {
    upstream: SocketAddr,
    rejecting: AtomicBool,
    accepted: AtomicUsize,
    kills: watch::Sender<u64>,
}

impl Proxy {
    pub async fn start(upstream_port: u16) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (kills, _) = watch::channel(0);

        let state = Arc::new(State {
            upstream: SocketAddr::from(([127, 0, 0, 1], upstream_port)),
            rejecting: AtomicBool::new(false),
            accepted: AtomicUsize::new(0),
            kills,
        });

        let accepting = tokio::spawn(Self::accept(listener, state.clone()));

        Self {
            port,
            state,
            accepting,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// How many connections were relayed so far.
    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Cuts every connection relayed so far.
    pub fn kill(&self) {
        self.state.kills.send_modify(|kills| *kills += 1);
    }

    /// Closes every new connection right after accepting it.
    pub fn reject_new(&self) {
        self.state.rejecting.store(true, Ordering::SeqCst);
    }

    async fn accept(listener: TcpListener, state: Arc<State>) {
        while let Ok((inbound, _)) = listener.accept().await {
            if state.rejecting.load(Ordering::SeqCst) {
                drop(inbound);
                continue;
            }

            let Ok(outbound) = TcpStream::connect(state.upstream).await else {
                continue;
            };

            state.accepted.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(Self::relay(inbound, outbound, state.kills.subscribe()));
        }
    }

    async fn relay(
        mut inbound: TcpStream,
        mut outbound: TcpStream,
        mut kills: watch::Receiver<u64>,
    ) {
        select! {
            _ = copy_bidirectional(&mut inbound, &mut outbound) => {},
            _ = kills.changed() => {},
        }
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.accepting.abort();
        self.kill();
    }
}
