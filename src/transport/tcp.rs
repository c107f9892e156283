// TCP provider: listener, one reader task per connection, shared connection table

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{after_send, deliver, read_stream_message, resolve, ProviderHandle, OUTBOUND_QUEUE};
use crate::config::{Endpoint, TransportKind};
use crate::director::Director;
use crate::error::GossipError;
use crate::sip::Item;

type Writer = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

/// Live connections keyed by remote address.
struct Connections {
    local: Endpoint,
    writers: Mutex<HashMap<SocketAddr, Writer>>,
    reply: mpsc::Sender<Arc<Item>>,
    director: Arc<Director>,
    shutdown: watch::Receiver<bool>,
}

impl Connections {
    fn get(&self, addr: &SocketAddr) -> Option<Writer> {
        self.writers.lock().get(addr).cloned()
    }

    fn remove(&self, addr: &SocketAddr) {
        self.writers.lock().remove(addr);
    }

    /// Register a stream and start reading from it.
    fn adopt(self: &Arc<Self>, stream: TcpStream, remote: SocketAddr) -> Writer {
        let (read, write) = stream.into_split();
        let writer: Writer = Arc::new(tokio::sync::Mutex::new(write));
        self.writers.lock().insert(remote, writer.clone());
        tokio::spawn(Arc::clone(self).read_stream(read, remote));
        writer
    }

    async fn read_stream(self: Arc<Self>, read: OwnedReadHalf, remote: SocketAddr) {
        let mut reader = BufReader::new(read);
        let mut shutdown = self.shutdown.clone();
        let from = Endpoint::from_socket_addr(TransportKind::Tcp, remote);
        loop {
            let result = tokio::select! {
                r = read_stream_message(&mut reader) => r,
                _ = shutdown.changed() => break,
            };
            match result {
                Ok(Some(data)) => deliver(&self.director, &data, &self.local, from.clone(), &self.reply),
                Ok(None) => break,
                Err(e) => {
                    warn!(remote = %remote, error = %e, "closing TCP connection");
                    break;
                }
            }
        }
        self.remove(&remote);
        debug!(remote = %remote, "TCP connection closed");
    }
}

pub(crate) async fn start(
    ep: &Endpoint,
    director: Arc<Director>,
    shutdown: watch::Receiver<bool>,
) -> Result<(ProviderHandle, Vec<JoinHandle<()>>), GossipError> {
    let listener = TcpListener::bind(ep.addr()).await?;
    let endpoint = Endpoint::from_socket_addr(TransportKind::Tcp, listener.local_addr()?);
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
    let conns = Arc::new(Connections {
        local: endpoint.clone(),
        writers: Mutex::new(HashMap::new()),
        reply: tx.clone(),
        director,
        shutdown: shutdown.clone(),
    });

    let sender = tokio::spawn(sender(conns.clone(), rx, shutdown.clone()));
    let acceptor = tokio::spawn(acceptor(listener, conns, shutdown));
    Ok((
        ProviderHandle {
            endpoint,
            queue: tx,
        },
        vec![sender, acceptor],
    ))
}

async fn acceptor(listener: TcpListener, conns: Arc<Connections>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, remote)) => {
                    info!(remote = %remote, "accepted TCP connection");
                    conns.adopt(stream, remote);
                }
                Err(e) => warn!(error = %e, "TCP accept failed"),
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn sender(conns: Arc<Connections>, mut rx: mpsc::Receiver<Arc<Item>>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let item = tokio::select! {
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
            _ = shutdown.changed() => break,
        };
        if let Err(e) = send_one(&conns, &item).await {
            warn!(remote = %item.remote, error = %e, "TCP send failed");
            continue;
        }
        after_send(&conns.director, &item);
    }
}

/// Write an item on an existing connection to its remote, dialling one if needed.
async fn send_one(conns: &Arc<Connections>, item: &Item) -> Result<(), GossipError> {
    let addr = resolve(&item.remote).await?;
    let writer = match conns.get(&addr) {
        Some(w) => w,
        None => {
            let stream = TcpStream::connect(addr).await?;
            conns.adopt(stream, addr)
        }
    };
    let result = writer.lock().await.write_all(&item.wire).await;
    if let Err(e) = result {
        conns.remove(&addr);
        return Err(e.into());
    }
    Ok(())
}
