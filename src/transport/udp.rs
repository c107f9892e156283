// UDP provider: one bound socket shared by the sender and receiver tasks

use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{after_send, deliver, resolve, ProviderHandle, MAX_MESSAGE_SIZE, OUTBOUND_QUEUE};
use crate::config::{Endpoint, TransportKind};
use crate::director::Director;
use crate::error::GossipError;
use crate::sip::Item;

pub(crate) async fn start(
    ep: &Endpoint,
    director: Arc<Director>,
    shutdown: watch::Receiver<bool>,
) -> Result<(ProviderHandle, Vec<JoinHandle<()>>), GossipError> {
    let socket = Arc::new(UdpSocket::bind(ep.addr()).await?);
    let endpoint = Endpoint::from_socket_addr(TransportKind::Udp, socket.local_addr()?);
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);

    let sender = tokio::spawn(sender(socket.clone(), rx, director.clone(), shutdown.clone()));
    let receiver = tokio::spawn(receiver(
        socket,
        endpoint.clone(),
        tx.clone(),
        director,
        shutdown,
    ));
    Ok((
        ProviderHandle {
            endpoint,
            queue: tx,
        },
        vec![sender, receiver],
    ))
}

async fn sender(
    socket: Arc<UdpSocket>,
    mut rx: mpsc::Receiver<Arc<Item>>,
    director: Arc<Director>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let item = tokio::select! {
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
            _ = shutdown.changed() => break,
        };
        let addr = match resolve(&item.remote).await {
            Ok(addr) => addr,
            Err(e) => {
                warn!(remote = %item.remote, error = %e, "cannot resolve remote endpoint");
                continue;
            }
        };
        if let Err(e) = socket.send_to(&item.wire, addr).await {
            warn!(remote = %addr, error = %e, "UDP send failed");
            continue;
        }
        debug!(remote = %addr, start_line = %item.msg.start_line, "sent");
        after_send(&director, &item);
    }
}

async fn receiver(
    socket: Arc<UdpSocket>,
    local: Endpoint,
    reply: mpsc::Sender<Arc<Item>>,
    director: Arc<Director>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    loop {
        let (len, from) = tokio::select! {
            result = socket.recv_from(&mut buf) => match result {
                Ok(r) => r,
                Err(e) => {
                    // ICMP port unreachable などは無視して受信を続ける
                    debug!(error = %e, "UDP receive error");
                    continue;
                }
            },
            _ = shutdown.changed() => break,
        };
        if len == 0 {
            continue;
        }
        let remote = Endpoint::from_socket_addr(TransportKind::Udp, from);
        deliver(&director, &buf[..len], &local, remote, &reply);
    }
}
