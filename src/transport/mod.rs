// Transport providers: UDP and TCP endpoints between the network and the director
//
// Every configured local endpoint gets one provider. A provider owns an
// outbound queue drained by its sender task, and a receiver side that parses
// inbound traffic into items and hands them to the director. The outbound
// queue doubles as the reply queue of every item sent through it, so the
// retransmission timers put items back there.

pub mod tcp;
pub mod udp;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{Endpoint, TransportKind};
use crate::director::Director;
use crate::error::GossipError;
use crate::sip::parser::{parse_sip_message, ParseError};
use crate::sip::{Item, RetransStage};

/// Outbound queue size per provider
pub const OUTBOUND_QUEUE: usize = 8;

/// Largest message accepted from the network
pub const MAX_MESSAGE_SIZE: usize = 65535;

/// Boundary between the scenario engine and the network.
pub trait Transport: Send + Sync {
    fn send<'a>(
        &'a self,
        item: Item,
    ) -> Pin<Box<dyn Future<Output = Result<(), GossipError>> + Send + 'a>>;
}

/// Sending side of one provider.
#[derive(Debug, Clone)]
pub(crate) struct ProviderHandle {
    pub(crate) endpoint: Endpoint,
    pub(crate) queue: mpsc::Sender<Arc<Item>>,
}

/// All providers of the process.
pub struct Providers {
    handles: Vec<ProviderHandle>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    director: Arc<Director>,
}

impl Providers {
    /// Bind every endpoint and start its sender and receiver tasks.
    pub async fn start(endpoints: &[Endpoint], director: Arc<Director>) -> Result<Arc<Self>, GossipError> {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::with_capacity(endpoints.len());
        let mut tasks = Vec::new();
        for ep in endpoints {
            let (handle, mut spawned) = match ep.kind {
                TransportKind::Udp => udp::start(ep, director.clone(), shutdown_rx.clone()).await?,
                TransportKind::Tcp => tcp::start(ep, director.clone(), shutdown_rx.clone()).await?,
            };
            info!(configured = %ep, bound = %handle.endpoint, "provider started");
            handles.push(handle);
            tasks.append(&mut spawned);
        }
        Ok(Arc::new(Self {
            handles,
            tasks: parking_lot::Mutex::new(tasks),
            shutdown,
            director,
        }))
    }

    /// Endpoints as actually bound (port 0 is replaced by the assigned port)
    pub fn local_endpoints(&self) -> Vec<Endpoint> {
        self.handles.iter().map(|h| h.endpoint.clone()).collect()
    }

    fn pick(&self, local: &Endpoint) -> Option<&ProviderHandle> {
        self.handles
            .iter()
            .find(|h| &h.endpoint == local)
            .or_else(|| self.handles.iter().find(|h| h.endpoint.kind == local.kind))
    }

    /// Queue an item on the provider of its local endpoint, or on any provider
    /// of the same transport kind.
    pub async fn transmit(&self, item: Item) -> Result<(), GossipError> {
        let handle = self
            .pick(&item.local)
            .ok_or_else(|| GossipError::NoTransport(item.local.to_string()))?;
        let item = Arc::new(item.with_reply(handle.queue.clone()));
        handle
            .queue
            .send(item)
            .await
            .map_err(|_| GossipError::TransportClosed(handle.endpoint.to_string()))
    }

    /// Stop every provider task and pending retransmission.
    pub async fn close(&self) {
        info!("closing network interfaces");
        let _ = self.shutdown.send(true);
        self.director.retransmitter().cancel_all();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Transport for Providers {
    fn send<'a>(
        &'a self,
        item: Item,
    ) -> Pin<Box<dyn Future<Output = Result<(), GossipError>> + Send + 'a>> {
        Box::pin(self.transmit(item))
    }
}

/// Bookkeeping after an item went out: statistics and the next retransmission.
pub(crate) fn after_send(director: &Director, item: &Arc<Item>) {
    let stats = director.stats();
    stats.record_sent();
    if !matches!(item.retrans_stage(), RetransStage::NoRetrans | RetransStage::Initial) {
        stats.record_retransmission();
    }
    director.retransmitter().after_send(item);
}

/// Parse raw bytes into an inbound item and route it.
pub(crate) fn deliver(
    director: &Director,
    data: &[u8],
    local: &Endpoint,
    remote: Endpoint,
    reply: &mpsc::Sender<Arc<Item>>,
) {
    match parse_sip_message(data) {
        Ok(scanned) => {
            let item = Item::inbound(
                scanned.message,
                data.to_vec(),
                scanned.checksum,
                local.clone(),
                remote,
                Some(reply.clone()),
            );
            director.direct(Arc::new(item));
        }
        Err(e) => warn!(remote = %remote, error = %e, "dropping unparsable message"),
    }
}

/// Read one message from a stream: header lines up to the blank line, then
/// `Content-Length` bytes of body. `Ok(None)` on a clean end of stream.
pub async fn read_stream_message<R>(reader: &mut R) -> Result<Option<Vec<u8>>, GossipError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut content_length = 0usize;
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ParseError::new("stream closed inside a message").into());
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            // メッセージ間の keep-alive CRLF は読み飛ばす
            if buf.is_empty() {
                continue;
            }
            buf.extend_from_slice(b"\r\n");
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            let name = name.trim();
            if name.eq_ignore_ascii_case("Content-Length") || name.eq_ignore_ascii_case("l") {
                content_length = value
                    .trim()
                    .parse()
                    .map_err(|_| ParseError::new(format!("invalid Content-Length: {}", value.trim())))?;
            }
        }
        buf.extend_from_slice(trimmed.as_bytes());
        buf.extend_from_slice(b"\r\n");
        if buf.len() > MAX_MESSAGE_SIZE {
            return Err(ParseError::new("header block too large").into());
        }
    }
    if content_length > MAX_MESSAGE_SIZE {
        return Err(ParseError::new(format!("Content-Length too large: {}", content_length)).into());
    }
    let start = buf.len();
    buf.resize(start + content_length, 0);
    reader.read_exact(&mut buf[start..]).await?;
    Ok(Some(buf))
}

/// Resolve `host:port` of an endpoint to a socket address.
pub(crate) async fn resolve(ep: &Endpoint) -> Result<std::net::SocketAddr, GossipError> {
    tokio::net::lookup_host(ep.addr())
        .await?
        .next()
        .ok_or_else(|| GossipError::NoTransport(format!("cannot resolve {}", ep)))
}
