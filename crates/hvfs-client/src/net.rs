//! TCP transport
//!
//! Every connection carries length-prefixed [`Frame`]s in both directions.
//! Outbound connections are opened lazily from the address table learned at
//! registration; inbound connections are attributed to the site named as
//! `source` in their first request, so replies can find their way back.
//! When a connection drops, every request still waiting on that site fails.

use crate::context::ClientContext;
use crate::transport::{ReplyRouter, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use hvfs_common::{Config, Error, Result, SiteId};
use hvfs_proto::{FRAME_HEADER_LEN, Frame, MAX_FRAME_LEN, Reply, Request};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

/// Frames queued per connection before senders wait
const PEER_QUEUE: usize = 256;

struct Inner {
    local: SiteId,
    router: Arc<ReplyRouter>,
    addresses: RwLock<HashMap<SiteId, SocketAddr>>,
    peers: Mutex<HashMap<SiteId, mpsc::Sender<Bytes>>>,
    inbound: mpsc::UnboundedSender<Request>,
}

/// Frame transport over TCP connections
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<Inner>,
}

impl TcpTransport {
    /// Create a transport for `local`; unsolicited requests arrive on the
    /// returned channel
    #[must_use]
    pub fn new(
        local: SiteId,
        router: Arc<ReplyRouter>,
    ) -> (Self, mpsc::UnboundedReceiver<Request>) {
        let (inbound, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            local,
            router,
            addresses: RwLock::new(HashMap::new()),
            peers: Mutex::new(HashMap::new()),
            inbound,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// Accept connections on `addr`; returns the bound address
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        info!("{} listening on {}", self.inner.local, bound);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        debug!("accepted connection from {}", remote);
                        Inner::attach(&inner, None, stream);
                    }
                    Err(e) => {
                        warn!("accept on {} failed: {}", bound, e);
                        break;
                    }
                }
            }
        });
        Ok(bound)
    }

    async fn write_to(&self, dest: SiteId, frame: Bytes) -> Result<()> {
        let peer = self.inner.peer(dest).await?;
        peer.send(frame)
            .await
            .map_err(|_| Error::ConnectionFailed(format!("{dest}: connection closed")))
    }
}

impl Inner {
    /// Sender for `dest`, connecting if there is no live connection
    async fn peer(self: &Arc<Self>, dest: SiteId) -> Result<mpsc::Sender<Bytes>> {
        let mut peers = self.peers.lock().await;
        if let Some(tx) = peers.get(&dest) {
            if !tx.is_closed() {
                return Ok(tx.clone());
            }
        }
        let addr = self
            .addresses
            .read()
            .get(&dest)
            .copied()
            .ok_or(Error::UnknownSite(dest))?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::ConnectionFailed(format!("{dest} at {addr}: {e}")))?;
        debug!("{} connected to {} at {}", self.local, dest, addr);
        let tx = Self::attach(self, Some(dest), stream);
        peers.insert(dest, tx.clone());
        Ok(tx)
    }

    /// Spawn the reader and writer tasks of one connection
    fn attach(self: &Arc<Self>, peer: Option<SiteId>, stream: TcpStream) -> mpsc::Sender<Bytes> {
        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<Bytes>(PEER_QUEUE);

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = writer.write_all(&frame).await {
                    debug!("write failed: {}", e);
                    break;
                }
            }
        });

        let inner = Arc::clone(self);
        let own = tx.clone();
        tokio::spawn(async move {
            let mut peer = peer;
            let reason = loop {
                match read_frame(&mut reader).await {
                    Ok(Some(Frame::Reply(reply))) => inner.router.complete(reply),
                    Ok(Some(Frame::Request(request))) => {
                        if peer.is_none() {
                            peer = Some(request.source);
                            inner.peers.lock().await.insert(request.source, own.clone());
                        }
                        if inner.inbound.send(request).is_err() {
                            break "inbound channel closed".to_string();
                        }
                    }
                    Ok(None) => break "connection closed".to_string(),
                    Err(e) => break e.to_string(),
                }
            };
            if let Some(site) = peer {
                let mut peers = inner.peers.lock().await;
                if peers.get(&site).is_some_and(|tx| tx.same_channel(&own)) {
                    peers.remove(&site);
                }
                drop(peers);
                inner.router.fail_site(site, &reason);
            }
            debug!("connection to {:?} ended: {}", peer, reason);
        });

        tx
    }
}

/// Read one frame; `None` on a clean end of stream
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::corrupt(format!(
            "frame of {len} bytes exceeds {MAX_FRAME_LEN}"
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Frame::decode(Bytes::from(body)).map(Some)
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, request: Request) -> Result<()> {
        let dest = request.dest;
        let frame = Frame::Request(request).encode()?;
        self.write_to(dest, frame).await
    }

    async fn reply(&self, dest: SiteId, reply: Reply) -> Result<()> {
        let frame = Frame::Reply(reply).encode()?;
        self.write_to(dest, frame).await
    }

    fn learn_address(&self, site: SiteId, addr: SocketAddr) {
        self.inner.addresses.write().insert(site, addr);
    }
}

/// Build a context over TCP, start serving ring updates and register
pub async fn connect(config: Config) -> Result<Arc<ClientContext>> {
    let router = Arc::new(ReplyRouter::new());
    let site = SiteId::client(config.client.site_index);
    let (transport, inbound) = TcpTransport::new(site, Arc::clone(&router));
    transport.listen(config.client.listen).await?;
    transport.learn_address(SiteId::root(0), config.client.root_address);

    let ctx = Arc::new(ClientContext::new(config, Arc::new(transport), router));
    tokio::spawn(Arc::clone(&ctx).serve_inbound(inbound));
    ctx.register().await?;
    Ok(ctx)
}
