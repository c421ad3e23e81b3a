use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::ListenerError;
use crate::sip::parse_request;
use crate::transport::listener::Delivery;

pub type ConnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => f.write_str("TCP"),
            Transport::Udp => f.write_str("UDP"),
        }
    }
}

/// 送信経路。TCP は接続ごとの writer タスク、UDP はリスナーの共有ソケット。
enum Link {
    Tcp(UnboundedSender<Vec<u8>>),
    /// UDP ソケットの所有者は受信ループ。ループ終了後の送信は NotConnected になる。
    Udp(Weak<UdpSocket>),
}

/// A logical peer: an accepted TCP stream, or a remote address seen on the
/// shared UDP socket.
///
/// Outbound bytes are buffered by [`Conn::write`] and sent by [`Conn::flush`].
/// On UDP one flush is one datagram.
pub struct Conn {
    id: ConnId,
    peer: SocketAddr,
    link: Link,
    pending: Mutex<Vec<u8>>,
}

impl Conn {
    pub(crate) fn from_tcp(id: ConnId, peer: SocketAddr, tx: UnboundedSender<Vec<u8>>) -> Self {
        Self {
            id,
            peer,
            link: Link::Tcp(tx),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn from_udp(id: ConnId, peer: SocketAddr, sock: Weak<UdpSocket>) -> Self {
        Self {
            id,
            peer,
            link: Link::Udp(sock),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn transport(&self) -> Transport {
        match self.link {
            Link::Tcp(_) => Transport::Tcp,
            Link::Udp(_) => Transport::Udp,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Queues bytes for the next [`Conn::flush`].
    pub fn write(&self, data: &[u8]) {
        self.pending.lock().extend_from_slice(data);
    }

    /// Sends everything queued by [`Conn::write`].
    pub async fn flush(&self) -> io::Result<()> {
        let payload = std::mem::take(&mut *self.pending.lock());
        if payload.is_empty() {
            return Ok(());
        }
        match &self.link {
            Link::Tcp(tx) => {
                let len = payload.len();
                tx.send(payload).map_err(|_| {
                    io::Error::new(io::ErrorKind::NotConnected, "tcp connection is closed")
                })?;
                log::debug!("[sip ->] tcp conn_id={} peer={} len={}", self.id, self.peer, len);
                Ok(())
            }
            Link::Udp(sock) => {
                let sock = sock.upgrade().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotConnected, "udp listener is closed")
                })?;
                let sent = sock.send_to(&payload, self.peer).await?;
                log::debug!("[sip ->] udp conn_id={} peer={} len={}", self.id, self.peer, sent);
                Ok(())
            }
        }
    }

    /// `write` + `flush`
    pub async fn send(&self, data: &[u8]) -> io::Result<()> {
        self.write(data);
        self.flush().await
    }

    /// Decodes one complete message received from this peer.
    pub(crate) fn decode(self: &Arc<Self>, data: &[u8]) -> Delivery {
        match parse_request(data) {
            Ok(request) => Delivery::Request {
                conn: Arc::clone(self),
                request,
            },
            Err(source) => {
                log::warn!(
                    "[sip <-] {} conn_id={} peer={} undecodable message: {:#}",
                    self.transport(),
                    self.id,
                    self.peer,
                    source
                );
                Delivery::Failed(ListenerError::Codec {
                    conn: Arc::clone(self),
                    source,
                })
            }
        }
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("transport", &self.transport())
            .field("peer", &self.peer)
            .finish()
    }
}
