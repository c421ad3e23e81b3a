use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::net::UdpSocket;

use crate::transport::conn::Conn;

/// UDP の送信元アドレス → 論理コネクション
///
/// Entries are never evicted: the pool grows with the number of distinct UDP
/// peers for the lifetime of the listener. Crossing each multiple of
/// `warn_every` entries is logged so that growth stays visible.
pub struct UdpPool {
    conns: Mutex<HashMap<SocketAddr, Arc<Conn>>>,
    sock: Weak<UdpSocket>,
    conn_seq: Arc<AtomicU64>,
    warn_every: usize,
}

impl UdpPool {
    pub fn new(sock: Weak<UdpSocket>, conn_seq: Arc<AtomicU64>, warn_every: usize) -> Self {
        Self {
            conns: Mutex::new(HashMap::new()),
            sock,
            conn_seq,
            warn_every: warn_every.max(1),
        }
    }

    /// Connection for `peer`, created on first sight.
    pub fn get_or_create(&self, peer: SocketAddr) -> Arc<Conn> {
        let mut conns = self.conns.lock();
        if let Some(conn) = conns.get(&peer) {
            return Arc::clone(conn);
        }

        let conn_id = self.conn_seq.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Conn::from_udp(conn_id, peer, self.sock.clone()));
        conns.insert(peer, Arc::clone(&conn));
        let size = conns.len();
        drop(conns);

        log::debug!("[sip udp] new peer conn_id={} peer={}", conn_id, peer);
        if size % self.warn_every == 0 {
            log::warn!(
                "[sip udp] peer pool holds {} connections and is never evicted",
                size
            );
        }
        conn
    }

    pub fn len(&self) -> usize {
        self.conns.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
