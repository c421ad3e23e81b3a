use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::ListenerConfig;
use crate::error::ListenerError;
use crate::sip::SipRequest;
use crate::transport::branch_cache::{transaction_branch, BranchCache};
use crate::transport::conn::{Conn, ConnId};
use crate::transport::framing::FrameBuffer;
use crate::transport::udp_pool::UdpPool;

/// UDP の最大ペイロード長
const MAX_DATAGRAM: usize = 65_535;
const TCP_READ_CHUNK: usize = 4096;
const MAX_TCP_BUFFER: usize = 256 * 1024;
/// tokio の mpsc で取れる最小容量。受け手が止まれば送り手 (各ループ) も止まる。
const DELIVERY_CHANNEL_CAPACITY: usize = 1;

/// 受信ループ → accept_request に渡す 1 件分
pub(crate) enum Delivery {
    Request { conn: Arc<Conn>, request: SipRequest },
    Failed(ListenerError),
}

/// A request that passed branch validation and retransmission filtering.
#[derive(Debug)]
pub struct Incoming {
    pub request: SipRequest,
    /// Where the request came from; responses are written here.
    pub conn: Arc<Conn>,
}

/// タスク間で共有する状態
struct Shared {
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    branches: BranchCache,
    udp_pool: UdpPool,
    conn_seq: Arc<AtomicU64>,
    config: ListenerConfig,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// One-time shutdown trigger. Returns `false` if someone else got there first.
    fn begin_close(&self) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.shutdown_tx.send_replace(true);
        log::info!("[listener] shutting down");
        true
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    fn next_conn_id(&self) -> ConnId {
        self.conn_seq.fetch_add(1, Ordering::Relaxed)
    }
}

struct Tasks {
    tcp: JoinHandle<()>,
    udp: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

/// SIP listener serving TCP and UDP on one address.
///
/// Both transports feed a single queue consumed through
/// [`Listener::accept_request`]. Requests are checked for an RFC 3261 branch
/// and UDP retransmissions of an already delivered request are dropped.
///
/// A fatal error on either transport shuts the whole listener down; the
/// error is reported once through `accept_request`.
pub struct Listener {
    shared: Arc<Shared>,
    deliveries: tokio::sync::Mutex<mpsc::Receiver<Delivery>>,
    tasks: parking_lot::Mutex<Option<Tasks>>,
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
}

impl Listener {
    /// Listens on `addr` (`host:port`) over both TCP and UDP.
    pub async fn bind(addr: &str) -> Result<Self, ListenerError> {
        Self::bind_with(addr, ListenerConfig::default()).await
    }

    /// Like [`Listener::bind`] with explicit tunables.
    ///
    /// UDP is bound to the effective TCP address, so port `0` yields one port
    /// shared by both transports. If the UDP bind fails the TCP socket is
    /// released before the error is returned.
    pub async fn bind_with(addr: &str, config: ListenerConfig) -> Result<Self, ListenerError> {
        let tcp = TcpListener::bind(addr).await?;
        let tcp_addr = tcp.local_addr()?;
        let udp = UdpSocket::bind(tcp_addr).await?;
        let udp_addr = udp.local_addr()?;
        let udp = Arc::new(udp);

        let conn_seq = Arc::new(AtomicU64::new(1));
        let (shutdown_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            closed: AtomicBool::new(false),
            shutdown_tx,
            branches: BranchCache::new(config.branch_retention),
            udp_pool: UdpPool::new(
                Arc::downgrade(&udp),
                conn_seq.clone(),
                config.udp_pool_warn,
            ),
            conn_seq,
            config,
        });

        let (tx, rx) = mpsc::channel(DELIVERY_CHANNEL_CAPACITY);
        let tasks = Tasks {
            tcp: tokio::spawn(run_tcp_accept_loop(shared.clone(), tcp, tx.clone())),
            udp: tokio::spawn(run_udp_loop(shared.clone(), udp, tx)),
            sweeper: tokio::spawn(run_branch_sweeper(shared.clone())),
        };

        log::info!(
            "[listener] SIP listening on {} (tcp) / {} (udp)",
            tcp_addr,
            udp_addr
        );

        Ok(Self {
            shared,
            deliveries: tokio::sync::Mutex::new(rx),
            tasks: parking_lot::Mutex::new(Some(tasks)),
            tcp_addr,
            udp_addr,
        })
    }

    /// Waits for the next inbound request.
    ///
    /// Errors carrying a connection (`InvalidBranch`, `Codec`, `PeerClosed`)
    /// concern a single peer and the caller may keep accepting. `Transport`
    /// and `Closed` mean the listener is finished.
    pub async fn accept_request(&self) -> Result<Incoming, ListenerError> {
        let mut deliveries = self.deliveries.lock().await;
        let mut shutdown = self.shared.subscribe();

        loop {
            if self.shared.is_closed() {
                return Err(take_terminal_error(&mut deliveries));
            }

            let item = tokio::select! {
                biased;
                item = deliveries.recv() => item,
                _ = wait_closed(&mut shutdown) => continue,
            };
            let Some(item) = item else {
                return Err(ListenerError::Closed);
            };

            let (conn, request) = match item {
                Delivery::Failed(err) => return Err(err),
                Delivery::Request { conn, request } => (conn, request),
            };

            let Some(branch) = transaction_branch(&request) else {
                log::debug!(
                    "[listener] {} from {} has no valid branch",
                    request.method,
                    conn.peer_addr()
                );
                return Err(ListenerError::InvalidBranch {
                    request: Box::new(request),
                    conn,
                });
            };

            if !self.shared.branches.check_and_record(&branch, Instant::now()) {
                log::debug!(
                    "[listener] retransmission dropped branch={} peer={}",
                    branch,
                    conn.peer_addr()
                );
                continue;
            }

            return Ok(Incoming { request, conn });
        }
    }

    /// Stops both transports and releases their sockets.
    ///
    /// Waits for the TCP loop, then the UDP loop, and returns the first
    /// failure among them. Repeated or concurrent calls are harmless; only
    /// the first does any work.
    pub async fn close(&self) -> Result<(), ListenerError> {
        self.shared.begin_close();
        let Some(tasks) = self.tasks.lock().take() else {
            return Ok(());
        };

        let tcp = tasks.tcp.await;
        let udp = tasks.udp.await;
        let sweeper = tasks.sweeper.await;

        let mut deliveries = self.deliveries.lock().await;
        let mut drained = 0usize;
        while deliveries.try_recv().is_ok() {
            drained += 1;
        }
        if drained > 0 {
            log::debug!("[listener] discarded {} queued deliveries", drained);
        }

        tcp.and(udp).and(sweeper).map_err(ListenerError::from)
    }

    /// Effective bound address (from the TCP socket).
    pub fn local_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn udp_local_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    /// Number of distinct UDP peers seen so far.
    pub fn udp_peer_count(&self) -> usize {
        self.shared.udp_pool.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shared.begin_close();
    }
}

/// クローズ後に残っている致命的エラーを 1 度だけ返す。無ければ Closed。
fn take_terminal_error(deliveries: &mut mpsc::Receiver<Delivery>) -> ListenerError {
    while let Ok(item) = deliveries.try_recv() {
        if let Delivery::Failed(err) = item {
            if err.is_fatal() {
                return err;
            }
        }
    }
    ListenerError::Closed
}

async fn wait_closed(shutdown: &mut watch::Receiver<bool>) {
    // Sender が消えた場合も終了扱い
    let _ = shutdown.wait_for(|closed| *closed).await;
}

/// Returns `false` when the listener shut down before the item was taken.
async fn deliver(
    tx: &mpsc::Sender<Delivery>,
    shutdown: &mut watch::Receiver<bool>,
    item: Delivery,
) -> bool {
    tokio::select! {
        res = tx.send(item) => res.is_ok(),
        _ = wait_closed(shutdown) => false,
    }
}

async fn run_tcp_accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    tx: mpsc::Sender<Delivery>,
) {
    let mut shutdown = shared.subscribe();

    loop {
        let accepted = tokio::select! {
            _ = wait_closed(&mut shutdown) => break,
            res = listener.accept() => res,
        };
        match accepted {
            Ok((stream, peer)) => spawn_tcp_conn(&shared, stream, peer, tx.clone()),
            Err(e) => {
                if shared.is_closed() {
                    break;
                }
                log::error!("[sip tcp] accept failed: {}", e);
                deliver(&tx, &mut shutdown, Delivery::Failed(ListenerError::Transport(e))).await;
                break;
            }
        }
    }

    drop(listener);
    shared.begin_close();
}

fn spawn_tcp_conn(
    shared: &Arc<Shared>,
    stream: TcpStream,
    peer: SocketAddr,
    tx: mpsc::Sender<Delivery>,
) {
    let conn_id = shared.next_conn_id();
    log::info!("[sip tcp] accepted conn_id={} peer={}", conn_id, peer);

    let (reader, writer) = stream.into_split();
    let (write_tx, write_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let conn = Arc::new(Conn::from_tcp(conn_id, peer, write_tx));

    let idle_close = Arc::new(Notify::new());

    tokio::spawn(run_tcp_writer(
        conn_id,
        peer,
        writer,
        write_rx,
        shared.subscribe(),
        idle_close.clone(),
    ));
    tokio::spawn(run_tcp_reader(shared.clone(), conn, reader, tx, idle_close));
}

/// 1 接続分の受信パス。リクエストは受信順に渡す。
async fn run_tcp_reader(
    shared: Arc<Shared>,
    conn: Arc<Conn>,
    mut reader: OwnedReadHalf,
    tx: mpsc::Sender<Delivery>,
    idle_close: Arc<Notify>,
) {
    let mut shutdown = shared.subscribe();
    let idle = shared.config.tcp_idle;
    let mut frames = FrameBuffer::new(MAX_TCP_BUFFER);
    let mut tmp = vec![0u8; TCP_READ_CHUNK];

    loop {
        let read = tokio::select! {
            _ = wait_closed(&mut shutdown) => return,
            res = read_with_idle(&mut reader, &mut tmp, idle) => res,
        };

        let n = match read {
            Ok(Some(0)) => {
                log::info!(
                    "[sip tcp] conn_id={} closed by peer {}",
                    conn.id(),
                    conn.peer_addr()
                );
                let item = Delivery::Failed(ListenerError::PeerClosed { conn: conn.clone() });
                deliver(&tx, &mut shutdown, item).await;
                return;
            }
            Ok(Some(n)) => n,
            Ok(None) => {
                log::info!(
                    "[sip tcp] idle timeout conn_id={} peer={}",
                    conn.id(),
                    conn.peer_addr()
                );
                // 書き込み側も閉じてソケットごと解放する
                idle_close.notify_one();
                return;
            }
            Err(e) => {
                log::warn!("[sip tcp] conn_id={} read error: {}", conn.id(), e);
                let item = Delivery::Failed(ListenerError::PeerClosed { conn: conn.clone() });
                deliver(&tx, &mut shutdown, item).await;
                return;
            }
        };

        if let Err(source) = frames.push(&tmp[..n]) {
            log::warn!("[sip tcp] conn_id={} {}", conn.id(), source);
            let item = Delivery::Failed(ListenerError::Codec {
                conn: conn.clone(),
                source,
            });
            deliver(&tx, &mut shutdown, item).await;
            return;
        }

        while let Some(frame) = frames.next_frame() {
            log::debug!(
                "[sip <-] tcp conn_id={} peer={} len={}",
                conn.id(),
                conn.peer_addr(),
                frame.len()
            );
            let item = conn.decode(&frame);
            // 壊れたメッセージの後はフレーミングを信用できない
            let undecodable = matches!(item, Delivery::Failed(_));
            if !deliver(&tx, &mut shutdown, item).await || undecodable {
                return;
            }
        }
    }
}

/// `Ok(None)` はアイドルタイムアウト
async fn read_with_idle(
    reader: &mut OwnedReadHalf,
    buf: &mut [u8],
    idle: Option<Duration>,
) -> std::io::Result<Option<usize>> {
    match idle {
        Some(limit) => match tokio::time::timeout(limit, reader.read(buf)).await {
            Ok(res) => res.map(Some),
            Err(_) => Ok(None),
        },
        None => reader.read(buf).await.map(Some),
    }
}

/// Conn::flush で積まれたバイト列をソケットへ書き出す
async fn run_tcp_writer(
    conn_id: ConnId,
    peer: SocketAddr,
    mut writer: OwnedWriteHalf,
    mut write_rx: UnboundedReceiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
    idle_close: Arc<Notify>,
) {
    loop {
        let payload = tokio::select! {
            _ = wait_closed(&mut shutdown) => break,
            _ = idle_close.notified() => break,
            payload = write_rx.recv() => payload,
        };
        let Some(payload) = payload else {
            break;
        };
        if let Err(e) = writer.write_all(&payload).await {
            log::warn!("[sip tcp] conn_id={} peer={} write error: {}", conn_id, peer, e);
            break;
        }
    }
    // 以降の Conn::flush は NotConnected
    drop(write_rx);
    let _ = writer.shutdown().await;
}

async fn run_udp_loop(shared: Arc<Shared>, sock: Arc<UdpSocket>, tx: mpsc::Sender<Delivery>) {
    let mut shutdown = shared.subscribe();

    loop {
        // データグラムごとに新しいバッファ
        let mut data = vec![0u8; MAX_DATAGRAM];
        let received = tokio::select! {
            _ = wait_closed(&mut shutdown) => break,
            res = sock.recv_from(&mut data) => res,
        };

        match received {
            Ok((len, src)) => {
                data.truncate(len);
                if is_keepalive(&data) {
                    log::trace!("[sip udp] keep-alive from {}", src);
                    continue;
                }
                log::debug!("[sip <-] udp peer={} len={}", src, len);
                // 1 データグラム = 1 リクエスト
                let conn = shared.udp_pool.get_or_create(src);
                if !deliver(&tx, &mut shutdown, conn.decode(&data)).await {
                    break;
                }
            }
            Err(e) => {
                if shared.is_closed() {
                    break;
                }
                log::error!("[sip udp] receive failed: {}", e);
                deliver(&tx, &mut shutdown, Delivery::Failed(ListenerError::Transport(e))).await;
                break;
            }
        }
    }

    // ここで最後の強参照が落ち、UDP ソケットが閉じる
    drop(sock);
    shared.begin_close();
}

/// RFC 5626 の CRLF keep-alive (空行だけのデータグラム)
fn is_keepalive(data: &[u8]) -> bool {
    data.iter().all(|b| matches!(b, b'\r' | b'\n'))
}

async fn run_branch_sweeper(shared: Arc<Shared>) {
    let mut shutdown = shared.subscribe();
    let period = shared
        .config
        .branch_sweep_interval
        .max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = wait_closed(&mut shutdown) => break,
            _ = ticker.tick() => {}
        }
        if shared.is_closed() {
            break;
        }
        let removed = shared.branches.sweep(Instant::now());
        if removed > 0 {
            log::debug!(
                "[listener] swept {} branches older than {:?}, {} remain",
                removed,
                shared.branches.retention(),
                shared.branches.len()
            );
        }
    }
}
