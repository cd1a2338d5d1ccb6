use arc_swap::ArcSwapOption;
use std::{
    fmt, io,
    net::SocketAddr,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::{net::TcpStream as TokioTcpStream, sync::Mutex as AsyncMutex, task::JoinHandle};

use crate::{
    config::TcpConnectionConfig,
    error::{CLOSE, ConnectionError, OperationKind, READ, Result, WRITE},
    inbound::{InboundBuffer, ReadOutcome},
    socket::{CloseCause, SocketHandle},
    state::{ConnectionState, StateChangeHandler, StateMachine},
};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// 面向帧层的 TCP 字节流连接。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 底层套接字以事件驱动方式分块交付数据，而帧层期望“读满 N 字节再返回”的
///   阻塞式契约；`TcpConnection` 负责在不阻塞线程的前提下弥合两者；
/// - 读与写互不阻塞，保持全双工；连接丢失时，任何挂起中的读都会被立即拒绝。
///
/// ## 逻辑 (How)
/// - **生命周期**：`open` 建立套接字后为其创建独立的会话（套接字句柄 + 入站缓冲），
///   并派生唯一的入站泵任务；泵任务承担“数据到达”和“关闭通知”两个处理器，
///   每个套接字实例恰好一组；
/// - **读仲裁**：`read` 持有读锁，缓冲足够时立即切出，否则登记唯一的挂起请求，
///   由入站泵满足或由关闭路径拒绝；
/// - **写串行化**：`write` 持有写锁，直到内核接收全部字节；
/// - 读锁与写锁相互独立，二者均在获取前后各检查一次 `connected`，
///   以关闭检查与加锁之间的竞态窗口。
///
/// ## 契约 (What)
/// - `open`：仅在 `Disconnected` 状态下允许；成功后状态为 `Connected`，并以 `true`
///   调用状态回调；握手失败返回 [`ConnectionError::Connect`] 等 `open` 类错误；
/// - `close`：同步触发强制关闭，清理（拒绝挂起读、以 `false` 调用回调）在入站泵中异步完成；
/// - `read`：恰好填满 `buf` 或返回错误，从不短读；
/// - `write`：全部字节被内核接受后返回；
/// - 未打开或已关闭时，`read`/`write`/`close` 均返回 [`ConnectionError::NotOpen`]。
///
/// ## 注意事项 (Trade-offs)
/// - 读写不提供内建超时；调用方可在外层叠加 `tokio::time::timeout`，
///   被取消的 `read` 不会丢失或重排任何字节；
/// - 关闭后残留在缓冲区中的未读字节随会话一并丢弃；重新 `open` 得到全新的字节流。
pub struct TcpConnection {
    shared: Arc<Shared>,
    read_lock: AsyncMutex<()>,
    write_lock: AsyncMutex<()>,
}

struct Shared {
    id: u64,
    hostname: String,
    port: u16,
    config: TcpConnectionConfig,
    session: ArcSwapOption<Session>,
    state: StateMachine,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// 单个套接字实例及其专属的入站缓冲。
#[derive(Debug)]
struct Session {
    socket: SocketHandle,
    inbound: InboundBuffer,
}

impl TcpConnection {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self::with_config(hostname, port, TcpConnectionConfig::default())
    }

    pub fn with_config(
        hostname: impl Into<String>,
        port: u16,
        config: TcpConnectionConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                hostname: hostname.into(),
                port,
                config,
                session: ArcSwapOption::empty(),
                state: StateMachine::default(),
                pump: Mutex::new(None),
            }),
            read_lock: AsyncMutex::new(()),
            write_lock: AsyncMutex::new(()),
        }
    }

    /// 进程内唯一的连接编号，用于日志字段。
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn hostname(&self) -> &str {
        &self.shared.hostname
    }

    pub fn port(&self) -> u16 {
        self.shared.port
    }

    pub fn config(&self) -> &TcpConnectionConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.current()
    }

    /// 安装或替换状态变更回调；传入 `None` 移除回调。
    pub fn set_state_change_handler(&self, handler: Option<StateChangeHandler>) {
        self.shared.state.set_handler(handler);
    }

    /// 套接字存在且传输层仍处于就绪状态。
    pub fn connected(&self) -> bool {
        self.shared
            .session
            .load_full()
            .is_some_and(|session| session.socket.is_open())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.live_session(READ).ok().map(|s| s.socket.local_addr())
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.live_session(READ).ok().map(|s| s.socket.peer_addr())
    }

    /// 建立到配置地址的连接。
    ///
    /// 上一个套接字的关闭通知完成后才开始握手，因此回调总是先收到旧套接字的
    /// `false` 再收到新套接字的 `true`。若返回的 Future 在握手完成前被丢弃，
    /// 状态回到 `Disconnected`。
    pub async fn open(&self) -> Result<()> {
        let shared = &self.shared;
        shared.state.begin_open()?;
        let mut opening = OpeningGuard {
            state: &shared.state,
            armed: true,
        };

        if let Some(previous) = shared.take_pump() {
            let _ = previous.await;
        }

        tracing::debug!(
            connection = shared.id,
            target = %shared.target(),
            "tcp connection opening"
        );
        let stream = match self.establish().await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(connection = shared.id, error = %err, "tcp handshake failed");
                return Err(err);
            }
        };
        shared
            .config
            .apply(&stream)
            .map_err(|source| ConnectionError::Configure { source })?;
        let socket =
            SocketHandle::new(stream).map_err(|source| ConnectionError::Configure { source })?;

        let inbound = InboundBuffer::new();
        inbound.reopen();
        let session = Arc::new(Session { socket, inbound });
        shared.session.store(Some(Arc::clone(&session)));
        shared.state.mark_connected();
        opening.armed = false;

        tracing::info!(
            connection = shared.id,
            local = %session.socket.local_addr(),
            peer = %session.socket.peer_addr(),
            "tcp connection established"
        );
        shared.state.notify(true);
        let handle = tokio::spawn(pump(Arc::clone(shared), session));
        *shared.pump.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// 强制关闭当前套接字。
    pub fn close(&self) -> Result<()> {
        let session = self.live_session(CLOSE)?;
        self.shared.detach(&session);
        session.socket.force_close(CloseCause::Local);
        tracing::debug!(connection = self.shared.id, "tcp connection closed locally");
        Ok(())
    }

    /// 读取恰好 `buf.len()` 字节。
    pub async fn read(&self, buf: &mut [u8]) -> Result<()> {
        self.live_session(READ)?;
        let _read_guard = self.read_lock.lock().await;
        let session = self.live_session(READ)?;

        let bytes = match session.inbound.take_or_register(buf.len())? {
            ReadOutcome::Ready(bytes) => bytes,
            ReadOutcome::Pending(pending) => {
                tracing::trace!(
                    connection = self.shared.id,
                    wanted = buf.len(),
                    "tcp read suspended"
                );
                pending.wait().await?
            }
        };
        buf.copy_from_slice(&bytes);
        Ok(())
    }

    /// 写入全部字节，等待内核接受后返回。
    pub async fn write(&self, buf: &[u8]) -> Result<()> {
        self.live_session(WRITE)?;
        let _write_guard = self.write_lock.lock().await;
        let session = self.live_session(WRITE)?;

        let failure = tokio::select! {
            biased;
            _ = session.socket.closed() => None,
            result = session.socket.write_all(buf) => match result {
                Ok(()) => return Ok(()),
                Err(err) => Some(err),
            },
        };
        Err(self.write_failure(&session, failure))
    }

    /// 本地关闭打断的写返回 `NotOpen`；其余情况原样透传传输层错误，
    /// 写本身未报错时取入站泵记录的关闭原因。
    fn write_failure(&self, session: &Session, failure: Option<io::Error>) -> ConnectionError {
        let cause = session.socket.close_cause();
        if cause == Some(CloseCause::Local) {
            return ConnectionError::not_open(WRITE);
        }
        let source = failure
            .or_else(|| cause.and_then(CloseCause::interrupted_error))
            .unwrap_or_else(|| io::Error::from(io::ErrorKind::NotConnected));
        tracing::warn!(connection = self.shared.id, error = %source, "tcp write failed");
        ConnectionError::transport(WRITE, source)
    }

    fn live_session(&self, operation: OperationKind) -> Result<Arc<Session>> {
        match self.shared.session.load_full() {
            Some(session) if session.socket.is_open() => Ok(session),
            _ => Err(ConnectionError::not_open(operation)),
        }
    }

    async fn establish(&self) -> Result<TokioTcpStream> {
        let shared = &self.shared;
        let connect = connect_any(&shared.hostname, shared.port);
        match shared.config.connect_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| ConnectionError::ConnectTimeout {
                    addr: shared.target(),
                    timeout,
                })?,
            None => connect.await,
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        if let Some(session) = self.shared.session.swap(None) {
            session.socket.force_close(CloseCause::Local);
        }
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("id", &self.shared.id)
            .field("target", &self.shared.target())
            .field("state", &self.shared.state.current())
            .field("connected", &self.connected())
            .finish()
    }
}

impl Shared {
    fn target(&self) -> String {
        if self.hostname.contains(':') {
            format!("[{}]:{}", self.hostname, self.port)
        } else {
            format!("{}:{}", self.hostname, self.port)
        }
    }

    fn take_pump(&self) -> Option<JoinHandle<()>> {
        self.pump.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// 若 `session` 仍是当前会话则将其摘除并迁移到 `Disconnected`。
    fn detach(&self, session: &Arc<Session>) -> bool {
        let previous = self.session.rcu(|current| match current {
            Some(current) if Arc::ptr_eq(current, session) => None,
            other => other.clone(),
        });
        let detached = previous
            .as_ref()
            .is_some_and(|previous| Arc::ptr_eq(previous, session));
        if detached {
            self.state.mark_disconnected();
        }
        detached
    }

    /// 关闭通知路径：每个会话恰好执行一次。
    fn on_session_closed(&self, session: &Arc<Session>, reason: CloseReason) {
        match &reason {
            CloseReason::Local => {}
            CloseReason::PeerClosed => {
                tracing::info!(connection = self.id, "tcp connection closed by peer");
            }
            CloseReason::Failed(err) => {
                tracing::warn!(connection = self.id, error = %err, "tcp connection failed");
            }
        }
        session.socket.force_close(reason.cause());
        if session.inbound.close() {
            tracing::debug!(connection = self.id, "pending tcp read rejected");
        }
        self.detach(session);
        self.state.notify(false);
    }
}

enum CloseReason {
    Local,
    PeerClosed,
    Failed(io::Error),
}

impl CloseReason {
    fn cause(&self) -> CloseCause {
        match self {
            Self::Local => CloseCause::Local,
            Self::PeerClosed => CloseCause::PeerClosed,
            Self::Failed(err) => CloseCause::Failed(err.kind()),
        }
    }
}

/// 入站泵：把每块到达的数据交给读仲裁器，套接字结束时执行一次关闭通知。
async fn pump(shared: Arc<Shared>, session: Arc<Session>) {
    let mut chunk = vec![0u8; shared.config.read_chunk_size()];
    let reason = loop {
        tokio::select! {
            biased;
            _ = session.socket.closed() => break CloseReason::Local,
            result = session.socket.read_chunk(&mut chunk) => match result {
                Ok(0) => break CloseReason::PeerClosed,
                Ok(read) => {
                    let satisfied = session.inbound.on_data(&chunk[..read]);
                    tracing::trace!(
                        connection = shared.id,
                        bytes = read,
                        satisfied,
                        "tcp data arrived"
                    );
                }
                Err(err) => break CloseReason::Failed(err),
            },
        }
    };
    shared.on_session_closed(&session, reason);
}

async fn connect_any(hostname: &str, port: u16) -> Result<TokioTcpStream> {
    let resolve_error = |source| ConnectionError::Resolve {
        host: hostname.to_owned(),
        source,
    };
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((hostname, port))
        .await
        .map_err(resolve_error)?
        .collect();
    if addrs.is_empty() {
        return Err(resolve_error(io::Error::new(
            io::ErrorKind::NotFound,
            "no address resolved",
        )));
    }

    let mut last_error = None;
    for addr in &addrs {
        match TokioTcpStream::connect(*addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                tracing::debug!(addr = %addr, error = %err, "tcp connect attempt failed");
                last_error = Some((*addr, err));
            }
        }
    }
    let (addr, source) = match last_error {
        Some(failure) => failure,
        None => (addrs[0], io::Error::from(io::ErrorKind::NotConnected)),
    };
    Err(ConnectionError::Connect {
        addr: addr.to_string(),
        source,
    })
}

struct OpeningGuard<'a> {
    state: &'a StateMachine,
    armed: bool,
}

impl Drop for OpeningGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.mark_disconnected();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tracing_test::traced_test;

    async fn accept_open(connection: &TcpConnection, listener: &TcpListener) -> TokioTcpStream {
        let (opened, accepted) = tokio::join!(connection.open(), listener.accept());
        opened.expect("open connection");
        accepted.expect("accept connection").0
    }

    #[tokio::test]
    #[traced_test]
    async fn lifecycle_is_logged() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
        let port = listener.local_addr().expect("listener addr").port();
        let connection = TcpConnection::new("127.0.0.1", port);

        let _peer = accept_open(&connection, &listener).await;
        assert!(logs_contain("tcp connection opening"));
        assert!(logs_contain("tcp connection established"));

        connection.close().expect("close");
        assert!(logs_contain("tcp connection closed locally"));
    }

    #[test]
    fn target_brackets_ipv6_literals() {
        let v6 = TcpConnection::new("2001:b28:f23d:f001::a", 80);
        assert_eq!(v6.shared.target(), "[2001:b28:f23d:f001::a]:80");
        let v4 = TcpConnection::new("149.154.167.51", 80);
        assert_eq!(v4.shared.target(), "149.154.167.51:80");
        assert_ne!(v4.id(), v6.id());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dropping_an_open_connection_reports_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
        let port = listener.local_addr().expect("listener addr").port();
        let connection = TcpConnection::new("127.0.0.1", port);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        connection.set_state_change_handler(Some(Arc::new(move |connected| {
            sink.lock().expect("events").push(connected);
        })));

        let _peer = accept_open(&connection, &listener).await;
        drop(connection);

        tokio::time::timeout(Duration::from_secs(5), async {
            while events.lock().expect("events").len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("closure path should run after drop");
        assert_eq!(*events.lock().expect("events"), [true, false]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn inbound_reset_is_recorded_as_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
        let port = listener.local_addr().expect("listener addr").port();
        let connection = TcpConnection::new("127.0.0.1", port);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        connection.set_state_change_handler(Some(Arc::new(move |connected| {
            sink.lock().expect("events").push(connected);
        })));

        let peer = accept_open(&connection, &listener).await;
        let session = connection.shared.session.load_full().expect("live session");
        socket2::SockRef::from(&peer)
            .set_linger(Some(Duration::ZERO))
            .expect("zero linger on peer");
        drop(peer);

        tokio::time::timeout(Duration::from_secs(5), async {
            while events.lock().expect("events").len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("reset should run the closure path");
        assert_eq!(*events.lock().expect("events"), [true, false]);
        assert!(
            matches!(session.socket.close_cause(), Some(CloseCause::Failed(_))),
            "got {:?}",
            session.socket.close_cause()
        );
        assert!(session.inbound.take_or_register(1).is_err());

        let err = connection.write(b"x").await.expect_err("write after reset");
        assert!(err.is_not_open());
    }

    #[tokio::test]
    async fn abandoned_open_returns_to_disconnected() {
        let connection = TcpConnection::with_config(
            "10.255.255.1",
            80,
            TcpConnectionConfig::new().with_connect_timeout(Some(Duration::from_secs(30))),
        );
        let _ = tokio::time::timeout(Duration::from_millis(20), connection.open()).await;
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }
}
