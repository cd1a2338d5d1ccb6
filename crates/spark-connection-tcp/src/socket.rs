use socket2::SockRef;
use std::{
    io,
    net::{Shutdown as StdShutdown, SocketAddr},
    sync::{
        OnceLock,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::{net::TcpStream as TokioTcpStream, sync::Notify};

/// 连接独占的套接字句柄。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 入站泵与写路径需要同时访问同一条 `TcpStream`；借助 `readable`/`try_read`
///   与 `writable`/`try_write` 两组 `&self` 接口，读写两侧无需共享一把互斥锁，
///   从而保留全双工；
/// - `open` 标志即“传输层就绪状态”，`connected` 查询据此判断。
///
/// ## 逻辑 (How)
/// - `force_close`：先记录首个关闭原因，再原子地清除 `open`，以 `socket2` 双向关闭
///   套接字并唤醒所有等待 `closed` 的任务（入站泵与进行中的写）；
/// - 关闭原因只记录一次，写路径据此区分本地关闭与对端或传输层导致的关闭；
/// - `SO_LINGER` 为零时，最终释放句柄会发送 RST。
///
/// ## 注意事项 (Trade-offs)
/// - `force_close` 不保证发送缓冲被排空，这与关闭语义一致。
#[derive(Debug)]
pub(crate) struct SocketHandle {
    stream: TokioTcpStream,
    open: AtomicBool,
    cause: OnceLock<CloseCause>,
    shutdown: Notify,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl SocketHandle {
    pub(crate) fn new(stream: TokioTcpStream) -> io::Result<Self> {
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        Ok(Self {
            stream,
            open: AtomicBool::new(true),
            cause: OnceLock::new(),
            shutdown: Notify::new(),
            local_addr,
            peer_addr,
        })
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// 首次关闭时记录的原因；句柄仍打开时为 `None`。
    pub(crate) fn close_cause(&self) -> Option<CloseCause> {
        self.cause.get().copied()
    }

    /// 强制关闭：双向关闭套接字并唤醒等待者，仅首次调用返回 `true`。
    pub(crate) fn force_close(&self, cause: CloseCause) -> bool {
        let _ = self.cause.set(cause);
        let first = self.open.swap(false, Ordering::AcqRel);
        if first
            && let Err(err) = SockRef::from(&self.stream).shutdown(StdShutdown::Both)
            && err.kind() != io::ErrorKind::NotConnected
        {
            tracing::debug!(peer = %self.peer_addr, error = %err, "tcp shutdown failed");
        }
        self.shutdown.notify_waiters();
        first
    }

    /// 等待句柄被关闭。
    pub(crate) async fn closed(&self) {
        let notified = self.shutdown.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if !self.is_open() {
            return;
        }
        notified.await;
    }

    /// 读取一块数据；返回 `0` 表示对端已关闭写半部。
    pub(crate) async fn read_chunk(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            self.stream.readable().await?;
            match self.stream.try_read(buf) {
                Ok(read) => return Ok(read),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// 将 `buf` 全部交给内核发送缓冲后返回。
    pub(crate) async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut remaining = buf;
        while !remaining.is_empty() {
            self.stream.writable().await?;
            match self.stream.try_write(remaining) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(written) => remaining = &remaining[written..],
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

/// 套接字结束的原因。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CloseCause {
    /// `close` 或连接被丢弃。
    Local,
    /// 对端发送 EOF。
    PeerClosed,
    /// 入站读取返回错误。
    Failed(io::ErrorKind),
}

impl CloseCause {
    /// 非本地关闭时，为被中断的写构造对应的传输层错误。
    pub(crate) fn interrupted_error(self) -> Option<io::Error> {
        match self {
            Self::Local => None,
            Self::PeerClosed => Some(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection closed by peer",
            )),
            Self::Failed(kind) => Some(io::Error::from(kind)),
        }
    }
}
