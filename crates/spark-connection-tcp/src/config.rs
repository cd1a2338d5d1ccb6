use serde::{Deserialize, Deserializer};
use socket2::SockRef;
use std::{io, time::Duration};
use tokio::net::TcpStream as TokioTcpStream;

const DEFAULT_READ_CHUNK_SIZE: usize = 16 * 1024;

/// 单条 TCP 连接的套接字选项与运行参数。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 将 `SO_LINGER`、`TCP_NODELAY` 等内核行为显式配置化，避免帧层直接操作 `socket2`；
/// - 为握手阶段提供可选的超时上限，读写路径仍保持“无内建超时”的契约。
///
/// ## 核心逻辑（How）
/// - `linger`：握手成功后通过 `socket2::SockRef::set_linger` 落地；`Some(Duration::ZERO)`
///   使 `close` 以 RST 结束连接；
/// - `nodelay`：默认开启，帧层通常一次写入一个完整报文，不需要 Nagle 合并；
/// - `read_chunk_size`：入站泵单次从套接字读取的最大字节数，即一次“数据到达”通知的上限。
///
/// ## 契约说明（What）
/// - 支持 `serde` 反序列化，时长字段以毫秒表示（`linger_ms`、`connect_timeout_ms`），
///   缺省字段回落到 [`TcpConnectionConfig::default`]；
/// - **后置条件**：`apply` 返回 `Ok(())` 时选项均已写入套接字。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TcpConnectionConfig {
    #[serde(rename = "linger_ms", deserialize_with = "millis_opt")]
    linger: Option<Duration>,
    nodelay: bool,
    #[serde(rename = "connect_timeout_ms", deserialize_with = "millis_opt")]
    connect_timeout: Option<Duration>,
    read_chunk_size: usize,
}

impl Default for TcpConnectionConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpConnectionConfig {
    pub const fn new() -> Self {
        Self {
            linger: None,
            nodelay: true,
            connect_timeout: None,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }

    /// 设置 `SO_LINGER` 超时时长。
    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// 设置握手超时；`None` 表示等待内核自身的连接超时。
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// 设置单次套接字读取的字节上限，`0` 会被提升为 `1`。
    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size.max(1);
        self
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger
    }

    pub fn nodelay(&self) -> bool {
        self.nodelay
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    pub fn read_chunk_size(&self) -> usize {
        self.read_chunk_size.max(1)
    }

    pub(crate) fn apply(&self, stream: &TokioTcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;
        if self.linger.is_some() {
            SockRef::from(stream).set_linger(self.linger)?;
        }
        Ok(())
    }
}

fn millis_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
}
