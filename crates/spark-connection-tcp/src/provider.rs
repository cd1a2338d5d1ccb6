use serde::Deserialize;
use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str::FromStr,
    sync::Arc,
};
use thiserror::Error;

use crate::{config::TcpConnectionConfig, connection::TcpConnection, contract::Connection};

/// 工厂路径使用的固定端口。
pub const DEFAULT_PORT: u16 = 80;

const TEST_DC_OFFSET: i32 = 10_000;

/// 目标数据中心：生产环境 `1..=5`，测试环境 `1-test..=3-test`。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataCenter {
    Production(u8),
    Test(u8),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown data center `{0}`")]
pub struct ParseDataCenterError(String);

/// 数据中心的公开地址。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DcAddresses {
    pub ipv4: Ipv4Addr,
    pub ipv6: Ipv6Addr,
}

impl DataCenter {
    pub fn production(id: u8) -> Option<Self> {
        (1..=5).contains(&id).then_some(Self::Production(id))
    }

    pub fn test(id: u8) -> Option<Self> {
        (1..=3).contains(&id).then_some(Self::Test(id))
    }

    pub fn number(self) -> u8 {
        match self {
            Self::Production(id) | Self::Test(id) => id,
        }
    }

    pub fn is_test(self) -> bool {
        matches!(self, Self::Test(_))
    }

    pub fn addresses(self) -> DcAddresses {
        let (ipv4, ipv6): ([u8; 4], [u16; 8]) = match self {
            Self::Production(1) => (
                [149, 154, 175, 53],
                [0x2001, 0x0b28, 0xf23d, 0xf001, 0, 0, 0, 0xa],
            ),
            Self::Production(2) => (
                [149, 154, 167, 51],
                [0x2001, 0x067c, 0x04e8, 0xf002, 0, 0, 0, 0xa],
            ),
            Self::Production(3) => (
                [149, 154, 175, 100],
                [0x2001, 0x0b28, 0xf23d, 0xf003, 0, 0, 0, 0xa],
            ),
            Self::Production(4) => (
                [149, 154, 167, 91],
                [0x2001, 0x067c, 0x04e8, 0xf004, 0, 0, 0, 0xa],
            ),
            Self::Production(_) => (
                [91, 108, 56, 130],
                [0x2001, 0x0b28, 0xf23f, 0xf005, 0, 0, 0, 0xa],
            ),
            Self::Test(1) => (
                [149, 154, 175, 10],
                [0x2001, 0x0b28, 0xf23d, 0xf001, 0, 0, 0, 0xe],
            ),
            Self::Test(2) => (
                [149, 154, 167, 40],
                [0x2001, 0x067c, 0x04e8, 0xf002, 0, 0, 0, 0xe],
            ),
            Self::Test(_) => (
                [149, 154, 175, 117],
                [0x2001, 0x0b28, 0xf23d, 0xf003, 0, 0, 0, 0xe],
            ),
        };
        DcAddresses {
            ipv4: Ipv4Addr::from(ipv4),
            ipv6: Ipv6Addr::from(ipv6),
        }
    }

    /// 按地址族选择目标地址。
    pub fn address(self, ipv6: bool) -> IpAddr {
        let addresses = self.addresses();
        if ipv6 {
            IpAddr::V6(addresses.ipv6)
        } else {
            IpAddr::V4(addresses.ipv4)
        }
    }

    /// 解析后的端点编号：测试环境加 `10000`，CDN 取负。
    pub fn endpoint_id(self, cdn: bool) -> i32 {
        let id = i32::from(self.number()) + if self.is_test() { TEST_DC_OFFSET } else { 0 };
        if cdn { -id } else { id }
    }
}

impl FromStr for DataCenter {
    type Err = ParseDataCenterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = match s.strip_suffix("-test") {
            Some(number) => number.parse().ok().and_then(Self::test),
            None => s.parse().ok().and_then(Self::production),
        };
        parsed.ok_or_else(|| ParseDataCenterError(s.to_owned()))
    }
}

impl fmt::Display for DataCenter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Production(id) => write!(f, "{id}"),
            Self::Test(id) => write!(f, "{id}-test"),
        }
    }
}

/// 工厂参数。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderParams {
    /// 选择 IPv6 地址而非 IPv4。
    pub ipv6: bool,
    /// 交给帧层的混淆开关。
    pub obfuscated: bool,
}

/// 帧层包装器的接入点，由外部协议库实现。
pub trait FramingFactory: Send + Sync {
    type Transport;

    fn wrap(&self, connection: Arc<dyn Connection>, obfuscated: bool) -> Self::Transport;
}

impl<F, T> FramingFactory for F
where
    F: Fn(Arc<dyn Connection>, bool) -> T + Send + Sync,
{
    type Transport = T;

    fn wrap(&self, connection: Arc<dyn Connection>, obfuscated: bool) -> T {
        self(connection, obfuscated)
    }
}

/// 工厂产物：原始连接、帧层包装与端点编号。
pub struct TransportDescriptor<T> {
    pub connection: Arc<TcpConnection>,
    pub transport: T,
    pub dc_id: i32,
}

impl<T> fmt::Debug for TransportDescriptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportDescriptor")
            .field("connection", &self.connection)
            .field("dc_id", &self.dc_id)
            .finish_non_exhaustive()
    }
}

/// TCP 传输工厂。
///
/// # 教案式注释
///
/// ## 逻辑 (How)
/// - 按 `ipv6` 参数选取数据中心地址，固定端口 [`DEFAULT_PORT`]；
/// - 构造未打开的 [`TcpConnection`]，交由 [`FramingFactory`] 包装；
/// - 工厂本身不做缓冲或并发控制，`open` 由帧层决定时机。
pub struct TcpTransportProvider<F> {
    params: ProviderParams,
    connection_config: TcpConnectionConfig,
    framing: F,
}

impl<F: FramingFactory> TcpTransportProvider<F> {
    pub fn new(params: ProviderParams, framing: F) -> Self {
        Self {
            params,
            connection_config: TcpConnectionConfig::default(),
            framing,
        }
    }

    pub fn with_connection_config(mut self, config: TcpConnectionConfig) -> Self {
        self.connection_config = config;
        self
    }

    pub fn params(&self) -> ProviderParams {
        self.params
    }

    pub fn provide(&self, dc: DataCenter, cdn: bool) -> TransportDescriptor<F::Transport> {
        let address = dc.address(self.params.ipv6);
        let connection = Arc::new(TcpConnection::with_config(
            address.to_string(),
            DEFAULT_PORT,
            self.connection_config.clone(),
        ));
        tracing::debug!(dc = %dc, cdn, %address, "tcp transport provided");
        let transport = self
            .framing
            .wrap(Arc::clone(&connection) as Arc<dyn Connection>, self.params.obfuscated);
        TransportDescriptor {
            connection,
            transport,
            dc_id: dc.endpoint_id(cdn),
        }
    }
}
