#![doc = r#"
# spark-connection-tcp

## 设计动机（Why）
- **定位**：为上层帧层（如 Abridged 传输）提供一条有序、字节精确、全双工的 TCP
  连接抽象，对外暴露“读满 N 字节才返回”“写入被确认才返回”的挂起式契约。
- **架构角色**：位于套接字与帧层之间，只负责字节流；不解释报文边界，不做加密或
  混淆，不维护连接池，也不自动重连。
- **设计理念**：事件驱动的数据来源与阻塞式消费契约之间由显式的挂起请求槽位衔接，
  每个字节按到达顺序恰好交付一次。

## 核心契约（What）
- [`TcpConnection::open`]：建立连接，成功后以 `true` 触发状态回调；
- [`TcpConnection::read`]：恰好填满缓冲区，否则失败，不存在短读；
- [`TcpConnection::write`]：全部字节被内核接受后返回，写入按调用顺序串行；
- [`TcpConnection::close`]：同步触发强制关闭，挂起中的读以
  [`ConnectionError::NotOpen`] 失败，并以 `false` 触发状态回调；
- [`TcpConnection::connected`]：套接字存在且仍就绪；
- [`Connection`]：以上动作的 trait 形式，帧层通过 `Arc<dyn Connection>` 消费；
- [`TcpTransportProvider`]：按数据中心选址、构造连接并交给帧层包装的工厂。

## 实现策略（How）
- **执行框架**：Tokio。每个套接字实例派生一个入站泵任务，承担“数据到达”与
  “关闭通知”两个处理器；
- **并发控制**：读锁与写锁相互独立，均为 `tokio::sync::Mutex`；入站缓冲、挂起请求槽位
  与关闭标志共用一把不跨 `.await` 持有的 `std::sync::Mutex`；
- **可观测性**：关键生命周期事件通过 `tracing` 输出，字段包含连接编号与对端地址。

## 风险与考量（Trade-offs）
- 读写不提供内建超时，调用方可叠加 `tokio::time::timeout`；取消的读不会丢失或重排字节；
- 任何 `open`/`read`/`write` 失败对该连接实例都是终态，恢复需重新 `open`。
"#]

mod config;
mod connection;
mod contract;
mod error;
mod inbound;
mod provider;
mod socket;
mod state;

pub use config::TcpConnectionConfig;
pub use connection::TcpConnection;
pub use contract::Connection;
pub use error::{
    CLOSE, ConnectionError, ErrorCategory, OPEN, OperationKind, READ, Result, WRITE,
};
pub use provider::{
    DEFAULT_PORT, DataCenter, DcAddresses, FramingFactory, ParseDataCenterError, ProviderParams,
    TcpTransportProvider, TransportDescriptor,
};
pub use state::{ConnectionState, StateChangeHandler};
