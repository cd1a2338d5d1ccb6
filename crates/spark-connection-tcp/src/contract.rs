use async_trait::async_trait;

use crate::{
    connection::TcpConnection,
    error::Result,
    state::StateChangeHandler,
};

/// 帧层消费的字节流连接契约。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 帧层（如 Abridged 传输）只关心“打开、读满、写完、关闭、是否连通”五个动作，
///   通过 trait object (`Arc<dyn Connection>`) 接入，无需了解 Tokio 具体类型；
/// - 便于在测试中以内存实现替换真实套接字。
///
/// ## 契约说明（What）
/// - `read`：恰好填满 `buf`，否则返回错误；不存在短读；
/// - `write`：全部字节被传输层确认后返回；
/// - `close`：同步触发，清理与 `false` 通知异步完成；
/// - `set_state_change_handler`：握手成功以 `true`、任意关闭以 `false` 调用回调。
///
/// ## 风险提示（Trade-offs）
/// - 宏 [`async_trait`] 为每次调用装箱 Future，帧层每个报文两次调用，开销可忽略。
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    async fn open(&self) -> Result<()>;

    fn close(&self) -> Result<()>;

    async fn read(&self, buf: &mut [u8]) -> Result<()>;

    async fn write(&self, buf: &[u8]) -> Result<()>;

    fn connected(&self) -> bool;

    fn set_state_change_handler(&self, handler: Option<StateChangeHandler>);
}

#[async_trait]
impl Connection for TcpConnection {
    async fn open(&self) -> Result<()> {
        TcpConnection::open(self).await
    }

    fn close(&self) -> Result<()> {
        TcpConnection::close(self)
    }

    async fn read(&self, buf: &mut [u8]) -> Result<()> {
        TcpConnection::read(self, buf).await
    }

    async fn write(&self, buf: &[u8]) -> Result<()> {
        TcpConnection::write(self, buf).await
    }

    fn connected(&self) -> bool {
        TcpConnection::connected(self)
    }

    fn set_state_change_handler(&self, handler: Option<StateChangeHandler>) {
        TcpConnection::set_state_change_handler(self, handler)
    }
}
