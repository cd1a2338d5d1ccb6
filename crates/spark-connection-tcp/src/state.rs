use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::error::{ConnectionError, Result};

/// 连接的生命周期状态。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        })
    }
}

/// 状态变更通知：握手成功时以 `true` 调用，任意关闭（本地或远端）时以 `false` 调用。
///
/// 回调在入站泵任务或 `open` 的调用方上同步执行，实现应保持轻量且不可阻塞。
pub type StateChangeHandler = Arc<dyn Fn(bool) + Send + Sync + 'static>;

/// 状态机与通知回调的组合。
///
/// # 教案式注释
///
/// ## 逻辑 (How)
/// - `begin_open`：仅允许 `Disconnected → Connecting`，其余情况返回
///   [`ConnectionError::AlreadyOpen`]，从而保证同一实例任意时刻至多拥有一个套接字；
/// - `mark_connected`/`mark_disconnected` 只负责迁移，通知由调用方在锁外触发；
/// - 回调以 `Arc` 克隆出锁后再调用，回调内部重入 `state()` 不会死锁。
#[derive(Default)]
pub(crate) struct StateMachine {
    state: Mutex<ConnectionState>,
    handler: Mutex<Option<StateChangeHandler>>,
}

impl StateMachine {
    pub(crate) fn current(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub(crate) fn begin_open(&self) -> Result<()> {
        let mut state = lock(&self.state);
        match *state {
            ConnectionState::Disconnected => {
                *state = ConnectionState::Connecting;
                Ok(())
            }
            ConnectionState::Connecting | ConnectionState::Connected => {
                Err(ConnectionError::AlreadyOpen)
            }
        }
    }

    pub(crate) fn mark_connected(&self) {
        *lock(&self.state) = ConnectionState::Connected;
    }

    pub(crate) fn mark_disconnected(&self) {
        *lock(&self.state) = ConnectionState::Disconnected;
    }

    pub(crate) fn set_handler(&self, handler: Option<StateChangeHandler>) {
        *lock(&self.handler) = handler;
    }

    pub(crate) fn notify(&self, connected: bool) {
        let handler = lock(&self.handler).clone();
        if let Some(handler) = handler {
            handler(connected);
        }
    }
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("state", &self.current())
            .field("has_handler", &lock(&self.handler).is_some())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
