use std::io;
use std::time::Duration;

use thiserror::Error;

/// 描述一次公开操作对应的稳定错误码与默认文案。
///
/// `code` 是该操作在传输层失败时报告的错误码。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub const OPEN: OperationKind = OperationKind {
    code: "spark.connection.tcp.open_failed",
    message: "tcp open",
};
pub const READ: OperationKind = OperationKind {
    code: "spark.connection.tcp.read_failed",
    message: "tcp read",
};
pub const WRITE: OperationKind = OperationKind {
    code: "spark.connection.tcp.write_failed",
    message: "tcp write",
};
pub const CLOSE: OperationKind = OperationKind {
    code: "spark.connection.tcp.close_failed",
    message: "tcp close",
};

const NOT_OPEN_CODE: &str = "spark.connection.tcp.not_open";

/// 错误的粗粒度分类，供上层决定是否重建连接。
///
/// 连接本身从不重试；分类仅作为调用方的建议。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// 重新构造连接并 `open` 可能成功。
    Retryable,
    /// 重试无意义（权限、参数、调用顺序错误）。
    NonRetryable,
    /// 在配置的时限内未完成。
    Timeout,
}

/// 连接适配器的错误分类。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 将“未打开”“握手失败”“传输层写失败”三类失败显式区分，上层帧层据此
///   判断当前连接实例是否已经作废；
/// - 保留底层 [`io::Error`] 作为 `source`，避免在映射过程中丢失诊断信息。
///
/// ## 契约 (What)
/// - [`ConnectionError::NotOpen`]：在无活动套接字时调用 `read`/`write`/`close`，
///   或挂起中的读请求因连接关闭被拒绝；
/// - [`ConnectionError::Connect`]/[`ConnectionError::ConnectTimeout`]/[`ConnectionError::Resolve`]：
///   `open` 在握手完成前失败；
/// - [`ConnectionError::Transport`]：写入确认阶段返回的底层错误，原样透传；
/// - 任一错误对该连接实例均视为终态，恢复需重新 `open`。
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("{}: connection not open", .operation.message)]
    NotOpen { operation: OperationKind },

    #[error("tcp open: connection already open or opening")]
    AlreadyOpen,

    #[error("tcp open: failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("tcp open: connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("tcp open: connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("tcp open: failed to configure socket: {source}")]
    Configure {
        #[source]
        source: io::Error,
    },

    #[error("{}: {source}", .operation.message)]
    Transport {
        operation: OperationKind,
        #[source]
        source: io::Error,
    },
}

impl ConnectionError {
    pub(crate) fn not_open(operation: OperationKind) -> Self {
        Self::NotOpen { operation }
    }

    pub(crate) fn transport(operation: OperationKind, source: io::Error) -> Self {
        Self::Transport { operation, source }
    }

    /// 返回稳定的机器可读错误码。
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotOpen { .. } => NOT_OPEN_CODE,
            Self::AlreadyOpen => "spark.connection.tcp.already_open",
            Self::Resolve { .. } => "spark.connection.tcp.resolve_failed",
            Self::Connect { .. } => "spark.connection.tcp.connect_failed",
            Self::ConnectTimeout { .. } => "spark.connection.tcp.connect_timeout",
            Self::Configure { .. } => "spark.connection.tcp.configure_failed",
            Self::Transport { operation, .. } => operation.code,
        }
    }

    /// 触发该错误的操作。
    pub fn operation(&self) -> OperationKind {
        match self {
            Self::NotOpen { operation } | Self::Transport { operation, .. } => *operation,
            Self::AlreadyOpen
            | Self::Resolve { .. }
            | Self::Connect { .. }
            | Self::ConnectTimeout { .. }
            | Self::Configure { .. } => OPEN,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotOpen { .. } | Self::AlreadyOpen => ErrorCategory::NonRetryable,
            Self::ConnectTimeout { .. } => ErrorCategory::Timeout,
            Self::Resolve { source, .. }
            | Self::Connect { source, .. }
            | Self::Configure { source }
            | Self::Transport { source, .. } => categorize_io_error(source),
        }
    }

    /// 是否为“连接未打开”错误。
    pub fn is_not_open(&self) -> bool {
        matches!(self, Self::NotOpen { .. })
    }
}

fn categorize_io_error(error: &io::Error) -> ErrorCategory {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::TimedOut => ErrorCategory::Timeout,
        ErrorKind::WouldBlock
        | ErrorKind::Interrupted
        | ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::AddrInUse
        | ErrorKind::AddrNotAvailable
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof
        | ErrorKind::WriteZero => ErrorCategory::Retryable,
        ErrorKind::PermissionDenied | ErrorKind::Unsupported | ErrorKind::InvalidInput => {
            ErrorCategory::NonRetryable
        }
        _ => ErrorCategory::NonRetryable,
    }
}

pub type Result<T, E = ConnectionError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_open_reports_operation_in_message() {
        let err = ConnectionError::not_open(READ);
        assert_eq!(err.to_string(), "tcp read: connection not open");
        assert_eq!(err.code(), "spark.connection.tcp.not_open");
        assert_eq!(err.operation(), READ);
        assert!(err.is_not_open());
        assert_eq!(err.category(), ErrorCategory::NonRetryable);
    }

    #[test]
    fn io_errors_map_to_categories() {
        let refused = ConnectionError::Connect {
            addr: "127.0.0.1:80".into(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert_eq!(refused.category(), ErrorCategory::Retryable);
        assert_eq!(refused.operation(), OPEN);

        let denied =
            ConnectionError::transport(WRITE, io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(denied.category(), ErrorCategory::NonRetryable);
        assert_eq!(denied.operation(), WRITE);

        let timeout = ConnectionError::ConnectTimeout {
            addr: "10.0.0.1:80".into(),
            timeout: Duration::from_millis(50),
        };
        assert_eq!(timeout.category(), ErrorCategory::Timeout);
        assert_eq!(timeout.code(), "spark.connection.tcp.connect_timeout");
    }

    #[test]
    fn transport_error_keeps_source() {
        use std::error::Error as _;
        let err = ConnectionError::transport(WRITE, io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(err.source().is_some());
        assert!(err.to_string().starts_with("tcp write: "));
        assert_eq!(err.code(), WRITE.code);
        assert_eq!(err.code(), "spark.connection.tcp.write_failed");
    }
}
