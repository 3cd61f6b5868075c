//! 错误类型
//!
//! 所有公开操作都以 `Result<T, GattError>` 结束，`Display` 即给上层展示的错误描述。

use std::fmt;

use crate::gatt::GattStatus;

/// 客户端操作类别，每个类别同一时刻最多一个未完成请求
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Connect,
    Discover,
    Mtu,
    Read,
    Write,
    EnableNotification,
    DisableNotification,
}

impl Operation {
    pub const ALL: [Operation; 7] = [
        Operation::Connect,
        Operation::Discover,
        Operation::Mtu,
        Operation::Read,
        Operation::Write,
        Operation::EnableNotification,
        Operation::DisableNotification,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Operation::Connect => "connect",
            Operation::Discover => "discover services",
            Operation::Mtu => "request MTU",
            Operation::Read => "read characteristic",
            Operation::Write => "write characteristic",
            Operation::EnableNotification => "enable notification",
            Operation::DisableNotification => "disable notification",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// GATT 操作错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GattError {
    #[error("Another {0} is in progress")]
    Busy(Operation),

    #[error("Not connected to a GATT server")]
    NotConnected,

    #[error("Already connected to a GATT server")]
    AlreadyConnected,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Transport rejected request: {0}")]
    TransportRejected(String),

    #[error("Failed to {operation} (status: {status})")]
    TransportFailed {
        operation: Operation,
        status: GattStatus,
    },

    #[error("Timed out waiting to {0}")]
    Timeout(Operation),

    #[error("{0}")]
    Disconnected(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl GattError {
    pub(crate) fn rejected(err: &TransportError) -> Self {
        GattError::TransportRejected(err.to_string())
    }
}

/// 传输层在发起请求时返回的错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Operation not supported by transport")]
    Unsupported,

    #[error("Transport not ready: {0}")]
    NotReady(String),

    #[error("Peer unavailable: {0}")]
    PeerUnavailable(String),

    #[error("{0}")]
    Other(String),
}
