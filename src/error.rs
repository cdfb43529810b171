use crate::types::{DataType, Rank, ReduceOp};

pub type Result<T> = std::result::Result<T, IpcError>;

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported data type: {dtype} for operation {op}")]
    UnsupportedDType { dtype: DataType, op: &'static str },

    #[error("invalid rank {rank}: world size is {world_size}")]
    InvalidRank { rank: Rank, world_size: u32 },

    #[error("buffer too small for {operation}: need {needed} bytes, buffer holds {actual}")]
    BufferTooSmall {
        operation: &'static str,
        needed: usize,
        actual: usize,
    },

    #[error("buffer lives on device {buffer_device}, communicator uses device {comm_device}")]
    DeviceMismatch {
        buffer_device: u32,
        comm_device: u32,
    },

    #[error("{operation} is not implemented")]
    Unimplemented { operation: &'static str },

    #[error("reduce operator {op} is not implemented")]
    UnsupportedOp { op: ReduceOp },

    #[error("device error: {message}")]
    Device {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("timed out after {timeout_ms}ms waiting for rank {rank} ({operation})")]
    PeerTimeout {
        operation: &'static str,
        rank: Rank,
        timeout_ms: u64,
    },

    #[error("peer {rank} disconnected unexpectedly")]
    PeerDisconnected { rank: Rank },

    #[error("remote error from rank {rank}: {reason}")]
    Remote { rank: Rank, reason: String },

    #[error("descriptor decode failed: {0}")]
    DecodeFailed(String),

    #[error("descriptor encode failed: {0}")]
    EncodeFailed(String),
}

impl IpcError {
    /// Create a `Device` error with just a message.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Device` error with a message and a source error.
    pub fn device_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Device {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an `InvalidArgument` error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// The result code reported to callers of the C-style surface.
    pub fn code(&self) -> ResultCode {
        match self {
            IpcError::InvalidArgument(_)
            | IpcError::UnsupportedDType { .. }
            | IpcError::InvalidRank { .. }
            | IpcError::BufferTooSmall { .. }
            | IpcError::DeviceMismatch { .. } => ResultCode::InvalidArgument,
            IpcError::Unimplemented { .. } | IpcError::UnsupportedOp { .. } => {
                ResultCode::InternalError
            }
            IpcError::Device { .. } => ResultCode::UnhandledDeviceError,
            IpcError::PeerTimeout { .. }
            | IpcError::PeerDisconnected { .. }
            | IpcError::Remote { .. } => ResultCode::RemoteError,
            IpcError::DecodeFailed(_) | IpcError::EncodeFailed(_) => ResultCode::SystemError,
        }
    }
}

/// Fixed result-code table returned by every entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResultCode {
    Success = 0,
    UnhandledDeviceError = 1,
    SystemError = 2,
    InternalError = 3,
    InvalidArgument = 4,
    InvalidUsage = 5,
    RemoteError = 6,
    InProgress = 7,
}

impl ResultCode {
    pub const ALL: [ResultCode; 8] = [
        ResultCode::Success,
        ResultCode::UnhandledDeviceError,
        ResultCode::SystemError,
        ResultCode::InternalError,
        ResultCode::InvalidArgument,
        ResultCode::InvalidUsage,
        ResultCode::RemoteError,
        ResultCode::InProgress,
    ];
}

impl<T> From<&Result<T>> for ResultCode {
    fn from(r: &Result<T>) -> Self {
        match r {
            Ok(_) => ResultCode::Success,
            Err(e) => e.code(),
        }
    }
}

/// Human-readable description of a result code.
pub fn error_string(code: ResultCode) -> &'static str {
    match code {
        ResultCode::Success => "no error",
        ResultCode::UnhandledDeviceError => "unhandled device error",
        ResultCode::SystemError => "unhandled system error",
        ResultCode::InternalError => "internal error - please report this issue",
        ResultCode::InvalidArgument => "invalid argument",
        ResultCode::InvalidUsage => "invalid usage",
        ResultCode::RemoteError => "remote process exited or there was a network error",
        ResultCode::InProgress => "operation in progress",
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(error_string(*self))
    }
}

/// Log a failed device operation with its call site and terminate the process.
///
/// Device error state is not continuable, so there is no unwinding path.
#[track_caller]
pub(crate) fn fatal_device_error(context: &str, detail: &dyn std::fmt::Display) -> ! {
    let location = std::panic::Location::caller();
    tracing::error!(
        file = location.file(),
        line = location.line(),
        "fatal device error: {context}: {detail}"
    );
    std::process::abort()
}
