use std::fmt;

/// Thread status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    Yield = 1,
    ErrRun = 2,
    ErrSyntax = 3,
    ErrMem = 4,
    ErrGcMm = 5,
    ErrErr = 6,
}

impl Status {
    pub fn is_error(self) -> bool {
        !matches!(self, Status::Ok | Status::Yield)
    }
}

/// Why a precompiled chunk was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedReason {
    NotAChunk,
    Truncated,
    VersionMismatch,
    FormatMismatch,
    Corrupted,
    /// Width of the named primitive differs from ours.
    SizeMismatch(&'static str),
    EndiannessMismatch,
    FloatFormatMismatch,
    UnknownConstant(u8),
    NullConstantText,
    BadUpvalueNames,
    UpvalueMismatch,
}

impl fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MalformedReason::NotAChunk => write!(f, "not a"),
            MalformedReason::Truncated => write!(f, "truncated"),
            MalformedReason::VersionMismatch => write!(f, "version mismatch in"),
            MalformedReason::FormatMismatch => write!(f, "format mismatch in"),
            MalformedReason::Corrupted => write!(f, "corrupted"),
            MalformedReason::SizeMismatch(what) => write!(f, "{} size mismatch in", what),
            MalformedReason::EndiannessMismatch => write!(f, "endianness mismatch in"),
            MalformedReason::FloatFormatMismatch => write!(f, "float format mismatch in"),
            MalformedReason::UnknownConstant(tag) => {
                write!(f, "unknown constant type 0x{:02x} in", tag)
            }
            MalformedReason::NullConstantText => write!(f, "null string constant in"),
            MalformedReason::BadUpvalueNames => write!(f, "too many upvalue names in"),
            MalformedReason::UpvalueMismatch => write!(f, "upvalue count mismatch in"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LuaError {
    #[error("not enough memory")]
    OutOfMemory,
    #[error("memory allocation error: block too big")]
    BlockTooBig,
    #[error("too many {what} (limit is {limit})")]
    TooMany { what: &'static str, limit: usize },
    #[error("{chunk}: {reason} precompiled chunk")]
    Malformed {
        chunk: String,
        reason: MalformedReason,
    },
    #[error("invalid raw type tag value: {0}")]
    InvalidTag(u8),
    #[error("stack overflow")]
    StackOverflow,
    /// An error was raised while a previous one was being handled.
    #[error("error in error handling")]
    ErrorInHandler,
    #[error("{0}")]
    Runtime(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

pub type LuaResult<T> = Result<T, LuaError>;

impl LuaError {
    pub fn malformed(chunk: &str, reason: MalformedReason) -> Self {
        LuaError::Malformed {
            chunk: chunk.to_string(),
            reason,
        }
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        LuaError::Runtime(msg.into())
    }

    /// Status a thread ends up in when this error reaches a protected boundary.
    pub fn status(&self) -> Status {
        match self {
            LuaError::OutOfMemory => Status::ErrMem,
            LuaError::Malformed { .. } => Status::ErrSyntax,
            LuaError::ErrorInHandler => Status::ErrErr,
            _ => Status::ErrRun,
        }
    }

    pub fn reason(&self) -> Option<MalformedReason> {
        match self {
            LuaError::Malformed { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}
