use std::{convert::Infallible, fmt::Display};

/// Coarse classification of an [`Error`], used by host bindings to map
/// failures onto their own exception types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Value,
    Type,
    Runtime,
    Assertion,
    NotImplemented,
    Timeout,
    Other,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An argument referenced something that does not exist or is malformed.
    #[error("Value error: {0}")]
    Value(String),

    /// Dtypes disagree across an operation.
    #[error("Type error: {0}")]
    Type(String),

    /// The operation is not supported in the current state or graph type.
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// An internal invariant does not hold.
    #[error("Assertion failed: {0}")]
    Assertion(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Reported by a communication backend when a transfer stalls.
    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Message: {0}")]
    Msg(String),

    #[error("{inner}\n{backtrace}")]
    WithBacktrace {
        inner: Box<Self>,
        backtrace: Box<std::backtrace::Backtrace>,
    },

    #[error("IO error: {0}")]
    IoError(String),

    /// Arbitrary errors wrapping.
    #[error(transparent)]
    Wrapped(Box<dyn std::error::Error + Send + Sync>),

    /// Arbitrary errors wrapping with context.
    #[error("{wrapped:?}\n{context:?}")]
    WrappedContext {
        wrapped: Box<dyn std::error::Error + Send + Sync>,
        context: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new error based on a printable error message.
    ///
    /// If the message implements `std::error::Error`, prefer using [`Error::wrap`] instead.
    pub fn msg<M: Display>(msg: M) -> Self {
        Self::Msg(msg.to_string()).bt()
    }

    pub fn wrap(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Wrapped(Box::new(err)).bt()
    }

    pub fn bt(self) -> Self {
        let backtrace = std::backtrace::Backtrace::capture();
        match backtrace.status() {
            std::backtrace::BacktraceStatus::Disabled
            | std::backtrace::BacktraceStatus::Unsupported => self,
            _ => Self::WithBacktrace {
                inner: Box::new(self),
                backtrace: Box::new(backtrace),
            },
        }
    }

    /// The taxonomy entry of this error, looking through backtrace wrappers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Value(_) => ErrorKind::Value,
            Self::Type(_) => ErrorKind::Type,
            Self::Runtime(_) => ErrorKind::Runtime,
            Self::Assertion(_) => ErrorKind::Assertion,
            Self::NotImplemented(_) => ErrorKind::NotImplemented,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::WithBacktrace { inner, .. } => inner.kind(),
            Self::Msg(_) | Self::IoError(_) | Self::Wrapped(_) | Self::WrappedContext { .. } => {
                ErrorKind::Other
            }
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::IoError(value.to_string())
    }
}

#[macro_export]
macro_rules! bail {
    ($msg:literal $(,)?) => {
        return Err($crate::Error::Msg(format!($msg).into()).bt())
    };
    ($err:expr $(,)?) => {
        return Err($crate::Error::Msg(format!($err).into()).bt())
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($fmt, $($arg)*).into()).bt())
    };
}

#[macro_export]
macro_rules! bail_value {
    ($($arg:tt)*) => {
        return Err($crate::Error::Value(format!($($arg)*)).bt())
    };
}

#[macro_export]
macro_rules! bail_type {
    ($($arg:tt)*) => {
        return Err($crate::Error::Type(format!($($arg)*)).bt())
    };
}

#[macro_export]
macro_rules! bail_runtime {
    ($($arg:tt)*) => {
        return Err($crate::Error::Runtime(format!($($arg)*)).bt())
    };
}

#[macro_export]
macro_rules! bail_not_implemented {
    ($($arg:tt)*) => {
        return Err($crate::Error::NotImplemented(format!($($arg)*)).bt())
    };
}

/// Return an assertion error unless `cond` holds.
#[macro_export]
macro_rules! ensure {
    ($cond:expr $(,)?) => {
        if !$cond {
            return Err($crate::Error::Assertion(
                concat!("Assertion `", stringify!($cond), "` failed").to_string(),
            )
            .bt());
        }
    };
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err($crate::Error::Assertion(format!(
                "Assertion `{}` failed: {}",
                stringify!($cond),
                format!($($arg)*)
            ))
            .bt());
        }
    };
}

pub(crate) mod private {
    pub trait Sealed {}

    impl<T, E> Sealed for std::result::Result<T, E> where E: std::error::Error {}
    impl<T> Sealed for Option<T> {}
}

/// Attach more context to an error.
///
/// Inspired by [`anyhow::Context`].
pub trait Context<T, E>: private::Sealed {
    /// Wrap the error value with additional context.
    fn context<C>(self, context: C) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static;

    /// Wrap the error value with additional context that is evaluated lazily
    /// only once an error does occur.
    fn with_context<C, F>(self, f: F) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> Context<T, E> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context<C>(self, context: C) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
    {
        // Not using map_err to save 2 useless frames off the captured backtrace
        // in ext_context.
        match self {
            Ok(ok) => Ok(ok),
            Err(error) => Err(Error::WrappedContext {
                wrapped: Box::new(error),
                context: context.to_string(),
            }),
        }
    }

    fn with_context<C, F>(self, context: F) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        match self {
            Ok(ok) => Ok(ok),
            Err(error) => Err(Error::WrappedContext {
                wrapped: Box::new(error),
                context: context().to_string(),
            }),
        }
    }
}

impl<T> Context<T, Infallible> for Option<T> {
    fn context<C>(self, context: C) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
    {
        // Not using ok_or_else to save 2 useless frames off the captured
        // backtrace.
        match self {
            Some(ok) => Ok(ok),
            None => Err(Error::msg(context)),
        }
    }

    fn with_context<C, F>(self, context: F) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        match self {
            Some(ok) => Ok(ok),
            None => Err(Error::msg(context())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fails_value() -> Result<()> {
        bail_value!("graph {} does not exist", 7)
    }

    fn fails_assert(x: usize) -> Result<()> {
        ensure!(x == 0, "x was {x}");
        Ok(())
    }

    #[test]
    fn kinds_survive_backtrace_wrapping() {
        assert_eq!(fails_value().unwrap_err().kind(), ErrorKind::Value);
        assert_eq!(fails_assert(3).unwrap_err().kind(), ErrorKind::Assertion);
        assert!(fails_assert(0).is_ok());
    }
}
