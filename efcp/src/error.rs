use dtp::DtpError;
use failure::Fail;
use kfa::KfaError;
use naming::{CepId, ConfigError};
use pdu::SinkError;

/// Kind of an EFCP error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Resource exhaustion.
    Alloc,
    /// Invalid argument.
    InvalidArg,
    /// The port is not bound to a flow.
    NoFlow,
    /// The flow was torn down.
    FlowDown,
    /// Malformed PDU.
    BadPdu,
    /// PDU for a CEP-id that does not exist.
    UnknownCep,
    /// Backpressure, retry later.
    WindowFull,
    /// The connection is closing or closed.
    Teardown,
    /// No route to the destination.
    Unreachable,
}

/// EFCP error.
#[derive(Debug, Fail)]
pub enum EfcpError {
    /// No CEP-id available.
    #[fail(display = "cep-ids exhausted")]
    Exhausted,
    /// Invalid argument.
    #[fail(display = "invalid argument: {}", _0)]
    InvalidArg(&'static str),
    /// No connection with this CEP-id.
    #[fail(display = "unknown cep-id {}", _0)]
    UnknownCep(CepId),
    /// The receive queue of a connection is full.
    #[fail(display = "receive queue of cep-id {} full", _0)]
    QueueFull(CepId),
    /// Invalid configuration.
    #[fail(display = "{}", _0)]
    Config(#[cause] ConfigError),
    /// Port table error.
    #[fail(display = "{}", _0)]
    Kfa(#[cause] KfaError),
    /// Connection error.
    #[fail(display = "{}", _0)]
    Dtp(#[cause] DtpError),
}

impl EfcpError {
    /// Kind of the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EfcpError::Exhausted => ErrorKind::Alloc,
            EfcpError::InvalidArg(_) | EfcpError::Config(_) => ErrorKind::InvalidArg,
            EfcpError::UnknownCep(_) => ErrorKind::UnknownCep,
            EfcpError::QueueFull(_) => ErrorKind::WindowFull,
            EfcpError::Kfa(err) => kfa_kind(err),
            EfcpError::Dtp(err) => dtp_kind(err),
        }
    }
}

fn kfa_kind(err: &KfaError) -> ErrorKind {
    match err {
        KfaError::NoFlow(_) | KfaError::NotActive(_) => ErrorKind::NoFlow,
        KfaError::FlowDown(_) => ErrorKind::FlowDown,
        KfaError::AlreadyBound(_) => ErrorKind::InvalidArg,
        KfaError::Busy => ErrorKind::WindowFull,
        KfaError::Exhausted => ErrorKind::Alloc,
        KfaError::Dtp(err) => dtp_kind(err),
    }
}

fn dtp_kind(err: &DtpError) -> ErrorKind {
    match err {
        DtpError::NotActive(_) => ErrorKind::Teardown,
        DtpError::Busy => ErrorKind::WindowFull,
        DtpError::SduTooLarge { .. } | DtpError::PduTooSmall(_) | DtpError::WrongCep { .. } => {
            ErrorKind::InvalidArg
        }
        DtpError::Unexpected(_) | DtpError::BadPdu(_) => ErrorKind::BadPdu,
        DtpError::Sink(SinkError::QueueFull) => ErrorKind::WindowFull,
        DtpError::Sink(SinkError::NoRoute(_)) => ErrorKind::Unreachable,
        DtpError::Sink(SinkError::Closed) => ErrorKind::Teardown,
        DtpError::Dtcp(_) => ErrorKind::FlowDown,
    }
}

impl From<ConfigError> for EfcpError {
    fn from(err: ConfigError) -> Self {
        EfcpError::Config(err)
    }
}

impl From<KfaError> for EfcpError {
    fn from(err: KfaError) -> Self {
        EfcpError::Kfa(err)
    }
}

impl From<DtpError> for EfcpError {
    fn from(err: DtpError) -> Self {
        EfcpError::Dtp(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dtp::DtpState;

    #[test]
    fn test_kind() {
        assert_eq!(EfcpError::Exhausted.kind(), ErrorKind::Alloc);
        assert_eq!(EfcpError::from(KfaError::Busy).kind(), ErrorKind::WindowFull);
        assert_eq!(EfcpError::from(DtpError::Busy).kind(), ErrorKind::WindowFull);
        assert_eq!(EfcpError::from(KfaError::NoFlow(1)).kind(), ErrorKind::NoFlow);
        assert_eq!(
            EfcpError::from(DtpError::NotActive(DtpState::Draining)).kind(),
            ErrorKind::Teardown
        );
        assert_eq!(
            EfcpError::from(DtpError::Sink(SinkError::NoRoute(3))).kind(),
            ErrorKind::Unreachable
        );
        assert_eq!(
            EfcpError::from(KfaError::Dtp(DtpError::SduTooLarge { len: 2, max: 1 })).kind(),
            ErrorKind::InvalidArg
        );
    }
}
