use std::fmt::{Display, Formatter};

/// Numeric ADS status codes as transmitted on the wire (and expected by
///  remote tooling). Kept as plain constants so callers can
///  compare a [`AdsError::Device`] payload against well-known values without
///  this crate interpreting device semantics.
pub mod codes {
    pub const GLOBALERR_TARGET_PORT: u32 = 0x06;
    pub const GLOBALERR_MISSING_ROUTE: u32 = 0x07;
    pub const GLOBALERR_TCP_SEND: u32 = 0x1A;

    pub const ROUTERERR_PORTALREADYINUSE: u32 = 0x0506;
    pub const ROUTERERR_NOMOREQUEUES: u32 = 0x0508;

    pub const ADSERR_CLIENT_INVALIDPARM: u32 = 0x0741;
    pub const ADSERR_CLIENT_SYNCTIMEOUT: u32 = 0x0745;
    pub const ADSERR_CLIENT_PORTNOTOPEN: u32 = 0x0748;
    pub const ADSERR_CLIENT_REMOVEHASH: u32 = 0x0752;
    pub const ADSERR_CLIENT_SYNCRESINVALID: u32 = 0x0754;
    pub const ADSERR_CLIENT_SYNCPORTLOCKED: u32 = 0x0755;
}

/// Error type for all public operations of this crate.
///
/// Transport failures keep their [`std::io::Error`] source, everything else
///  maps onto the status codes of the original protocol so that
///  [`AdsError::code`] round-trips to the numeric values remote tooling
///  expects.
#[derive(Debug, thiserror::Error)]
pub enum AdsError {
    /// The remote device answered the request with a non-zero status code,
    ///  which is propagated verbatim.
    #[error("device reported status {0:#x}")]
    Device(u32),

    /// No response arrived within the port's configured timeout.
    #[error("request timed out")]
    SyncTimeout,

    /// A request is already outstanding on this local port.
    #[error("local port busy, a request is already outstanding")]
    PortBusy,

    /// The local port number is out of range or was never opened.
    #[error("local port not open")]
    PortNotOpen,

    /// All slots of the local port pool are in use.
    #[error("no free local port")]
    NoFreePort,

    /// There is no route for the destination net id.
    #[error("no route to {0}")]
    MissingRoute(crate::net_id::AmsNetId),

    /// A route for this net id already points to a different host.
    #[error("net id {0} already routed to a different host")]
    RouteInUse(crate::net_id::AmsNetId),

    /// The notification handle is not registered with this port.
    #[error("unknown notification handle {0}")]
    UnknownNotification(u32),

    /// The peer answered with something that is not a valid response frame.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Connect / send / receive failure on the underlying socket.
    #[error("transport error")]
    Io(#[from] std::io::Error),
}

impl AdsError {
    /// The numeric ADS status code equivalent of this error.
    pub fn code(&self) -> u32 {
        match self {
            AdsError::Device(code) => *code,
            AdsError::SyncTimeout => codes::ADSERR_CLIENT_SYNCTIMEOUT,
            AdsError::PortBusy => codes::ADSERR_CLIENT_SYNCPORTLOCKED,
            AdsError::PortNotOpen => codes::ADSERR_CLIENT_PORTNOTOPEN,
            AdsError::NoFreePort => codes::ROUTERERR_NOMOREQUEUES,
            AdsError::MissingRoute(_) => codes::GLOBALERR_MISSING_ROUTE,
            AdsError::RouteInUse(_) => codes::ROUTERERR_PORTALREADYINUSE,
            AdsError::UnknownNotification(_) => codes::ADSERR_CLIENT_REMOVEHASH,
            AdsError::InvalidResponse(_) => codes::ADSERR_CLIENT_SYNCRESINVALID,
            AdsError::InvalidParameter(_) => codes::ADSERR_CLIENT_INVALIDPARM,
            AdsError::Io(_) => codes::GLOBALERR_TCP_SEND,
        }
    }
}

/// ADS protocol version of a device, as reported by a read-device-info call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AdsVersion {
    pub version: u8,
    pub revision: u8,
    pub build: u16,
}

impl Display for AdsVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.version, self.revision, self.build)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::timeout(AdsError::SyncTimeout, 0x745)]
    #[case::port_not_open(AdsError::PortNotOpen, 0x748)]
    #[case::no_free_port(AdsError::NoFreePort, 0x508)]
    #[case::device(AdsError::Device(0x701), 0x701)]
    #[case::port_busy(AdsError::PortBusy, 0x755)]
    fn test_code(#[case] error: AdsError, #[case] expected: u32) {
        assert_eq!(error.code(), expected);
    }
}
