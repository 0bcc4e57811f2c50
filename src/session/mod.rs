mod codec;
mod hold_timer;
mod manager;
mod message_counts;
mod poller;
mod session;

use std::convert::From;
use std::error;
use std::fmt;
use std::io;
use std::net::IpAddr;

use hold_timer::HoldTimer;
pub use manager::SessionManager;
use message_counts::MessageCounts;
use poller::{Poller, PollerTx};
pub use session::Session;

use bgp_rs::Update;

#[derive(Debug)]
pub enum SessionUpdate {
    // Update received from a peer (PeerIP, Update)
    Learned((IpAddr, Update)),
    // A session reached Established for the first time; helper processes
    // subscribed to this peer should receive `neighbor <ip> up`.
    Up(IpAddr),
    // Sessions ended (PeerIP, reason): clear the RIB for these peers and send
    // subscribed helper processes `neighbor <ip> down <reason>`.
    Ended(Vec<(IpAddr, String)>),
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum SessionState {
    Connect,
    Active,
    Idle,
    OpenSent,
    OpenConfirm,
    Established,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            SessionState::Connect => "Connect",
            SessionState::Active => "Active",
            SessionState::Idle => "Idle",
            SessionState::OpenSent => "OpenSent",
            SessionState::OpenConfirm => "OpenConfirm",
            SessionState::Established => "Established",
        };
        write!(f, "{}", word)
    }
}

#[derive(Debug)]
pub enum SessionError {
    /// Peer De-configured
    Deconfigured,
    /// Received an unexpected ASN. [received, expected]
    OpenAsnMismatch(u32, u32),
    /// Finite State Machine error, unexpected transition [minor_err_codes]
    FiniteStateMachine(u8),
    /// Hold time expired. [interval]
    HoldTimeExpired(u16),
    /// Local side advertised 4-byte ASN but the peer didn't, and our ASN
    /// doesn't fit in 2 bytes. NOTIFICATION(2,0); no back-off on retry.
    Asn4Downgrade,
    /// Negotiated hold-time was 1 or 2 seconds. NOTIFICATION(2,6).
    HoldTimeUnacceptable(u16),
    /// Peer's router-id was zero, or equal to our own. NOTIFICATION(2,3).
    RouterIdInvalid(IpAddr),
    /// Mandatory capability mismatch. `true` selects subcode 8 (multisession
    /// session-id mismatch), `false` selects subcode 7 (unsupported capability).
    UnsupportedCapability(bool),
    /// Marker octets were not all ones. NOTIFICATION(1,1).
    ConnectionNotSynchronized,
    /// Total message length outside `[19, 4096]`. NOTIFICATION(1,2).
    BadMessageLength(u16),
    /// Type byte wasn't OPEN/UPDATE/NOTIFICATION/KEEPALIVE. NOTIFICATION(1,3).
    BadMessageType(u8),
    /// Something happened in transport. [reason]
    TransportError(String),
    /// Some other issue happened. [reason]
    Other(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Session Error: ")?;
        use SessionError::*;
        match self {
            Deconfigured => write!(f, "Peer De-configured")?,
            OpenAsnMismatch(r, e) => {
                write!(f, "Open ASN Mismatch (received={}, expected={})", r, e)?;
            }
            HoldTimeExpired(h) => write!(f, "Hold time expired after {} seconds", h)?,
            Asn4Downgrade => write!(f, "Peer does not speak ASN4 - restarting in compatibility mode")?,
            HoldTimeUnacceptable(h) => write!(f, "Unacceptable hold time ({}s)", h)?,
            RouterIdInvalid(id) => write!(f, "Invalid peer router-id ({})", id)?,
            UnsupportedCapability(is_multisession) => {
                if *is_multisession {
                    write!(f, "peer did not reply with the sessionid we sent")?
                } else {
                    write!(f, "Unsupported mandatory capability")?
                }
            }
            ConnectionNotSynchronized => write!(f, "Connection Not Synchronized (bad marker)")?,
            BadMessageLength(len) => write!(f, "Bad Message Length ({})", len)?,
            BadMessageType(kind) => write!(f, "Bad Message Type ({})", kind)?,
            FiniteStateMachine(minor) => write!(f, "Finite State Machine err [{}]", minor)?,
            TransportError(r) => write!(f, "Transport error [{}]", r)?,
            Other(r) => write!(f, "{}", r)?,
        }
        Ok(())
    }
}

impl From<io::Error> for SessionError {
    fn from(error: io::Error) -> Self {
        SessionError::TransportError(error.to_string())
    }
}

impl error::Error for SessionError {
    fn description(&self) -> &str {
        "Session Error"
    }

    fn cause(&self) -> Option<&dyn error::Error> {
        None
    }
}
