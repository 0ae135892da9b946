//! Role specializations layered on the connection core.
//!
//! A role is a behaviour bundle attached during `start()` and torn down by
//! `stop()`:
//!
//! - **Peer**: discovery and request/response only
//! - **Parent**: answers every `connection.ping` request
//! - **Child**: pings rapidly until a parent answers, then keeps a slow heartbeat
//!
//! Nothing here elects a single parent. Running two parents on one channel is
//! a deployment mistake the protocol does not detect.

pub(crate) mod child;
pub(crate) mod parent;

/// Which behaviour bundle a connection runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Role {
    #[default]
    Peer,
    Parent,
    Child,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Peer => "peer",
            Role::Parent => "parent",
            Role::Child => "child",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
