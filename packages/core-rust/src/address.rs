//! Destination addresses and the scheme that selects a transport.
//!
//! Two schemes exist: `tcp://host:port[/name]` for the stream transport and
//! `local://name` for in-process delivery through the local worker queue.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error produced when parsing a destination address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address '{0}' is missing a scheme (expected tcp:// or local://)")]
    MissingScheme(String),
    #[error("unknown address scheme '{0}'")]
    UnknownScheme(String),
    #[error("tcp address '{0}' must be host:port")]
    MissingPort(String),
    #[error("invalid port in address '{0}'")]
    InvalidPort(String),
    #[error("local address must name a queue, got '{0}'")]
    MissingQueueName(String),
}

/// A destination the runtime can deliver envelopes to.
///
/// The scheme determines which transport handles the address: `Tcp` goes
/// through the stream transport's per-destination sender, `Local` bypasses
/// sockets and feeds the local worker queue directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Address {
    Tcp {
        host: String,
        port: u16,
        /// Optional queue name, e.g. the `/incoming` in
        /// `tcp://localhost:2201/incoming`.
        name: Option<String>,
    },
    Local {
        name: String,
    },
}

impl Address {
    /// Builds a TCP address without a queue name.
    #[must_use]
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
            name: None,
        }
    }

    /// Builds a local queue address.
    #[must_use]
    pub fn local(name: impl Into<String>) -> Self {
        Self::Local { name: name.into() }
    }

    /// Whether this address is served in-process.
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local { .. })
    }

    /// The `host:port` pair for socket connection, if this is a TCP address.
    #[must_use]
    pub fn socket_addr(&self) -> Option<String> {
        match self {
            Self::Tcp { host, port, .. } => Some(format!("{host}:{port}")),
            Self::Local { .. } => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port, name } => {
                write!(f, "tcp://{host}:{port}")?;
                if let Some(name) = name {
                    write!(f, "/{name}")?;
                }
                Ok(())
            }
            Self::Local { name } => write!(f, "local://{name}"),
        }
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let Some((scheme, rest)) = input.split_once("://") else {
            return Err(AddressError::MissingScheme(input.to_string()));
        };

        match scheme {
            "tcp" => {
                let (authority, name) = match rest.split_once('/') {
                    Some((authority, name)) if !name.is_empty() => {
                        (authority, Some(name.to_string()))
                    }
                    Some((authority, _)) => (authority, None),
                    None => (rest, None),
                };
                let Some((host, port)) = authority.rsplit_once(':') else {
                    return Err(AddressError::MissingPort(input.to_string()));
                };
                let port: u16 = port
                    .parse()
                    .map_err(|_| AddressError::InvalidPort(input.to_string()))?;
                Ok(Self::Tcp {
                    host: host.to_string(),
                    port,
                    name,
                })
            }
            "local" => {
                if rest.is_empty() {
                    return Err(AddressError::MissingQueueName(input.to_string()));
                }
                Ok(Self::Local {
                    name: rest.to_string(),
                })
            }
            other => Err(AddressError::UnknownScheme(other.to_string())),
        }
    }
}
