//! Remote Server Endpoints

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a remote server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Endpoint {
    pub host: String,
    /// Numeric address the host name resolved to; empty when unknown
    #[serde(default)]
    pub resolved_address: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            resolved_address: String::new(),
            port,
        }
    }

    pub fn with_resolved_address(mut self, address: impl Into<String>) -> Self {
        self.resolved_address = address.into();
        self
    }

    /// Address used to open the socket: the resolved address when known
    pub fn dial_target(&self) -> String {
        let host = if self.resolved_address.is_empty() {
            &self.host
        } else {
            &self.resolved_address
        };

        if host.contains(':') && !host.starts_with('[') {
            format!("[{}]:{}", host, self.port)
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Role of the remote server; selects the idle TTL of its physical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerRole {
    /// Load balancer / metadata server, kept around for a long time
    Redirector,
    DataServer,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dial_target_prefers_resolved_address() {
        let endpoint = Endpoint::new("data01.example.org", 1094).with_resolved_address("10.0.0.7");
        assert_eq!(endpoint.dial_target(), "10.0.0.7:1094");
        assert_eq!(endpoint.to_string(), "data01.example.org:1094");
    }

    #[test]
    fn test_dial_target_brackets_ipv6() {
        let endpoint = Endpoint::new("::1", 1094);
        assert_eq!(endpoint.dial_target(), "[::1]:1094");
    }
}
