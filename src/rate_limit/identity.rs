// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Who a request is counted against.
//!
//! Client IP precedence: first `X-Forwarded-For` segment, then `X-Real-IP`,
//! then the socket peer address. Principal-keyed routes fall back to the IP
//! when the request is anonymous.

use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;

/// Identifier used when nothing about the caller is known.
pub const UNKNOWN_CLIENT: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStrategy {
    /// Count per client address
    #[default]
    Ip,
    /// Count per authenticated principal, falling back to the address
    Principal,
}

/// Request attributes the rate limiter may key on.
#[derive(Debug, Clone, Default)]
pub struct RequestIdentity {
    /// Header names are stored lowercased
    headers: HashMap<String, String>,
    remote_addr: Option<IpAddr>,
    principal: Option<String>,
}

impl RequestIdentity {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    #[must_use]
    pub fn with_remote_addr(mut self, addr: IpAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    #[must_use]
    pub fn with_principal(mut self, id: impl Into<String>) -> Self {
        self.principal = Some(id.into());
        self
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Best-effort client address.
    #[must_use]
    pub fn client_ip(&self) -> Option<String> {
        if let Some(forwarded) = self.header("x-forwarded-for") {
            let first = forwarded.split(',').next().unwrap_or("").trim();
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }
        if let Some(real_ip) = self.header("x-real-ip") {
            return Some(real_ip.to_string());
        }
        self.remote_addr.map(|addr| addr.to_string())
    }

    /// Rate-limit identifier under `strategy`.
    #[must_use]
    pub fn identifier(&self, strategy: KeyStrategy) -> String {
        if strategy == KeyStrategy::Principal {
            if let Some(id) = self.principal.as_deref().filter(|id| !id.is_empty()) {
                return format!("user:{}", id);
            }
        }
        self.client_ip().unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn socket() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9))
    }

    #[test]
    fn test_forwarded_for_wins() {
        let identity = RequestIdentity::new()
            .with_header("X-Forwarded-For", "203.0.113.7, 10.0.0.1")
            .with_header("X-Real-IP", "198.51.100.2")
            .with_remote_addr(socket());
        assert_eq!(identity.client_ip().as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn test_real_ip_then_socket() {
        let identity = RequestIdentity::new()
            .with_header("x-real-ip", "198.51.100.2")
            .with_remote_addr(socket());
        assert_eq!(identity.client_ip().as_deref(), Some("198.51.100.2"));

        let identity = RequestIdentity::new().with_header("x-forwarded-for", " ").with_remote_addr(socket());
        assert_eq!(identity.client_ip().as_deref(), Some("10.0.0.9"));

        assert_eq!(RequestIdentity::new().identifier(KeyStrategy::Ip), UNKNOWN_CLIENT);
    }

    #[test]
    fn test_principal_strategy() {
        let anonymous = RequestIdentity::new().with_remote_addr(socket());
        assert_eq!(anonymous.identifier(KeyStrategy::Principal), "10.0.0.9");

        let signed_in = anonymous.clone().with_principal("42");
        assert_eq!(signed_in.identifier(KeyStrategy::Principal), "user:42");
        assert_eq!(signed_in.identifier(KeyStrategy::Ip), "10.0.0.9");
    }
}
