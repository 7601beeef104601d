//! Client configuration: construction, environment-variable overlay, and
//! the insecure-credentials gate (§4.J, §4.Q, §6).
//!
//! Mirrors the teacher's `Raw*Config` (all-`Option`) deserialize-then-merge
//! shape from `forwarder::config`, except the override direction here is
//! env-over-constructor rather than file-over-default: every field on
//! [`RawEnvOverlay`] is read via `std::env::var` and, when present,
//! replaces the corresponding [`Config`] field.

use crate::error::{Error, Result};

/// Which wire protocol the facade speaks for commands. Follow-mode
/// streams may still use the socket side-channel even when `protocol` is
/// `Rest`, if `socket_port` is configured (hybrid mode, §4.J).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Socket,
    Rest,
}

/// Construction-time configuration for a [`crate::client::RouterClient`].
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub user: String,
    pub password: String,
    pub protocol: Protocol,
    /// Socket API port — plain 8728 or TLS 8729 by convention (§6).
    pub port: u16,
    /// Secondary socket port reserved for hybrid-mode follow streams when
    /// `protocol` is `Rest` (§4.J step 2, `MIKROTIK_PORT_APISSL`).
    pub socket_stream_port: Option<u16>,
    pub rest_port: u16,
    pub tls: bool,
    /// Opt-in required to construct with hardcoded (non-env-sourced)
    /// credentials (§4.J, §6).
    pub allow_insecure: bool,
    pub handshake_timeout: std::time::Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: String::new(),
            user: String::new(),
            password: String::new(),
            protocol: Protocol::Rest,
            port: 8728,
            socket_stream_port: None,
            rest_port: 443,
            tls: true,
            allow_insecure: false,
            handshake_timeout: std::time::Duration::from_secs(10),
        }
    }
}

/// The env-var overlay, all-`Option` like the teacher's `RawReaderConfig`.
/// Presence of all four core variables satisfies the "don't hardcode
/// credentials" requirement and disables the insecure-config gate,
/// regardless of whether the constructor also supplied values (§4.Q).
#[derive(Debug, Default)]
struct RawEnvOverlay {
    host: Option<String>,
    user: Option<String>,
    password: Option<String>,
    port: Option<u16>,
    protocol: Option<Protocol>,
    socket_stream_port: Option<u16>,
}

impl RawEnvOverlay {
    fn read() -> Self {
        Self {
            host: std::env::var("MIKROTIK_HOST").ok(),
            user: std::env::var("MIKROTIK_USER").ok(),
            password: std::env::var("MIKROTIK_PASS").ok(),
            port: std::env::var("MIKROTIK_PORT").ok().and_then(|v| v.parse().ok()),
            protocol: std::env::var("MIKROTIK_PROTOCOL").ok().and_then(|v| match v.as_str() {
                "socket" => Some(Protocol::Socket),
                "rest" => Some(Protocol::Rest),
                _ => None,
            }),
            socket_stream_port: std::env::var("MIKROTIK_PORT_APISSL")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }

    /// The four core variables (host/user/pass/port) being present is
    /// treated as having satisfied "do not hardcode credentials" even if
    /// the constructor also passed values in (§6).
    fn has_all_core_vars(&self) -> bool {
        self.host.is_some() && self.user.is_some() && self.password.is_some() && self.port.is_some()
    }
}

impl Config {
    /// Merge the environment overlay on top of `self` and enforce the
    /// insecure-credentials gate (§4.J connect step 0 / §4.Q).
    pub fn resolve(mut self) -> Result<Self> {
        let overlay = RawEnvOverlay::read();
        let env_satisfied_credential_policy = overlay.has_all_core_vars();

        if let Some(host) = overlay.host {
            self.host = host;
        }
        if let Some(user) = overlay.user {
            self.user = user;
        }
        if let Some(password) = overlay.password {
            self.password = password;
        }
        if let Some(port) = overlay.port {
            self.port = port;
        }
        if let Some(protocol) = overlay.protocol {
            self.protocol = protocol;
        }
        if let Some(p) = overlay.socket_stream_port {
            self.socket_stream_port = Some(p);
        }

        if self.host.is_empty() {
            return Err(Error::Config("missing host".into()));
        }
        if !self.allow_insecure && !env_satisfied_credential_policy && !self.password.is_empty() {
            return Err(Error::Config(
                "hardcoded credentials require allow_insecure = true, or set MIKROTIK_HOST/USER/PASS/PORT".into(),
            ));
        }
        Ok(self)
    }
}

/// Seam for the out-of-scope schema/version alias table (§1, §4.T). The
/// default resolver is the identity function; a real alias table is an
/// external collaborator a caller can plug in via
/// [`crate::client::RouterClient::connect_with`].
pub trait AliasResolver: Send + Sync {
    fn resolve<'a>(&'a self, path: &'a str) -> &'a str;
}

#[derive(Debug, Default)]
pub struct NoopAliasResolver;

impl AliasResolver for NoopAliasResolver {
    fn resolve<'a>(&'a self, path: &'a str) -> &'a str {
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardcoded_credentials_without_allow_insecure_are_rejected() {
        // SAFETY (tests only): env var isolation is not guaranteed across
        // parallel tests, so this scenario only asserts the happy path
        // where none of the MIKROTIK_* vars happen to be set.
        for var in [
            "MIKROTIK_HOST",
            "MIKROTIK_USER",
            "MIKROTIK_PASS",
            "MIKROTIK_PORT",
            "MIKROTIK_PROTOCOL",
            "MIKROTIK_PORT_APISSL",
        ] {
            unsafe { std::env::remove_var(var) };
        }
        let config = Config {
            host: "10.0.0.1".into(),
            password: "hunter2".into(),
            allow_insecure: false,
            ..Config::default()
        };
        assert!(matches!(config.resolve(), Err(Error::Config(_))));
    }

    #[test]
    fn allow_insecure_permits_hardcoded_credentials() {
        for var in [
            "MIKROTIK_HOST",
            "MIKROTIK_USER",
            "MIKROTIK_PASS",
            "MIKROTIK_PORT",
            "MIKROTIK_PROTOCOL",
            "MIKROTIK_PORT_APISSL",
        ] {
            unsafe { std::env::remove_var(var) };
        }
        let config = Config {
            host: "10.0.0.1".into(),
            password: "hunter2".into(),
            allow_insecure: true,
            ..Config::default()
        };
        assert!(config.resolve().is_ok());
    }

    #[test]
    fn missing_host_is_rejected_even_with_allow_insecure() {
        for var in ["MIKROTIK_HOST", "MIKROTIK_USER", "MIKROTIK_PASS", "MIKROTIK_PORT"] {
            unsafe { std::env::remove_var(var) };
        }
        let config = Config {
            allow_insecure: true,
            ..Config::default()
        };
        assert!(matches!(config.resolve(), Err(Error::Config(_))));
    }
}
