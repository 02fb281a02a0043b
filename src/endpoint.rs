//! Camera endpoint identity.

use std::fmt;

use crate::error::ConfigError;

pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_RTSP_PORT: u16 = 554;

/// Username/password pair presented through the transport's own auth mechanism.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Credentials {
    pub username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Validated camera endpoint. Immutable once constructed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CameraEndpoint {
    host: String,
    credentials: Credentials,
    port: u16,
    rtsp_port: u16,
    model: String,
}

impl CameraEndpoint {
    pub fn new(
        host: impl Into<String>,
        credentials: Credentials,
        port: u16,
        rtsp_port: u16,
        model: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let host = host.into().trim().to_string();
        validate_host(&host)?;
        if port == 0 {
            return Err(ConfigError::ZeroPort { field: "port" });
        }
        if rtsp_port == 0 {
            return Err(ConfigError::ZeroPort { field: "rtsp_port" });
        }
        Ok(Self {
            host,
            credentials,
            port,
            rtsp_port,
            model: model.into(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn rtsp_port(&self) -> u16 {
        self.rtsp_port
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// URL host component, bracketing IPv6 literals.
    pub(crate) fn url_host(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }
}

fn validate_host(host: &str) -> Result<(), ConfigError> {
    if host.is_empty() {
        return Err(ConfigError::EmptyHost);
    }
    let forbidden = |c: char| c.is_whitespace() || matches!(c, '/' | '@' | '?' | '#');
    if host.chars().any(forbidden) || host.contains("://") {
        return Err(ConfigError::InvalidHost(host.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_scheme_hosts() {
        let creds = Credentials::new("admin", "secret");
        assert_eq!(
            CameraEndpoint::new("  ", creds.clone(), 80, 554, "m").unwrap_err(),
            ConfigError::EmptyHost
        );
        assert!(matches!(
            CameraEndpoint::new("http://cam", creds.clone(), 80, 554, "m"),
            Err(ConfigError::InvalidHost(_))
        ));
        assert!(matches!(
            CameraEndpoint::new("admin@cam", creds, 80, 554, "m"),
            Err(ConfigError::InvalidHost(_))
        ));
    }

    #[test]
    fn rejects_zero_ports() {
        let creds = Credentials::default();
        assert_eq!(
            CameraEndpoint::new("cam", creds.clone(), 0, 554, "m").unwrap_err(),
            ConfigError::ZeroPort { field: "port" }
        );
        assert_eq!(
            CameraEndpoint::new("cam", creds, 80, 0, "m").unwrap_err(),
            ConfigError::ZeroPort { field: "rtsp_port" }
        );
    }

    #[test]
    fn debug_output_redacts_password() {
        let creds = Credentials::new("admin", "hunter2");
        let endpoint = CameraEndpoint::new("10.0.0.5", creds, 80, 554, "m").unwrap();
        let rendered = format!("{endpoint:?}");
        assert!(rendered.contains("admin"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn ipv6_hosts_are_bracketed() {
        let endpoint =
            CameraEndpoint::new("fe80::1", Credentials::default(), 80, 554, "m").unwrap();
        assert_eq!(endpoint.url_host(), "[fe80::1]");
    }
}
