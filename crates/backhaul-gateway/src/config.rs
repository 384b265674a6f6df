//! Gateway configuration

pub use backhaul_control::listener::DEFAULT_WAIT_TIMEOUT;
pub use backhaul_transport::link::DEFAULT_IDLE_TIMEOUT;
use backhaul_transport::LinkConfig;
use std::net::SocketAddr;
use std::time::Duration;

use crate::GatewayError;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address for both tunnel endpoints and end-user traffic
    pub listen_addr: SocketAddr,

    /// Shared secret agents must present; `None` accepts any agent
    pub password: Option<String>,

    /// How long an end-user request waits for a tunnel stream
    pub wait_timeout: Duration,

    /// Tunnel connections silent for this long are aborted
    pub idle_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            password: None,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl GatewayConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    /// Require agents to present `password`; an empty string disables the check
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        let password = password.into();
        self.password = if password.is_empty() {
            None
        } else {
            Some(password)
        };
        self
    }

    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.wait_timeout.is_zero() {
            return Err(GatewayError::Config(
                "wait timeout must be greater than zero".to_string(),
            ));
        }
        if self.idle_timeout.is_zero() {
            return Err(GatewayError::Config(
                "idle timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Exact comparison against the configured secret
    pub fn password_matches(&self, given: Option<&str>) -> bool {
        match &self.password {
            None => true,
            Some(expected) => given == Some(expected.as_str()),
        }
    }

    pub(crate) fn link_config(&self) -> LinkConfig {
        LinkConfig::idle_timeout(self.idle_timeout)
    }
}
