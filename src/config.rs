//! Server configuration
use crate::{
    error::Error,
    usbip_protocol::{DEFAULT_MAX_TRANSFER, USBIP_VERSION},
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Standard USB/IP port
pub const USBIP_PORT: u16 = 3240;

/// What happens when the client drops the connection while the device is imported
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DetachPolicy {
    /// Clean up and accept the next client
    #[default]
    GracefulReset,
    /// Clean up, then stop the server so the process can be restarted
    Restart,
}

/// TCP keepalive probing of the accepted connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Idle time before the first probe
    pub idle: Duration,
    /// Time between probes
    pub interval: Duration,
    /// Unanswered probes before the connection is dropped
    pub count: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(5),
            interval: Duration::from_secs(5),
            count: 3,
        }
    }
}

/// Sizing of the channels towards the device executor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchConfig {
    pub control_depth: usize,
    pub data_depth: usize,
    /// Longest wait for room on the data channel before a submit is dropped
    pub submit_wait: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            control_depth: 4,
            data_depth: 16,
            submit_wait: Duration::from_millis(100),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind_address: IpAddr,
    pub port: u16,
    pub listen_backlog: i32,

    /// Version a control header must carry to be accepted
    pub protocol_version: u16,

    /// How long one receive may block before the session polls again
    pub recv_timeout: Duration,
    /// Upper bound for one guarded send
    pub send_timeout: Duration,
    pub keepalive: KeepaliveConfig,
    pub nodelay: bool,
    /// Pause after a failed accept
    pub accept_backoff: Duration,

    /// How long to wait for the executor to confirm an import
    pub import_wait: Duration,
    /// Largest transfer payload accepted from the peer
    pub max_transfer: usize,
    pub detach_policy: DetachPolicy,

    pub dispatch: DispatchConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: USBIP_PORT,
            listen_backlog: 1,

            protocol_version: USBIP_VERSION,

            recv_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(5),
            keepalive: KeepaliveConfig::default(),
            nodelay: true,
            accept_backoff: Duration::from_secs(1),

            import_wait: Duration::from_secs(1),
            max_transfer: DEFAULT_MAX_TRANSFER,
            detach_policy: DetachPolicy::GracefulReset,

            dispatch: DispatchConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// Builder: set listen address and port
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_address = addr.ip();
        self.port = addr.port();
        self
    }

    /// Builder: set the accepted protocol version
    pub fn with_protocol_version(mut self, version: u16) -> Self {
        self.protocol_version = version;
        self
    }

    /// Builder: set receive poll interval
    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }

    /// Builder: set import confirmation wait
    pub fn with_import_wait(mut self, wait: Duration) -> Self {
        self.import_wait = wait;
        self
    }

    /// Builder: set transfer payload bound
    pub fn with_max_transfer(mut self, max: usize) -> Self {
        self.max_transfer = max;
        self
    }

    /// Builder: set detach policy
    pub fn with_detach_policy(mut self, policy: DetachPolicy) -> Self {
        self.detach_policy = policy;
        self
    }

    /// Builder: set channel sizing
    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Rejects values the server cannot run with
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_transfer == 0 || self.max_transfer > u32::MAX as usize {
            return Err(Error::Config(format!(
                "max_transfer must be between 1 and {}, got {}",
                u32::MAX,
                self.max_transfer
            )));
        }
        if self.listen_backlog < 1 {
            return Err(Error::Config("listen_backlog must be at least 1".into()));
        }
        if self.recv_timeout.is_zero() || self.send_timeout.is_zero() {
            return Err(Error::Config("socket timeouts must be non-zero".into()));
        }
        if self.dispatch.control_depth == 0 || self.dispatch.data_depth == 0 {
            return Err(Error::Config("dispatch channel depths must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_device() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3240);
        assert_eq!(config.listen_backlog, 1);
        assert_eq!(config.recv_timeout, Duration::from_secs(30));
        assert_eq!(config.import_wait, Duration::from_secs(1));
        assert_eq!(config.accept_backoff, Duration::from_secs(1));
        assert_eq!(config.max_transfer, 1024);
        assert_eq!(config.detach_policy, DetachPolicy::GracefulReset);
        assert!(config.nodelay);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let config = ServerConfig::default()
            .with_listen_addr(addr)
            .with_protocol_version(0x0106)
            .with_max_transfer(4096)
            .with_detach_policy(DetachPolicy::Restart);
        assert_eq!(config.listen_addr(), addr);
        assert_eq!(config.protocol_version, 0x0106);
        assert_eq!(config.max_transfer, 4096);
        assert_eq!(config.detach_policy, DetachPolicy::Restart);
    }

    #[test]
    fn validate_rejects_nonsense() {
        assert!(ServerConfig::default().with_max_transfer(0).validate().is_err());
        let config = ServerConfig {
            recv_timeout: Duration::ZERO,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
        let config = ServerConfig::default().with_dispatch(DispatchConfig {
            data_depth: 0,
            ..DispatchConfig::default()
        });
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
