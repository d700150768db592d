//! TCP front end: network bring-up, the listener and the accept loop.
//!
//! The bridge exports a single device, so only one connection is served at a
//! time. Further clients wait in the listen backlog until the running session
//! ends.
use super::*;
use crate::{
    config::{DetachPolicy, KeepaliveConfig, ServerConfig},
    device::DeviceState,
    dispatch::DispatchBridge,
    error::{Error, Result},
    executor::DeviceExecutor,
    session::{self, SessionContext, SessionEnd},
};
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpStream};

/// Whatever must come up before the listener can be created
pub trait NetworkLink: Send + Sync {
    fn bring_up(&self) -> std::io::Result<()>;
}

/// The host's network stack, already up when the process starts
#[derive(Clone, Copy, Debug, Default)]
pub struct HostNetwork;

impl NetworkLink for HostNetwork {
    fn bring_up(&self) -> std::io::Result<()> {
        debug!("Using the host network stack");
        Ok(())
    }
}

/// A USB/IP server exporting one device.
pub struct UsbIpServer {
    ctx: SessionContext,
}

impl UsbIpServer {
    pub fn new(
        config: ServerConfig,
        bridge: DispatchBridge,
        state: Arc<DeviceState>,
        executor: Arc<dyn DeviceExecutor>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            ctx: SessionContext {
                bridge,
                state,
                executor,
                config: Arc::new(config),
            },
        })
    }

    /// Creates the listening socket.
    pub fn bind(&self) -> Result<TcpListener> {
        let addr = self.ctx.config.listen_addr();
        let listen = || -> std::io::Result<TcpListener> {
            let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
            socket.set_reuse_address(true)?;
            socket.bind(&addr.into())?;
            socket.listen(self.ctx.config.listen_backlog)?;
            socket.set_nonblocking(true)?;
            TcpListener::from_std(socket.into())
        };
        let listener = listen().map_err(|source| Error::Bind { addr, source })?;
        info!(
            "Listening on {:?}",
            listener.local_addr().unwrap_or(addr)
        );
        Ok(listener)
    }

    /// Accepts clients one after another and runs each session to its end.
    ///
    /// Accept failures are retried after a pause. Returns only when a detach
    /// happens under [DetachPolicy::Restart].
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let backoff = self.ctx.config.accept_backoff;
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("Accept failed: {:?}, retrying in {:?}", err, backoff);
                    tokio::time::sleep(backoff).await;
                    continue;
                }
            };
            info!("Got connection from {:?}", peer);
            self.configure_stream(&stream);

            let res = session::handle(stream, self.ctx.clone()).await;
            info!("Handler ended with {:?}", res);

            if let Ok(SessionEnd::Detached) = res {
                if self.ctx.config.detach_policy == DetachPolicy::Restart {
                    warn!("Device detached, stopping for restart");
                    return Err(Error::RestartRequired);
                }
            }
            info!("Ready for a new connection");
        }
    }

    /// Keepalive and no-delay on an accepted connection. Failures are logged
    /// and the connection used as is.
    fn configure_stream(&self, stream: &TcpStream) {
        let config = &self.ctx.config;
        if let Err(err) = SockRef::from(stream).set_tcp_keepalive(&keepalive_params(&config.keepalive)) {
            warn!("Failed to enable TCP keepalive: {:?}", err);
        }
        if let Err(err) = stream.set_nodelay(config.nodelay) {
            warn!("Failed to set TCP_NODELAY: {:?}", err);
        }
    }
}

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd"
))]
fn keepalive_params(config: &KeepaliveConfig) -> TcpKeepalive {
    TcpKeepalive::new()
        .with_time(config.idle)
        .with_interval(config.interval)
        .with_retries(config.count)
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd"
)))]
fn keepalive_params(config: &KeepaliveConfig) -> TcpKeepalive {
    TcpKeepalive::new().with_time(config.idle)
}

/// Brings the network up, then binds and serves until a fatal error.
pub async fn run(link: &dyn NetworkLink, server: &UsbIpServer) -> Result<()> {
    link.bring_up().map_err(Error::NetworkBringUp)?;
    info!("Network is up");
    let listener = server.bind()?;
    server.serve(listener).await
}
