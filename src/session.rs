//! Per-connection state machine.
//!
//! A session reads commands off the socket strictly in order. While
//! [Phase::Idle] only control commands (device list, import) are accepted;
//! once the executor confirms an import it switches to [Phase::Busy] and
//! only URB commands are read. The session owns the read half; the write
//! half lives in a [SocketGuard] shared with the device executor.
use super::*;
use crate::{
    config::ServerConfig,
    device::DeviceState,
    dispatch::{ControlCommand, ControlRequest, DispatchBridge, SubmitRequest},
    executor::DeviceExecutor,
    guard::SocketGuard,
    usbip_protocol::{
        Command, CommonHeader, ImportRequest, SubmitCommand, SubmitParams, UnlinkParams,
        UnlinkReply, UsbIpHeaderBasic, COMMON_HEADER_LEN, DEVLIST_BODY_LEN, IMPORT_BODY_LEN,
        SUBMIT_PARAMS_LEN, UNLINK_PARAMS_LEN, URB_HEADER_LEN,
    },
};
use std::io::{ErrorKind, Result};
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::oneshot;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// No device imported, control commands only
    Idle,
    /// Device imported, URB commands only
    Busy,
}

/// How a session ended when the socket itself did not fail
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// Peer closed while idle, e.g. after a device list query
    Closed,
    /// Peer closed while the device was imported
    Detached,
}

/// What every session shares with the acceptor and the executor
#[derive(Clone)]
pub struct SessionContext {
    pub bridge: DispatchBridge,
    pub state: Arc<DeviceState>,
    pub executor: Arc<dyn DeviceExecutor>,
    pub config: Arc<ServerConfig>,
}

enum Recv {
    Frame,
    Closed,
    TimedOut,
}

enum Step {
    Continue,
    End(SessionEnd),
}

/// Runs one session over `socket` until the peer leaves or the socket fails.
pub async fn handle<S>(socket: S, ctx: SessionContext) -> Result<SessionEnd>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = split(socket);
    let guard = SocketGuard::new(writer, ctx.config.send_timeout);
    Session::new(reader, guard, ctx).run().await
}

pub struct Session<R> {
    reader: R,
    guard: SocketGuard,
    phase: Phase,
    ctx: SessionContext,
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
    )
}

impl<R: AsyncRead + Unpin + Send> Session<R> {
    pub fn new(reader: R, guard: SocketGuard, ctx: SessionContext) -> Self {
        Self {
            reader,
            guard,
            phase: Phase::Idle,
            ctx,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Processes commands until the session ends, then cleans up.
    ///
    /// Only socket failures come back as errors; protocol violations and
    /// dispatch failures are logged and the offending message dropped.
    pub async fn run(&mut self) -> Result<SessionEnd> {
        info!("Session started, waiting for USB/IP commands");
        let res = loop {
            let step = match self.phase {
                Phase::Idle => self.step_idle().await,
                Phase::Busy => self.step_busy().await,
            };
            match step {
                Ok(Step::Continue) => {}
                Ok(Step::End(end)) => break Ok(end),
                Err(err) => break Err(err),
            }
        };

        match &res {
            Ok(SessionEnd::Closed) => info!("Connection closed by client"),
            Ok(SessionEnd::Detached) => info!("Connection closed while device imported, detach"),
            Err(err) => warn!("Receive loop ended due to broken socket: {:?}", err),
        }
        self.cleanup().await;
        res
    }

    /// Clears the shared device flags, releases the executor's claims and
    /// closes the socket. Calling it again is harmless.
    pub async fn cleanup(&mut self) {
        if self.ctx.state.any_pending() {
            debug!("Transfers still in flight, their completions will be dropped");
        }
        self.ctx.state.reset();
        self.ctx.executor.release();
        self.guard.close().await;
        self.phase = Phase::Idle;
        debug!("Session cleaned up");
    }

    fn peer_closed(&self) -> Step {
        match self.phase {
            Phase::Idle => Step::End(SessionEnd::Closed),
            Phase::Busy => Step::End(SessionEnd::Detached),
        }
    }

    /// Fills `buf` completely.
    ///
    /// Returns `TimedOut` only when the receive timeout passed before the
    /// first byte; once a frame has started the read keeps waiting.
    async fn recv_frame(&mut self, buf: &mut [u8]) -> Result<Recv> {
        let recv_timeout = self.ctx.config.recv_timeout;
        let mut filled = 0;
        while filled < buf.len() {
            match tokio::time::timeout(recv_timeout, self.reader.read(&mut buf[filled..])).await {
                Ok(Ok(0)) => return Ok(Recv::Closed),
                Ok(Ok(n)) => filled += n,
                Ok(Err(err)) if is_transient(&err) => {
                    if filled == 0 {
                        return Ok(Recv::TimedOut);
                    }
                }
                Ok(Err(err)) => return Err(err),
                Err(_) => {
                    if filled == 0 {
                        return Ok(Recv::TimedOut);
                    }
                    trace!(
                        "Receive timeout inside a frame ({} of {} bytes), still waiting",
                        filled,
                        buf.len()
                    );
                }
            }
        }
        Ok(Recv::Frame)
    }

    /// Fills `buf` completely, riding out receive timeouts. `false` when
    /// the peer closed first.
    async fn recv_body(&mut self, buf: &mut [u8]) -> Result<bool> {
        loop {
            match self.recv_frame(buf).await? {
                Recv::Frame => return Ok(true),
                Recv::Closed => return Ok(false),
                Recv::TimedOut => trace!("Receive timeout before body, still waiting"),
            }
        }
    }

    /// Reads and throws away `len` bytes. `false` when the peer closed first.
    async fn discard(&mut self, len: u64) -> Result<bool> {
        let mut limited = (&mut self.reader).take(len);
        let copied = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
        Ok(copied == len)
    }

    async fn step_idle(&mut self) -> Result<Step> {
        let mut raw = [0u8; COMMON_HEADER_LEN];
        match self.recv_frame(&mut raw).await? {
            Recv::TimedOut => {
                debug!("Socket receive timeout, continuing to wait for data");
                return Ok(Step::Continue);
            }
            Recv::Closed => return Ok(self.peer_closed()),
            Recv::Frame => {}
        }

        let header = match CommonHeader::decode(&raw) {
            Ok(header) => header,
            Err(err) => {
                warn!("Discarding control header: {}", err);
                return Ok(Step::Continue);
            }
        };
        trace!(
            "Got control header version={:#06x} command={:#06x}",
            header.version,
            header.command
        );

        if header.version != self.ctx.config.protocol_version {
            warn!(
                "Invalid USB/IP version {:#06x} (expected {:#06x}), discarding",
                header.version, self.ctx.config.protocol_version
            );
            return Ok(Step::Continue);
        }

        match Command::from_op_code(header.command) {
            Command::DeviceList => self.device_list(header, raw).await,
            Command::Import => self.import(header, raw).await,
            other => {
                debug!("Forwarding unknown control command {:?}", other);
                self.post_control(header, raw, ControlCommand::Unknown)
                    .await;
                Ok(Step::Continue)
            }
        }
    }

    async fn device_list(
        &mut self,
        header: CommonHeader,
        raw: [u8; COMMON_HEADER_LEN],
    ) -> Result<Step> {
        debug!("Got OP_REQ_DEVLIST");
        let mut body = [0u8; DEVLIST_BODY_LEN];
        // The status word carries nothing; a peer that half-closes right
        // after the header still gets its list.
        let complete = self.recv_body(&mut body).await?;
        let status = u32::from_be_bytes(body);
        let (replied, reply_sent) = oneshot::channel();
        let posted = self
            .post_control(header, raw, ControlCommand::DeviceList { status, replied })
            .await;
        if complete {
            return Ok(Step::Continue);
        }

        // cleanup closes the socket, so the reply has to be out first
        if posted {
            let wait = self.ctx.config.import_wait;
            if tokio::time::timeout(wait, reply_sent).await.is_err() {
                warn!("Device list not answered within {:?}, closing anyway", wait);
            }
        }
        Ok(self.peer_closed())
    }

    async fn import(&mut self, header: CommonHeader, raw: [u8; COMMON_HEADER_LEN]) -> Result<Step> {
        let mut body = [0u8; IMPORT_BODY_LEN];
        if !self.recv_body(&mut body).await? {
            return Ok(self.peer_closed());
        }
        let request = match ImportRequest::decode(&body) {
            Ok(request) => request,
            Err(err) => {
                warn!("Discarding OP_REQ_IMPORT: {}", err);
                return Ok(Step::Continue);
            }
        };
        info!("Got OP_REQ_IMPORT for bus id {:?}", request.busid_str());

        let (confirm, confirmed) = oneshot::channel();
        let command = ControlCommand::Import {
            status: request.status,
            busid: request.busid,
            confirm,
        };
        if !self.post_control(header, raw, command).await {
            return Ok(Step::Continue);
        }

        let wait = self.ctx.config.import_wait;
        match tokio::time::timeout(wait, confirmed).await {
            Ok(Ok(true)) => {
                self.phase = Phase::Busy;
                info!("Device imported, switching to URB mode");
            }
            Ok(Ok(false)) => info!("Import refused by the device executor, staying idle"),
            Ok(Err(_)) => warn!("Device executor dropped the import request, staying idle"),
            Err(_) => warn!(
                "Import not confirmed within {:?}, staying idle; URBs that follow will be misread",
                wait
            ),
        }
        Ok(Step::Continue)
    }

    async fn post_control(
        &self,
        header: CommonHeader,
        raw_header: [u8; COMMON_HEADER_LEN],
        command: ControlCommand,
    ) -> bool {
        let request = ControlRequest {
            header,
            raw_header,
            command,
            reply: self.guard.clone(),
        };
        match self.ctx.bridge.post_control(request).await {
            Ok(()) => {
                trace!("Posted control command {:#06x}", header.command);
                true
            }
            Err(err) => {
                error!(
                    "Failed to post control command {:#06x}: {}; was the device executor started?",
                    header.command, err
                );
                false
            }
        }
    }

    async fn step_busy(&mut self) -> Result<Step> {
        let mut raw = [0u8; URB_HEADER_LEN];
        match self.recv_frame(&mut raw).await? {
            Recv::TimedOut => {
                debug!("URB socket receive timeout, continuing to wait");
                return Ok(Step::Continue);
            }
            Recv::Closed => return Ok(self.peer_closed()),
            Recv::Frame => {}
        }

        let header = match UsbIpHeaderBasic::decode(&raw) {
            Ok(header) => header,
            Err(err) => {
                warn!("Discarding URB header: {}", err);
                return Ok(Step::Continue);
            }
        };
        trace!("Got URB header {:?}", header);

        match Command::from_urb_command(header.command) {
            Command::Submit => self.submit(header).await,
            Command::Unlink => self.unlink(header).await,
            _ => {
                warn!(
                    "Unknown URB command {:#010x} (seqnum {}), discarding",
                    header.command, header.seqnum
                );
                Ok(Step::Continue)
            }
        }
    }

    async fn submit(&mut self, header: UsbIpHeaderBasic) -> Result<Step> {
        let mut raw = [0u8; SUBMIT_PARAMS_LEN];
        if !self.recv_body(&mut raw).await? {
            return Ok(self.peer_closed());
        }
        let params = match SubmitParams::parse(&raw) {
            Ok(params) => params,
            Err(err) => {
                warn!("Discarding USBIP_CMD_SUBMIT seqnum {}: {}", header.seqnum, err);
                return Ok(Step::Continue);
            }
        };

        if let Err(err) = params.check_bounds(self.ctx.config.max_transfer) {
            warn!("Dropping USBIP_CMD_SUBMIT seqnum {}: {}", header.seqnum, err);
            // skip what the peer already put on the wire for it
            let on_wire = params.payload_len(&header) + params.iso_descriptor_len();
            if !self.discard(on_wire).await? {
                return Ok(self.peer_closed());
            }
            return Ok(Step::Continue);
        }

        let mut data = vec![0u8; params.payload_len(&header) as usize];
        if !self.recv_body(&mut data).await? {
            return Ok(self.peer_closed());
        }
        let mut iso_packet_descriptor = vec![0u8; params.iso_descriptor_len() as usize];
        if !self.recv_body(&mut iso_packet_descriptor).await? {
            return Ok(self.peer_closed());
        }
        debug!(
            "Got USBIP_CMD_SUBMIT seqnum {} ep {} {} length {}",
            header.seqnum,
            header.ep,
            if header.is_out() { "OUT" } else { "IN" },
            params.transfer_buffer_length
        );

        let request = SubmitRequest {
            command: SubmitCommand {
                header,
                params,
                data,
                iso_packet_descriptor,
            },
            reply: self.guard.clone(),
        };
        if let Err(err) = self.ctx.bridge.post_submit(request).await {
            error!(
                "Failed to post USBIP_CMD_SUBMIT seqnum {}: {}, dropping it",
                header.seqnum, err
            );
        }
        Ok(Step::Continue)
    }

    async fn unlink(&mut self, header: UsbIpHeaderBasic) -> Result<Step> {
        let mut raw = [0u8; UNLINK_PARAMS_LEN];
        if !self.recv_body(&mut raw).await? {
            return Ok(self.peer_closed());
        }
        let params = match UnlinkParams::decode(&raw) {
            Ok(params) => params,
            Err(err) => {
                warn!("Discarding USBIP_CMD_UNLINK seqnum {}: {}", header.seqnum, err);
                return Ok(Step::Continue);
            }
        };
        debug!(
            "Got USBIP_CMD_UNLINK seqnum {} for seqnum {}",
            header.seqnum, params.unlink_seqnum
        );

        self.ctx.executor.unlink(params.unlink_seqnum);
        let reply = UnlinkReply::new(header.seqnum, 0);
        self.guard.send(&reply.to_bytes()).await?;
        trace!("Sent USBIP_RET_UNLINK seqnum {}", header.seqnum);
        Ok(Step::Continue)
    }
}
