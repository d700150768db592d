//! Hand-off of parsed commands to the device executor
use super::*;
use crate::{
    config::DispatchConfig,
    error::DispatchError,
    guard::SocketGuard,
    usbip_protocol::{CommonHeader, SubmitCommand, BUSID_LEN, COMMON_HEADER_LEN},
};
use std::time::Duration;
use tokio::sync::{
    mpsc::{self, error::SendTimeoutError},
    oneshot,
};

/// Body of a control request
#[derive(Debug)]
pub enum ControlCommand {
    /// The executor signals `replied` once OP_REP_DEVLIST went out, or
    /// could not.
    DeviceList {
        status: u32,
        replied: oneshot::Sender<()>,
    },
    /// The executor answers `true` on `confirm` once the device is attached
    /// and marked busy, `false` if it refused the import.
    Import {
        status: u32,
        busid: [u8; BUSID_LEN],
        confirm: oneshot::Sender<bool>,
    },
    /// A control code this bridge does not know; forwarded without a body
    Unknown,
}

/// Message on the control channel
pub struct ControlRequest {
    pub header: CommonHeader,
    pub raw_header: [u8; COMMON_HEADER_LEN],
    pub command: ControlCommand,
    /// Where replies go
    pub reply: SocketGuard,
}

/// Message on the data channel: exactly one decoded submit
pub struct SubmitRequest {
    pub command: SubmitCommand,
    pub reply: SocketGuard,
}

/// Sending side, held by the session driver
#[derive(Clone)]
pub struct DispatchBridge {
    control: mpsc::Sender<ControlRequest>,
    data: mpsc::Sender<SubmitRequest>,
    submit_wait: Duration,
}

/// Receiving side, held by the device executor
pub struct ExecutorPorts {
    pub control: mpsc::Receiver<ControlRequest>,
    pub data: mpsc::Receiver<SubmitRequest>,
}

/// Creates both channels of the bridge.
pub fn channel(config: &DispatchConfig) -> (DispatchBridge, ExecutorPorts) {
    let (control_tx, control_rx) = mpsc::channel(config.control_depth.max(1));
    let (data_tx, data_rx) = mpsc::channel(config.data_depth.max(1));
    (
        DispatchBridge {
            control: control_tx,
            data: data_tx,
            submit_wait: config.submit_wait,
        },
        ExecutorPorts {
            control: control_rx,
            data: data_rx,
        },
    )
}

impl DispatchBridge {
    /// Posts a control command.
    ///
    /// Waits for room as long as it takes: imports are rare and must stay
    /// ordered before the URBs that follow them.
    pub async fn post_control(&self, request: ControlRequest) -> Result<(), DispatchError> {
        self.control
            .send(request)
            .await
            .map_err(|_| DispatchError::ExecutorUnavailable)
    }

    /// Posts a submit, waiting at most the configured submit wait for room.
    ///
    /// A submit that cannot be posted is dropped by the caller; it is never
    /// retried since the peer's sequence numbers have moved on.
    pub async fn post_submit(&self, request: SubmitRequest) -> Result<(), DispatchError> {
        match self.data.send_timeout(request, self.submit_wait).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(DispatchError::Full),
            Err(SendTimeoutError::Closed(_)) => Err(DispatchError::ExecutorUnavailable),
        }
    }
}
