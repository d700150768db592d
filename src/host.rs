//! Device executor forwarding URBs to a USB device of the host through libusb
use super::*;
use crate::{
    config::ServerConfig,
    consts::{EndpointAttributes, UsbSpeed, ENDPOINT_DIR_IN},
    device::{DeviceState, ExportedDevice, ExportedInterface},
    dispatch::{ControlCommand, ControlRequest, ExecutorPorts, SubmitRequest},
    error::{Error, Result},
    executor::DeviceExecutor,
    setup::SetupPacket,
    usbip_protocol::{SubmitCommand, UsbIpHeaderBasic, UsbIpResponse},
};
use num_traits::FromPrimitive;
use rusb::{Device, DeviceHandle, GlobalContext};
use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle};

const TRANSFER_TIMEOUT: Duration = Duration::from_secs(1);

const EPIPE: i32 = 32;
const ENODEV: i32 = 19;
const EIO: i32 = 5;
const ETIMEDOUT: i32 = 110;
const EOPNOTSUPP: i32 = 95;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_lock<T>(rwlock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(rwlock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rwlock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Maps a libusb failure to the errno reported in RET_SUBMIT
fn errno(err: rusb::Error) -> i32 {
    match err {
        rusb::Error::Pipe => EPIPE,
        rusb::Error::Timeout => ETIMEDOUT,
        rusb::Error::NoDevice => ENODEV,
        rusb::Error::NotSupported => EOPNOTSUPP,
        _ => EIO,
    }
}

/// bcdDevice as it appears in the device descriptor
fn version_bcd(version: rusb::Version) -> u16 {
    let major = version.major() as u16;
    ((major / 10) << 12)
        | ((major % 10) << 8)
        | ((version.minor() as u16 & 0x0f) << 4)
        | (version.sub_minor() as u16 & 0x0f)
}

/// Endpoint address whose URBs must complete in submit order. Both
/// directions of the default control pipe share one queue.
fn queue_key(header: &UsbIpHeaderBasic) -> u8 {
    let number = (header.ep & 0x0f) as u8;
    match (number, header.is_out()) {
        (0, _) => 0,
        (number, true) => number,
        (number, false) => number | ENDPOINT_DIR_IN,
    }
}

/// The blocking libusb calls the executor makes.
///
/// All of them take `&self`; transfers on different endpoints may run at
/// the same time.
pub trait UsbHandle: Send + Sync + 'static {
    fn claim_interface(&self, iface: u8) -> rusb::Result<()>;
    fn release_interface(&self, iface: u8) -> rusb::Result<()>;
    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;
    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;
    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize>;
    fn write_bulk(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> rusb::Result<usize>;
    fn read_interrupt(&self, endpoint: u8, buf: &mut [u8], timeout: Duration)
        -> rusb::Result<usize>;
    fn write_interrupt(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> rusb::Result<usize>;
}

impl UsbHandle for DeviceHandle<GlobalContext> {
    fn claim_interface(&self, iface: u8) -> rusb::Result<()> {
        DeviceHandle::claim_interface(self, iface)
    }

    fn release_interface(&self, iface: u8) -> rusb::Result<()> {
        DeviceHandle::release_interface(self, iface)
    }

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        DeviceHandle::read_control(self, request_type, request, value, index, buf, timeout)
    }

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        DeviceHandle::write_control(self, request_type, request, value, index, buf, timeout)
    }

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        DeviceHandle::read_bulk(self, endpoint, buf, timeout)
    }

    fn write_bulk(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> rusb::Result<usize> {
        DeviceHandle::write_bulk(self, endpoint, buf, timeout)
    }

    fn read_interrupt(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        DeviceHandle::read_interrupt(self, endpoint, buf, timeout)
    }

    fn write_interrupt(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> rusb::Result<usize> {
        DeviceHandle::write_interrupt(self, endpoint, buf, timeout)
    }
}

/// Claims `numbers` in order. On failure the ones already claimed are
/// released again.
fn claim_interfaces<H: UsbHandle>(handle: &RwLock<H>, numbers: &[u8]) -> rusb::Result<()> {
    let handle = write_lock(handle);
    for (claimed, &number) in numbers.iter().enumerate() {
        if let Err(err) = handle.claim_interface(number) {
            warn!("Failed to claim interface {}: {}", number, err);
            for &number in &numbers[..claimed] {
                handle.release_interface(number).ok();
            }
            return Err(err);
        }
    }
    Ok(())
}

fn release_interfaces<H: UsbHandle>(handle: &RwLock<H>, numbers: &[u8]) {
    let handle = write_lock(handle);
    for &number in numbers {
        if let Err(err) = handle.release_interface(number) {
            debug!("Failed to release interface {}: {}", number, err);
        }
    }
}

#[derive(Debug, Default)]
struct Urbs {
    /// Submitted and not yet completed
    in_flight: HashSet<u32>,
    /// In flight when unlinked; their completion is not reported
    unlinked: HashSet<u32>,
}

impl Urbs {
    fn clear(&mut self) {
        self.in_flight.clear();
        self.unlinked.clear();
    }
}

/// A host USB device exported over USB/IP
pub struct HostExecutor<H = DeviceHandle<GlobalContext>> {
    /// Transfers take the read side, claim and release the write side
    handle: Arc<RwLock<H>>,
    device: ExportedDevice,
    /// Transfer type of every endpoint address in the active configuration
    endpoints: HashMap<u8, EndpointAttributes>,
    interface_numbers: Vec<u8>,
    claimed: Mutex<Vec<u8>>,
    /// A release still running on the blocking pool
    releasing: Mutex<Option<JoinHandle<()>>>,
    urbs: Mutex<Urbs>,
    /// One ordered queue per endpoint address
    workers: Mutex<HashMap<u8, mpsc::UnboundedSender<SubmitRequest>>>,
    state: Arc<DeviceState>,
    max_transfer: usize,
}

impl HostExecutor {
    /// Opens the first host device with the given vendor and product id.
    pub fn open(
        vendor_id: u16,
        product_id: u16,
        state: Arc<DeviceState>,
        config: &ServerConfig,
    ) -> Result<Self> {
        let device = rusb::devices()?
            .iter()
            .find(|dev| {
                dev.device_descriptor()
                    .map(|desc| desc.vendor_id() == vendor_id && desc.product_id() == product_id)
                    .unwrap_or(false)
            })
            .ok_or(Error::Usb(rusb::Error::NotFound))?;
        Self::from_device(device, state, config)
    }

    pub fn from_device(
        dev: Device<GlobalContext>,
        state: Arc<DeviceState>,
        config: &ServerConfig,
    ) -> Result<Self> {
        let desc = dev.device_descriptor()?;
        let cfg = dev.active_config_descriptor()?;
        let handle = dev.open()?;
        handle.set_auto_detach_kernel_driver(true).ok();

        let mut interfaces = vec![];
        let mut interface_numbers = vec![];
        let mut endpoints = HashMap::new();
        for intf in cfg.interfaces() {
            // ignore alternate settings
            let Some(intf_desc) = intf.descriptors().next() else {
                continue;
            };
            interface_numbers.push(intf_desc.interface_number());
            for ep_desc in intf_desc.endpoint_descriptors() {
                if let Some(attributes) = EndpointAttributes::from_u8(ep_desc.transfer_type() as u8)
                {
                    endpoints.insert(ep_desc.address(), attributes);
                }
            }
            interfaces.push(ExportedInterface {
                interface_class: intf_desc.class_code(),
                interface_subclass: intf_desc.sub_class_code(),
                interface_protocol: intf_desc.protocol_code(),
            });
        }

        let bus_id = format!("{}-{}", dev.bus_number(), dev.port_number());
        let device = ExportedDevice {
            path: format!("/sys/bus/usb/devices/{}", bus_id),
            bus_id,
            bus_num: dev.bus_number() as u32,
            dev_num: dev.address() as u32,
            speed: UsbSpeed::from(dev.speed()) as u32,
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            device_bcd: version_bcd(desc.device_version()),
            device_class: desc.class_code(),
            device_subclass: desc.sub_class_code(),
            device_protocol: desc.protocol_code(),
            configuration_value: cfg.number(),
            num_configurations: desc.num_configurations(),
            interfaces,
        };
        info!(
            "Exporting {:04x}:{:04x} as bus id {}",
            device.vendor_id, device.product_id, device.bus_id
        );

        Ok(Self::new(
            handle,
            device,
            endpoints,
            interface_numbers,
            state,
            config,
        ))
    }
}

impl<H: UsbHandle> HostExecutor<H> {
    fn new(
        handle: H,
        device: ExportedDevice,
        endpoints: HashMap<u8, EndpointAttributes>,
        interface_numbers: Vec<u8>,
        state: Arc<DeviceState>,
        config: &ServerConfig,
    ) -> Self {
        Self {
            handle: Arc::new(RwLock::new(handle)),
            device,
            endpoints,
            interface_numbers,
            claimed: Mutex::new(vec![]),
            releasing: Mutex::new(None),
            urbs: Mutex::new(Urbs::default()),
            workers: Mutex::new(HashMap::new()),
            state,
            max_transfer: config.max_transfer,
        }
    }

    /// Serves both dispatch channels until the sending side goes away.
    pub async fn run(self: Arc<Self>, mut ports: ExecutorPorts) {
        info!("Device executor started for bus id {}", self.device.bus_id);
        loop {
            tokio::select! {
                Some(req) = ports.control.recv() => self.handle_control(req).await,
                Some(req) = ports.data.recv() => self.handle_submit(req),
                else => break,
            }
        }
        info!("Dispatch bridge closed, device executor stopped");
    }

    async fn handle_control(&self, req: ControlRequest) {
        let ControlRequest {
            header,
            command,
            reply,
            ..
        } = req;
        match command {
            ControlCommand::DeviceList { replied, .. } => {
                let response = UsbIpResponse::op_rep_devlist(
                    header.version,
                    std::slice::from_ref(&self.device),
                );
                match reply.send(&response.to_bytes()).await {
                    Ok(()) => debug!("Sent OP_REP_DEVLIST"),
                    Err(err) => warn!("Failed to send OP_REP_DEVLIST: {:?}", err),
                }
                replied.send(()).ok();
            }
            ControlCommand::Import { busid, confirm, .. } => {
                let accepted = if !self.device.matches_busid(&busid) {
                    warn!("Import of unknown bus id {:?}", busid);
                    false
                } else if self.state.is_busy() {
                    warn!("Device {} is in use", self.device.bus_id);
                    false
                } else {
                    self.claim().await
                };

                let response = if accepted {
                    lock(&self.urbs).clear();
                    self.state.set_busy(true);
                    UsbIpResponse::op_rep_import_success(header.version, &self.device)
                } else {
                    UsbIpResponse::op_rep_import_fail(header.version)
                };
                let sent = match reply.send(&response.to_bytes()).await {
                    Ok(()) => {
                        debug!("Sent OP_REP_IMPORT (accepted: {})", accepted);
                        true
                    }
                    Err(err) => {
                        warn!("Failed to send OP_REP_IMPORT: {:?}", err);
                        false
                    }
                };
                if accepted && !sent {
                    self.state.set_busy(false);
                    self.release();
                    self.wait_released().await;
                }
                if confirm.send(accepted && sent).is_err() {
                    warn!("Session stopped waiting for the import confirmation");
                }
            }
            ControlCommand::Unknown => {
                warn!("Unknown control command {:#06x}, ignoring", header.command)
            }
        }
    }

    /// Claims every interface of the active configuration. On failure
    /// nothing stays claimed.
    async fn claim(&self) -> bool {
        self.wait_released().await;
        let handle = self.handle.clone();
        let numbers = self.interface_numbers.clone();
        match tokio::task::spawn_blocking(move || claim_interfaces(&handle, &numbers)).await {
            Ok(Ok(())) => {
                *lock(&self.claimed) = self.interface_numbers.clone();
                true
            }
            Ok(Err(_)) => false,
            Err(err) => {
                error!("Claim task died: {}", err);
                false
            }
        }
    }

    /// Waits for a release started by [DeviceExecutor::release].
    async fn wait_released(&self) {
        let task = lock(&self.releasing).take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                error!("Release task died: {}", err);
            }
        }
    }

    /// Queues a submit behind the ones already pending on its endpoint.
    fn handle_submit(self: &Arc<Self>, req: SubmitRequest) {
        let header = req.command.header;
        lock(&self.urbs).in_flight.insert(header.seqnum);
        self.state.mark_pending(header.ep);

        let key = queue_key(&header);
        let mut workers = lock(&self.workers);
        let queue = workers.entry(key).or_insert_with(|| self.spawn_worker(key));
        if queue.send(req).is_err() {
            error!(
                "Transfer worker for endpoint {:#04x} is gone, dropping seqnum {}",
                key, header.seqnum
            );
            workers.remove(&key);
            lock(&self.urbs).in_flight.remove(&header.seqnum);
            self.state.clear_pending(header.ep);
        }
    }

    fn spawn_worker(self: &Arc<Self>, key: u8) -> mpsc::UnboundedSender<SubmitRequest> {
        let (queue, mut requests) = mpsc::unbounded_channel();
        let executor = self.clone();
        tokio::spawn(async move {
            trace!("Transfer worker for endpoint {:#04x} started", key);
            while let Some(req) = requests.recv().await {
                executor.complete(req).await;
            }
            trace!("Transfer worker for endpoint {:#04x} stopped", key);
        });
        queue
    }

    /// Runs one queued submit and reports its completion.
    async fn complete(self: &Arc<Self>, req: SubmitRequest) {
        let SubmitRequest { command, reply } = req;
        let seqnum = command.header.seqnum;
        let ep = command.header.ep;

        let skip = !self.state.is_busy() || lock(&self.urbs).unlinked.contains(&seqnum);
        let response = if skip {
            None
        } else {
            let executor = self.clone();
            let res = tokio::task::spawn_blocking(move || executor.transfer(&command)).await;
            Some(match res {
                Ok(Ok((actual_length, buffer))) => {
                    UsbIpResponse::usbip_ret_submit_success(seqnum, actual_length, buffer)
                }
                Ok(Err(err)) => {
                    warn!("Transfer for seqnum {} failed: {}", seqnum, err);
                    UsbIpResponse::usbip_ret_submit_fail(seqnum, errno(err))
                }
                Err(err) => {
                    error!("Transfer task for seqnum {} died: {}", seqnum, err);
                    UsbIpResponse::usbip_ret_submit_fail(seqnum, EIO)
                }
            })
        };
        self.state.clear_pending(ep);

        let unlinked = {
            let mut urbs = lock(&self.urbs);
            urbs.in_flight.remove(&seqnum);
            urbs.unlinked.remove(&seqnum)
        };
        let Some(response) = response else {
            debug!("Seqnum {} dropped before its transfer ran", seqnum);
            return;
        };
        if unlinked {
            debug!("Seqnum {} was unlinked, dropping its completion", seqnum);
            return;
        }
        match reply.send(&response.to_bytes()).await {
            Ok(()) => trace!("Sent USBIP_RET_SUBMIT seqnum {}", seqnum),
            Err(err) => warn!("Failed to send USBIP_RET_SUBMIT seqnum {}: {:?}", seqnum, err),
        }
    }

    /// Runs one transfer to completion. Returns the actual length and, for
    /// IN transfers, the data read.
    fn transfer(&self, command: &SubmitCommand) -> rusb::Result<(u32, Vec<u8>)> {
        let header = &command.header;
        let number = (header.ep & 0x0f) as u8;
        let out = header.is_out();
        let len = (command.params.transfer_buffer_length as usize).min(self.max_transfer);
        let handle = read_lock(&self.handle);

        if number == 0 {
            let setup = SetupPacket::parse(&command.params.setup);
            trace!("Control transfer {:?}", setup);
            return if out {
                let written = handle.write_control(
                    setup.request_type,
                    setup.request,
                    setup.value,
                    setup.index,
                    &command.data,
                    TRANSFER_TIMEOUT,
                )?;
                Ok((written as u32, vec![]))
            } else {
                let mut buffer = vec![0u8; len.min(setup.length as usize)];
                let read = handle.read_control(
                    setup.request_type,
                    setup.request,
                    setup.value,
                    setup.index,
                    &mut buffer,
                    TRANSFER_TIMEOUT,
                )?;
                buffer.truncate(read);
                Ok((read as u32, buffer))
            };
        }

        let address = if out { number } else { number | ENDPOINT_DIR_IN };
        let attributes = self.endpoints.get(&address).copied();
        let mut buffer = vec![0u8; if out { 0 } else { len }];
        let count = match (attributes, out) {
            (Some(EndpointAttributes::Bulk), true) => {
                handle.write_bulk(address, &command.data, TRANSFER_TIMEOUT)?
            }
            (Some(EndpointAttributes::Bulk), false) => {
                handle.read_bulk(address, &mut buffer, TRANSFER_TIMEOUT)?
            }
            (Some(EndpointAttributes::Interrupt), true) => {
                handle.write_interrupt(address, &command.data, TRANSFER_TIMEOUT)?
            }
            (Some(EndpointAttributes::Interrupt), false) => {
                handle.read_interrupt(address, &mut buffer, TRANSFER_TIMEOUT)?
            }
            // libusb's synchronous API has no isochronous transfers
            (Some(EndpointAttributes::Isochronous), _) => return Err(rusb::Error::NotSupported),
            (Some(EndpointAttributes::Control), _) | (None, _) => {
                warn!("Endpoint {:#04x} not found", address);
                return Err(rusb::Error::NotFound);
            }
        };
        buffer.truncate(count);
        Ok((count as u32, buffer))
    }
}

impl<H: UsbHandle> DeviceExecutor for HostExecutor<H> {
    fn unlink(&self, seqnum: u32) {
        let mut urbs = lock(&self.urbs);
        if urbs.in_flight.contains(&seqnum) {
            urbs.unlinked.insert(seqnum);
            debug!("Seqnum {} unlinked, its completion will be dropped", seqnum);
        } else {
            debug!("Seqnum {} is not in flight, nothing to unlink", seqnum);
        }
    }

    /// Drops the transfer queues and releases the claimed interfaces on the
    /// blocking pool. The next import waits for the release to finish.
    fn release(&self) {
        let claimed = std::mem::take(&mut *lock(&self.claimed));
        lock(&self.urbs).clear();
        lock(&self.workers).clear();
        if claimed.is_empty() {
            return;
        }

        let handle = self.handle.clone();
        let bus_id = self.device.bus_id.clone();
        let release = move || {
            release_interfaces(&handle, &claimed);
            info!("Released device {}", bus_id);
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => *lock(&self.releasing) = Some(runtime.spawn_blocking(release)),
            Err(_) => release(),
        }
    }
}
