//! USB device engine
//!
//! [`UsbDevice`] owns the controller, the VBUS sense line and the
//! device/protocol driver, and runs the whole show from a single
//! interrupt vector. Each call to [`UsbDevice::service`] consumes at
//! most one event category, in a fixed priority order; if several
//! categories are pending the vector re-fires and the next call picks
//! up the next one.

use crate::control::{ControlPhase, ControlState};
use crate::endpoint::{encode_config, CONTROL_ENDPOINT, CONTROL_MAX_PACKET_SIZE, MAX_ENDPOINT};
use crate::setup::{SetupPacket, SETUP_PACKET_LEN};
use crate::traits::UsbDeviceDriver;
use zeugma_hal::{
    DeviceFlag, DmaCommand, DmaDescriptor, EndpointFlag, EndpointRequest, UsbController, VbusSense,
};

/// Conditions the design treats as unreachable under correct operation
///
/// These are recorded rather than panicked on: the machine re-arms
/// itself and the host sees at worst a STALL, but an integrator polling
/// [`UsbDevice::take_internal_error`] can tell something went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InternalError {
    /// The control endpoint raised an interrupt no checker claimed
    UnhandledControlEvent,
    /// An endpoint was asked for with settings that encode to null
    InvalidEndpointConfig,
    /// The hardware rejected an endpoint configuration
    EndpointNotConfigured,
    /// `attach` called before `init`
    AttachBeforeInit,
    /// A VBUS change fired before `init`
    VbusChangeBeforeInit,
    /// `transfer` called before the host selected a configuration
    TransferWhileUnconfigured,
}

/// The USB device engine
///
/// One instance exists per controller peripheral. It is constructed and
/// initialized before the USB interrupt is unmasked and touched only
/// from that interrupt afterwards, so it needs no locking.
pub struct UsbDevice<C, V, D> {
    controller: C,
    vbus: V,
    driver: D,
    inited: bool,
    setup: SetupPacket,
    control: ControlState,
    dma_in_use: u16,
    vbus_changed: bool,
    last_error: Option<InternalError>,
}

impl<C, V, D> UsbDevice<C, V, D>
where
    C: UsbController,
    V: VbusSense,
    D: UsbDeviceDriver,
{
    /// Bundle a controller, a VBUS sense line and a driver into a device
    ///
    /// The VBUS state is treated as unknown at construction, so the
    /// first `service` call after `init` settles attach/detach.
    pub fn new(controller: C, vbus: V, driver: D) -> Self {
        UsbDevice {
            controller,
            vbus,
            driver,
            inited: false,
            setup: SetupPacket::default(),
            control: ControlState::new(),
            dma_in_use: 0,
            vbus_changed: true,
            last_error: None,
        }
    }

    /// Bring up the controller and leave it detached
    ///
    /// Must run before the USB interrupt is unmasked.
    pub fn init(&mut self) {
        self.controller.init_controller();
        self.inited = true;
        self.control = ControlState::new();
        self.detach_internal();
    }

    /// Present the device to the host (if VBUS is up)
    pub fn attach(&mut self) -> bool {
        if !self.inited {
            self.record_error(InternalError::AttachBeforeInit);
            return false;
        }
        self.attach_internal();
        true
    }

    /// Remove the device from the bus
    pub fn detach(&mut self) -> bool {
        if !self.inited {
            return false;
        }
        self.detach_internal();
        true
    }

    /// Note a VBUS transition; the next `service` call acts on it
    ///
    /// Call from the sense pin's edge interrupt.
    pub fn notify_vbus_changed(&mut self) {
        self.vbus_changed = true;
    }

    /// True while the cable is plugged into a live host
    pub fn is_connected(&mut self) -> bool {
        self.vbus.is_present()
    }

    /// Most recently received SETUP packet
    pub fn setup(&self) -> &SetupPacket {
        &self.setup
    }

    /// Control-transfer state (phase, configuration number)
    pub fn control(&self) -> &ControlState {
        &self.control
    }

    /// The device/protocol driver
    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Retrieve and clear the last recorded internal error
    pub fn take_internal_error(&mut self) -> Option<InternalError> {
        self.last_error.take()
    }

    /// Tear the device apart again
    pub fn release(self) -> (C, V, D) {
        (self.controller, self.vbus, self.driver)
    }

    /// True while a DMA transfer is in flight on `endpoint`
    pub fn transfer_in_flight(&self, endpoint: u8) -> bool {
        self.dma_in_use & (1 << endpoint) != 0
    }

    /// Current DMA address of an endpoint's channel
    ///
    /// Useful for sizing a partial OUT transfer that completed early.
    pub fn transfer_position(&self, endpoint: u8) -> usize {
        self.controller.dma_address(endpoint)
    }

    /// Service the controller's interrupt
    ///
    /// Checkers run in priority order; the first one that consumes an
    /// event wins and the rest wait for the vector to re-fire. Returns
    /// whether any event was consumed.
    pub fn service(&mut self) -> bool {
        if self.check_vbus_change() {
            return true;
        }
        if self.check_start_of_frame() {
            return true;
        }
        if self.check_control() {
            return true;
        }
        if self.check_endpoints() {
            return true;
        }
        if self.check_reset() {
            return true;
        }
        if self.check_wakeup_suspend() {
            return true;
        }
        false
    }

    /// Start a DMA transfer on a non-control endpoint
    ///
    /// Returns `false` (without touching the hardware) while the host
    /// has not selected a configuration. The driver's
    /// `handle_transfer_done` fires exactly once when the transfer
    /// finishes, whether it ran to completion, ended on a short packet,
    /// or was cut off by reset/disconnect.
    pub fn transfer(&mut self, endpoint: u8, mut descriptor: DmaDescriptor) -> bool {
        if self.control.configuration() == 0 {
            self.record_error(InternalError::TransferWhileUnconfigured);
            return false;
        }

        descriptor.command = DmaCommand::RunAndStop;
        descriptor.descriptor_loaded_irq = false;
        if self.controller.endpoint_is_in(endpoint) {
            // Validate the final (possibly partial) packet when the byte
            // counter empties, and use the descriptor-loaded interrupt to
            // turn the bank interrupts on at the right moment
            descriptor.end_buffer_enable = true;
            descriptor.descriptor_loaded_irq = true;
        }
        descriptor.end_buffer_irq = true;

        self.dma_in_use |= 1 << endpoint;
        self.controller.dma_load(endpoint, descriptor);

        if self.controller.endpoint_is_in(endpoint) {
            self.controller
                .enable_endpoint_flag_interrupt(endpoint, EndpointFlag::InReady);
            // Allows the DMA to close with a short packet
            self.controller
                .enable_endpoint_flag_interrupt(endpoint, EndpointFlag::ShortPacket);
        } else {
            self.controller
                .enable_endpoint_flag_interrupt(endpoint, EndpointFlag::OutReceived);
        }
        self.controller.enable_endpoint_irq(endpoint);
        self.controller.enable_dma_interrupt(endpoint);
        true
    }

    /// Configure one endpoint from the driver's requested settings
    ///
    /// Requests are clamped to the hardware limits; an index out of
    /// range leaves the endpoint unconfigured and records an error.
    pub fn init_endpoint(&mut self, endpoint: u8, request: EndpointRequest) {
        let endpoint = endpoint & 0x0F;
        let config = encode_config(endpoint, request);
        if config.is_null() {
            self.record_error(InternalError::InvalidEndpointConfig);
            return;
        }
        self.controller.configure_endpoint(endpoint, config);
        self.controller.allocate_endpoint_memory(endpoint);
        self.controller.enable_endpoint(endpoint);
        if !self.controller.endpoint_configured(endpoint) {
            self.record_error(InternalError::EndpointNotConfigured);
        }
    }

    // ---- connection and power events ----

    fn attach_internal(&mut self) {
        self.controller.unfreeze_clock();

        // Only present ourselves when VBUS is actually up
        if !self.vbus.is_present() {
            return;
        }
        self.controller.attach_line();

        self.controller
            .enable_device_interrupt(DeviceFlag::EndOfReset);
        self.controller.enable_device_interrupt(DeviceFlag::Suspend);
        self.controller.enable_device_interrupt(DeviceFlag::Wakeup);
        self.controller
            .disable_device_interrupt(DeviceFlag::StartOfFrame);
        self.controller
            .disable_device_interrupt(DeviceFlag::MicroStartOfFrame);

        // Drop stale frame and wakeup flags from before the attach
        self.controller.ack_device_flag(DeviceFlag::StartOfFrame);
        self.controller
            .ack_device_flag(DeviceFlag::MicroStartOfFrame);
        self.controller.ack_device_flag(DeviceFlag::Wakeup);
    }

    fn detach_internal(&mut self) {
        self.controller.unfreeze_clock();
        self.controller.detach_line();
        self.controller.freeze_clock();
    }

    fn check_vbus_change(&mut self) -> bool {
        if !self.vbus_changed {
            return false;
        }
        self.vbus_changed = false;

        if !self.inited {
            self.record_error(InternalError::VbusChangeBeforeInit);
            return false;
        }

        let present = self.vbus.is_present();
        if !present {
            // A disconnect mid-transfer must not strand the driver's
            // bookkeeping; finish everything that was in flight
            self.abort_in_flight_transfers();
            self.detach_internal();
        } else {
            self.attach_internal();
        }
        self.driver.handle_connection_change(present);
        true
    }

    fn check_start_of_frame(&mut self) -> bool {
        let mut handled = false;
        if self
            .controller
            .device_interrupt_enabled(DeviceFlag::StartOfFrame)
            && self.controller.device_flag(DeviceFlag::StartOfFrame)
        {
            self.controller.ack_device_flag(DeviceFlag::StartOfFrame);
            handled = true;
        }
        if self
            .controller
            .device_interrupt_enabled(DeviceFlag::MicroStartOfFrame)
            && self.controller.device_flag(DeviceFlag::MicroStartOfFrame)
        {
            self.controller
                .ack_device_flag(DeviceFlag::MicroStartOfFrame);
            handled = true;
        }
        handled
    }

    fn check_reset(&mut self) -> bool {
        if !self.controller.device_flag(DeviceFlag::EndOfReset) {
            return false;
        }
        self.reset();
        self.init_setup();
        true
    }

    fn reset(&mut self) {
        self.controller.ack_device_flag(DeviceFlag::EndOfReset);

        // Address 0 is the unaddressed default state
        self.controller.set_address(0);
        self.controller.enable_address();
        self.control.address_available = false;

        // A disconnect/reconnect can land here with transfers still open
        self.abort_in_flight_transfers();

        let request = self.driver.endpoint_config(CONTROL_ENDPOINT, false);
        self.init_endpoint(CONTROL_ENDPOINT, request);

        self.controller
            .enable_endpoint_flag_interrupt(CONTROL_ENDPOINT, EndpointFlag::SetupReceived);
        self.controller
            .enable_endpoint_flag_interrupt(CONTROL_ENDPOINT, EndpointFlag::OutReceived);
        self.controller.enable_endpoint_irq(CONTROL_ENDPOINT);
    }

    fn check_wakeup_suspend(&mut self) -> bool {
        if self.controller.device_interrupt_enabled(DeviceFlag::Wakeup)
            && self.controller.device_flag(DeviceFlag::Wakeup)
        {
            self.controller.ack_device_flag(DeviceFlag::Wakeup);
            self.controller.unfreeze_clock();
            self.controller.disable_device_interrupt(DeviceFlag::Wakeup);
            self.controller.enable_device_interrupt(DeviceFlag::Suspend);
            return true;
        }
        if self
            .controller
            .device_interrupt_enabled(DeviceFlag::Suspend)
            && self.controller.device_flag(DeviceFlag::Suspend)
        {
            self.controller.ack_device_flag(DeviceFlag::Suspend);
            self.controller
                .disable_device_interrupt(DeviceFlag::Suspend);
            self.controller.enable_device_interrupt(DeviceFlag::Wakeup);
            self.controller.freeze_clock();
            return true;
        }
        false
    }

    fn abort_in_flight_transfers(&mut self) {
        if self.dma_in_use == 0 {
            return;
        }
        for endpoint in 0..=MAX_ENDPOINT {
            if self.dma_in_use & (1 << endpoint) != 0 {
                self.dma_in_use &= !(1 << endpoint);
                self.controller.dma_stop(endpoint);
                self.driver.handle_transfer_done(endpoint);
            }
        }
    }

    // ---- control endpoint ----

    fn check_control(&mut self) -> bool {
        let ep = CONTROL_ENDPOINT;
        if !self.controller.endpoint_irq_pending(ep) {
            return false;
        }

        // NAK detection is one-shot: re-armed explicitly where needed
        self.controller
            .disable_endpoint_flag_interrupt(ep, EndpointFlag::NakIn);
        self.controller
            .disable_endpoint_flag_interrupt(ep, EndpointFlag::NakOut);

        if self.controller.endpoint_flag(ep, EndpointFlag::SetupReceived) {
            self.handle_setup_received();
        } else if self.controller.endpoint_flag(ep, EndpointFlag::InReady)
            && self
                .controller
                .endpoint_flag_interrupt_enabled(ep, EndpointFlag::InReady)
        {
            self.handle_control_tx();
        } else if self.controller.endpoint_flag(ep, EndpointFlag::OutReceived) {
            self.handle_control_rx();
        } else if self.controller.endpoint_flag(ep, EndpointFlag::NakOut) {
            self.controller.ack_endpoint_flag(ep, EndpointFlag::NakOut);
            if !self.controller.endpoint_flag(ep, EndpointFlag::InReady) {
                // During DataIn this is the expected early end of the OUT
                // side; only a handshake overrun is an error
                if self.control.phase == ControlPhase::HandshakeWaitInZlp {
                    self.controller.request_stall(ep);
                }
            }
        } else if self.controller.endpoint_flag(ep, EndpointFlag::NakIn) {
            self.controller.ack_endpoint_flag(ep, EndpointFlag::NakIn);
            if !self.controller.endpoint_flag(ep, EndpointFlag::OutReceived) {
                match self.control.phase {
                    // The host wants to end the OUT phase early; close
                    // with the status-stage ZLP
                    ControlPhase::DataOut => self.send_zlp_on_in(),
                    // Waiting for the host's OUT ZLP but it asked for
                    // more IN data instead
                    ControlPhase::HandshakeWaitOutZlp => self.controller.request_stall(ep),
                    _ => {}
                }
            }
        } else {
            self.record_error(InternalError::UnhandledControlEvent);
        }

        true
    }

    fn handle_setup_received(&mut self) {
        let ep = CONTROL_ENDPOINT;

        let mut raw = [0u8; SETUP_PACKET_LEN];
        self.controller.read_fifo(ep, &mut raw);
        self.setup = SetupPacket::parse(&raw);

        if !self.driver.handle_setup_packet(&self.setup, &mut self.control) {
            self.control.phase = ControlPhase::StallRequested;
            self.controller.request_stall(ep);
            self.controller
                .ack_endpoint_flag(ep, EndpointFlag::SetupReceived);
            return;
        }
        self.controller
            .ack_endpoint_flag(ep, EndpointFlag::SetupReceived);

        if self.setup.is_device_to_host() {
            self.control.phase = ControlPhase::DataIn;
            // Fill the first packet now so it is ready before the host polls
            self.handle_control_tx();
        } else if self.setup.length == 0 {
            // No data stage: the status stage is an IN ZLP
            self.send_zlp_on_in();
        } else {
            self.control.phase = ControlPhase::DataOut;
            // Watch for the host ending the OUT phase early
            self.controller.ack_endpoint_flag(ep, EndpointFlag::NakIn);
            self.controller
                .enable_endpoint_flag_interrupt(ep, EndpointFlag::NakIn);
        }
    }

    /// Send the status-stage ZLP on IN and watch for OUT overruns
    fn send_zlp_on_in(&mut self) {
        let ep = CONTROL_ENDPOINT;
        self.control.phase = ControlPhase::HandshakeWaitInZlp;
        // Acking the IN-ready flag with an empty FIFO sends the ZLP
        self.controller.ack_endpoint_flag(ep, EndpointFlag::InReady);
        self.controller
            .enable_endpoint_flag_interrupt(ep, EndpointFlag::InReady);

        self.controller.ack_endpoint_flag(ep, EndpointFlag::NakOut);
        self.controller
            .enable_endpoint_flag_interrupt(ep, EndpointFlag::NakOut);
    }

    /// Wait for the host's status-stage OUT ZLP and watch for IN overruns
    fn send_zlp_on_out(&mut self) {
        let ep = CONTROL_ENDPOINT;
        self.control.phase = ControlPhase::HandshakeWaitOutZlp;

        self.controller.ack_endpoint_flag(ep, EndpointFlag::NakIn);
        self.controller
            .enable_endpoint_flag_interrupt(ep, EndpointFlag::NakIn);
    }

    /// Re-arm for the next SETUP packet
    fn init_setup(&mut self) {
        let ep = CONTROL_ENDPOINT;
        // Hardware aborts any pending IN transfer on SETUP reception by
        // itself, but the interrupt must not fire for it
        self.controller
            .disable_endpoint_flag_interrupt(ep, EndpointFlag::InReady);
        // Clear out a stale OUT ZLP, if any
        self.controller
            .ack_endpoint_flag(ep, EndpointFlag::OutReceived);
        self.control.reset_to_setup();
    }

    fn handle_control_tx(&mut self) {
        let ep = CONTROL_ENDPOINT;
        self.controller
            .disable_endpoint_flag_interrupt(ep, EndpointFlag::InReady);

        if self.control.phase == ControlPhase::HandshakeWaitInZlp {
            // The status stage just completed. A deferred SET_ADDRESS is
            // applied here and only here, after the handshake, as the
            // USB specification requires.
            if self.control.address_available {
                self.controller.set_address(self.setup.value_low());
                self.controller.enable_address();
                self.control.address_available = false;
            }
            self.init_setup();
            return;
        }

        // Never send more than the host asked for; if it wants the rest
        // it will come back with a larger wLength
        self.control.clamp_tx_to(self.setup.length as usize);

        let packet_size = (self.controller.endpoint_size(ep) as usize).min(CONTROL_MAX_PACKET_SIZE);
        let remaining = self.control.tx_remaining();
        if remaining == 0 {
            self.send_zlp_on_out();
            return;
        }

        // The host may have aborted the IN stage with an early OUT ZLP
        if self.controller.endpoint_flag(ep, EndpointFlag::OutReceived) {
            self.control.phase = ControlPhase::HandshakeWaitOutZlp;
            return;
        }

        let mut packet = [0u8; CONTROL_MAX_PACKET_SIZE];
        let to_send = remaining.min(packet_size);
        let filled = self.control.fill_packet(&mut packet[..to_send]);
        self.controller.write_fifo(ep, &packet[..filled]);

        self.controller.ack_endpoint_flag(ep, EndpointFlag::InReady);
        self.controller
            .enable_endpoint_flag_interrupt(ep, EndpointFlag::InReady);
    }

    fn handle_control_rx(&mut self) {
        let ep = CONTROL_ENDPOINT;

        if self.control.phase != ControlPhase::DataOut {
            match self.control.phase {
                // Either the expected status-stage ZLP, or an early OUT
                // ZLP hiding the end of a DataIn stage
                ControlPhase::HandshakeWaitOutZlp | ControlPhase::DataIn => {}
                _ => {
                    self.control.phase = ControlPhase::StallRequested;
                    self.controller.request_stall(ep);
                }
            }
            self.init_setup();
            return;
        }

        if self.control.read_capacity() > 0 {
            let packet_len = self.controller.byte_count(ep);
            let declared_left = self.setup.length - self.control.read_received();
            let amount = (declared_left.min(self.control.read_capacity()).min(packet_len)
                as usize)
                .min(CONTROL_MAX_PACKET_SIZE);

            let mut chunk = [0u8; CONTROL_MAX_PACKET_SIZE];
            let n = self.controller.read_fifo(ep, &mut chunk[..amount]);
            self.control.consume_read(n as u16);
            self.driver
                .control_read_complete(&chunk[..n], &mut self.control);

            let packet_size = self.controller.endpoint_size(ep);
            let more_expected = self.control.read_received() < self.setup.length;
            if packet_len < packet_size || (self.control.read_capacity() == 0 && more_expected) {
                // Short packet, or our buffer filled before the host was
                // done: either way the data stage is over
                self.controller
                    .ack_endpoint_flag(ep, EndpointFlag::OutReceived);
                self.send_zlp_on_in();
                return;
            }
        }

        // Free the bank for the next packet and watch for the status stage
        self.controller
            .ack_endpoint_flag(ep, EndpointFlag::OutReceived);
        self.controller.ack_endpoint_flag(ep, EndpointFlag::NakIn);
        self.controller
            .enable_endpoint_flag_interrupt(ep, EndpointFlag::NakIn);
    }

    // ---- DMA-backed endpoints ----

    /// Handle bank and DMA interrupts for the non-control endpoints
    ///
    /// Completion detection distinguishes the bank-versus-byte-counter
    /// race cases individually; see the inline notes. A transfer
    /// completes exactly once, on whichever path observes it first.
    fn check_endpoints(&mut self) -> bool {
        let mut handled = false;

        for ep in 1..=MAX_ENDPOINT {
            let mut transfer_completed = false;

            if self.controller.endpoint_irq_enabled(ep) {
                if self.controller.endpoint_is_in(ep) {
                    if self
                        .controller
                        .endpoint_flag_interrupt_enabled(ep, EndpointFlag::InReady)
                        && self.controller.endpoint_flag(ep, EndpointFlag::InReady)
                    {
                        let byte_count = self.controller.byte_count(ep);
                        let dma_left = self.controller.dma_remaining(ep);

                        // Full packet, or a partial one the DMA could not
                        // top up: release the bank onto the wire
                        if byte_count == self.controller.endpoint_size(ep) || dma_left == 0 {
                            self.controller.ack_endpoint_flag(ep, EndpointFlag::InReady);
                            self.controller.release_bank(ep);
                        }
                        if dma_left == 0 {
                            // Source exhausted: the transfer is done
                            transfer_completed = true;
                        }
                        if byte_count == 0 && dma_left > 0 {
                            // Bank drained ahead of the byte counter.
                            // Close the transfer now so the driver can
                            // re-arm instead of waiting on a re-fire.
                            transfer_completed = true;
                        }
                        handled = true;
                    }
                } else if self
                    .controller
                    .endpoint_flag_interrupt_enabled(ep, EndpointFlag::OutReceived)
                    && self.controller.endpoint_flag(ep, EndpointFlag::OutReceived)
                {
                    if self.controller.byte_count(ep) == 0 {
                        // Bank fully drained into memory: free it
                        self.controller
                            .ack_endpoint_flag(ep, EndpointFlag::OutReceived);
                        self.controller.release_bank(ep);
                    } else if self.controller.dma_remaining(ep) == 0 {
                        // Destination full with bytes still in the bank:
                        // the bank must NOT be released, the remainder
                        // stays for the next read
                        transfer_completed = true;
                    }
                    handled = true;
                }
            }

            if self.controller.dma_irq_enabled(ep) && self.controller.dma_irq_pending(ep) {
                let status = self.controller.dma_status(ep);

                if status.descriptor_loaded && !transfer_completed && self.controller.endpoint_is_in(ep)
                {
                    // Descriptor landed while the bank is still filling:
                    // make sure the bank interrupt catches the completion
                    self.controller
                        .enable_endpoint_flag_interrupt(ep, EndpointFlag::InReady);
                }
                if status.end_buffer {
                    transfer_completed = true;
                }
                handled = true;
            }

            if transfer_completed {
                self.complete_transfer(ep);
            }
        }

        handled
    }

    fn complete_transfer(&mut self, endpoint: u8) {
        if self.controller.endpoint_is_in(endpoint) {
            self.controller
                .disable_endpoint_flag_interrupt(endpoint, EndpointFlag::InReady);
        } else {
            self.controller
                .disable_endpoint_flag_interrupt(endpoint, EndpointFlag::OutReceived);
        }
        self.controller.disable_dma_interrupt(endpoint);
        self.dma_in_use &= !(1 << endpoint);
        self.driver.handle_transfer_done(endpoint);
    }

    fn record_error(&mut self, error: InternalError) {
        self.last_error = Some(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup::StandardRequest;
    use heapless::Vec;
    use zeugma_hal::{Direction, DmaStatus, EndpointConfig, EndpointKind, Speed};

    const NEP: usize = 10;

    fn ep_idx(flag: EndpointFlag) -> usize {
        match flag {
            EndpointFlag::InReady => 0,
            EndpointFlag::OutReceived => 1,
            EndpointFlag::SetupReceived => 2,
            EndpointFlag::NakOut => 3,
            EndpointFlag::NakIn => 4,
            EndpointFlag::ShortPacket => 5,
        }
    }

    fn dev_idx(flag: DeviceFlag) -> usize {
        match flag {
            DeviceFlag::Suspend => 0,
            DeviceFlag::MicroStartOfFrame => 1,
            DeviceFlag::StartOfFrame => 2,
            DeviceFlag::EndOfReset => 3,
            DeviceFlag::Wakeup => 4,
        }
    }

    /// Scriptable register-level double for the state machine tests
    #[derive(Default)]
    struct MockController {
        inited: bool,
        attached: bool,
        frozen: bool,
        address: u8,
        address_enabled: bool,

        dev_flags: [bool; 5],
        dev_irq: [bool; 5],

        ep_flags: [[bool; 6]; NEP],
        ep_flag_irq: [[bool; 6]; NEP],
        ep_irq: [bool; NEP],

        ep_config: [EndpointConfig; NEP],
        ep_allocated: [bool; NEP],
        ep_enabled: [bool; NEP],
        ep_size: [u16; NEP],
        ep_in: [bool; NEP],

        byte_count: [u16; NEP],
        stall_requested: [bool; NEP],
        bank_released: [u8; NEP],

        dma_loaded: [Option<DmaDescriptor>; NEP],
        dma_stopped: [u8; NEP],
        dma_remaining: [u16; NEP],
        dma_addr: [usize; NEP],
        dma_status: [DmaStatus; NEP],
        dma_pending: [bool; NEP],
        dma_irq: [bool; NEP],

        rx_data: Vec<u8, 256>,
        rx_pos: usize,
        staged_tx: Vec<u8, 64>,
        packets: Vec<Vec<u8, 64>, 16>,
    }

    impl MockController {
        fn new() -> Self {
            let mut mock = MockController::default();
            mock.ep_size = [64; NEP];
            mock
        }

        fn set_rx(&mut self, bytes: &[u8]) {
            self.rx_data.clear();
            self.rx_data.extend_from_slice(bytes).unwrap();
            self.rx_pos = 0;
        }
    }

    impl UsbController for MockController {
        fn init_controller(&mut self) {
            self.inited = true;
        }

        fn attach_line(&mut self) {
            self.attached = true;
        }

        fn detach_line(&mut self) {
            self.attached = false;
        }

        fn freeze_clock(&mut self) {
            self.frozen = true;
        }

        fn unfreeze_clock(&mut self) {
            self.frozen = false;
        }

        fn speed(&self) -> Speed {
            Speed::Full
        }

        fn set_address(&mut self, address: u8) {
            self.address = address;
        }

        fn enable_address(&mut self) {
            self.address_enabled = true;
        }

        fn device_flag(&self, flag: DeviceFlag) -> bool {
            self.dev_flags[dev_idx(flag)]
        }

        fn ack_device_flag(&mut self, flag: DeviceFlag) {
            self.dev_flags[dev_idx(flag)] = false;
        }

        fn enable_device_interrupt(&mut self, flag: DeviceFlag) {
            self.dev_irq[dev_idx(flag)] = true;
        }

        fn disable_device_interrupt(&mut self, flag: DeviceFlag) {
            self.dev_irq[dev_idx(flag)] = false;
        }

        fn device_interrupt_enabled(&self, flag: DeviceFlag) -> bool {
            self.dev_irq[dev_idx(flag)]
        }

        fn configure_endpoint(&mut self, endpoint: u8, config: EndpointConfig) {
            self.ep_config[endpoint as usize] = config;
        }

        fn allocate_endpoint_memory(&mut self, endpoint: u8) {
            self.ep_allocated[endpoint as usize] = true;
        }

        fn enable_endpoint(&mut self, endpoint: u8) {
            self.ep_enabled[endpoint as usize] = true;
        }

        fn endpoint_configured(&self, endpoint: u8) -> bool {
            !self.ep_config[endpoint as usize].is_null()
        }

        fn endpoint_size(&self, endpoint: u8) -> u16 {
            self.ep_size[endpoint as usize]
        }

        fn endpoint_is_in(&self, endpoint: u8) -> bool {
            self.ep_in[endpoint as usize]
        }

        fn endpoint_flag(&self, endpoint: u8, flag: EndpointFlag) -> bool {
            self.ep_flags[endpoint as usize][ep_idx(flag)]
        }

        fn ack_endpoint_flag(&mut self, endpoint: u8, flag: EndpointFlag) {
            self.ep_flags[endpoint as usize][ep_idx(flag)] = false;
            // Acking IN-ready on the control endpoint commits the staged
            // FIFO contents as one packet (an empty one is a ZLP)
            if endpoint == 0 && flag == EndpointFlag::InReady {
                self.packets.push(self.staged_tx.clone()).unwrap();
                self.staged_tx.clear();
            }
        }

        fn enable_endpoint_flag_interrupt(&mut self, endpoint: u8, flag: EndpointFlag) {
            self.ep_flag_irq[endpoint as usize][ep_idx(flag)] = true;
        }

        fn disable_endpoint_flag_interrupt(&mut self, endpoint: u8, flag: EndpointFlag) {
            self.ep_flag_irq[endpoint as usize][ep_idx(flag)] = false;
        }

        fn endpoint_flag_interrupt_enabled(&self, endpoint: u8, flag: EndpointFlag) -> bool {
            self.ep_flag_irq[endpoint as usize][ep_idx(flag)]
        }

        fn endpoint_irq_pending(&self, endpoint: u8) -> bool {
            let ep = endpoint as usize;
            (0..6).any(|i| self.ep_flags[ep][i] && self.ep_flag_irq[ep][i])
        }

        fn enable_endpoint_irq(&mut self, endpoint: u8) {
            self.ep_irq[endpoint as usize] = true;
        }

        fn disable_endpoint_irq(&mut self, endpoint: u8) {
            self.ep_irq[endpoint as usize] = false;
        }

        fn endpoint_irq_enabled(&self, endpoint: u8) -> bool {
            self.ep_irq[endpoint as usize]
        }

        fn request_stall(&mut self, endpoint: u8) {
            self.stall_requested[endpoint as usize] = true;
        }

        fn release_bank(&mut self, endpoint: u8) {
            self.bank_released[endpoint as usize] += 1;
        }

        fn byte_count(&self, endpoint: u8) -> u16 {
            self.byte_count[endpoint as usize]
        }

        fn read_fifo(&mut self, _endpoint: u8, buffer: &mut [u8]) -> usize {
            let available = self.rx_data.len() - self.rx_pos;
            let n = available.min(buffer.len());
            buffer[..n].copy_from_slice(&self.rx_data[self.rx_pos..self.rx_pos + n]);
            self.rx_pos += n;
            n
        }

        fn write_fifo(&mut self, endpoint: u8, data: &[u8]) {
            if endpoint == 0 {
                self.staged_tx.extend_from_slice(data).unwrap();
            }
        }

        fn dma_load(&mut self, endpoint: u8, descriptor: DmaDescriptor) {
            self.dma_loaded[endpoint as usize] = Some(descriptor);
        }

        fn dma_stop(&mut self, endpoint: u8) {
            self.dma_stopped[endpoint as usize] += 1;
            self.dma_loaded[endpoint as usize] = None;
        }

        fn dma_remaining(&self, endpoint: u8) -> u16 {
            self.dma_remaining[endpoint as usize]
        }

        fn dma_address(&self, endpoint: u8) -> usize {
            self.dma_addr[endpoint as usize]
        }

        fn dma_status(&mut self, endpoint: u8) -> DmaStatus {
            let ep = endpoint as usize;
            self.dma_pending[ep] = false;
            core::mem::take(&mut self.dma_status[ep])
        }

        fn enable_dma_interrupt(&mut self, endpoint: u8) {
            self.dma_irq[endpoint as usize] = true;
        }

        fn disable_dma_interrupt(&mut self, endpoint: u8) {
            self.dma_irq[endpoint as usize] = false;
        }

        fn dma_irq_pending(&self, endpoint: u8) -> bool {
            self.dma_pending[endpoint as usize]
        }

        fn dma_irq_enabled(&self, endpoint: u8) -> bool {
            self.dma_irq[endpoint as usize]
        }
    }

    struct MockVbus {
        present: bool,
    }

    impl VbusSense for MockVbus {
        fn is_present(&mut self) -> bool {
            self.present
        }
    }

    /// Scriptable device/protocol layer
    struct TestDriver {
        accept: bool,
        respond: Option<(Vec<u8, 256>, Vec<u8, 256>)>,
        read_capacity: Option<u16>,
        transfer_done: Vec<u8, 16>,
        connection_changes: Vec<bool, 8>,
        read_data: Vec<u8, 256>,
        read_calls: usize,
    }

    impl TestDriver {
        fn new() -> Self {
            TestDriver {
                accept: true,
                respond: None,
                read_capacity: None,
                transfer_done: Vec::new(),
                connection_changes: Vec::new(),
                read_data: Vec::new(),
                read_calls: 0,
            }
        }
    }

    impl UsbDeviceDriver for TestDriver {
        fn handle_setup_packet(&mut self, setup: &SetupPacket, control: &mut ControlState) -> bool {
            if !self.accept {
                return false;
            }
            match setup.standard_request() {
                Some(StandardRequest::SetAddress) => control.set_address_available(),
                Some(StandardRequest::SetConfiguration) => {
                    control.set_configuration(setup.value_low())
                }
                _ => {}
            }
            if let Some((seg0, seg1)) = &self.respond {
                control.write_to_control(seg0, seg1).unwrap();
            }
            if let Some(capacity) = self.read_capacity {
                control.read_from_control(capacity);
            }
            true
        }

        fn endpoint_config(&self, endpoint: u8, _other_speed: bool) -> EndpointRequest {
            if endpoint == 0 {
                EndpointRequest {
                    size: 64,
                    banks: 1,
                    kind: EndpointKind::Control,
                    direction: Direction::Out,
                }
            } else {
                EndpointRequest {
                    size: 512,
                    banks: 2,
                    kind: EndpointKind::Bulk,
                    direction: Direction::In,
                }
            }
        }

        fn handle_transfer_done(&mut self, endpoint: u8) {
            self.transfer_done.push(endpoint).unwrap();
        }

        fn handle_connection_change(&mut self, connected: bool) {
            self.connection_changes.push(connected).unwrap();
        }

        fn control_read_complete(&mut self, data: &[u8], _control: &mut ControlState) {
            self.read_data.extend_from_slice(data).unwrap();
            self.read_calls += 1;
        }
    }

    type TestDevice = UsbDevice<MockController, MockVbus, TestDriver>;

    fn make_device() -> TestDevice {
        let mut device = UsbDevice::new(
            MockController::new(),
            MockVbus { present: true },
            TestDriver::new(),
        );
        device.init();
        // Settle the initial VBUS state; this attaches to the bus
        assert!(device.service());
        device
    }

    fn bus_reset(device: &mut TestDevice) {
        device.controller.dev_flags[dev_idx(DeviceFlag::EndOfReset)] = true;
        assert!(device.service());
    }

    fn setup_bytes(request_type: u8, request: u8, value: u16, length: u16) -> [u8; 8] {
        let value = value.to_le_bytes();
        let length = length.to_le_bytes();
        [
            request_type,
            request,
            value[0],
            value[1],
            0,
            0,
            length[0],
            length[1],
        ]
    }

    fn send_setup(device: &mut TestDevice, bytes: [u8; 8]) {
        device.controller.set_rx(&bytes);
        device.controller.ep_flags[0][ep_idx(EndpointFlag::SetupReceived)] = true;
        assert!(device.service());
    }

    fn host_collects_in_packet(device: &mut TestDevice) {
        device.controller.ep_flags[0][ep_idx(EndpointFlag::InReady)] = true;
        assert!(device.service());
    }

    fn host_sends_out_zlp(device: &mut TestDevice) {
        device.controller.byte_count[0] = 0;
        device.controller.ep_flags[0][ep_idx(EndpointFlag::OutReceived)] = true;
        assert!(device.service());
    }

    fn select_configuration(device: &mut TestDevice) {
        send_setup(device, setup_bytes(0x00, 0x09, 1, 0));
        // Collect the status-stage ZLP so the machine returns to Setup
        host_collects_in_packet(device);
        assert_eq!(device.control.phase(), ControlPhase::Setup);
        device.controller.packets.clear();
    }

    // ---- connection, reset, suspend ----

    #[test]
    fn test_init_leaves_device_detached() {
        let mut device = UsbDevice::new(
            MockController::new(),
            MockVbus { present: true },
            TestDriver::new(),
        );
        device.init();
        assert!(device.controller.inited);
        assert!(!device.controller.attached);
        assert!(device.controller.frozen);
    }

    #[test]
    fn test_initial_vbus_settles_to_attached() {
        let mut device = make_device();
        assert!(device.controller.attached);
        assert_eq!(device.driver.connection_changes.as_slice(), &[true]);
        assert!(device
            .controller
            .device_interrupt_enabled(DeviceFlag::EndOfReset));
    }

    #[test]
    fn test_attach_before_init_fails() {
        let mut device = UsbDevice::new(
            MockController::new(),
            MockVbus { present: true },
            TestDriver::new(),
        );
        assert!(!device.attach());
        assert_eq!(
            device.take_internal_error(),
            Some(InternalError::AttachBeforeInit)
        );
    }

    #[test]
    fn test_vbus_change_before_init_is_flagged() {
        let mut device = UsbDevice::new(
            MockController::new(),
            MockVbus { present: true },
            TestDriver::new(),
        );
        assert!(!device.service());
        assert_eq!(
            device.take_internal_error(),
            Some(InternalError::VbusChangeBeforeInit)
        );
    }

    #[test]
    fn test_bus_reset_configures_control_endpoint() {
        let mut device = make_device();
        bus_reset(&mut device);

        assert_eq!(device.controller.address, 0);
        assert!(device.controller.address_enabled);

        let config = device.controller.ep_config[0];
        assert_eq!(config.size(), 64);
        assert_eq!(config.banks(), 1);
        assert_eq!(config.kind(), EndpointKind::Control);
        assert!(device.controller.ep_allocated[0]);
        assert!(device.controller.ep_enabled[0]);

        assert!(device
            .controller
            .endpoint_flag_interrupt_enabled(0, EndpointFlag::SetupReceived));
        assert!(device
            .controller
            .endpoint_flag_interrupt_enabled(0, EndpointFlag::OutReceived));
        assert!(device.controller.endpoint_irq_enabled(0));
        assert_eq!(device.control.phase(), ControlPhase::Setup);
    }

    #[test]
    fn test_suspend_wakeup_toggle() {
        let mut device = make_device();

        device.controller.dev_flags[dev_idx(DeviceFlag::Suspend)] = true;
        assert!(device.service());
        assert!(device.controller.frozen);
        assert!(!device.controller.device_interrupt_enabled(DeviceFlag::Suspend));
        assert!(device.controller.device_interrupt_enabled(DeviceFlag::Wakeup));

        device.controller.dev_flags[dev_idx(DeviceFlag::Wakeup)] = true;
        assert!(device.service());
        assert!(!device.controller.frozen);
        assert!(device.controller.device_interrupt_enabled(DeviceFlag::Suspend));
        assert!(!device.controller.device_interrupt_enabled(DeviceFlag::Wakeup));
    }

    #[test]
    fn test_dispatcher_handles_one_category_per_pass() {
        let mut device = make_device();
        bus_reset(&mut device);

        // SOF and a SETUP pending at once: SOF wins the first pass
        device.controller.dev_irq[dev_idx(DeviceFlag::StartOfFrame)] = true;
        device.controller.dev_flags[dev_idx(DeviceFlag::StartOfFrame)] = true;
        device.controller.set_rx(&setup_bytes(0x80, 0x06, 0x0100, 18));
        device.controller.ep_flags[0][ep_idx(EndpointFlag::SetupReceived)] = true;

        assert!(device.service());
        assert!(!device.controller.device_flag(DeviceFlag::StartOfFrame));
        assert_eq!(device.control.phase(), ControlPhase::Setup);

        // The vector re-fires; now the control endpoint is handled
        device.driver.respond = Some((Vec::new(), Vec::new()));
        assert!(device.service());
        assert_ne!(device.control.phase(), ControlPhase::Setup);
    }

    // ---- control transfers ----

    fn run_in_round_trip(n: usize) {
        let mut device = make_device();
        bus_reset(&mut device);

        let mut data: Vec<u8, 256> = Vec::new();
        for i in 0..n {
            data.push(i as u8).unwrap();
        }
        // Split across the two segments the way a header + body would be
        let split = n / 3;
        let mut seg0: Vec<u8, 256> = Vec::new();
        let mut seg1: Vec<u8, 256> = Vec::new();
        seg0.extend_from_slice(&data[..split]).unwrap();
        seg1.extend_from_slice(&data[split..]).unwrap();
        device.driver.respond = Some((seg0, seg1));

        send_setup(&mut device, setup_bytes(0x80, 0x06, 0x0100, n as u16));

        // Host polls IN until the device stops producing data packets
        for _ in 0..8 {
            if device.control.phase() != ControlPhase::DataIn {
                break;
            }
            host_collects_in_packet(&mut device);
        }
        assert_eq!(device.control.phase(), ControlPhase::HandshakeWaitOutZlp);
        assert!(device.control.phase().in_handshake());

        // Status stage: the host sends an OUT ZLP
        host_sends_out_zlp(&mut device);
        assert_eq!(device.control.phase(), ControlPhase::Setup);

        // Every packet but the last must be full-size; the concatenation
        // must be exactly the queued bytes
        let packets = &device.controller.packets;
        let mut received: Vec<u8, 256> = Vec::new();
        for (i, packet) in packets.iter().enumerate() {
            if i + 1 < packets.len() {
                assert_eq!(packet.len(), 64);
            }
            received.extend_from_slice(packet).unwrap();
        }
        assert_eq!(received, data);
    }

    #[test]
    fn test_control_in_round_trip_boundary_lengths() {
        for n in [0, 1, 63, 64, 65, 128] {
            run_in_round_trip(n);
        }
    }

    #[test]
    fn test_in_data_clamped_to_wlength() {
        let mut device = make_device();
        bus_reset(&mut device);

        let mut seg0: Vec<u8, 256> = Vec::new();
        seg0.extend_from_slice(&[0xAA; 40]).unwrap();
        device.driver.respond = Some((seg0, Vec::new()));

        // Host only wants 10 of the 40 queued bytes
        send_setup(&mut device, setup_bytes(0x80, 0x06, 0x0100, 10));
        assert_eq!(device.controller.packets[0].len(), 10);

        host_collects_in_packet(&mut device);
        assert_eq!(device.control.phase(), ControlPhase::HandshakeWaitOutZlp);
    }

    #[test]
    fn test_set_address_deferred_until_status_stage() {
        let mut device = make_device();
        bus_reset(&mut device);

        send_setup(&mut device, setup_bytes(0x00, 0x05, 7, 0));

        // Accepted, but the address must not be live yet
        assert!(device.control.address_available());
        assert_eq!(device.controller.address, 0);
        assert_eq!(device.control.phase(), ControlPhase::HandshakeWaitInZlp);

        // The host collects the status-stage IN ZLP; now it applies
        host_collects_in_packet(&mut device);
        assert_eq!(device.controller.address, 7);
        assert!(device.controller.address_enabled);
        assert!(!device.control.address_available());
        assert_eq!(device.control.phase(), ControlPhase::Setup);
    }

    #[test]
    fn test_stall_on_rejected_setup_then_recover() {
        let mut device = make_device();
        bus_reset(&mut device);

        device.driver.accept = false;
        send_setup(&mut device, setup_bytes(0x80, 0x06, 0x0100, 18));
        assert!(device.controller.stall_requested[0]);
        assert_eq!(device.control.phase(), ControlPhase::StallRequested);
        // The SETUP flag must have been acknowledged
        assert!(!device.controller.endpoint_flag(0, EndpointFlag::SetupReceived));

        // A well-formed SETUP right after resumes normal processing
        device.controller.stall_requested[0] = false;
        device.driver.accept = true;
        let mut seg0: Vec<u8, 256> = Vec::new();
        seg0.extend_from_slice(&[1, 2, 3, 4]).unwrap();
        device.driver.respond = Some((seg0, Vec::new()));
        send_setup(&mut device, setup_bytes(0x80, 0x06, 0x0100, 4));

        assert!(!device.controller.stall_requested[0]);
        assert_eq!(device.control.phase(), ControlPhase::HandshakeWaitOutZlp);
        assert_eq!(device.controller.packets[0].as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_control_out_data_delivery() {
        let mut device = make_device();
        bus_reset(&mut device);

        device.driver.read_capacity = Some(100);
        send_setup(&mut device, setup_bytes(0x00, 0x21, 0, 10));
        assert_eq!(device.control.phase(), ControlPhase::DataOut);
        assert!(device
            .controller
            .endpoint_flag_interrupt_enabled(0, EndpointFlag::NakIn));

        // Host delivers all 10 bytes in one (short) packet
        let payload = [9u8, 8, 7, 6, 5, 4, 3, 2, 1, 0];
        device.controller.set_rx(&payload);
        device.controller.byte_count[0] = 10;
        device.controller.ep_flags[0][ep_idx(EndpointFlag::OutReceived)] = true;
        assert!(device.service());

        assert_eq!(device.driver.read_calls, 1);
        assert_eq!(device.driver.read_data.as_slice(), &payload);
        // Short packet ends the data stage; status is an IN ZLP
        assert_eq!(device.control.phase(), ControlPhase::HandshakeWaitInZlp);

        host_collects_in_packet(&mut device);
        assert_eq!(device.control.phase(), ControlPhase::Setup);
    }

    #[test]
    fn test_out_phase_early_abort_via_nak_in() {
        let mut device = make_device();
        bus_reset(&mut device);

        device.driver.read_capacity = Some(100);
        send_setup(&mut device, setup_bytes(0x00, 0x21, 0, 100));
        assert_eq!(device.control.phase(), ControlPhase::DataOut);

        // Host gives up on the OUT phase and polls IN for the status stage
        device.controller.ep_flags[0][ep_idx(EndpointFlag::NakIn)] = true;
        assert!(device.service());

        // The device answers with an IN ZLP, and no partial data was
        // passed off as a completed read
        assert_eq!(device.control.phase(), ControlPhase::HandshakeWaitInZlp);
        assert_eq!(device.driver.read_calls, 0);

        host_collects_in_packet(&mut device);
        assert_eq!(device.control.phase(), ControlPhase::Setup);
    }

    #[test]
    fn test_in_phase_aborted_by_early_out_zlp() {
        let mut device = make_device();
        bus_reset(&mut device);

        let mut seg0: Vec<u8, 256> = Vec::new();
        seg0.extend_from_slice(&[0x55; 128]).unwrap();
        device.driver.respond = Some((seg0, Vec::new()));
        send_setup(&mut device, setup_bytes(0x80, 0x06, 0x0100, 128));
        assert_eq!(device.control.phase(), ControlPhase::DataIn);

        // Host collects the first packet but answers with an OUT ZLP
        // instead of polling for the rest
        device.controller.byte_count[0] = 0;
        device.controller.ep_flags[0][ep_idx(EndpointFlag::OutReceived)] = true;
        host_collects_in_packet(&mut device);
        assert_eq!(device.control.phase(), ControlPhase::HandshakeWaitOutZlp);

        // Only the first data packet went out
        assert_eq!(device.controller.packets.len(), 1);

        assert!(device.service());
        assert_eq!(device.control.phase(), ControlPhase::Setup);
    }

    #[test]
    fn test_unexpected_out_packet_stalls() {
        let mut device = make_device();
        bus_reset(&mut device);

        // An OUT packet with no transfer in progress is a protocol error
        host_sends_out_zlp(&mut device);
        assert!(device.controller.stall_requested[0]);
        assert_eq!(device.control.phase(), ControlPhase::Setup);
    }

    #[test]
    fn test_nak_out_during_in_handshake_stalls() {
        let mut device = make_device();
        bus_reset(&mut device);

        // SET_ADDRESS leaves the machine waiting for the IN ZLP pickup
        send_setup(&mut device, setup_bytes(0x00, 0x05, 7, 0));
        assert_eq!(device.control.phase(), ControlPhase::HandshakeWaitInZlp);

        // More OUT data during the IN handshake is an overrun
        device.controller.ep_flags[0][ep_idx(EndpointFlag::NakOut)] = true;
        device.controller.ep_flag_irq[0][ep_idx(EndpointFlag::NakOut)] = true;
        assert!(device.service());
        assert!(device.controller.stall_requested[0]);
    }

    #[test]
    fn test_unhandled_control_event_is_recorded() {
        let mut device = make_device();
        bus_reset(&mut device);

        // A flag no checker claims on the control endpoint
        device.controller.ep_flags[0][ep_idx(EndpointFlag::ShortPacket)] = true;
        device.controller.ep_flag_irq[0][ep_idx(EndpointFlag::ShortPacket)] = true;
        assert!(device.service());
        assert_eq!(
            device.take_internal_error(),
            Some(InternalError::UnhandledControlEvent)
        );
    }

    // ---- DMA transfers ----

    #[test]
    fn test_transfer_refused_while_unconfigured() {
        let mut device = make_device();
        bus_reset(&mut device);
        device.controller.ep_in[2] = true;

        assert!(!device.transfer(2, DmaDescriptor::new(0x2000_0000, 128)));
        assert!(!device.transfer_in_flight(2));
        assert_eq!(
            device.take_internal_error(),
            Some(InternalError::TransferWhileUnconfigured)
        );
    }

    #[test]
    fn test_transfer_arms_descriptor_and_interrupts() {
        let mut device = make_device();
        bus_reset(&mut device);
        select_configuration(&mut device);
        device.controller.ep_in[2] = true;

        assert!(device.transfer(2, DmaDescriptor::new(0x2000_0000, 128)));
        assert!(device.transfer_in_flight(2));

        let descriptor = device.controller.dma_loaded[2].unwrap();
        assert_eq!(descriptor.command, DmaCommand::RunAndStop);
        assert!(descriptor.end_buffer_enable);
        assert!(descriptor.end_buffer_irq);
        assert!(descriptor.descriptor_loaded_irq);

        assert!(device
            .controller
            .endpoint_flag_interrupt_enabled(2, EndpointFlag::InReady));
        assert!(device
            .controller
            .endpoint_flag_interrupt_enabled(2, EndpointFlag::ShortPacket));
        assert!(device.controller.endpoint_irq_enabled(2));
        assert!(device.controller.dma_irq_enabled(2));
    }

    #[test]
    fn test_out_transfer_arms_out_interrupt_only() {
        let mut device = make_device();
        bus_reset(&mut device);
        select_configuration(&mut device);
        device.controller.ep_in[3] = false;

        assert!(device.transfer(3, DmaDescriptor::new(0x2000_0000, 256)));
        let descriptor = device.controller.dma_loaded[3].unwrap();
        assert!(!descriptor.descriptor_loaded_irq);
        assert!(device
            .controller
            .endpoint_flag_interrupt_enabled(3, EndpointFlag::OutReceived));
        assert!(!device
            .controller
            .endpoint_flag_interrupt_enabled(3, EndpointFlag::InReady));
    }

    #[test]
    fn test_in_completion_packet_full_dma_empty() {
        let mut device = make_device();
        bus_reset(&mut device);
        select_configuration(&mut device);
        device.controller.ep_in[2] = true;
        assert!(device.transfer(2, DmaDescriptor::new(0x2000_0000, 128)));

        // Final packet filled to the brim exactly as the source drained
        device.controller.byte_count[2] = 64;
        device.controller.dma_remaining[2] = 0;
        device.controller.ep_flags[2][ep_idx(EndpointFlag::InReady)] = true;
        assert!(device.service());

        assert_eq!(device.driver.transfer_done.as_slice(), &[2]);
        assert!(!device.transfer_in_flight(2));
        assert_eq!(device.controller.bank_released[2], 1);
        assert!(!device
            .controller
            .endpoint_flag_interrupt_enabled(2, EndpointFlag::InReady));
        assert!(!device.controller.dma_irq_enabled(2));

        // Nothing left to handle; the callback must not fire again
        assert!(!device.service());
        assert_eq!(device.driver.transfer_done.len(), 1);
    }

    #[test]
    fn test_in_completion_descriptor_loaded_then_short_packet() {
        let mut device = make_device();
        bus_reset(&mut device);
        select_configuration(&mut device);
        device.controller.ep_in[2] = true;
        assert!(device.transfer(2, DmaDescriptor::new(0x2000_0000, 70)));

        // Descriptor lands while the bank is still filling: no completion,
        // but the bank interrupt gets (re)armed
        device.controller.dma_pending[2] = true;
        device.controller.dma_status[2].descriptor_loaded = true;
        device.controller.dma_remaining[2] = 6;
        assert!(device.service());
        assert!(device.driver.transfer_done.is_empty());
        assert!(device.transfer_in_flight(2));
        assert!(device
            .controller
            .endpoint_flag_interrupt_enabled(2, EndpointFlag::InReady));

        // The short final packet drains the source
        device.controller.byte_count[2] = 6;
        device.controller.dma_remaining[2] = 0;
        device.controller.ep_flags[2][ep_idx(EndpointFlag::InReady)] = true;
        assert!(device.service());

        assert_eq!(device.driver.transfer_done.as_slice(), &[2]);
        assert!(!device.transfer_in_flight(2));
        assert_eq!(device.controller.bank_released[2], 1);
    }

    #[test]
    fn test_in_full_packet_mid_transfer_only_releases_bank() {
        let mut device = make_device();
        bus_reset(&mut device);
        select_configuration(&mut device);
        device.controller.ep_in[2] = true;
        assert!(device.transfer(2, DmaDescriptor::new(0x2000_0000, 512)));

        // Packet full but the source still has bytes: bank goes out,
        // transfer stays in flight
        device.controller.byte_count[2] = 64;
        device.controller.dma_remaining[2] = 448;
        device.controller.ep_flags[2][ep_idx(EndpointFlag::InReady)] = true;
        assert!(device.service());

        assert!(device.driver.transfer_done.is_empty());
        assert!(device.transfer_in_flight(2));
        assert_eq!(device.controller.bank_released[2], 1);
    }

    #[test]
    fn test_out_completion_destination_full_keeps_bank() {
        let mut device = make_device();
        bus_reset(&mut device);
        select_configuration(&mut device);
        device.controller.ep_in[3] = false;
        assert!(device.transfer(3, DmaDescriptor::new(0x2000_0000, 256)));

        // 20 bytes stranded in the bank with the destination full: the
        // bank must stay, the transfer must complete
        device.controller.byte_count[3] = 20;
        device.controller.dma_remaining[3] = 0;
        device.controller.ep_flags[3][ep_idx(EndpointFlag::OutReceived)] = true;
        assert!(device.service());

        assert_eq!(device.driver.transfer_done.as_slice(), &[3]);
        assert!(!device.transfer_in_flight(3));
        assert_eq!(device.controller.bank_released[3], 0);
        assert!(device.controller.endpoint_flag(3, EndpointFlag::OutReceived));
    }

    #[test]
    fn test_out_drained_bank_released_without_completion() {
        let mut device = make_device();
        bus_reset(&mut device);
        select_configuration(&mut device);
        device.controller.ep_in[3] = false;
        assert!(device.transfer(3, DmaDescriptor::new(0x2000_0000, 256)));

        device.controller.byte_count[3] = 0;
        device.controller.dma_remaining[3] = 192;
        device.controller.ep_flags[3][ep_idx(EndpointFlag::OutReceived)] = true;
        assert!(device.service());

        assert!(device.driver.transfer_done.is_empty());
        assert!(device.transfer_in_flight(3));
        assert_eq!(device.controller.bank_released[3], 1);
    }

    #[test]
    fn test_completion_via_dma_end_buffer_interrupt() {
        let mut device = make_device();
        bus_reset(&mut device);
        select_configuration(&mut device);
        device.controller.ep_in[3] = false;
        assert!(device.transfer(3, DmaDescriptor::new(0x2000_0000, 256)));

        device.controller.dma_pending[3] = true;
        device.controller.dma_status[3].end_buffer = true;
        assert!(device.service());

        assert_eq!(device.driver.transfer_done.as_slice(), &[3]);
        assert!(!device.transfer_in_flight(3));
    }

    #[test]
    fn test_disconnect_completes_all_in_flight_transfers() {
        let mut device = make_device();
        bus_reset(&mut device);
        select_configuration(&mut device);
        device.controller.ep_in[2] = true;
        device.controller.ep_in[3] = false;
        assert!(device.transfer(2, DmaDescriptor::new(0x2000_0000, 128)));
        assert!(device.transfer(3, DmaDescriptor::new(0x2000_1000, 256)));

        device.vbus.present = false;
        device.notify_vbus_changed();
        assert!(device.service());

        // Both callbacks fired exactly once, channels forced to stop,
        // the in-use mask is clean, and we are off the bus
        assert_eq!(device.driver.transfer_done.as_slice(), &[2, 3]);
        assert!(!device.transfer_in_flight(2));
        assert!(!device.transfer_in_flight(3));
        assert_eq!(device.controller.dma_stopped[2], 1);
        assert_eq!(device.controller.dma_stopped[3], 1);
        assert!(!device.controller.attached);
        assert_eq!(device.driver.connection_changes.as_slice(), &[true, false]);
    }

    #[test]
    fn test_bus_reset_completes_in_flight_transfers() {
        let mut device = make_device();
        bus_reset(&mut device);
        select_configuration(&mut device);
        device.controller.ep_in[2] = true;
        assert!(device.transfer(2, DmaDescriptor::new(0x2000_0000, 128)));

        bus_reset(&mut device);
        assert_eq!(device.driver.transfer_done.as_slice(), &[2]);
        assert!(!device.transfer_in_flight(2));
        assert_eq!(device.controller.dma_stopped[2], 1);
    }

    #[test]
    fn test_init_endpoint_out_of_range_is_rejected() {
        let mut device = make_device();
        let request = EndpointRequest {
            size: 64,
            banks: 1,
            kind: EndpointKind::Bulk,
            direction: Direction::In,
        };
        device.init_endpoint(12, request);
        assert_eq!(
            device.take_internal_error(),
            Some(InternalError::InvalidEndpointConfig)
        );
    }
}
