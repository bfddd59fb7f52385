//! Device/protocol layer interface
//!
//! The core drives the wire; everything above it (descriptor tables,
//! class logic, transfer bookkeeping) lives behind [`UsbDeviceDriver`].
//! All callbacks run inside the controller's interrupt context and must
//! not block.

use crate::control::ControlState;
use crate::setup::SetupPacket;
use zeugma_hal::EndpointRequest;

/// The device/protocol layer the core reports into
pub trait UsbDeviceDriver {
    /// Act on a freshly received SETUP packet
    ///
    /// Return `true` after queueing any response via
    /// [`ControlState::write_to_control`] or arming a read via
    /// [`ControlState::read_from_control`]. Return `false` to reject the
    /// request; the core answers the host with a STALL handshake.
    fn handle_setup_packet(&mut self, setup: &SetupPacket, control: &mut ControlState) -> bool;

    /// Buffer settings to use when (re)configuring an endpoint
    fn endpoint_config(&self, endpoint: u8, other_speed: bool) -> EndpointRequest;

    /// A DMA transfer started with `UsbDevice::transfer` has finished
    ///
    /// Fires exactly once per transfer, including transfers cut short by
    /// bus reset or disconnect.
    fn handle_transfer_done(&mut self, endpoint: u8);

    /// The cable was attached to or removed from a live host
    fn handle_connection_change(&mut self, connected: bool);

    /// OUT-stage bytes armed by [`ControlState::read_from_control`] have
    /// arrived
    ///
    /// Called once per received packet with the bytes of that packet.
    fn control_read_complete(&mut self, data: &[u8], control: &mut ControlState) {
        let _ = (data, control);
    }
}
