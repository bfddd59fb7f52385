//! Device-controller register primitives
//!
//! [`UsbController`] is the seam between the portable core and a concrete
//! USB device peripheral. Every method maps onto one or two masked
//! register accesses; none of them carry any protocol logic. The core
//! calls them from a single interrupt context, so implementations do not
//! need their own locking.

use crate::config::EndpointConfig;
use crate::dma::{DmaDescriptor, DmaStatus};

/// Negotiated bus speed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Speed {
    Low,
    Full,
    High,
}

/// Device-level event flags
///
/// Each variant names one bit of the device interrupt status register;
/// the flag-to-bit mapping is table-driven inside the chip crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceFlag {
    /// Suspend condition detected on the bus
    Suspend,
    /// Micro start-of-frame received (high speed only)
    MicroStartOfFrame,
    /// Start-of-frame received
    StartOfFrame,
    /// End of bus reset
    EndOfReset,
    /// Bus activity while suspended
    Wakeup,
}

/// Endpoint-level event flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EndpointFlag {
    /// IN bank free, ready to be filled
    InReady,
    /// OUT packet received
    OutReceived,
    /// SETUP packet received (control endpoints)
    SetupReceived,
    /// NAK handshake sent on an OUT token
    NakOut,
    /// NAK handshake sent on an IN token
    NakIn,
    /// Short packet seen (enables sending a final partial DMA packet)
    ShortPacket,
}

/// Register-level contract a USB device peripheral must provide
///
/// Implementations perform the raw flag tests, acknowledgements and
/// interrupt masking; the portable core in `zeugma-core` decides when
/// each primitive is used.
pub trait UsbController {
    /// One-time peripheral bring-up: clocks, device mode, speed selection
    ///
    /// Called once before the USB interrupt is unmasked. Must leave the
    /// controller enabled but detached from the bus.
    fn init_controller(&mut self);

    /// Clear the detach bit, presenting the device to the host
    fn attach_line(&mut self);

    /// Set the detach bit, removing the device from the bus
    fn detach_line(&mut self);

    /// Freeze the peripheral clock (low-power idle)
    fn freeze_clock(&mut self);

    /// Unfreeze the peripheral clock and wait for it to become usable
    fn unfreeze_clock(&mut self);

    /// Bus speed currently negotiated with the host
    fn speed(&self) -> Speed;

    /// Latch the device address (does not take effect until enabled)
    fn set_address(&mut self, address: u8);

    /// Enable address matching for the latched address
    fn enable_address(&mut self);

    // Device-level flags and interrupt sources

    fn device_flag(&self, flag: DeviceFlag) -> bool;
    fn ack_device_flag(&mut self, flag: DeviceFlag);
    fn enable_device_interrupt(&mut self, flag: DeviceFlag);
    fn disable_device_interrupt(&mut self, flag: DeviceFlag);
    fn device_interrupt_enabled(&self, flag: DeviceFlag) -> bool;

    // Endpoint configuration

    /// Write the configuration word for an endpoint
    fn configure_endpoint(&mut self, endpoint: u8, config: EndpointConfig);

    /// Allocate DPRAM for a configured endpoint
    fn allocate_endpoint_memory(&mut self, endpoint: u8);

    /// Enable an endpoint
    fn enable_endpoint(&mut self, endpoint: u8);

    /// True once the hardware reports the configuration as valid
    fn endpoint_configured(&self, endpoint: u8) -> bool;

    /// Configured buffer size of an endpoint, in bytes
    fn endpoint_size(&self, endpoint: u8) -> u16;

    /// True if the endpoint is configured in the IN (device-to-host) direction
    fn endpoint_is_in(&self, endpoint: u8) -> bool;

    // Endpoint-level flags and interrupt sources

    fn endpoint_flag(&self, endpoint: u8, flag: EndpointFlag) -> bool;
    fn ack_endpoint_flag(&mut self, endpoint: u8, flag: EndpointFlag);
    fn enable_endpoint_flag_interrupt(&mut self, endpoint: u8, flag: EndpointFlag);
    fn disable_endpoint_flag_interrupt(&mut self, endpoint: u8, flag: EndpointFlag);
    fn endpoint_flag_interrupt_enabled(&self, endpoint: u8, flag: EndpointFlag) -> bool;

    // Per-endpoint interrupt lines (the controller's summary bits)

    /// True if the endpoint's summary interrupt bit is raised
    fn endpoint_irq_pending(&self, endpoint: u8) -> bool;
    fn enable_endpoint_irq(&mut self, endpoint: u8);
    fn disable_endpoint_irq(&mut self, endpoint: u8);
    fn endpoint_irq_enabled(&self, endpoint: u8) -> bool;

    // Handshakes and FIFO control

    /// Request a STALL handshake on the endpoint
    fn request_stall(&mut self, endpoint: u8);

    /// Release the current bank: sends a filled IN bank or frees a
    /// drained OUT bank and switches to the next one
    fn release_bank(&mut self, endpoint: u8);

    /// Bytes currently held in the endpoint's active bank
    fn byte_count(&self, endpoint: u8) -> u16;

    /// Drain up to `buffer.len()` bytes from the endpoint FIFO
    ///
    /// Returns the number of bytes actually copied.
    fn read_fifo(&mut self, endpoint: u8, buffer: &mut [u8]) -> usize;

    /// Copy `data` into the endpoint FIFO
    fn write_fifo(&mut self, endpoint: u8, data: &[u8]);

    // DMA channel control

    /// Hand a descriptor to the endpoint's DMA channel and start it
    fn dma_load(&mut self, endpoint: u8, descriptor: DmaDescriptor);

    /// Force the channel to the stopped/null state
    fn dma_stop(&mut self, endpoint: u8);

    /// Bytes the channel has yet to move (the hardware byte counter)
    fn dma_remaining(&self, endpoint: u8) -> u16;

    /// Current channel address; advances as the transfer progresses
    fn dma_address(&self, endpoint: u8) -> usize;

    /// Snapshot and clear the channel's status flags
    fn dma_status(&mut self, endpoint: u8) -> DmaStatus;

    fn enable_dma_interrupt(&mut self, endpoint: u8);
    fn disable_dma_interrupt(&mut self, endpoint: u8);
    fn dma_irq_pending(&self, endpoint: u8) -> bool;
    fn dma_irq_enabled(&self, endpoint: u8) -> bool;
}
