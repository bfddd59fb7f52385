//! Board-agnostic USB device-controller core
//!
//! This crate contains the device-side USB logic that does not depend on
//! a specific controller peripheral:
//!
//! - SETUP packet decoding
//! - Endpoint configuration encoding (with per-endpoint hardware limits)
//! - The control-transfer state machine for endpoint 0
//! - The DMA-backed transfer engine for bulk/interrupt endpoints
//! - Connection, bus-reset and suspend/wakeup event handling
//!
//! Everything runs from a single interrupt context: the integrator calls
//! [`device::UsbDevice::service`] from the controller's interrupt vector
//! and the checkers consume at most one event category per invocation.

#![no_std]
#![deny(unsafe_code)]

pub mod control;
pub mod device;
pub mod endpoint;
pub mod setup;
pub mod traits;

pub use control::{ControlError, ControlPhase, ControlState};
pub use device::{InternalError, UsbDevice};
pub use setup::SetupPacket;
pub use traits::UsbDeviceDriver;
