//! SAMS70/SAME70-specific HAL for the Zeugma USB device stack
//!
//! This crate implements the `zeugma-hal` traits for the "USBHS"
//! high-speed device controller found on the SAMS70, SAME70 and SAMV7x
//! parts. It contains:
//!
//! - The documented USBHS register map ([`registers`])
//! - [`Usbhs`], the [`zeugma_hal::UsbController`] implementation
//! - Clock bring-up (UPLL) and NVIC hookup for the USBHS vector
//!
//! # Usage
//!
//! The integrator keeps a single `UsbDevice` instance, initialized at
//! boot, and services it from the USBHS vector:
//!
//! ```ignore
//! let mut device = UsbDevice::new(Usbhs::new(), VbusPin::new(sense), driver);
//! device.init();
//! Usbhs::enable_interrupt(1);
//! device.attach();
//!
//! #[interrupt]
//! fn USBHS() {
//!     // `device` is the one registered instance, set at boot and
//!     // never reassigned
//!     device.service();
//! }
//! ```

#![no_std]

pub mod registers;
mod usbhs;

pub use usbhs::{Usbhs, UsbhsInterrupt};
