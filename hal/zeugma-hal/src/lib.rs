//! Zeugma Hardware Abstraction Layer
//!
//! This crate defines the register-level contract between the portable USB
//! device core (`zeugma-core`) and a concrete device-controller peripheral.
//! Chip crates implement these traits with masked volatile reads and writes
//! against their own register maps.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  Device/protocol layer (firmware)       │
//! └─────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────┐
//! │  zeugma-core (state machine + DMA)      │
//! └─────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────┐
//! │  zeugma-hal (this crate - traits)       │
//! └─────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────┐
//! │  zeugma-hal-sams70 (USBHS registers)    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Traits
//!
//! - [`controller::UsbController`] - device-controller register primitives
//! - [`vbus::VbusSense`] - cable-presence detection

#![no_std]
#![deny(unsafe_code)]

pub mod config;
pub mod controller;
pub mod dma;
pub mod vbus;

// Re-export key types at crate root for convenience
pub use config::{Direction, EndpointConfig, EndpointKind, EndpointRequest};
pub use controller::{DeviceFlag, EndpointFlag, Speed, UsbController};
pub use dma::{DmaCommand, DmaDescriptor, DmaStatus};
pub use vbus::{AlwaysPresent, VbusPin, VbusSense};
