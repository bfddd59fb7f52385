//! USBHS device-controller implementation
//!
//! Every trait method is a thin masked read or write against the
//! register map in [`crate::registers`]. The only busy-waits are the
//! bounded clock-ready polls during bring-up and unfreeze.

use core::ptr;

use cortex_m::interrupt::InterruptNumber;
use zeugma_hal::{
    DeviceFlag, DmaDescriptor, DmaStatus, EndpointConfig, EndpointFlag, Speed, UsbController,
};

use crate::registers as regs;

/// The USBHS interrupt line, for NVIC masking
#[derive(Debug, Clone, Copy)]
pub struct UsbhsInterrupt;

// SAFETY: ID_USBHS is the USBHS vector number from the datasheet
unsafe impl InterruptNumber for UsbhsInterrupt {
    fn number(self) -> u16 {
        regs::ID_USBHS
    }
}

/// Handle to the USBHS device controller
///
/// There is one USBHS peripheral; construct exactly one handle and hand
/// it to `UsbDevice` at boot.
pub struct Usbhs {
    _private: (),
}

impl Usbhs {
    pub fn new() -> Self {
        Usbhs { _private: () }
    }

    /// Give the USBHS vector a priority and unmask it
    ///
    /// Call after `UsbDevice::init`, before `attach`.
    pub fn enable_interrupt(priority: u8) {
        // SAFETY: masking/priority of our own vector, taken once at boot
        unsafe {
            let mut peripherals = cortex_m::Peripherals::steal();
            peripherals.NVIC.set_priority(UsbhsInterrupt, priority);
            cortex_m::peripheral::NVIC::unmask(UsbhsInterrupt);
        }
    }

    fn read(&self, offset: usize) -> u32 {
        // SAFETY: offset comes from the register map constants
        unsafe { ptr::read_volatile((regs::USBHS_BASE + offset) as *const u32) }
    }

    fn write(&mut self, offset: usize, value: u32) {
        // SAFETY: offset comes from the register map constants
        unsafe { ptr::write_volatile((regs::USBHS_BASE + offset) as *mut u32, value) }
    }

    fn set_bits(&mut self, offset: usize, mask: u32) {
        let value = self.read(offset);
        self.write(offset, value | mask);
    }

    fn clear_bits(&mut self, offset: usize, mask: u32) {
        let value = self.read(offset);
        self.write(offset, value & !mask);
    }

    fn pmc_read(&self, offset: usize) -> u32 {
        // SAFETY: offset comes from the register map constants
        unsafe { ptr::read_volatile((regs::PMC_BASE + offset) as *const u32) }
    }

    fn pmc_write(&mut self, offset: usize, value: u32) {
        // SAFETY: offset comes from the register map constants
        unsafe { ptr::write_volatile((regs::PMC_BASE + offset) as *mut u32, value) }
    }

    /// Word offset of an entry in one of the per-endpoint register arrays
    fn ep_offset(base: usize, endpoint: u8) -> usize {
        base + 4 * endpoint as usize
    }

    /// Offset of a DMA channel register; channel n serves endpoint n
    fn dma_offset(register: usize, endpoint: u8) -> usize {
        regs::DEVDMA + (endpoint as usize - 1) * regs::DMA_STRIDE + register
    }

    fn has_dma_channel(endpoint: u8) -> bool {
        (1..=regs::DMA_CHANNELS).contains(&endpoint)
    }

    fn fifo(endpoint: u8) -> *mut u8 {
        (regs::USBHS_RAM + endpoint as usize * regs::FIFO_STRIDE) as *mut u8
    }

    fn endpoint_summary_bit(endpoint: u8) -> u32 {
        1 << (regs::DEVISR_PEP_SHIFT + endpoint as u32)
    }

    fn dma_summary_bit(endpoint: u8) -> u32 {
        1 << (regs::DEVISR_DMA_SHIFT + endpoint as u32 - 1)
    }
}

impl Default for Usbhs {
    fn default() -> Self {
        Usbhs::new()
    }
}

impl UsbController for Usbhs {
    fn init_controller(&mut self) {
        cortex_m::interrupt::free(|_| {
            // Feed the peripheral its bus clock
            self.pmc_write(regs::PMC_PCER1, 1 << (regs::ID_USBHS - 32));

            // Force the controller off while reconfiguring, then select
            // device mode
            self.clear_bits(regs::CTRL, regs::CTRL_USBE);
            self.write(regs::CTRL, regs::CTRL_UIMOD_DEVICE);

            // Start the UTMI PLL and wait for lock
            self.pmc_write(
                regs::CKGR_UCKR,
                (3 << regs::CKGR_UCKR_UPLLCOUNT_SHIFT) | regs::CKGR_UCKR_UPLLEN,
            );
            while self.pmc_read(regs::PMC_SR) & regs::PMC_SR_LOCKU == 0 {}

            // UPLL as the USB clock source, undivided
            self.pmc_write(regs::PMC_USB, regs::PMC_USB_USBS);
            self.pmc_write(regs::PMC_SCER, regs::PMC_SCER_USBCLK);

            // USB line activity may wake the core from sleep
            let fsmr = self.pmc_read(regs::PMC_FSMR);
            self.pmc_write(regs::PMC_FSMR, fsmr | regs::PMC_FSMR_USBAL);

            // Enable the controller, limited to full speed
            self.set_bits(regs::CTRL, regs::CTRL_USBE);
            self.clear_bits(regs::DEVCTRL, regs::DEVCTRL_LS);
            let devctrl = self.read(regs::DEVCTRL) & !regs::DEVCTRL_SPDCONF_MASK;
            self.write(regs::DEVCTRL, devctrl | regs::DEVCTRL_SPDCONF_FORCED_FS);
        });
    }

    fn attach_line(&mut self) {
        self.clear_bits(regs::DEVCTRL, regs::DEVCTRL_DETACH);
    }

    fn detach_line(&mut self) {
        self.set_bits(regs::DEVCTRL, regs::DEVCTRL_DETACH);
    }

    fn freeze_clock(&mut self) {
        self.set_bits(regs::CTRL, regs::CTRL_FRZCLK);
    }

    fn unfreeze_clock(&mut self) {
        self.clear_bits(regs::CTRL, regs::CTRL_FRZCLK);
        // Bounded wait for a usable clock
        while self.read(regs::SR) & regs::SR_CLKUSABLE == 0 {}
    }

    fn speed(&self) -> Speed {
        match (self.read(regs::SR) & regs::SR_SPEED_MASK) >> regs::SR_SPEED_SHIFT {
            regs::SR_SPEED_HIGH => Speed::High,
            regs::SR_SPEED_FULL => Speed::Full,
            _ => Speed::Low,
        }
    }

    fn set_address(&mut self, address: u8) {
        let devctrl = self.read(regs::DEVCTRL) & !regs::DEVCTRL_UADD_MASK;
        self.write(
            regs::DEVCTRL,
            devctrl | (address as u32 & regs::DEVCTRL_UADD_MASK),
        );
    }

    fn enable_address(&mut self) {
        self.set_bits(regs::DEVCTRL, regs::DEVCTRL_ADDEN);
    }

    fn device_flag(&self, flag: DeviceFlag) -> bool {
        self.read(regs::DEVISR) & regs::device_flag_bit(flag) != 0
    }

    fn ack_device_flag(&mut self, flag: DeviceFlag) {
        self.write(regs::DEVICR, regs::device_flag_bit(flag));
    }

    fn enable_device_interrupt(&mut self, flag: DeviceFlag) {
        self.write(regs::DEVIER, regs::device_flag_bit(flag));
    }

    fn disable_device_interrupt(&mut self, flag: DeviceFlag) {
        self.write(regs::DEVIDR, regs::device_flag_bit(flag));
    }

    fn device_interrupt_enabled(&self, flag: DeviceFlag) -> bool {
        self.read(regs::DEVIMR) & regs::device_flag_bit(flag) != 0
    }

    fn configure_endpoint(&mut self, endpoint: u8, config: EndpointConfig) {
        self.write(Self::ep_offset(regs::DEVEPTCFG, endpoint), config.bits());
    }

    fn allocate_endpoint_memory(&mut self, endpoint: u8) {
        self.set_bits(
            Self::ep_offset(regs::DEVEPTCFG, endpoint),
            regs::DEVEPTCFG_ALLOC,
        );
    }

    fn enable_endpoint(&mut self, endpoint: u8) {
        self.set_bits(
            regs::DEVEPT,
            1 << (regs::DEVEPT_EPEN_SHIFT + endpoint as u32),
        );
    }

    fn endpoint_configured(&self, endpoint: u8) -> bool {
        self.read(Self::ep_offset(regs::DEVEPTISR, endpoint)) & regs::DEVEPTISR_CFGOK != 0
    }

    fn endpoint_size(&self, endpoint: u8) -> u16 {
        let config = self.read(Self::ep_offset(regs::DEVEPTCFG, endpoint));
        8 << ((config & regs::DEVEPTCFG_EPSIZE_MASK) >> regs::DEVEPTCFG_EPSIZE_SHIFT)
    }

    fn endpoint_is_in(&self, endpoint: u8) -> bool {
        self.read(Self::ep_offset(regs::DEVEPTCFG, endpoint)) & regs::DEVEPTCFG_EPDIR != 0
    }

    fn endpoint_flag(&self, endpoint: u8, flag: EndpointFlag) -> bool {
        self.read(Self::ep_offset(regs::DEVEPTISR, endpoint)) & regs::endpoint_flag_bit(flag) != 0
    }

    fn ack_endpoint_flag(&mut self, endpoint: u8, flag: EndpointFlag) {
        self.write(
            Self::ep_offset(regs::DEVEPTICR, endpoint),
            regs::endpoint_flag_bit(flag),
        );
    }

    fn enable_endpoint_flag_interrupt(&mut self, endpoint: u8, flag: EndpointFlag) {
        self.write(
            Self::ep_offset(regs::DEVEPTIER, endpoint),
            regs::endpoint_flag_bit(flag),
        );
    }

    fn disable_endpoint_flag_interrupt(&mut self, endpoint: u8, flag: EndpointFlag) {
        self.write(
            Self::ep_offset(regs::DEVEPTIDR, endpoint),
            regs::endpoint_flag_bit(flag),
        );
    }

    fn endpoint_flag_interrupt_enabled(&self, endpoint: u8, flag: EndpointFlag) -> bool {
        self.read(Self::ep_offset(regs::DEVEPTIMR, endpoint)) & regs::endpoint_flag_bit(flag) != 0
    }

    fn endpoint_irq_pending(&self, endpoint: u8) -> bool {
        self.read(regs::DEVISR) & Self::endpoint_summary_bit(endpoint) != 0
    }

    fn enable_endpoint_irq(&mut self, endpoint: u8) {
        self.write(regs::DEVIER, Self::endpoint_summary_bit(endpoint));
    }

    fn disable_endpoint_irq(&mut self, endpoint: u8) {
        self.write(regs::DEVIDR, Self::endpoint_summary_bit(endpoint));
    }

    fn endpoint_irq_enabled(&self, endpoint: u8) -> bool {
        self.read(regs::DEVIMR) & Self::endpoint_summary_bit(endpoint) != 0
    }

    fn request_stall(&mut self, endpoint: u8) {
        self.write(
            Self::ep_offset(regs::DEVEPTIER, endpoint),
            regs::DEVEPTIER_STALLRQS,
        );
    }

    fn release_bank(&mut self, endpoint: u8) {
        self.write(
            Self::ep_offset(regs::DEVEPTIDR, endpoint),
            regs::DEVEPTIDR_FIFOCONC,
        );
    }

    fn byte_count(&self, endpoint: u8) -> u16 {
        let isr = self.read(Self::ep_offset(regs::DEVEPTISR, endpoint));
        ((isr & regs::DEVEPTISR_BYCT_MASK) >> regs::DEVEPTISR_BYCT_SHIFT) as u16
    }

    fn read_fifo(&mut self, endpoint: u8, buffer: &mut [u8]) -> usize {
        let fifo = Self::fifo(endpoint);
        for (i, byte) in buffer.iter_mut().enumerate() {
            // SAFETY: the FIFO aperture is FIFO_STRIDE bytes, far larger
            // than any endpoint buffer the caller can configure
            *byte = unsafe { ptr::read_volatile(fifo.add(i)) };
        }
        buffer.len()
    }

    fn write_fifo(&mut self, endpoint: u8, data: &[u8]) {
        let fifo = Self::fifo(endpoint);
        for (i, byte) in data.iter().enumerate() {
            // SAFETY: as for read_fifo
            unsafe { ptr::write_volatile(fifo.add(i), *byte) };
        }
    }

    fn dma_load(&mut self, endpoint: u8, descriptor: DmaDescriptor) {
        if !Self::has_dma_channel(endpoint) {
            return;
        }
        // Single-descriptor transfers program the channel directly; no
        // in-memory descriptor fetch, so no chaining
        self.write(
            Self::dma_offset(regs::DMA_ADDRESS, endpoint),
            descriptor.addr as u32,
        );
        self.write(
            Self::dma_offset(regs::DMA_CONTROL, endpoint),
            descriptor.control_bits(),
        );
    }

    fn dma_stop(&mut self, endpoint: u8) {
        if !Self::has_dma_channel(endpoint) {
            return;
        }
        self.write(Self::dma_offset(regs::DMA_CONTROL, endpoint), 0);
        self.write(Self::dma_offset(regs::DMA_ADDRESS, endpoint), 0);
    }

    fn dma_remaining(&self, endpoint: u8) -> u16 {
        if !Self::has_dma_channel(endpoint) {
            return 0;
        }
        let status = self.read(Self::dma_offset(regs::DMA_STATUS, endpoint));
        (status >> regs::DMA_STATUS_BUFF_COUNT_SHIFT) as u16
    }

    fn dma_address(&self, endpoint: u8) -> usize {
        if !Self::has_dma_channel(endpoint) {
            return 0;
        }
        self.read(Self::dma_offset(regs::DMA_ADDRESS, endpoint)) as usize
    }

    fn dma_status(&mut self, endpoint: u8) -> DmaStatus {
        if !Self::has_dma_channel(endpoint) {
            return DmaStatus::default();
        }
        // The event bits clear on read
        let status = self.read(Self::dma_offset(regs::DMA_STATUS, endpoint));
        DmaStatus {
            active: status & (regs::DMA_STATUS_CHANN_ENB | regs::DMA_STATUS_CHANN_ACT) != 0,
            end_transfer: status & regs::DMA_STATUS_END_TR_ST != 0,
            end_buffer: status & regs::DMA_STATUS_END_BF_ST != 0,
            descriptor_loaded: status & regs::DMA_STATUS_DESC_LDST != 0,
            remaining: (status >> regs::DMA_STATUS_BUFF_COUNT_SHIFT) as u16,
        }
    }

    fn enable_dma_interrupt(&mut self, endpoint: u8) {
        if Self::has_dma_channel(endpoint) {
            self.write(regs::DEVIER, Self::dma_summary_bit(endpoint));
        }
    }

    fn disable_dma_interrupt(&mut self, endpoint: u8) {
        if Self::has_dma_channel(endpoint) {
            self.write(regs::DEVIDR, Self::dma_summary_bit(endpoint));
        }
    }

    fn dma_irq_pending(&self, endpoint: u8) -> bool {
        Self::has_dma_channel(endpoint)
            && self.read(regs::DEVISR) & Self::dma_summary_bit(endpoint) != 0
    }

    fn dma_irq_enabled(&self, endpoint: u8) -> bool {
        Self::has_dma_channel(endpoint)
            && self.read(regs::DEVIMR) & Self::dma_summary_bit(endpoint) != 0
    }
}
