//! Local APIC driver and IPI protocol (C2).
//!
//! Register access is uniform across the xAPIC (MMIO) and x2APIC (MSR) variants behind a single
//! [`LocalApic`] type chosen once at construction by probing `CPUID.01H:ECX.x2APIC`, rather than
//! branching on every call.

use core::sync::atomic::{fence, Ordering};

use hermit_sync::InterruptTicketMutex;
use raw_cpuid::CpuId;
use x86_64::instructions::port::Port;
use x86_64::registers::model_specific::Msr;

use crate::config::{APIC_MMIO_BASE, IPI_VECTOR, SPIN_TIMEOUT_ITERATIONS, TIMER_VECTOR};
use crate::error::{NkError, Result};

// Register offsets, in bytes, within the xAPIC MMIO page (16-byte aligned per the architecture).
const REG_ID: u32 = 0x020;
const REG_VERSION: u32 = 0x030;
const REG_EOI: u32 = 0x0B0;
const REG_SVR: u32 = 0x0F0;
const REG_ESR: u32 = 0x280;
const REG_ICR_LOW: u32 = 0x300;
const REG_ICR_HIGH: u32 = 0x310;
const REG_LVT_TIMER: u32 = 0x320;
const REG_TIMER_INITIAL_COUNT: u32 = 0x380;
const REG_TIMER_DIVIDE_CONFIG: u32 = 0x3E0;

// x2APIC MSRs mirror the xAPIC offsets at `0x800 + offset / 0x10`.
const X2APIC_MSR_BASE: u32 = 0x800;

const ICR_DELIVERY_MODE_FIXED: u32 = 0b000 << 8;
const ICR_DELIVERY_MODE_INIT: u32 = 0b101 << 8;
const ICR_DELIVERY_MODE_STARTUP: u32 = 0b110 << 8;
const ICR_LEVEL_ASSERT: u32 = 1 << 14;
const ICR_TRIGGER_LEVEL: u32 = 1 << 15;
const ICR_DELIVERY_STATUS_PENDING: u32 = 1 << 12;

const SVR_APIC_ENABLE: u32 = 1 << 8;

const LVT_TIMER_PERIODIC: u32 = 1 << 17;
const LVT_MASKED: u32 = 1 << 16;

/// A delivery mode accepted by [`LocalApic::send_ipi`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Fixed,
    Init,
    Startup,
}

impl DeliveryMode {
    fn bits(self) -> u32 {
        match self {
            DeliveryMode::Fixed => ICR_DELIVERY_MODE_FIXED,
            DeliveryMode::Init => ICR_DELIVERY_MODE_INIT,
            DeliveryMode::Startup => ICR_DELIVERY_MODE_STARTUP,
        }
    }
}

enum Backend {
    /// MMIO register window, identity-mapped at [`APIC_MMIO_BASE`].
    Xapic { base: *mut u32 },
    /// `IA32_X2APIC_*` model-specific registers.
    X2apic,
}

// The MMIO window is a fixed hardware address read/written under full fences; access is safe
// from any CPU that has mapped it, which every CPU does identically.
unsafe impl Send for Backend {}
unsafe impl Sync for Backend {}

/// A local APIC, dispatching to xAPIC MMIO or x2APIC MSRs depending on what
/// `LocalApic::new` found at construction.
pub struct LocalApic {
    backend: Backend,
}

impl LocalApic {
    /// Probes `CPUID.01H:ECX.x2APIC` and constructs the matching backend. The xAPIC MMIO page
    /// is assumed identity-mapped at [`APIC_MMIO_BASE`] by the caller before this runs.
    pub fn new() -> Self {
        let has_x2apic = CpuId::new()
            .get_feature_info()
            .map(|f| f.has_x2apic())
            .unwrap_or(false);

        let backend = if has_x2apic {
            Backend::X2apic
        } else {
            Backend::Xapic {
                base: APIC_MMIO_BASE as *mut u32,
            }
        };
        Self { backend }
    }

    /// Reads a 32-bit register. `offset` is the xAPIC MMIO byte offset; the x2APIC backend
    /// derives the matching MSR index from it.
    pub fn read(&self, offset: u32) -> u32 {
        fence(Ordering::SeqCst);
        let value = match &self.backend {
            Backend::Xapic { base } => unsafe {
                core::ptr::read_volatile(base.byte_add(offset as usize))
            },
            Backend::X2apic => {
                let msr = Msr::new(X2APIC_MSR_BASE + offset / 0x10);
                unsafe { msr.read() as u32 }
            }
        };
        fence(Ordering::SeqCst);
        value
    }

    /// Writes a 32-bit register. See [`Self::read`] for `offset`'s meaning.
    pub fn write(&self, offset: u32, value: u32) {
        fence(Ordering::SeqCst);
        match &self.backend {
            Backend::Xapic { base } => unsafe {
                core::ptr::write_volatile(base.byte_add(offset as usize), value);
            },
            Backend::X2apic => {
                let mut msr = Msr::new(X2APIC_MSR_BASE + offset / 0x10);
                unsafe { msr.write(u64::from(value)) };
            }
        }
        fence(Ordering::SeqCst);
    }

    /// Software-enables the APIC via the SVR register. Must run before the first trusted read;
    /// a disabled APIC reads back zero for most registers.
    pub fn enable(&self) {
        let svr = self.read(REG_SVR);
        self.write(REG_SVR, svr | SVR_APIC_ENABLE | u32::from(IPI_VECTOR));
    }

    /// This CPU's own APIC id, as reported by the APIC itself (not ACPI).
    pub fn id(&self) -> u8 {
        match &self.backend {
            // xAPIC packs the id in bits 24..32; x2APIC uses the full 32-bit register.
            Backend::Xapic { .. } => (self.read(REG_ID) >> 24) as u8,
            Backend::X2apic => self.read(REG_ID) as u8,
        }
    }

    /// Clears the Error Status Register, if the APIC version register indicates support.
    fn clear_esr(&self) {
        self.write(REG_ESR, 0);
        self.write(REG_ESR, 0);
    }

    /// Writes ICR-high (target) then ICR-low (command), in that order, as the architecture
    /// requires. The assert bit is set only for `Init` (and would be for SMI, which this crate
    /// never sends); `Startup` is always edge-triggered without it.
    pub fn send_ipi(&self, target_apic_id: u8, mode: DeliveryMode, vector: u8) {
        let mut low = mode.bits() | u32::from(vector);
        if mode == DeliveryMode::Init {
            low |= ICR_TRIGGER_LEVEL | ICR_LEVEL_ASSERT;
        }
        self.write(REG_ICR_HIGH, u32::from(target_apic_id) << 24);
        self.write(REG_ICR_LOW, low);
    }

    /// Sends an INIT-deassert: level-triggered, no assert bit. Intel mandates this follow
    /// INIT-assert; a CPU omitting it leaves the targeted AP permanently stuck.
    fn send_init_deassert(&self, target_apic_id: u8) {
        self.write(REG_ICR_HIGH, u32::from(target_apic_id) << 24);
        self.write(REG_ICR_LOW, ICR_DELIVERY_MODE_INIT | ICR_TRIGGER_LEVEL);
    }

    /// Polls the ICR delivery-status bit until it clears or the iteration budget runs out.
    pub fn wait_for_delivery(&self) -> Result<()> {
        let mut iterations = 0u64;
        while self.read(REG_ICR_LOW) & ICR_DELIVERY_STATUS_PENDING != 0 {
            core::hint::spin_loop();
            iterations += 1;
            if iterations > SPIN_TIMEOUT_ITERATIONS {
                return Err(NkError::Timeout);
            }
        }
        Ok(())
    }

    /// Writes 0 to the EOI register, acknowledging the interrupt currently in service.
    pub fn eoi(&self) {
        self.write(REG_EOI, 0);
    }

    /// Configures the timer LVT for periodic mode at [`TIMER_VECTOR`] and loads the initial
    /// count. `divide` is the raw divide-configuration value (see Intel SDM Vol. 3A, Table
    /// 10-10); callers pass the encoding for the divisor they want.
    pub fn timer_init(&self, initial_count: u32, divide: u32) {
        self.write(REG_TIMER_DIVIDE_CONFIG, divide);
        self.write(REG_LVT_TIMER, LVT_TIMER_PERIODIC | u32::from(TIMER_VECTOR));
        self.write(REG_TIMER_INITIAL_COUNT, initial_count);
    }

    /// Masks the timer LVT entry, stopping further timer interrupts without touching the
    /// divide or count configuration.
    pub fn timer_stop(&self) {
        self.write(REG_LVT_TIMER, LVT_MASKED | u32::from(TIMER_VECTOR));
    }

    /// Executes the Intel INIT/STARTUP sequence to bring an AP out of reset and into the
    /// trampoline at `page_number`. See the module docs of [`crate::smp`] for the surrounding
    /// bring-up protocol.
    ///
    /// Fails with [`NkError::Timeout`] on the first IPI that does not report delivered; the
    /// caller (the bootstrap coordinator) treats that as a non-fatal, per-AP failure.
    pub fn ap_startup(&self, apic_id: u8, page_number: u8) -> Result<()> {
        if self.read(REG_VERSION) & 0xFF >= 0x10 {
            self.clear_esr();
        }

        self.send_ipi(apic_id, DeliveryMode::Init, 0);
        self.wait_for_delivery()?;
        delay_us(10_000);

        self.send_init_deassert(apic_id);
        self.wait_for_delivery()?;
        delay_us(10_000);

        self.send_ipi(apic_id, DeliveryMode::Startup, page_number);
        self.wait_for_delivery()?;
        delay_us(200);

        // Intel recommends sending STARTUP twice; a real AP ignores the second if it already
        // started executing from the first.
        self.send_ipi(apic_id, DeliveryMode::Startup, page_number);
        self.wait_for_delivery()?;
        delay_us(200);

        Ok(())
    }
}

impl Default for LocalApic {
    fn default() -> Self {
        Self::new()
    }
}

/// A bounded busy-wait, used only for the millisecond/microsecond-scale delays the INIT/STARTUP
/// sequence calls for. Not a precise clock: it burns a fixed number of `in`-from-port-0x80
/// I/O-delay cycles, the same "write discard to an unused ISA port" trick the rest of this
/// lineage uses when no calibrated timer is available yet this early in boot.
#[cfg(not(test))]
fn delay_us(us: u64) {
    let mut port: Port<u8> = Port::new(0x80);
    for _ in 0..us {
        unsafe { port.write(0) };
    }
}

#[cfg(test)]
fn delay_us(_us: u64) {}

/// This CPU's [`LocalApic`], installed by the boot sequence once the driver has been constructed
/// and enabled. The timer and IPI interrupt handlers (`crate::idt`) reach the APIC only through
/// this accessor, since they have no other way to get at the instance a boot function built
/// locally.
static LOCAL: InterruptTicketMutex<Option<LocalApic>> = InterruptTicketMutex::new(None);

/// Installs `apic` as this CPU's local APIC instance.
pub fn install_local(apic: LocalApic) {
    *LOCAL.lock() = Some(apic);
}

/// Acknowledges the interrupt currently in service on this CPU's local APIC, if one has been
/// installed. A no-op (rather than a panic) if called before [`install_local`], which keeps
/// early, pre-APIC faults from cascading into a second fault inside their own handler.
pub fn eoi_current() {
    if let Some(apic) = LOCAL.lock().as_ref() {
        apic.eoi();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_mode_bits_match_intel_encoding() {
        assert_eq!(DeliveryMode::Fixed.bits(), 0b000 << 8);
        assert_eq!(DeliveryMode::Init.bits(), 0b101 << 8);
        assert_eq!(DeliveryMode::Startup.bits(), 0b110 << 8);
    }

    #[test]
    fn init_ipi_sets_level_and_assert_bits() {
        let mode = DeliveryMode::Init;
        let mut low = mode.bits() | 0u32;
        if mode == DeliveryMode::Init {
            low |= ICR_TRIGGER_LEVEL | ICR_LEVEL_ASSERT;
        }
        assert_ne!(low & ICR_TRIGGER_LEVEL, 0);
        assert_ne!(low & ICR_LEVEL_ASSERT, 0);
    }

    #[test]
    fn startup_ipi_never_sets_assert_bit() {
        let mode = DeliveryMode::Startup;
        let mut low = mode.bits() | 7u32;
        if mode == DeliveryMode::Init {
            low |= ICR_TRIGGER_LEVEL | ICR_LEVEL_ASSERT;
        }
        assert_eq!(low & ICR_LEVEL_ASSERT, 0);
        assert_eq!(low & ICR_TRIGGER_LEVEL, 0);
    }
}
