use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use axerrno::{ax_err, AxResult};
use memory_addr::PAGE_SIZE_4K;

use crate::{AxArchHm, AxHmHal, HmCapabilities, HmTechnology, HostPhysAddr, HostVirtAddr};

/// A 4K, physically contiguous page handed to the vendor layer, e.g. as VMXON region or host
/// save area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlPage {
    paddr: HostPhysAddr,
    vaddr: HostVirtAddr,
}

impl ControlPage {
    pub(crate) fn alloc<H: AxHmHal>(hal: &H) -> Option<Self> {
        let paddr = hal.alloc_contiguous_page()?;
        debug_assert!(memory_addr::is_aligned_4k(paddr.as_usize()));
        Some(Self::from_paddr(hal, paddr))
    }

    fn from_paddr<H: AxHmHal>(hal: &H, paddr: HostPhysAddr) -> Self {
        Self {
            paddr,
            vaddr: hal.phys_to_virt(paddr),
        }
    }

    /// The physical address of the page.
    pub const fn paddr(&self) -> HostPhysAddr {
        self.paddr
    }

    /// The host virtual address the page is mapped at.
    pub const fn vaddr(&self) -> HostVirtAddr {
        self.vaddr
    }

    /// Writes a 32-bit value at `offset` bytes into the page.
    pub fn write_u32(&self, offset: usize, value: u32) {
        assert!(offset % 4 == 0 && offset + 4 <= PAGE_SIZE_4K);
        // SAFETY: the page is mapped, 4K long and exclusively owned by its holder.
        unsafe {
            self.vaddr
                .as_mut_ptr()
                .add(offset)
                .cast::<u32>()
                .write_volatile(value)
        }
    }

    /// Reads a 32-bit value at `offset` bytes into the page.
    pub fn read_u32(&self, offset: usize) -> u32 {
        assert!(offset % 4 == 0 && offset + 4 <= PAGE_SIZE_4K);
        // SAFETY: see `write_u32`.
        unsafe {
            self.vaddr
                .as_mut_ptr()
                .add(offset)
                .cast::<u32>()
                .read_volatile()
        }
    }
}

/// How hardware virtualization is switched on for this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HmEnableMode {
    /// Nobody requested enablement yet.
    Uninitialized = 0,
    /// Enabled once on every online CPU, kept on until termination.
    Global = 1,
    /// Enabled on the current CPU around each world switch only.
    Local = 2,
}

impl HmEnableMode {
    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Global,
            2 => Self::Local,
            _ => Self::Uninitialized,
        }
    }
}

/// Host per-CPU state of hardware virtualization.
///
/// A slot is only ever modified by code running on the physical CPU it describes, except for
/// page allocation before a broadcast and page release after one, both done while no
/// broadcast is in flight.
#[derive(Debug)]
pub struct PhysCpuSlot {
    /// The index of the physical CPU.
    cpu_id: usize,
    /// Physical address of the control page, `0` if none is allocated.
    page: AtomicUsize,
    /// The [`HmTechnology`] enabled on this CPU.
    configured: AtomicU8,
}

impl PhysCpuSlot {
    pub(crate) const fn new(cpu_id: usize) -> Self {
        Self {
            cpu_id,
            page: AtomicUsize::new(0),
            configured: AtomicU8::new(HmTechnology::None as u8),
        }
    }

    /// The index of the physical CPU.
    pub const fn cpu_id(&self) -> usize {
        self.cpu_id
    }

    /// What is currently enabled on this CPU.
    pub fn configured_technology(&self) -> HmTechnology {
        HmTechnology::from_u8(self.configured.load(Ordering::Acquire))
    }

    /// Whether hardware virtualization is enabled on this CPU.
    pub fn is_enabled(&self) -> bool {
        self.configured_technology() != HmTechnology::None
    }

    /// Whether a control page is allocated for this CPU.
    pub fn has_control_page(&self) -> bool {
        self.page.load(Ordering::Acquire) != 0
    }

    /// The control page of this CPU, if allocated.
    pub fn control_page<H: AxHmHal>(&self, hal: &H) -> Option<ControlPage> {
        match self.page.load(Ordering::Acquire) {
            0 => None,
            paddr => Some(ControlPage::from_paddr(hal, HostPhysAddr::from(paddr))),
        }
    }

    /// Allocates the control page unless there already is one.
    pub(crate) fn ensure_control_page<H: AxHmHal>(&self, hal: &H) -> AxResult {
        if self.has_control_page() {
            return Ok(());
        }
        let page = match ControlPage::alloc(hal) {
            Some(page) => page,
            None => return ax_err!(NoMemory, "no control page for CPU"),
        };
        self.page.store(page.paddr().as_usize(), Ordering::Release);
        Ok(())
    }

    /// Releases the control page. The CPU must not be enabled.
    pub(crate) fn free_control_page<H: AxHmHal>(&self, hal: &H) {
        debug_assert!(!self.is_enabled());
        let paddr = self.page.swap(0, Ordering::AcqRel);
        if paddr != 0 {
            hal.dealloc_contiguous_page(HostPhysAddr::from(paddr));
        }
    }

    /// Enables hardware virtualization on this CPU. Must run on this CPU.
    pub(crate) fn hardware_enable<H: AxHmHal>(
        &self,
        hal: &H,
        backend: &dyn AxArchHm<H>,
        caps: &HmCapabilities,
    ) -> AxResult {
        debug_assert_eq!(H::current_cpu_id(), self.cpu_id);
        if self.is_enabled() {
            return Ok(());
        }
        let page = match self.control_page(hal) {
            Some(page) => page,
            None => return ax_err!(BadState, "CPU has no control page"),
        };
        backend.enable_cpu(self.cpu_id, &page, caps)?;
        self.configured.store(caps.technology as u8, Ordering::Release);
        trace!("CPU {}: {:?} enabled", self.cpu_id, caps.technology);
        Ok(())
    }

    /// Disables hardware virtualization on this CPU. Must run on this CPU.
    pub(crate) fn hardware_disable<H: AxHmHal>(
        &self,
        hal: &H,
        backend: &dyn AxArchHm<H>,
    ) -> AxResult {
        debug_assert_eq!(H::current_cpu_id(), self.cpu_id);
        if !self.is_enabled() {
            return Ok(());
        }
        let page = match self.control_page(hal) {
            Some(page) => page,
            None => return ax_err!(BadState, "CPU has no control page"),
        };
        backend.disable_cpu(self.cpu_id, &page)?;
        self.configured.store(HmTechnology::None as u8, Ordering::Release);
        trace!("CPU {}: disabled", self.cpu_id);
        Ok(())
    }
}
