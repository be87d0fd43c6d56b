use memory_addr::{PhysAddr, VirtAddr};
use raw_cpuid::CpuIdResult;

use crate::{AxArchHm, GuestCpuContext};

/// Host physical address.
pub type HostPhysAddr = PhysAddr;
/// Host virtual address.
pub type HostVirtAddr = VirtAddr;

/// The interfaces which the underlying software (kernel or hypervisor) must implement.
///
/// Register and instruction accessors act on the physical CPU the caller is currently running
/// on. Callers that need several of them to observe the same CPU disable preemption first.
pub trait AxHmHal: Sized + Send + Sync + 'static {
    /// The VT-x backend.
    type VtxBackend: AxArchHm<Self>;
    /// The AMD-V backend.
    type AmdVBackend: AxArchHm<Self>;

    /// Returns the VT-x backend.
    fn vtx_backend(&self) -> &Self::VtxBackend;

    /// Returns the AMD-V backend.
    fn amdv_backend(&self) -> &Self::AmdVBackend;

    /// Returns an identifier of the calling thread. Never `0`.
    fn current_thread_id() -> u64;

    /// Returns the index of the physical CPU the caller is running on.
    fn current_cpu_id() -> usize;

    /// The number of possible physical CPUs. CPU indexes are below this number.
    fn cpu_num(&self) -> usize;

    /// Whether the physical CPU `cpu_id` is online.
    fn is_cpu_online(&self, cpu_id: usize) -> bool;

    /// Runs `f` once on every online physical CPU and waits for all of them to finish.
    ///
    /// `f` receives the index of the CPU it runs on, which equals [`AxHmHal::current_cpu_id`]
    /// while `f` executes.
    fn run_on_each_cpu(&self, f: &(dyn Fn(usize) + Sync));

    /// Disables preemption and migration of the calling thread.
    fn preempt_disable(&self);

    /// Re-enables preemption and migration of the calling thread.
    fn preempt_enable(&self);

    /// Allocates one zeroed, 4K-aligned, physically contiguous page.
    fn alloc_contiguous_page(&self) -> Option<HostPhysAddr>;

    /// Frees a page returned by [`AxHmHal::alloc_contiguous_page`].
    fn dealloc_contiguous_page(&self, paddr: HostPhysAddr);

    /// Converts a host physical address to a host virtual address.
    fn phys_to_virt(&self, paddr: HostPhysAddr) -> HostVirtAddr;

    /// Whether the `CPUID` instruction is usable.
    fn has_cpuid(&self) -> bool {
        true
    }

    /// Executes `CPUID` with the given leaf and subleaf.
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuIdResult;

    /// Reads a model-specific register.
    fn read_msr(&self, msr: u32) -> u64;

    /// Writes a model-specific register.
    fn write_msr(&self, msr: u32, value: u64);

    /// Reads `CR4`.
    fn read_cr4(&self) -> u64;

    /// Writes `CR4`.
    fn write_cr4(&self, value: u64);

    /// Executes `VMXON` with the given region. Returns `false` if the instruction failed.
    fn vmxon(&self, region: HostPhysAddr) -> bool;

    /// Executes `VMXOFF`.
    fn vmxoff(&self);

    /// Saves the guest FPU/extended state into `ctx` and loads the host's back onto the CPU.
    fn fpu_save_guest_restore_host(&self, ctx: &mut GuestCpuContext);
}

/// Keeps the calling thread on its physical CPU while alive.
pub(crate) struct PreemptGuard<'a, H: AxHmHal> {
    hal: &'a H,
}

impl<'a, H: AxHmHal> PreemptGuard<'a, H> {
    pub(crate) fn new(hal: &'a H) -> Self {
        hal.preempt_disable();
        Self { hal }
    }
}

impl<H: AxHmHal> Drop for PreemptGuard<'_, H> {
    fn drop(&mut self) {
        self.hal.preempt_enable();
    }
}
