use axerrno::AxResult;

use crate::{AxHmHal, AxVCpu, AxVCpuExitReason, AxVm, ControlPage, HmCapabilities, VmHmContext};

/// Vendor-specific (VT-x or AMD-V) hardware virtualization backend.
///
/// This trait is the seam between the vendor-independent enable/world-switch logic of this
/// crate and the instruction sequences that program a VMCS or VMCB. Exactly one backend is
/// used per host, selected by [`HmCapabilities::technology`].
///
/// # Calling context
///
/// - [`AxArchHm::enable_cpu`] and [`AxArchHm::disable_cpu`] run on the physical CPU they
///   configure, with preemption disabled.
/// - [`AxArchHm::setup_vm`] runs once per machine, before any vcpu executes.
/// - The world-switch methods run on the EMT of `vcpu`, in the order `enter`,
///   `save_host_state`, `load_guest_state`, then any number of `run_guest_code`, then `leave`.
pub trait AxArchHm<H: AxHmHal>: Send + Sync {
    /// Enables VMX/SVM operation on the current CPU, using `page` as the VMXON region or host
    /// save area.
    fn enable_cpu(&self, cpu_id: usize, page: &ControlPage, caps: &HmCapabilities) -> AxResult;

    /// Disables VMX/SVM operation on the current CPU.
    fn disable_cpu(&self, cpu_id: usize, page: &ControlPage) -> AxResult;

    /// Per-machine setup, e.g. picking the ASID/VPID allocation policy.
    fn setup_vm(&self, vm: &mut VmHmContext) -> AxResult;

    /// Prepares the current CPU to run `vcpu`.
    fn enter(&self, vm: &AxVm<H>, vcpu: &AxVCpu<H>) -> AxResult;

    /// Saves the host state restored on VM exit.
    fn save_host_state(&self, vm: &AxVm<H>, vcpu: &AxVCpu<H>) -> AxResult;

    /// Loads the dirty parts of the guest context into the VMCS/VMCB.
    fn load_guest_state(&self, vm: &AxVm<H>, vcpu: &AxVCpu<H>) -> AxResult;

    /// Runs the guest until something needs the host.
    ///
    /// Implementations are expected to return [`AxVCpuExitReason::ForcedAction`] at the next
    /// exit point after a forced action shows up in the vcpu's or machine's registry.
    fn run_guest_code(&self, vm: &AxVm<H>, vcpu: &AxVCpu<H>) -> AxResult<AxVCpuExitReason>;

    /// Undoes [`AxArchHm::enter`].
    fn leave(&self, vm: &AxVm<H>, vcpu: &AxVCpu<H>) -> AxResult;
}
