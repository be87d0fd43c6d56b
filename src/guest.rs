/// The guest register state of one vcpu, as seen by the world switch and the vendor layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuestCpuContext {
    /// General purpose registers, in the x86 encoding order (rax, rcx, rdx, rbx, rsp, ...).
    pub gprs: [u64; 16],
    pub rip: u64,
    pub rflags: u64,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,
    /// Whether the guest FPU/extended state is currently loaded on the physical CPU.
    ///
    /// Set by the vendor layer when the guest touches the FPU while running.
    pub fpu_active: bool,
}

impl GuestCpuContext {
    /// Index of `rax` in [`GuestCpuContext::gprs`].
    pub const RAX: usize = 0;
    /// Index of `rsp` in [`GuestCpuContext::gprs`].
    pub const RSP: usize = 4;
}
