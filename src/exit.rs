#[allow(unused_imports)] // used in doc
use crate::AxArchHm;

memory_addr::def_usize_addr! {
    /// Guest physical address.
    pub type GuestPhysAddr;
}

memory_addr::def_usize_addr_formatter! {
    GuestPhysAddr = "GPA:{}";
}

/// The width of a port or MMIO access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessWidth {
    /// 8-bit access.
    Byte,
    /// 16-bit access.
    Word,
    /// 32-bit access.
    Dword,
    /// 64-bit access.
    Qword,
}

impl AccessWidth {
    /// The access size in bytes.
    pub const fn size(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Word => 2,
            Self::Dword => 4,
            Self::Qword => 8,
        }
    }
}

/// Why control came back from [`AxArchHm::run_guest_code`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AxVCpuExitReason {
    /// The vendor run-loop saw a pending forced action and returned to let the host service it.
    ForcedAction,
    /// A guest timer (or the preemption timer armed on its behalf) expired.
    Timer,
    /// An external interrupt happened.
    ///
    /// Note that fields may be added in the future, use `..` to handle them.
    ExternalInterrupt {
        /// The interrupt vector.
        vector: u64,
    },
    /// The instruction executed by the vcpu performs a hypercall.
    Hypercall {
        /// The hypercall number.
        nr: u64,
        /// The arguments for the hypercall.
        args: [u64; 6],
    },
    /// The instruction executed by the vcpu performs a I/O read operation.
    ///
    /// It's unnecessary to specify the destination register because it's always `al`, `ax`, or `eax`.
    IoRead {
        /// The port number of the I/O read.
        port: u16,
        /// The width of the I/O read.
        width: AccessWidth,
    },
    /// The instruction executed by the vcpu performs a I/O write operation.
    IoWrite {
        /// The port number of the I/O write.
        port: u16,
        /// The width of the I/O write.
        width: AccessWidth,
        /// The data to be written.
        data: u64,
    },
    /// The guest read an intercepted MSR.
    MsrRead {
        /// The MSR index, taken from `ecx`.
        msr: u32,
    },
    /// The guest wrote an intercepted MSR.
    MsrWrite {
        /// The MSR index, taken from `ecx`.
        msr: u32,
        /// The value taken from `edx:eax`.
        value: u64,
    },
    /// Another intercepted instruction the host has to emulate.
    Instruction {
        /// The raw vendor exit code.
        exit_code: u64,
    },
    /// A nested page fault (EPT violation / NPF) the host has to resolve.
    NestedPageFault {
        /// The guest physical address of the fault.
        addr: GuestPhysAddr,
        /// Whether the faulting access was a write.
        write: bool,
    },
    /// The vcpu executed `HLT`.
    Halt,
    /// Nothing special happened, the vendor layer has handled the exit itself.
    Nothing,
    /// Something bad happened during VM entry, the vcpu could not be run.
    FailEntry {
        /// Vendor-specific VM entry failure reason.
        hardware_entry_failure_reason: u64,
    },
}

impl AxVCpuExitReason {
    /// Whether the exit leaves the vcpu unable to continue without outside intervention.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::FailEntry { .. })
    }
}
