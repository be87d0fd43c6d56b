//! Forced actions: lock-free "please come back to the host" signaling.
//!
//! Any thread may post a forced action on a machine or on one vcpu; only the owning EMT consumes
//! them. Individual actions are identified by the [`VmForcedAction`] / [`VCpuForcedAction`]
//! enums, and grouped into priority classes by the associated constants of [`VmFfMask`] /
//! [`VCpuFfMask`], so the dispatch loop can test a whole class with one load.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Defines a forced-action enum together with its mask type.
///
/// Each variant's discriminant is its bit position, and a const block checks that the mask
/// constant of every variant is exactly `1 << discriminant` and fits the mask width. Reusing a
/// bit position is rejected by the compiler as a duplicate discriminant.
macro_rules! forced_actions {
    (
        $(#[$emeta:meta])*
        pub enum $Enum:ident;
        $(#[$($mmeta:tt)*])*
        pub struct $Mask:ident: $T:ty {
            $(
                $(#[$($doc:tt)*])*
                $Variant:ident = $CONST:ident @ $bit:literal,
            )*
        }
    ) => {
        bitflags::bitflags! {
            $(#[$($mmeta)*])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub struct $Mask: $T {
                $(
                    $(#[$($doc)*])*
                    const $CONST = 1 << $bit;
                )*
            }
        }

        $(#[$emeta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum $Enum {
            $(
                $(#[$($doc)*])*
                $Variant = $bit,
            )*
        }

        impl $Enum {
            /// The bit position of this action.
            pub const fn bit(self) -> u32 {
                self as u32
            }

            /// The single-bit mask of this action.
            pub const fn mask(self) -> $Mask {
                match self {
                    $(Self::$Variant => $Mask::$CONST,)*
                }
            }
        }

        impl From<$Enum> for $Mask {
            fn from(action: $Enum) -> Self {
                action.mask()
            }
        }

        const _: () = {
            $(
                assert!($bit < <$T>::BITS);
                assert!($Mask::$CONST.bits().is_power_of_two());
                assert!($Mask::$CONST.bits() == (1 as $T) << ($Enum::$Variant as u32));
            )*
        };
    };
}

forced_actions! {
    /// A machine-wide forced action.
    pub enum VmForcedAction;

    /// A set of machine-wide forced actions.
    pub struct VmFfMask: u32 {
        /// The virtual-sync clock has expired timers to run.
        TmVirtualSync = TM_VIRTUAL_SYNC @ 2,
        /// Device queues need flushing.
        PdmQueues = PDM_QUEUES @ 3,
        /// A DMA transfer is pending.
        PdmDma = PDM_DMA @ 4,
        /// The debugger wants attention.
        Dbgf = DBGF @ 8,
        /// A machine-wide request is queued.
        Request = REQUEST @ 9,
        /// The machine state changed and every EMT should look at it.
        CheckVmState = CHECK_VM_STATE @ 10,
        /// A machine reset was requested.
        Reset = RESET @ 11,
        /// All EMTs must meet at a rendezvous point.
        EmtRendezvous = EMT_RENDEZVOUS @ 12,
        /// The memory manager is running low on free pages.
        PgmNeedHandyPages = PGM_NEED_HANDY_PAGES @ 18,
        /// The memory manager ran out of memory.
        PgmNoMemory = PGM_NO_MEMORY @ 19,
        /// A shadow page pool flush is pending.
        PgmPoolFlushPending = PGM_POOL_FLUSH_PENDING @ 20,
        /// The debugger requested a suspend.
        DebugSuspend = DEBUG_SUSPEND @ 31,
    }
}

impl VmFfMask {
    /// Must be serviced before attempting guest entry.
    pub const HIGH_PRIORITY_PRE: Self = Self::TM_VIRTUAL_SYNC
        .union(Self::DBGF)
        .union(Self::CHECK_VM_STATE)
        .union(Self::DEBUG_SUSPEND)
        .union(Self::PGM_NEED_HANDY_PAGES)
        .union(Self::PGM_NO_MEMORY)
        .union(Self::EMT_RENDEZVOUS);
    /// The part of [`Self::HIGH_PRIORITY_PRE`] checked before every hardware-assisted entry.
    pub const HIGH_PRIORITY_PRE_HARDWARE: Self = Self::TM_VIRTUAL_SYNC
        .union(Self::PGM_NEED_HANDY_PAGES)
        .union(Self::PGM_NO_MEMORY)
        .union(Self::EMT_RENDEZVOUS);
    /// Must be serviced right after returning from the guest.
    pub const HIGH_PRIORITY_POST: Self = Self::PGM_NO_MEMORY;
    /// May wait for the next convenient point in the dispatch loop.
    pub const NORMAL_PRIORITY: Self = Self::REQUEST
        .union(Self::PDM_QUEUES)
        .union(Self::PDM_DMA)
        .union(Self::EMT_RENDEZVOUS);
    /// Normal-priority work that is looked at after leaving the guest.
    pub const NORMAL_PRIORITY_POST: Self = Self::CHECK_VM_STATE
        .union(Self::DBGF)
        .union(Self::RESET)
        .union(Self::PGM_NO_MEMORY)
        .union(Self::EMT_RENDEZVOUS);
    /// Breaks the wait of a suspended machine.
    pub const EXTERNAL_SUSPENDED: Self = Self::CHECK_VM_STATE
        .union(Self::DBGF)
        .union(Self::RESET)
        .union(Self::EMT_RENDEZVOUS);
    /// Breaks the wait of a halted vcpu.
    pub const EXTERNAL_HALTED: Self = Self::CHECK_VM_STATE
        .union(Self::DBGF)
        .union(Self::REQUEST)
        .union(Self::PDM_QUEUES)
        .union(Self::PDM_DMA)
        .union(Self::EMT_RENDEZVOUS);
}

forced_actions! {
    /// A forced action local to one vcpu.
    pub enum VCpuForcedAction;

    /// A set of vcpu-local forced actions.
    pub struct VCpuFfMask: u64 {
        /// The local APIC has an interrupt to deliver.
        InterruptApic = INTERRUPT_APIC @ 0,
        /// The legacy PIC has an interrupt to deliver.
        InterruptPic = INTERRUPT_PIC @ 1,
        /// A timer owned by this vcpu expired.
        Timer = TIMER @ 2,
        /// An NMI is pending.
        InterruptNmi = INTERRUPT_NMI @ 3,
        /// An SMI is pending.
        InterruptSmi = INTERRUPT_SMI @ 4,
        /// APIC state must be resynchronised.
        UpdateApic = UPDATE_APIC @ 5,
        /// Wake the vcpu from a halt.
        Unhalt = UNHALT @ 6,
        /// The debugger wants attention.
        Dbgf = DBGF @ 8,
        /// A request targeted at this vcpu is queued.
        Request = REQUEST @ 9,
        /// Guest CR3 must be resynchronised after a hardware exit.
        HmUpdateCr3 = HM_UPDATE_CR3 @ 12,
        /// Guest PAE PDPTEs must be resynchronised after a hardware exit.
        HmUpdatePaePdpes = HM_UPDATE_PAE_PDPES @ 13,
        /// A critical section was left with deferred work.
        PdmCritsect = PDM_CRITSECT @ 14,
        /// The shadow paging structures must be synced (global pages included).
        PgmSyncCr3 = PGM_SYNC_CR3 @ 16,
        /// The shadow paging structures must be synced (non-global pages only).
        PgmSyncCr3NonGlobal = PGM_SYNC_CR3_NON_GLOBAL @ 17,
        /// The TLB must be flushed before the next entry.
        TlbFlush = TLB_FLUSH @ 18,
        /// Interrupts are inhibited for one instruction.
        InhibitInterrupts = INHIBIT_INTERRUPTS @ 24,
        /// NMIs are blocked until the next IRET.
        BlockNmis = BLOCK_NMIS @ 25,
        /// The instruction emulator has pending commits.
        Iem = IEM @ 26,
        /// Leave guest execution and return to host-level processing.
        ToHost = TO_HOST @ 28,
        /// An I/O write must be committed.
        Iom = IOM @ 29,
        /// The guest CR0 must be reloaded on the next entry.
        HmDirtyGuestCr0 = HM_DIRTY_GUEST_CR0 @ 32,
        /// The host context must be reloaded on the next entry.
        HmDirtyHostContext = HM_DIRTY_HOST_CONTEXT @ 33,
    }
}

impl VCpuFfMask {
    /// Must be serviced before attempting guest entry.
    pub const HIGH_PRIORITY_PRE: Self = Self::TIMER
        .union(Self::INTERRUPT_APIC)
        .union(Self::UPDATE_APIC)
        .union(Self::INTERRUPT_PIC)
        .union(Self::INTERRUPT_NMI)
        .union(Self::INTERRUPT_SMI)
        .union(Self::DBGF)
        .union(Self::PGM_SYNC_CR3)
        .union(Self::PGM_SYNC_CR3_NON_GLOBAL)
        .union(Self::PDM_CRITSECT)
        .union(Self::IEM)
        .union(Self::IOM)
        .union(Self::TO_HOST);
    /// The part of [`Self::HIGH_PRIORITY_PRE`] checked before every hardware-assisted entry.
    /// Pending interrupts are left out: the vendor layer injects them on entry.
    pub const HIGH_PRIORITY_PRE_HARDWARE: Self = Self::TIMER
        .union(Self::PGM_SYNC_CR3)
        .union(Self::PGM_SYNC_CR3_NON_GLOBAL)
        .union(Self::PDM_CRITSECT)
        .union(Self::IEM)
        .union(Self::IOM)
        .union(Self::TO_HOST);
    /// Must be serviced right after returning from the guest.
    pub const HIGH_PRIORITY_POST: Self = Self::PDM_CRITSECT
        .union(Self::HM_UPDATE_CR3)
        .union(Self::HM_UPDATE_PAE_PDPES)
        .union(Self::IEM)
        .union(Self::IOM);
    /// May wait for the next convenient point in the dispatch loop.
    pub const NORMAL_PRIORITY: Self = Self::REQUEST;
    /// Normal-priority work that is looked at after leaving the guest.
    pub const NORMAL_PRIORITY_POST: Self = Self::DBGF;
    /// Breaks the wait of a suspended machine.
    pub const EXTERNAL_SUSPENDED: Self = Self::REQUEST.union(Self::DBGF);
    /// Breaks the wait of a halted vcpu.
    pub const EXTERNAL_HALTED: Self = Self::UPDATE_APIC
        .union(Self::INTERRUPT_APIC)
        .union(Self::INTERRUPT_PIC)
        .union(Self::INTERRUPT_NMI)
        .union(Self::INTERRUPT_SMI)
        .union(Self::REQUEST)
        .union(Self::UNHALT)
        .union(Self::TIMER)
        .union(Self::DBGF);
    /// Cleared right before resuming guest execution.
    pub const RESUME_GUEST: Self = Self::TO_HOST;
    /// Dirty-state markers the world switch raises on every entry.
    pub const HM_DIRTY_ON_ENTRY: Self = Self::HM_DIRTY_GUEST_CR0.union(Self::HM_DIRTY_HOST_CONTEXT);
}

/// Defines an atomic registry over one forced-action enum/mask pair.
macro_rules! ff_registry {
    (
        $(#[$meta:meta])*
        pub struct $Registry:ident($Atomic:ty) for $Enum:ident, $Mask:ident;
    ) => {
        $(#[$meta])*
        #[derive(Debug, Default)]
        pub struct $Registry {
            bits: $Atomic,
        }

        impl $Registry {
            /// Creates an empty registry.
            pub const fn new() -> Self {
                Self { bits: <$Atomic>::new(0) }
            }

            /// Posts a single action.
            pub fn set(&self, action: $Enum) {
                self.bits.fetch_or(action.mask().bits(), Ordering::AcqRel);
            }

            /// Posts several actions at once.
            pub fn set_mask(&self, mask: $Mask) {
                self.bits.fetch_or(mask.bits(), Ordering::AcqRel);
            }

            /// Withdraws a single action.
            pub fn clear(&self, action: $Enum) {
                self.bits.fetch_and(!action.mask().bits(), Ordering::AcqRel);
            }

            /// Withdraws several actions at once.
            pub fn clear_mask(&self, mask: $Mask) {
                self.bits.fetch_and(!mask.bits(), Ordering::AcqRel);
            }

            /// Whether `action` is pending.
            pub fn is_set(&self, action: $Enum) -> bool {
                self.bits.load(Ordering::Acquire) & action.mask().bits() != 0
            }

            /// Whether any action in `mask` is pending.
            pub fn is_any_set(&self, mask: $Mask) -> bool {
                self.bits.load(Ordering::Acquire) & mask.bits() != 0
            }

            /// Atomically consumes `action`, returning whether it was pending.
            ///
            /// For one posting, at most one concurrent caller observes `true`.
            pub fn test_and_clear(&self, action: $Enum) -> bool {
                let bit = action.mask().bits();
                self.bits.fetch_and(!bit, Ordering::AcqRel) & bit != 0
            }

            /// Whether something in `mask` is pending while nothing in `except` is.
            pub fn is_pending_except(&self, mask: $Mask, except: $Mask) -> bool {
                let bits = self.bits.load(Ordering::Acquire);
                bits & mask.bits() != 0 && bits & except.bits() == 0
            }

            /// A snapshot of every pending action.
            pub fn pending(&self) -> $Mask {
                $Mask::from_bits_retain(self.bits.load(Ordering::Acquire))
            }
        }
    };
}

ff_registry! {
    /// Machine-wide forced actions.
    pub struct VmFfRegistry(AtomicU32) for VmForcedAction, VmFfMask;
}

ff_registry! {
    /// Forced actions local to one vcpu.
    pub struct VCpuFfRegistry(AtomicU64) for VCpuForcedAction, VCpuFfMask;
}

const _: () = {
    assert!(VmFfMask::HIGH_PRIORITY_PRE.contains(VmFfMask::HIGH_PRIORITY_PRE_HARDWARE));
    assert!(VCpuFfMask::HIGH_PRIORITY_PRE.contains(VCpuFfMask::HIGH_PRIORITY_PRE_HARDWARE));
};
