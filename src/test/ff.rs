use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{VCpuFfMask, VCpuFfRegistry, VCpuForcedAction, VmFfMask, VmFfRegistry, VmForcedAction};

#[test]
fn test_ff_set_clear_round_trip() {
    let vm_ff = VmFfRegistry::new();
    for action in [
        VmForcedAction::TmVirtualSync,
        VmForcedAction::Request,
        VmForcedAction::CheckVmState,
        VmForcedAction::DebugSuspend,
    ] {
        vm_ff.set(action);
        assert!(vm_ff.is_set(action));
        vm_ff.clear(action);
        assert!(!vm_ff.is_set(action));
    }

    let vcpu_ff = VCpuFfRegistry::new();
    for action in [
        VCpuForcedAction::InterruptApic,
        VCpuForcedAction::ToHost,
        VCpuForcedAction::HmDirtyHostContext,
    ] {
        vcpu_ff.set(action);
        assert!(vcpu_ff.is_set(action));
        vcpu_ff.clear(action);
        assert!(!vcpu_ff.is_set(action));
    }
    assert!(vcpu_ff.pending().is_empty());
}

#[test]
fn test_ff_bits_match_declared_positions() {
    assert_eq!(VmForcedAction::CheckVmState.bit(), 10);
    assert_eq!(VmForcedAction::CheckVmState.mask(), VmFfMask::CHECK_VM_STATE);
    assert_eq!(VmFfMask::DEBUG_SUSPEND.bits(), 1 << 31);
    assert_eq!(VCpuForcedAction::HmDirtyHostContext.bit(), 33);
    assert_eq!(VCpuFfMask::HM_DIRTY_HOST_CONTEXT.bits(), 1 << 33);
    assert_eq!(
        VCpuFfMask::from(VCpuForcedAction::ToHost),
        VCpuFfMask::RESUME_GUEST
    );
}

#[test]
fn test_ff_mask_operations() {
    let ff = VCpuFfRegistry::new();
    ff.set_mask(VCpuFfMask::HM_DIRTY_ON_ENTRY);
    assert!(ff.is_set(VCpuForcedAction::HmDirtyGuestCr0));
    assert!(ff.is_set(VCpuForcedAction::HmDirtyHostContext));
    assert!(!ff.is_any_set(VCpuFfMask::HIGH_PRIORITY_PRE));

    ff.set(VCpuForcedAction::Timer);
    assert!(ff.is_any_set(VCpuFfMask::HIGH_PRIORITY_PRE));
    assert!(ff.is_any_set(VCpuFfMask::HIGH_PRIORITY_PRE_HARDWARE));

    ff.clear_mask(VCpuFfMask::HM_DIRTY_ON_ENTRY | VCpuFfMask::TIMER);
    assert!(ff.pending().is_empty());
}

#[test]
fn test_ff_concurrent_set_no_lost_update() {
    for _ in 0..200 {
        let ff = VmFfRegistry::new();
        std::thread::scope(|s| {
            s.spawn(|| ff.set(VmForcedAction::PdmQueues));
            s.spawn(|| ff.set(VmForcedAction::PgmNoMemory));
        });
        assert!(ff.is_any_set(VmFfMask::PDM_QUEUES | VmFfMask::PGM_NO_MEMORY));
        assert!(ff.is_set(VmForcedAction::PdmQueues));
        assert!(ff.is_set(VmForcedAction::PgmNoMemory));
    }
}

#[test]
fn test_ff_test_and_clear_consumed_once() {
    let ff = VCpuFfRegistry::new();
    for _ in 0..200 {
        ff.set(VCpuForcedAction::Request);
        let observed = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..2 {
                s.spawn(|| {
                    if ff.test_and_clear(VCpuForcedAction::Request) {
                        observed.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });
        assert_eq!(observed.load(Ordering::SeqCst), 1);
        assert!(!ff.is_set(VCpuForcedAction::Request));
    }
    assert!(!ff.test_and_clear(VCpuForcedAction::Request));
}

#[test]
fn test_ff_is_pending_except() {
    let ff = VmFfRegistry::new();
    let mask = VmFfMask::REQUEST | VmFfMask::DBGF;
    let except = VmFfMask::DBGF;

    ff.set(VmForcedAction::Dbgf);
    assert!(!ff.is_pending_except(mask, except));

    ff.set(VmForcedAction::Request);
    assert!(!ff.is_pending_except(mask, except));

    ff.clear(VmForcedAction::Dbgf);
    assert!(ff.is_pending_except(mask, except));
}

#[test]
fn test_ff_priority_classes() {
    assert!(VmFfMask::HIGH_PRIORITY_PRE.contains(VmFfMask::HIGH_PRIORITY_PRE_HARDWARE));
    assert!(VCpuFfMask::HIGH_PRIORITY_PRE.contains(VCpuFfMask::HIGH_PRIORITY_PRE_HARDWARE));
    assert!(VCpuFfMask::HIGH_PRIORITY_PRE.contains(VCpuFfMask::RESUME_GUEST));
    assert!(!VCpuFfMask::HIGH_PRIORITY_PRE.intersects(VCpuFfMask::HM_DIRTY_ON_ENTRY));
    assert!(VmFfMask::NORMAL_PRIORITY.contains(VmFfMask::PDM_QUEUES));
    assert!(VCpuFfMask::EXTERNAL_HALTED.contains(VCpuFfMask::INTERRUPT_APIC));
}
