use axerrno::{ax_err, AxResult};

use crate::{
    AxHmHal, AxVCpu, AxVCpuExitReason, AxVm, VCpuFfMask, VCpuForcedAction, VCpuState, VmFfMask,
    VmForcedAction, VmState,
};

/// Host-side work an EMT performs between guest executions.
///
/// Implementations consume the forced actions they handle (e.g. with
/// [`test_and_clear`](crate::VCpuFfRegistry::test_and_clear)). Actions left pending are
/// offered again at the next step.
pub trait AxEmtHandler<H: AxHmHal> {
    /// Services pending [`HIGH_PRIORITY_PRE`](VCpuFfMask::HIGH_PRIORITY_PRE) actions.
    fn service_high_priority(&mut self, vm: &AxVm<H>, vcpu: &AxVCpu<H>) -> AxResult;

    /// Services pending [`HIGH_PRIORITY_POST`](VCpuFfMask::HIGH_PRIORITY_POST) actions, right
    /// after the guest returned.
    fn service_high_priority_post(&mut self, vm: &AxVm<H>, vcpu: &AxVCpu<H>) -> AxResult {
        let _ = (vm, vcpu);
        Ok(())
    }

    /// Services pending normal-priority actions.
    fn service_normal(&mut self, vm: &AxVm<H>, vcpu: &AxVCpu<H>) -> AxResult;
}

/// The outcome of one [`AxVm::emt_step`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmtEvent {
    /// The guest ran and returned for this reason.
    Exited(AxVCpuExitReason),
    /// High-priority work is still pending, the guest was not entered.
    Pending,
    /// The vcpu is halted; wait until [`AxVm::halt_wake_pending`].
    Halted,
    /// The vcpu is stopped.
    Stopped,
    /// The machine is suspended.
    Suspended,
}

impl<H: AxHmHal> AxVm<H> {
    /// Runs one iteration of the dispatch loop of `vcpu`. Must be called on its EMT.
    ///
    /// Order of business:
    /// 1. follow the machine state (power the vcpu on or off, stop for suspend);
    /// 2. service `HIGH_PRIORITY_PRE` actions, then normal-priority ones;
    /// 3. drop `RESUME_GUEST` requests and enter, run and leave the guest, unless a
    ///    hardware-relevant high-priority action is still pending;
    /// 4. service `HIGH_PRIORITY_POST` actions.
    pub fn emt_step<E: AxEmtHandler<H>>(
        &self,
        vcpu: &AxVCpu<H>,
        handler: &mut E,
    ) -> AxResult<EmtEvent> {
        vcpu.assert_emt();

        self.ff().clear(VmForcedAction::CheckVmState);
        match self.state() {
            VmState::Running => {}
            VmState::Created => return Ok(EmtEvent::Stopped),
            VmState::Suspended => return Ok(EmtEvent::Suspended),
            VmState::Off | VmState::Destroyed => {
                if vcpu.state().is_started() {
                    vcpu.power_off()?;
                }
                return Ok(EmtEvent::Stopped);
            }
            VmState::GuruMeditation => {
                return ax_err!(BadState, format!("VM[{}] is in guru meditation", self.id()));
            }
        }
        match vcpu.state() {
            VCpuState::Stopped => vcpu.power_on()?,
            VCpuState::StartedHalted => {
                if !self.halt_wake_pending(vcpu) {
                    return Ok(EmtEvent::Halted);
                }
                vcpu.unhalt();
                vcpu.ff().clear(VCpuForcedAction::Unhalt);
            }
            _ => {}
        }

        if self.ff().is_any_set(VmFfMask::HIGH_PRIORITY_PRE)
            || vcpu.ff().is_any_set(VCpuFfMask::HIGH_PRIORITY_PRE)
        {
            handler.service_high_priority(self, vcpu)?;
        }
        if self
            .ff()
            .is_any_set(VmFfMask::NORMAL_PRIORITY.union(VmFfMask::NORMAL_PRIORITY_POST))
            || vcpu
                .ff()
                .is_any_set(VCpuFfMask::NORMAL_PRIORITY.union(VCpuFfMask::NORMAL_PRIORITY_POST))
        {
            handler.service_normal(self, vcpu)?;
        }

        vcpu.ff().clear_mask(VCpuFfMask::RESUME_GUEST);
        if self.ff().is_any_set(VmFfMask::HIGH_PRIORITY_PRE_HARDWARE)
            || vcpu.ff().is_any_set(VCpuFfMask::HIGH_PRIORITY_PRE_HARDWARE)
        {
            return Ok(EmtEvent::Pending);
        }

        let exit = self.execute_hw(vcpu)?;

        if self.ff().is_any_set(VmFfMask::HIGH_PRIORITY_POST)
            || vcpu.ff().is_any_set(VCpuFfMask::HIGH_PRIORITY_POST)
        {
            handler.service_high_priority_post(self, vcpu)?;
        }

        if exit == AxVCpuExitReason::Halt {
            vcpu.set_state(VCpuState::StartedHalted);
            return Ok(EmtEvent::Halted);
        }
        Ok(EmtEvent::Exited(exit))
    }

    /// One hardware-assisted execution: enter, run, leave.
    fn execute_hw(&self, vcpu: &AxVCpu<H>) -> AxResult<AxVCpuExitReason> {
        vcpu.transition_state(VCpuState::Started, VCpuState::StartedExecHw)?;
        let result = self.enter(vcpu).and_then(|()| {
            let exit = self.run_guest_code(vcpu);
            let left = self.leave(vcpu);
            let exit = exit?;
            left.map(|()| exit)
        });
        vcpu.set_state(VCpuState::Started);
        result
    }

    /// Whether a halted `vcpu` has a reason to wake up.
    pub fn halt_wake_pending(&self, vcpu: &AxVCpu<H>) -> bool {
        self.state() != VmState::Running
            || self.ff().is_any_set(VmFfMask::EXTERNAL_HALTED)
            || vcpu.ff().is_any_set(VCpuFfMask::EXTERNAL_HALTED)
    }
}
