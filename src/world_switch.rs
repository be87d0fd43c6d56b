use axerrno::{ax_err, AxResult};

use crate::{
    AxHmHal, AxVCpu, AxVCpuExitReason, AxVm, HmEnableMode, HmPhase, VCpuFfMask, VCpuForcedAction,
};

/// The world switch.
///
/// All three methods run on the EMT of `vcpu`. From [`AxVm::enter`] to [`AxVm::leave`] the
/// thread stays on one physical CPU, reported by [`AxVCpu::host_cpu`]. Nothing here retries:
/// on failure the caller decides whether to try again, fall back, or declare
/// [`AxVm::guru_meditation`].
impl<H: AxHmHal> AxVm<H> {
    /// Prepares the current physical CPU to run `vcpu`.
    ///
    /// Unloads guest FPU state still active on this CPU, marks guest `CR0` and the host
    /// context dirty, then calls the vendor `enter`, `save_host_state` and `load_guest_state`
    /// in that order, stopping at the first failure. A failed entry leaves `vcpu` outside the
    /// world switch. Entry is refused with `ResourceBusy` while the host is suspended.
    pub fn enter(&self, vcpu: &AxVCpu<H>) -> AxResult {
        vcpu.assert_emt();
        assert!(
            self.owns(vcpu),
            "vcpu {} is not part of VM[{}]",
            vcpu.id(),
            self.id()
        );
        if !self.hm_context().is_configured() {
            return ax_err!(BadState, "machine not set up for hardware virtualization");
        }
        if self.host().is_suspended() {
            return ax_err!(ResourceBusy, "host suspend pending");
        }
        if !vcpu.cas_phase(HmPhase::Entered, HmPhase::Idle) {
            return ax_err!(
                BadState,
                format!("vcpu {} already entered ({:?})", vcpu.id(), vcpu.phase())
            );
        }

        let hal = self.host().hal();
        hal.preempt_disable();
        let result = self.do_enter(vcpu);
        if result.is_err() {
            self.abort_enter(vcpu);
        } else {
            trace!(
                "VM[{}] vcpu {} entered on CPU {}",
                self.id(),
                vcpu.id(),
                H::current_cpu_id()
            );
        }
        result
    }

    fn do_enter(&self, vcpu: &AxVCpu<H>) -> AxResult {
        let backend = self.backend()?;
        vcpu.set_host_cpu(Some(H::current_cpu_id()));
        if self.host().enable_mode() == HmEnableMode::Local {
            self.host().enable_current_cpu()?;
        }

        let ctx = vcpu.get_guest_context();
        if ctx.fpu_active {
            self.host().hal().fpu_save_guest_restore_host(ctx);
            ctx.fpu_active = false;
        }
        vcpu.ff().set_mask(VCpuFfMask::HM_DIRTY_ON_ENTRY);

        backend.enter(self, vcpu)?;
        backend.save_host_state(self, vcpu)?;
        backend.load_guest_state(self, vcpu)
    }

    fn abort_enter(&self, vcpu: &AxVCpu<H>) {
        if self.host().enable_mode() == HmEnableMode::Local {
            if let Err(err) = self.host().disable_current_cpu() {
                error!(
                    "CPU {}: disable after failed entry: {:?}",
                    H::current_cpu_id(),
                    err
                );
            }
        }
        vcpu.set_host_cpu(None);
        vcpu.set_phase(HmPhase::Idle);
        self.host().hal().preempt_enable();
    }

    /// Runs guest code until something needs the host, and returns why.
    pub fn run_guest_code(&self, vcpu: &AxVCpu<H>) -> AxResult<AxVCpuExitReason> {
        vcpu.assert_emt();
        let backend = self.backend()?;
        if !vcpu.cas_phase(HmPhase::Running, HmPhase::Entered) {
            return ax_err!(
                BadState,
                format!("vcpu {} is not entered ({:?})", vcpu.id(), vcpu.phase())
            );
        }
        let result = backend.run_guest_code(self, vcpu);
        vcpu.set_phase(HmPhase::Entered);
        result
    }

    /// Undoes [`AxVm::enter`].
    ///
    /// Host FPU state is only restored if the guest activated its own during the run, in
    /// which case guest `CR0` is marked dirty again.
    pub fn leave(&self, vcpu: &AxVCpu<H>) -> AxResult {
        vcpu.assert_emt();
        if !vcpu.cas_phase(HmPhase::Idle, HmPhase::Entered) {
            return ax_err!(
                BadState,
                format!("vcpu {} left without entering ({:?})", vcpu.id(), vcpu.phase())
            );
        }
        debug_assert_eq!(vcpu.host_cpu(), Some(H::current_cpu_id()));

        let ctx = vcpu.get_guest_context();
        if ctx.fpu_active {
            self.host().hal().fpu_save_guest_restore_host(ctx);
            ctx.fpu_active = false;
            vcpu.ff().set(VCpuForcedAction::HmDirtyGuestCr0);
        }

        let mut result = match self.backend() {
            Ok(backend) => backend.leave(self, vcpu),
            Err(err) => Err(err),
        };
        if self.host().enable_mode() == HmEnableMode::Local {
            let disabled = self.host().disable_current_cpu();
            result = result.and(disabled);
        }
        vcpu.set_host_cpu(None);
        self.host().hal().preempt_enable();
        trace!("VM[{}] vcpu {} left", self.id(), vcpu.id());
        result
    }
}
