use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, Ordering};

use axerrno::{ax_err, AxResult};

use crate::{
    AxArchHm, AxHmHal, AxHmHost, AxVCpu, HmEnableMode, VmFfRegistry, VmForcedAction, VmHmContext,
};

/// The machine-wide state of an [`AxVm`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum VmState {
    /// Constructed, not powered on yet.
    Created = 0,
    /// Vcpus may execute guest code.
    Running = 1,
    /// Execution is paused; vcpus wait in the host.
    Suspended = 2,
    /// Powered off; vcpus stop.
    Off = 3,
    /// Hit an unrecoverable fault. Only [`AxVm::destroy`] leaves this state.
    GuruMeditation = 4,
    /// Torn down.
    Destroyed = 5,
}

impl VmState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Suspended,
            3 => Self::Off,
            4 => Self::GuruMeditation,
            _ => Self::Destroyed,
        }
    }
}

/// A virtual machine as seen by the hardware virtualization core.
///
/// Holds the machine-wide forced actions, the per-machine [`VmHmContext`] and the vcpus. The
/// vcpus are driven by their EMTs through the world switch ([`AxVm::enter`],
/// [`AxVm::run_guest_code`], [`AxVm::leave`]) or one dispatch iteration at a time with
/// [`AxVm::emt_step`].
pub struct AxVm<H: AxHmHal> {
    id: usize,
    host: Arc<AxHmHost<H>>,
    state: AtomicU8,
    ff: VmFfRegistry,
    hm: VmHmContext,
    vcpus: Vec<AxVCpu<H>>,
}

impl<H: AxHmHal> AxVm<H> {
    /// Creates a machine with `vcpu_count` stopped vcpus.
    ///
    /// Switches hardware virtualization on for the host if nobody did yet, in the mode picked
    /// by [`AxHmConfig::global_init`](crate::AxHmConfig::global_init), then copies the host
    /// capabilities into the machine and runs the vendor per-machine setup.
    pub fn new(id: usize, host: Arc<AxHmHost<H>>, vcpu_count: usize) -> AxResult<Self> {
        if vcpu_count == 0 {
            return ax_err!(InvalidInput, "a machine needs at least one vcpu");
        }
        let mode = if host.config().global_init {
            HmEnableMode::Global
        } else {
            HmEnableMode::Local
        };
        host.enable_all_online(mode)?;

        let mut hm = VmHmContext::init_for_machine(&*host)?;
        hm.setup_for_machine(&*host)?;

        let vcpus = (0..vcpu_count).map(AxVCpu::new).collect();
        info!(
            "VM[{}] created with {} vcpus, {:?}",
            id,
            vcpu_count,
            hm.technology()
        );
        Ok(Self {
            id,
            host,
            state: AtomicU8::new(VmState::Created as u8),
            ff: VmFfRegistry::new(),
            hm,
            vcpus,
        })
    }

    /// The id of the machine.
    pub const fn id(&self) -> usize {
        self.id
    }

    /// The host this machine runs on.
    pub fn host(&self) -> &Arc<AxHmHost<H>> {
        &self.host
    }

    /// Machine-wide forced actions.
    pub fn ff(&self) -> &VmFfRegistry {
        &self.ff
    }

    /// The per-machine hardware virtualization context.
    pub fn hm_context(&self) -> &VmHmContext {
        &self.hm
    }

    /// The vcpu with the given id.
    pub fn vcpu(&self, vcpu_id: usize) -> Option<&AxVCpu<H>> {
        self.vcpus.get(vcpu_id)
    }

    /// All vcpus of this machine.
    pub fn vcpus(&self) -> &[AxVCpu<H>] {
        &self.vcpus
    }

    /// The number of vcpus.
    pub fn vcpu_count(&self) -> usize {
        self.vcpus.len()
    }

    pub(crate) fn owns(&self, vcpu: &AxVCpu<H>) -> bool {
        self.vcpus
            .get(vcpu.id())
            .is_some_and(|own| core::ptr::eq(own, vcpu))
    }

    pub(crate) fn backend(&self) -> AxResult<&dyn AxArchHm<H>> {
        self.host.backend(self.hm.technology())
    }

    /// The current machine state.
    pub fn state(&self) -> VmState {
        VmState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Starts execution. EMTs power their vcpus on at their next step.
    pub fn power_on(&self) -> AxResult {
        self.transition(&[VmState::Created], VmState::Running)
    }

    /// Pauses execution.
    pub fn suspend(&self) -> AxResult {
        self.transition(&[VmState::Running], VmState::Suspended)
    }

    /// Continues a suspended machine.
    pub fn resume(&self) -> AxResult {
        self.transition(&[VmState::Suspended], VmState::Running)
    }

    /// Powers the machine off. EMTs power their vcpus off at their next step.
    pub fn power_off(&self) -> AxResult {
        self.transition(&[VmState::Running, VmState::Suspended], VmState::Off)
    }

    /// Requests a machine reset, carried out by the EMTs' forced-action handling.
    pub fn reset(&self) -> AxResult {
        match self.state() {
            VmState::Running | VmState::Suspended => {
                self.ff.set(VmForcedAction::Reset);
                self.ff.set(VmForcedAction::CheckVmState);
                debug!("VM[{}] reset requested", self.id);
                Ok(())
            }
            state => ax_err!(BadState, format!("cannot reset a machine in {:?}", state)),
        }
    }

    /// Marks the machine as hit by an unrecoverable fault.
    pub fn guru_meditation(&self) -> AxResult {
        self.transition(
            &[
                VmState::Created,
                VmState::Running,
                VmState::Suspended,
                VmState::Off,
            ],
            VmState::GuruMeditation,
        )
    }

    /// Final state. No vcpu may be inside a world switch.
    pub fn destroy(&self) -> AxResult {
        if let Some(vcpu) = self.vcpus.iter().find(|vcpu| vcpu.host_cpu().is_some()) {
            return ax_err!(
                ResourceBusy,
                format!("vcpu {} is executing guest code", vcpu.id())
            );
        }
        self.transition(
            &[VmState::Created, VmState::Off, VmState::GuruMeditation],
            VmState::Destroyed,
        )
    }

    fn transition(&self, from: &[VmState], to: VmState) -> AxResult {
        let mut current = self.state();
        loop {
            if !from.contains(&current) {
                return ax_err!(
                    BadState,
                    format!("VM[{}] cannot go from {:?} to {:?}", self.id, current, to)
                );
            }
            match self.state.compare_exchange(
                current as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = VmState::from_u8(actual),
            }
        }
        self.ff.set(VmForcedAction::CheckVmState);
        if to == VmState::GuruMeditation {
            error!("VM[{}] {:?} -> {:?}", self.id, current, to);
        } else {
            info!("VM[{}] {:?} -> {:?}", self.id, current, to);
        }
        Ok(())
    }
}
