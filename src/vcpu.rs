use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

use axerrno::{ax_err, AxResult};

use crate::{AxHmHal, GuestCpuContext, VCpuFfRegistry};

/// The state of a virtual CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum VCpuState {
    /// An invalid state.
    Invalid = 0,
    /// The vcpu is powered off.
    Stopped = 1,
    /// The vcpu is powered on and doing host-level work.
    Started = 2,
    /// The vcpu is executing guest code with hardware assistance.
    StartedExecHw = 3,
    /// The vcpu is executing guest code in the instruction interpreter.
    StartedExecInterp = 4,
    /// The vcpu is executing guest code through the host's native virtualization API.
    StartedExecNem = 5,
    /// Like [`VCpuState::StartedExecNem`], blocked waiting for an event.
    StartedExecNemWait = 6,
    /// A [`VCpuState::StartedExecNemWait`] wait was cancelled from another thread.
    StartedExecNemCanceled = 7,
    /// The vcpu executed `HLT` and waits for an interrupt.
    StartedHalted = 8,
}

impl VCpuState {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Stopped,
            2 => Self::Started,
            3 => Self::StartedExecHw,
            4 => Self::StartedExecInterp,
            5 => Self::StartedExecNem,
            6 => Self::StartedExecNemWait,
            7 => Self::StartedExecNemCanceled,
            8 => Self::StartedHalted,
            _ => Self::Invalid,
        }
    }

    /// Whether the vcpu is powered on.
    pub const fn is_started(self) -> bool {
        !matches!(self, Self::Invalid | Self::Stopped)
    }
}

/// Where a vcpu stands in the world-switch protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum HmPhase {
    /// Outside `enter`..`leave`.
    Idle = 0,
    /// Between `enter` and `leave`.
    Entered = 1,
    /// Inside `run_guest_code`.
    Running = 2,
}

impl HmPhase {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Entered,
            2 => Self::Running,
            _ => Self::Idle,
        }
    }
}

/// "No thread" / "no CPU" markers.
const NIL_THREAD: u64 = 0;
const NIL_CPU: usize = usize::MAX;

/// A virtual CPU of an [`AxVm`](crate::AxVm).
///
/// Exactly one thread, the EMT, drives a vcpu: it changes its state, runs the world switch on
/// it and consumes its forced actions. Any thread may post forced actions through
/// [`AxVCpu::ff`].
///
/// Note that:
/// - Calling an EMT-only method from another thread is a bug and panics.
/// - The guest context is only reachable from the EMT.
pub struct AxVCpu<H: AxHmHal> {
    /// The id of the vcpu.
    id: usize,
    /// The [`VCpuState`].
    state: AtomicU8,
    /// The [`HmPhase`].
    phase: AtomicU8,
    /// The thread id of the EMT, [`NIL_THREAD`] if unbound.
    emt: AtomicU64,
    /// The physical CPU running the guest, valid only between `enter` and `leave`.
    host_cpu: AtomicUsize,
    /// Forced actions local to this vcpu.
    ff: VCpuFfRegistry,
    /// The guest register state.
    ///
    /// `UnsafeCell` is used because the EMT hands out mutable access to the vendor layer while
    /// other threads hold shared references to the vcpu for signaling.
    guest: UnsafeCell<GuestCpuContext>,
    _hal: PhantomData<fn() -> H>,
}

// SAFETY: everything except `guest` is atomic, and `guest` is only accessed on the EMT.
unsafe impl<H: AxHmHal> Sync for AxVCpu<H> {}

impl<H: AxHmHal> AxVCpu<H> {
    /// Create a new, stopped [`AxVCpu`] with no EMT.
    pub fn new(id: usize) -> Self {
        Self {
            id,
            state: AtomicU8::new(VCpuState::Stopped as u8),
            phase: AtomicU8::new(HmPhase::Idle as u8),
            emt: AtomicU64::new(NIL_THREAD),
            host_cpu: AtomicUsize::new(NIL_CPU),
            ff: VCpuFfRegistry::new(),
            guest: UnsafeCell::new(GuestCpuContext::default()),
            _hal: PhantomData,
        }
    }

    /// Get the id of the vcpu.
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Get whether the vcpu is the BSP. We always assume the first vcpu (vcpu with id #0) is the BSP.
    pub const fn is_bsp(&self) -> bool {
        self.id == 0
    }

    /// The forced actions of this vcpu.
    pub fn ff(&self) -> &VCpuFfRegistry {
        &self.ff
    }

    /// Makes the calling thread the EMT of this vcpu.
    pub fn bind_emt(&self) -> AxResult {
        let me = H::current_thread_id();
        match self
            .emt
            .compare_exchange(NIL_THREAD, me, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(owner) if owner == me => Ok(()),
            Err(_) => ax_err!(
                ResourceBusy,
                format!("vcpu {} already has an EMT", self.id)
            ),
        }
    }

    /// Releases the EMT binding. Must be called on the EMT.
    pub fn unbind_emt(&self) {
        self.assert_emt();
        self.emt.store(NIL_THREAD, Ordering::Release);
    }

    /// Whether the calling thread is the EMT of this vcpu.
    pub fn is_emt(&self) -> bool {
        self.emt.load(Ordering::Acquire) == H::current_thread_id()
    }

    /// Panics unless the calling thread is the EMT of this vcpu.
    #[track_caller]
    pub fn assert_emt(&self) {
        assert!(
            self.is_emt(),
            "vcpu {} used from a thread other than its EMT",
            self.id
        );
    }

    /// Get the state of the vcpu.
    pub fn state(&self) -> VCpuState {
        VCpuState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Set the state of the vcpu. Must be called on the EMT.
    #[track_caller]
    pub fn set_state(&self, state: VCpuState) {
        self.assert_emt();
        self.state.store(state as u8, Ordering::Release);
    }

    /// Sets the state to `new` if it is `expected`. Must be called on the EMT.
    #[track_caller]
    pub fn cmp_set_state(&self, new: VCpuState, expected: VCpuState) -> bool {
        self.assert_emt();
        self.cas_state(new, expected)
    }

    fn cas_state(&self, new: VCpuState, expected: VCpuState) -> bool {
        self.state
            .compare_exchange(
                expected as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Wakes an EMT blocked in the native-API backend. Callable from any thread.
    ///
    /// Returns `false` if the vcpu was not waiting.
    pub fn cancel_nem_wait(&self) -> bool {
        self.cas_state(
            VCpuState::StartedExecNemCanceled,
            VCpuState::StartedExecNemWait,
        )
    }

    /// Execute a block with the state of the vcpu transitioned from `from` to `to`. If the
    /// current state is not `from`, return an error.
    ///
    /// The state will be set back to `from` if the block fails.
    #[track_caller]
    pub fn with_state_transition<F, T>(&self, from: VCpuState, to: VCpuState, f: F) -> AxResult<T>
    where
        F: FnOnce() -> AxResult<T>,
    {
        if !self.cmp_set_state(to, from) {
            return ax_err!(
                BadState,
                format!("VCpu state is not {:?}, but {:?}", from, self.state())
            );
        }
        let result = f();
        if result.is_err() {
            self.state.store(from as u8, Ordering::Release);
        }
        result
    }

    /// Transition the state of the vcpu. If the current state is not `from`, return an error.
    #[track_caller]
    pub fn transition_state(&self, from: VCpuState, to: VCpuState) -> AxResult {
        self.with_state_transition(from, to, || Ok(()))
    }

    /// Powers the vcpu on: [`VCpuState::Stopped`] to [`VCpuState::Started`].
    pub fn power_on(&self) -> AxResult {
        self.transition_state(VCpuState::Stopped, VCpuState::Started)?;
        debug!("vcpu {} powered on", self.id);
        Ok(())
    }

    /// Powers the vcpu off from any started state.
    pub fn power_off(&self) -> AxResult {
        if self.phase() != HmPhase::Idle {
            return ax_err!(BadState, "cannot power off inside a world switch");
        }
        let state = self.state();
        if !state.is_started() {
            return ax_err!(BadState, format!("vcpu {} is {:?}", self.id, state));
        }
        self.set_state(VCpuState::Stopped);
        debug!("vcpu {} powered off", self.id);
        Ok(())
    }

    /// Leaves [`VCpuState::StartedHalted`]. Returns `false` if the vcpu was not halted.
    pub fn unhalt(&self) -> bool {
        self.cmp_set_state(VCpuState::Started, VCpuState::StartedHalted)
    }

    /// Where the vcpu stands in the world-switch protocol.
    pub fn phase(&self) -> HmPhase {
        HmPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn cas_phase(&self, new: HmPhase, expected: HmPhase) -> bool {
        self.phase
            .compare_exchange(
                expected as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn set_phase(&self, phase: HmPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// The physical CPU executing this vcpu, if it is inside a world switch.
    pub fn host_cpu(&self) -> Option<usize> {
        match self.host_cpu.load(Ordering::Acquire) {
            NIL_CPU => None,
            cpu => Some(cpu),
        }
    }

    pub(crate) fn set_host_cpu(&self, cpu: Option<usize>) {
        self.host_cpu.store(cpu.unwrap_or(NIL_CPU), Ordering::Release);
    }

    /// Get the guest register state. Must be called on the EMT.
    #[allow(clippy::mut_from_ref)]
    #[track_caller]
    pub fn get_guest_context(&self) -> &mut GuestCpuContext {
        self.assert_emt();
        // SAFETY: only the EMT reaches the guest context.
        unsafe { &mut *self.guest.get() }
    }

    /// Sets the value of a general-purpose register according to the given index.
    pub fn set_gpr(&self, reg: usize, val: u64) {
        if let Some(gpr) = self.get_guest_context().gprs.get_mut(reg) {
            *gpr = val;
        }
    }
}
