use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use axerrno::{ax_err, AxResult};
use spin::{Mutex, Once};

use crate::{
    AxArchHm, AxHmConfig, AxHmHal, HmCapabilities, HmEnableMode, HmTechnology, PhysCpuSlot,
};

/// Process-wide hardware virtualization state.
///
/// There is one `AxHmHost` per host. It owns the [`AxHmHal`], the capability snapshot (detected
/// on first use, immutable afterwards), the enablement mode, and one [`PhysCpuSlot`] per
/// possible physical CPU. Machines hold it through an `Arc`.
///
/// Lifecycle:
/// - [`AxHmHost::capabilities`] runs detection exactly once.
/// - [`AxHmHost::enable_all_online`] picks the enablement mode exactly once; in
///   [`HmEnableMode::Global`] it also enables every online CPU.
/// - [`AxHmHost::disable_all`] (also run on drop) disables every CPU and frees every page.
pub struct AxHmHost<H: AxHmHal> {
    hal: H,
    config: AxHmConfig,
    caps: Once<HmCapabilities>,
    mode: AtomicU8,
    /// Outcome of the call that picked the mode; `None` while uninitialized.
    enabled: Mutex<Option<AxResult>>,
    suspended: AtomicBool,
    slots: Box<[PhysCpuSlot]>,
}

impl<H: AxHmHal> AxHmHost<H> {
    /// Creates the host state. Nothing is detected or enabled yet.
    pub fn new(hal: H, config: AxHmConfig) -> Self {
        let slots = (0..hal.cpu_num()).map(PhysCpuSlot::new).collect();
        Self {
            hal,
            config,
            caps: Once::new(),
            mode: AtomicU8::new(HmEnableMode::Uninitialized as u8),
            enabled: Mutex::new(None),
            suspended: AtomicBool::new(false),
            slots,
        }
    }

    /// The host abstraction layer.
    pub fn hal(&self) -> &H {
        &self.hal
    }

    /// The host configuration.
    pub fn config(&self) -> &AxHmConfig {
        &self.config
    }

    /// The capability snapshot, detected on the first call.
    pub fn capabilities(&self) -> &HmCapabilities {
        self.caps
            .call_once(|| HmCapabilities::detect(&self.hal, &self.config))
    }

    /// Whether VT-x or AMD-V is usable on this host.
    pub fn is_available(&self) -> bool {
        self.capabilities().is_supported()
    }

    /// The current enablement mode.
    pub fn enable_mode(&self) -> HmEnableMode {
        HmEnableMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    /// Whether CPUs are disabled because the host is suspended.
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// The slot of physical CPU `cpu_id`.
    pub fn slot(&self, cpu_id: usize) -> Option<&PhysCpuSlot> {
        self.slots.get(cpu_id)
    }

    /// All physical CPU slots.
    pub fn slots(&self) -> &[PhysCpuSlot] {
        &self.slots
    }

    /// The backend for `technology`.
    pub(crate) fn backend(&self, technology: HmTechnology) -> AxResult<&dyn AxArchHm<H>> {
        match technology {
            HmTechnology::Vtx => Ok(self.hal.vtx_backend()),
            HmTechnology::AmdV => Ok(self.hal.amdv_backend()),
            HmTechnology::None => ax_err!(Unsupported, "no hardware virtualization"),
        }
    }

    /// Switches hardware virtualization on, in the given mode.
    ///
    /// The mode is chosen by the first caller. Later callers asking for the same mode wait for
    /// the first one to finish and get its result; asking for another mode fails with
    /// `PermissionDenied`.
    ///
    /// In [`HmEnableMode::Global`], every online CPU gets a control page and is enabled on
    /// itself. A failure on one CPU is returned, but CPUs that succeeded stay enabled until
    /// [`AxHmHost::disable_all`].
    pub fn enable_all_online(&self, mode: HmEnableMode) -> AxResult {
        if mode == HmEnableMode::Uninitialized {
            return ax_err!(InvalidInput, "no enablement mode given");
        }
        self.capabilities().check()?;

        let mut enabled = self.enabled.lock();
        if let Some(result) = *enabled {
            let current = self.enable_mode();
            if current == mode {
                return result;
            }
            return ax_err!(
                PermissionDenied,
                format!("already enabled in {:?} mode, {:?} requested", current, mode)
            );
        }

        self.mode.store(mode as u8, Ordering::Release);
        let result = match mode {
            HmEnableMode::Global => self.enable_online_cpus(),
            _ => {
                info!("hardware virtualization enabled per world switch");
                Ok(())
            }
        };
        *enabled = Some(result);
        result
    }

    /// Disables hardware virtualization on every CPU and frees every control page.
    ///
    /// Every CPU is attempted even if some fail; the first failure is returned after the
    /// cleanup completed. The mode is only reset once no CPU is left enabled, so a failed
    /// teardown can be retried.
    pub fn disable_all(&self) -> AxResult {
        let mut enabled = self.enabled.lock();
        let mode = self.enable_mode();
        let result = if self.slots.iter().any(PhysCpuSlot::is_enabled) {
            self.disable_enabled_cpus()
        } else {
            Ok(())
        };
        let mut leaked = false;
        for slot in self.slots.iter() {
            if slot.is_enabled() {
                error!("CPU {}: still enabled, control page leaked", slot.cpu_id());
                leaked = true;
            } else {
                slot.free_control_page(&self.hal);
            }
        }
        if leaked {
            return result;
        }
        self.mode
            .store(HmEnableMode::Uninitialized as u8, Ordering::Release);
        *enabled = None;
        self.suspended.store(false, Ordering::Release);
        if mode != HmEnableMode::Uninitialized {
            info!("hardware virtualization terminated ({:?} mode)", mode);
        }
        result
    }

    /// Disables every CPU for a host suspend. Undone by [`AxHmHost::resume`].
    pub fn suspend(&self) -> AxResult {
        if self.enable_mode() != HmEnableMode::Global || self.suspended.swap(true, Ordering::AcqRel)
        {
            return Ok(());
        }
        debug!("host suspending, disabling hardware virtualization");
        self.disable_enabled_cpus()
    }

    /// Re-enables every online CPU after a host resume.
    pub fn resume(&self) -> AxResult {
        if !self.suspended.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("host resumed, re-enabling hardware virtualization");
        self.enable_online_cpus()
    }

    /// Brings a newly onlined CPU in line with the others. Must run on that CPU.
    pub fn cpu_online(&self, cpu_id: usize) -> AxResult {
        if self.enable_mode() != HmEnableMode::Global || self.is_suspended() {
            return Ok(());
        }
        let slot = self.checked_slot(cpu_id)?;
        let caps = self.capabilities();
        slot.ensure_control_page(&self.hal)?;
        slot.hardware_enable(&self.hal, self.backend(caps.technology)?, caps)
    }

    /// Disables a CPU about to go offline. Must run on that CPU.
    pub fn cpu_offline(&self, cpu_id: usize) -> AxResult {
        let slot = self.checked_slot(cpu_id)?;
        if !slot.is_enabled() {
            return Ok(());
        }
        slot.hardware_disable(&self.hal, self.backend(slot.configured_technology())?)
    }

    /// Enables the current CPU for one world switch in [`HmEnableMode::Local`].
    pub(crate) fn enable_current_cpu(&self) -> AxResult {
        let slot = self.checked_slot(H::current_cpu_id())?;
        let caps = self.capabilities();
        slot.ensure_control_page(&self.hal)?;
        slot.hardware_enable(&self.hal, self.backend(caps.technology)?, caps)
    }

    /// Undoes [`AxHmHost::enable_current_cpu`].
    pub(crate) fn disable_current_cpu(&self) -> AxResult {
        let slot = self.checked_slot(H::current_cpu_id())?;
        slot.hardware_disable(&self.hal, self.backend(slot.configured_technology())?)
    }

    fn checked_slot(&self, cpu_id: usize) -> AxResult<&PhysCpuSlot> {
        match self.slots.get(cpu_id) {
            Some(slot) => Ok(slot),
            None => ax_err!(InvalidInput, format!("CPU {} out of range", cpu_id)),
        }
    }

    fn online_slots(&self) -> impl Iterator<Item = &PhysCpuSlot> {
        self.slots
            .iter()
            .filter(|slot| self.hal.is_cpu_online(slot.cpu_id()))
    }

    fn enable_online_cpus(&self) -> AxResult {
        let caps = self.capabilities();
        let backend = self.backend(caps.technology)?;
        for slot in self.online_slots() {
            slot.ensure_control_page(&self.hal)?;
        }

        let results = self.broadcast(|slot| slot.hardware_enable(&self.hal, backend, caps));
        let (enabled, result) = self.collect_results(&results, "enable");
        info!(
            "{:?} enabled on {}/{} online CPUs",
            caps.technology,
            enabled,
            self.online_slots().count()
        );
        result
    }

    fn disable_enabled_cpus(&self) -> AxResult {
        let results = self.broadcast(|slot| match slot.configured_technology() {
            HmTechnology::None => Ok(()),
            technology => slot.hardware_disable(&self.hal, self.backend(technology)?),
        });
        let (disabled, result) = self.collect_results(&results, "disable");
        debug!("hardware virtualization disabled on {} CPUs", disabled);
        result
    }

    /// Runs `f` on every online CPU with that CPU's slot. Each CPU writes only its own result.
    fn broadcast<F>(&self, f: F) -> Vec<Once<AxResult>>
    where
        F: Fn(&PhysCpuSlot) -> AxResult + Sync,
    {
        let results: Vec<Once<AxResult>> = self.slots.iter().map(|_| Once::new()).collect();
        self.hal.run_on_each_cpu(&|cpu_id| {
            debug_assert_eq!(H::current_cpu_id(), cpu_id);
            let result = match self.slots.get(cpu_id) {
                Some(slot) => f(slot),
                None => ax_err!(InvalidInput, format!("CPU {} out of range", cpu_id)),
            };
            if let Some(slot_result) = results.get(cpu_id) {
                slot_result.call_once(|| result);
            }
        });
        results
    }

    fn collect_results(&self, results: &[Once<AxResult>], what: &str) -> (usize, AxResult) {
        let mut done = 0;
        let mut first_err = None;
        for slot in self.online_slots() {
            match results[slot.cpu_id()].get() {
                Some(Ok(())) => done += 1,
                Some(Err(err)) => {
                    warn!("CPU {}: {} failed: {:?}", slot.cpu_id(), what, err);
                    first_err.get_or_insert(*err);
                }
                None => {
                    warn!("CPU {}: {} callback never ran", slot.cpu_id(), what);
                    first_err.get_or_insert(axerrno::AxError::BadState);
                }
            }
        }
        (done, first_err.map_or(Ok(()), Err))
    }
}

impl<H: AxHmHal> Drop for AxHmHost<H> {
    fn drop(&mut self) {
        if let Err(err) = self.disable_all() {
            error!("hardware virtualization teardown failed: {:?}", err);
        }
    }
}
