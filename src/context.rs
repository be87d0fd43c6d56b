use axerrno::{ax_err, AxResult};

use crate::{AxHmConfig, AxHmHal, AxHmHost, HmCapabilities, HmTechnology};

/// Setup progress of a [`VmHmContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmHmState {
    /// Capabilities copied, vendor setup not run yet.
    Initialized,
    /// Vendor setup done, vcpus may enter.
    Configured,
}

/// The per-machine view of hardware virtualization.
///
/// Built once when the machine is created from the host's immutable capability snapshot. Only
/// the vendor's [`AxArchHm::setup_vm`](crate::AxArchHm::setup_vm) modifies it afterwards.
#[derive(Debug, Clone)]
pub struct VmHmContext {
    state: VmHmState,
    caps: HmCapabilities,
    /// Use nested paging (EPT/NPT).
    pub nested_paging: bool,
    /// Tag TLB entries with VPIDs (VT-x) or ASIDs (AMD-V).
    pub tagged_tlb: bool,
    /// First ASID/VPID this machine may hand out.
    pub first_asid: u32,
    /// One past the last ASID/VPID this machine may hand out.
    pub asid_limit: u32,
    /// Opaque value owned by the vendor backend.
    pub vendor_data: u64,
}

impl VmHmContext {
    /// Copies the host capabilities into a new per-machine context.
    pub fn init_for_machine<H: AxHmHal>(host: &AxHmHost<H>) -> AxResult<Self> {
        let caps = host.capabilities();
        caps.check()?;
        Ok(Self::from_capabilities(caps.clone(), host.config()))
    }

    fn from_capabilities(caps: HmCapabilities, config: &AxHmConfig) -> Self {
        let (nested_paging, tagged_tlb, asid_limit) = match caps.technology {
            HmTechnology::Vtx => (
                config.nested_paging && caps.vmx.supports_ept(),
                config.vpid && caps.vmx.supports_vpid(),
                // VPIDs are 16 bits wide.
                u16::MAX as u32 + 1,
            ),
            HmTechnology::AmdV => (
                config.nested_paging && caps.svm.supports_nested_paging(),
                caps.svm.max_asid > 1,
                caps.svm.max_asid,
            ),
            HmTechnology::None => (false, false, 0),
        };
        let asid_limit = match config.max_asid {
            Some(max) => asid_limit.min(max.saturating_add(1)),
            None => asid_limit,
        };
        Self {
            state: VmHmState::Initialized,
            caps,
            nested_paging,
            tagged_tlb,
            // ASID/VPID 0 belongs to the host.
            first_asid: 1,
            asid_limit,
            vendor_data: 0,
        }
    }

    /// Runs the vendor per-machine setup. Must be called exactly once, before any vcpu enters.
    pub fn setup_for_machine<H: AxHmHal>(&mut self, host: &AxHmHost<H>) -> AxResult {
        if self.state != VmHmState::Initialized {
            return ax_err!(BadState, "hardware virtualization already set up");
        }
        host.backend(self.caps.technology)?.setup_vm(self)?;
        self.state = VmHmState::Configured;
        debug!(
            "{:?} machine setup done: nested paging {}, tagged TLB {}",
            self.caps.technology, self.nested_paging, self.tagged_tlb
        );
        Ok(())
    }

    /// Setup progress.
    pub fn state(&self) -> VmHmState {
        self.state
    }

    /// Whether [`VmHmContext::setup_for_machine`] completed.
    pub fn is_configured(&self) -> bool {
        self.state == VmHmState::Configured
    }

    /// The technology this machine runs with.
    pub fn technology(&self) -> HmTechnology {
        self.caps.technology
    }

    /// The machine's copy of the host capabilities.
    pub fn capabilities(&self) -> &HmCapabilities {
        &self.caps
    }
}
