//! One-time detection of VT-x / AMD-V and capture of the MSR state needed later.

use core::fmt;

use axerrno::{AxError, AxResult};
use raw_cpuid::CpuId;

use crate::hal::PreemptGuard;
use crate::{AxHmConfig, AxHmHal, ControlPage};

pub(crate) const MSR_IA32_FEATURE_CONTROL: u32 = 0x3a;
pub(crate) const MSR_IA32_VMX_BASIC: u32 = 0x480;
pub(crate) const MSR_IA32_VMX_PINBASED_CTLS: u32 = 0x481;
pub(crate) const MSR_IA32_VMX_PROCBASED_CTLS: u32 = 0x482;
pub(crate) const MSR_IA32_VMX_EXIT_CTLS: u32 = 0x483;
pub(crate) const MSR_IA32_VMX_ENTRY_CTLS: u32 = 0x484;
pub(crate) const MSR_IA32_VMX_MISC: u32 = 0x485;
pub(crate) const MSR_IA32_VMX_CR0_FIXED0: u32 = 0x486;
pub(crate) const MSR_IA32_VMX_CR0_FIXED1: u32 = 0x487;
pub(crate) const MSR_IA32_VMX_CR4_FIXED0: u32 = 0x488;
pub(crate) const MSR_IA32_VMX_CR4_FIXED1: u32 = 0x489;
pub(crate) const MSR_IA32_VMX_PROCBASED_CTLS2: u32 = 0x48b;
pub(crate) const MSR_IA32_VMX_EPT_VPID_CAP: u32 = 0x48c;
pub(crate) const MSR_EFER: u32 = 0xc000_0080;
pub(crate) const MSR_VM_CR: u32 = 0xc001_0114;
pub(crate) const MSR_VM_HSAVE_PA: u32 = 0xc001_0117;

pub(crate) const FEATURE_CONTROL_LOCKED: u64 = 1 << 0;
pub(crate) const FEATURE_CONTROL_VMXON_OUTSIDE_SMX: u64 = 1 << 2;
pub(crate) const CR4_VMXE: u64 = 1 << 13;
pub(crate) const EFER_SVME: u64 = 1 << 12;
pub(crate) const VM_CR_SVMDIS: u64 = 1 << 4;

const CPUID_SVM_FEATURES: u32 = 0x8000_000a;

/// The hardware virtualization extension in use. The variants are mutually exclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum HmTechnology {
    /// No hardware virtualization.
    #[default]
    None = 0,
    /// Intel VT-x.
    Vtx = 1,
    /// AMD-V (SVM).
    AmdV = 2,
}

impl HmTechnology {
    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Vtx,
            2 => Self::AmdV,
            _ => Self::None,
        }
    }
}

/// Why hardware virtualization is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HmDetectError {
    /// `CPUID` cannot be executed.
    NoCpuId,
    /// The CPU vendor is neither Intel-compatible nor AMD-compatible.
    UnknownVendor,
    /// The CPU lacks VT-x / AMD-V.
    NoHardwareSupport,
    /// Firmware locked `IA32_FEATURE_CONTROL` with VMXON disallowed.
    VmxDisabled,
    /// `IA32_FEATURE_CONTROL` is unlocked and locking it ourselves is not allowed.
    VmxNotLocked,
    /// Writing the lock and enable bits of `IA32_FEATURE_CONTROL` had no effect.
    VmxLockFailed,
    /// `VMXON` failed: another hypervisor already owns VMX root mode.
    VmxInRootMode,
    /// `VM_CR.SVMDIS` is set.
    SvmDisabled,
    /// `EFER.SVME` did not stick.
    SvmEnableFailed,
    /// Another hypervisor already owns SVM.
    SvmInUse,
    /// No memory for the probe page.
    NoMemory,
}

impl fmt::Display for HmDetectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::NoCpuId => "CPUID is not available",
            Self::UnknownVendor => "unrecognized CPU vendor",
            Self::NoHardwareSupport => "no hardware virtualization support",
            Self::VmxDisabled => "VT-x is disabled by firmware",
            Self::VmxNotLocked => "IA32_FEATURE_CONTROL is not locked",
            Self::VmxLockFailed => "failed to lock IA32_FEATURE_CONTROL",
            Self::VmxInRootMode => "VT-x is already in use by another hypervisor",
            Self::SvmDisabled => "AMD-V is disabled by firmware",
            Self::SvmEnableFailed => "failed to set EFER.SVME",
            Self::SvmInUse => "AMD-V is already in use by another hypervisor",
            Self::NoMemory => "out of memory",
        };
        f.write_str(msg)
    }
}

impl From<HmDetectError> for AxError {
    fn from(err: HmDetectError) -> Self {
        match err {
            HmDetectError::NoCpuId
            | HmDetectError::UnknownVendor
            | HmDetectError::NoHardwareSupport => AxError::Unsupported,
            HmDetectError::VmxDisabled
            | HmDetectError::VmxNotLocked
            | HmDetectError::SvmDisabled => AxError::PermissionDenied,
            HmDetectError::VmxInRootMode | HmDetectError::SvmInUse => AxError::ResourceBusy,
            HmDetectError::VmxLockFailed | HmDetectError::SvmEnableFailed => AxError::BadState,
            HmDetectError::NoMemory => AxError::NoMemory,
        }
    }
}

/// The VMX capability MSRs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmxCapabilities {
    pub feature_control: u64,
    pub basic: u64,
    pub pin_based_ctls: u64,
    pub proc_based_ctls: u64,
    /// Zero if secondary processor-based controls are not supported.
    pub proc_based_ctls2: u64,
    pub exit_ctls: u64,
    pub entry_ctls: u64,
    pub misc: u64,
    pub cr0_fixed0: u64,
    pub cr0_fixed1: u64,
    pub cr4_fixed0: u64,
    pub cr4_fixed1: u64,
    /// Zero if neither EPT nor VPID is supported.
    pub ept_vpid_cap: u64,
}

impl VmxCapabilities {
    const PROC_CTLS_SECONDARY: u64 = 1 << 31;
    const PROC_CTLS2_EPT: u64 = 1 << 1;
    const PROC_CTLS2_VPID: u64 = 1 << 5;

    fn read<H: AxHmHal>(hal: &H, feature_control: u64) -> Self {
        let mut caps = Self {
            feature_control,
            basic: hal.read_msr(MSR_IA32_VMX_BASIC),
            pin_based_ctls: hal.read_msr(MSR_IA32_VMX_PINBASED_CTLS),
            proc_based_ctls: hal.read_msr(MSR_IA32_VMX_PROCBASED_CTLS),
            exit_ctls: hal.read_msr(MSR_IA32_VMX_EXIT_CTLS),
            entry_ctls: hal.read_msr(MSR_IA32_VMX_ENTRY_CTLS),
            misc: hal.read_msr(MSR_IA32_VMX_MISC),
            cr0_fixed0: hal.read_msr(MSR_IA32_VMX_CR0_FIXED0),
            cr0_fixed1: hal.read_msr(MSR_IA32_VMX_CR0_FIXED1),
            cr4_fixed0: hal.read_msr(MSR_IA32_VMX_CR4_FIXED0),
            cr4_fixed1: hal.read_msr(MSR_IA32_VMX_CR4_FIXED1),
            ..Self::default()
        };
        if caps.allowed1(caps.proc_based_ctls) & Self::PROC_CTLS_SECONDARY != 0 {
            caps.proc_based_ctls2 = hal.read_msr(MSR_IA32_VMX_PROCBASED_CTLS2);
            if caps.supports_ept() || caps.supports_vpid() {
                caps.ept_vpid_cap = hal.read_msr(MSR_IA32_VMX_EPT_VPID_CAP);
            }
        }
        caps
    }

    /// The upper half of a control capability MSR holds the bits that may be set.
    const fn allowed1(&self, ctls: u64) -> u64 {
        ctls >> 32
    }

    /// The VMCS revision identifier.
    pub const fn revision_id(&self) -> u32 {
        (self.basic & 0x7fff_ffff) as u32
    }

    /// Whether extended page tables can be enabled.
    pub const fn supports_ept(&self) -> bool {
        self.allowed1(self.proc_based_ctls2) & Self::PROC_CTLS2_EPT != 0
    }

    /// Whether VPIDs can be enabled.
    pub const fn supports_vpid(&self) -> bool {
        self.allowed1(self.proc_based_ctls2) & Self::PROC_CTLS2_VPID != 0
    }
}

/// The SVM feature leaf and control MSR.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SvmCapabilities {
    pub revision: u8,
    /// Number of address space identifiers, ASID 0 being reserved for the host.
    pub max_asid: u32,
    /// `EDX` of CPUID leaf `0x8000000a`.
    pub features: u32,
    pub vm_cr: u64,
}

impl SvmCapabilities {
    const FEATURE_NESTED_PAGING: u32 = 1 << 0;

    /// Whether nested paging is supported.
    pub const fn supports_nested_paging(&self) -> bool {
        self.features & Self::FEATURE_NESTED_PAGING != 0
    }
}

/// Everything learned about hardware virtualization on this host.
///
/// Produced once by [`HmCapabilities::detect`], immutable afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HmCapabilities {
    pub technology: HmTechnology,
    /// Meaningful only if `technology` is [`HmTechnology::Vtx`].
    pub vmx: VmxCapabilities,
    /// Meaningful only if `technology` is [`HmTechnology::AmdV`].
    pub svm: SvmCapabilities,
    pub host_cr4: u64,
    pub host_efer: u64,
    /// Why detection failed, if it did.
    pub last_error: Option<HmDetectError>,
}

impl HmCapabilities {
    /// Detects hardware virtualization support on the current physical CPU.
    ///
    /// Preemption stays disabled for the whole sequence so all registers are read from the same
    /// CPU. Apart from locking `IA32_FEATURE_CONTROL` (when allowed by `config`), the CPU
    /// configuration is left as it was found.
    pub fn detect<H: AxHmHal>(hal: &H, config: &AxHmConfig) -> Self {
        let mut caps = Self::default();
        let result = {
            let _guard = PreemptGuard::new(hal);
            caps.detect_current_cpu(hal, config)
        };
        match result {
            Ok(technology) => {
                caps.technology = technology;
                info!("hardware virtualization detected: {:?}", technology);
            }
            Err(err) => {
                caps.technology = HmTechnology::None;
                caps.last_error = Some(err);
                warn!("hardware virtualization unavailable: {}", err);
            }
        }
        caps
    }

    /// Whether VT-x or AMD-V is usable.
    pub fn is_supported(&self) -> bool {
        self.technology != HmTechnology::None
    }

    /// Returns the detection failure as an [`AxError`].
    pub fn check(&self) -> AxResult {
        match self.last_error {
            Some(err) => Err(err.into()),
            None if self.is_supported() => Ok(()),
            None => Err(AxError::Unsupported),
        }
    }

    fn detect_current_cpu<H: AxHmHal>(
        &mut self,
        hal: &H,
        config: &AxHmConfig,
    ) -> Result<HmTechnology, HmDetectError> {
        if !hal.has_cpuid() {
            return Err(HmDetectError::NoCpuId);
        }
        let cpuid =
            CpuId::with_cpuid_reader(move |leaf: u32, subleaf: u32| hal.cpuid(leaf, subleaf));
        let vendor = cpuid
            .get_vendor_info()
            .ok_or(HmDetectError::UnknownVendor)?;
        self.host_cr4 = hal.read_cr4();

        match vendor.as_str() {
            "GenuineIntel" | "CentaurHauls" | "  Shanghai  " => {
                if !cpuid.get_feature_info().is_some_and(|f| f.has_vmx()) {
                    return Err(HmDetectError::NoHardwareSupport);
                }
                self.detect_vmx(hal, config)?;
                Ok(HmTechnology::Vtx)
            }
            "AuthenticAMD" | "HygonGenuine" => {
                let has_svm = cpuid
                    .get_extended_processor_and_feature_identifiers()
                    .is_some_and(|f| f.has_svm());
                let svm = cpuid
                    .get_svm_info()
                    .filter(|_| has_svm)
                    .ok_or(HmDetectError::NoHardwareSupport)?;
                self.svm.revision = svm.revision();
                self.svm.max_asid = svm.supported_asids();
                self.svm.features = hal.cpuid(CPUID_SVM_FEATURES, 0).edx;
                self.detect_svm(hal)?;
                Ok(HmTechnology::AmdV)
            }
            other => {
                debug!("unknown CPU vendor {:?}", other);
                Err(HmDetectError::UnknownVendor)
            }
        }
    }

    fn detect_vmx<H: AxHmHal>(
        &mut self,
        hal: &H,
        config: &AxHmConfig,
    ) -> Result<(), HmDetectError> {
        const WANTED: u64 = FEATURE_CONTROL_LOCKED | FEATURE_CONTROL_VMXON_OUTSIDE_SMX;

        let mut feature_control = hal.read_msr(MSR_IA32_FEATURE_CONTROL);
        if feature_control & FEATURE_CONTROL_LOCKED == 0 {
            if !config.lock_feature_control {
                return Err(HmDetectError::VmxNotLocked);
            }
            info!("locking IA32_FEATURE_CONTROL with VMXON enabled");
            hal.write_msr(MSR_IA32_FEATURE_CONTROL, feature_control | WANTED);
            feature_control = hal.read_msr(MSR_IA32_FEATURE_CONTROL);
            if feature_control & WANTED != WANTED {
                return Err(HmDetectError::VmxLockFailed);
            }
        } else if feature_control & FEATURE_CONTROL_VMXON_OUTSIDE_SMX == 0 {
            return Err(HmDetectError::VmxDisabled);
        }
        self.vmx = VmxCapabilities::read(hal, feature_control);

        // Enter and leave VMX root mode once. Fails if someone else is already in it.
        let page = ScratchPage::new(hal)?;
        page.write_u32(0, self.vmx.revision_id());
        let cr4 = hal.read_cr4();
        hal.write_cr4(cr4 | CR4_VMXE);
        let entered = hal.vmxon(page.paddr());
        if entered {
            hal.vmxoff();
        }
        hal.write_cr4(cr4);
        if !entered {
            return Err(HmDetectError::VmxInRootMode);
        }
        Ok(())
    }

    fn detect_svm<H: AxHmHal>(&mut self, hal: &H) -> Result<(), HmDetectError> {
        self.svm.vm_cr = hal.read_msr(MSR_VM_CR);
        if self.svm.vm_cr & VM_CR_SVMDIS != 0 {
            return Err(HmDetectError::SvmDisabled);
        }

        let efer = hal.read_msr(MSR_EFER);
        self.host_efer = efer;
        if efer & EFER_SVME != 0 && hal.read_msr(MSR_VM_HSAVE_PA) != 0 {
            return Err(HmDetectError::SvmInUse);
        }
        let page = ScratchPage::new(hal)?;

        hal.write_msr(MSR_EFER, efer | EFER_SVME);
        if hal.read_msr(MSR_EFER) & EFER_SVME == 0 {
            hal.write_msr(MSR_EFER, efer);
            return Err(HmDetectError::SvmEnableFailed);
        }

        // Point the host save area at the probe page and back again.
        let hsave = hal.read_msr(MSR_VM_HSAVE_PA);
        let probe = page.paddr().as_usize() as u64;
        hal.write_msr(MSR_VM_HSAVE_PA, probe);
        let accepted = hal.read_msr(MSR_VM_HSAVE_PA) == probe;
        hal.write_msr(MSR_VM_HSAVE_PA, hsave);
        hal.write_msr(MSR_EFER, efer);
        if !accepted {
            return Err(HmDetectError::SvmInUse);
        }
        Ok(())
    }
}

/// A probe page, freed when dropped.
struct ScratchPage<'a, H: AxHmHal> {
    hal: &'a H,
    page: ControlPage,
}

impl<'a, H: AxHmHal> ScratchPage<'a, H> {
    fn new(hal: &'a H) -> Result<Self, HmDetectError> {
        let page = ControlPage::alloc(hal).ok_or(HmDetectError::NoMemory)?;
        Ok(Self { hal, page })
    }
}

impl<H: AxHmHal> core::ops::Deref for ScratchPage<'_, H> {
    type Target = ControlPage;

    fn deref(&self) -> &ControlPage {
        &self.page
    }
}

impl<H: AxHmHal> Drop for ScratchPage<'_, H> {
    fn drop(&mut self) {
        self.hal.dealloc_contiguous_page(self.page.paddr());
    }
}
