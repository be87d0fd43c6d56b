//! Host-wide configuration of hardware-assisted virtualization.

/// Configuration of an [`AxHmHost`](crate::AxHmHost).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxHmConfig {
    /// Enable VT-x/AMD-V on every online physical CPU once, when the first machine is created.
    ///
    /// If `false`, hardware virtualization is switched on only on the current physical CPU for
    /// the duration of each world switch.
    pub global_init: bool,
    /// Whether the detector may set the lock and enable bits of `IA32_FEATURE_CONTROL` itself
    /// when firmware left the register unlocked. Setting the lock bit cannot be undone until
    /// the next reset.
    pub lock_feature_control: bool,
    /// Upper bound of the AMD-V ASID range handed to each machine.
    pub max_asid: Option<u32>,
    /// Use nested paging (EPT/NPT) when the hardware supports it.
    pub nested_paging: bool,
    /// Use VPIDs to tag TLB entries when the hardware supports it.
    pub vpid: bool,
}

impl Default for AxHmConfig {
    fn default() -> Self {
        Self {
            global_init: true,
            lock_feature_control: true,
            max_asid: None,
            nested_paging: true,
            vpid: true,
        }
    }
}
