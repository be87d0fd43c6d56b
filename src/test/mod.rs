//! Mock host and vendor backend shared by the unit tests.

mod ff;

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::Cell;
use core::ops::Deref;
use core::sync::atomic::{AtomicBool, AtomicIsize, AtomicU64, AtomicUsize, Ordering};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use axerrno::{AxError, AxResult};
use raw_cpuid::CpuIdResult;

use crate::caps::{
    MSR_EFER, MSR_IA32_FEATURE_CONTROL, MSR_IA32_VMX_BASIC, MSR_IA32_VMX_PROCBASED_CTLS,
    MSR_IA32_VMX_PROCBASED_CTLS2, MSR_VM_CR, MSR_VM_HSAVE_PA,
};
use crate::{
    AxArchHm, AxHmConfig, AxHmHal, AxHmHost, AxVCpu, AxVCpuExitReason, AxVm, ControlPage,
    GuestCpuContext, HmCapabilities, HostPhysAddr, HostVirtAddr, VmHmContext,
};

const PAGE_SIZE: usize = 0x1000;
const VMCS_REVISION: u64 = 0x12;
const SVM_ASIDS: u32 = 64;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

std::thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
    static CURRENT_CPU: Cell<usize> = const { Cell::new(0) };
}

/// Runs `f` on a fresh thread that believes it executes on physical CPU `cpu`.
pub(crate) fn on_cpu<T: Send>(cpu: usize, f: impl FnOnce() -> T + Send) -> T {
    std::thread::scope(|s| {
        s.spawn(move || {
            CURRENT_CPU.with(|c| c.set(cpu));
            f()
        })
        .join()
        .unwrap()
    })
}

/// Splits a vendor string into the `ebx`, `ecx`, `edx` values of CPUID leaf 0.
fn vendor_regs(vendor: &[u8; 12]) -> (u32, u32, u32) {
    let word = |i: usize| u32::from_le_bytes(vendor[i..i + 4].try_into().unwrap());
    (word(0), word(8), word(4))
}

fn regs(eax: u32, ebx: u32, ecx: u32, edx: u32) -> CpuIdResult {
    CpuIdResult { eax, ebx, ecx, edx }
}

/// Simulated processor and host kernel.
pub(crate) struct MockHw {
    online: Vec<bool>,
    cpuid: HashMap<u32, CpuIdResult>,
    has_cpuid: bool,
    msrs: Mutex<HashMap<u32, u64>>,
    /// MSRs whose writes are ignored.
    read_only_msrs: Mutex<HashSet<u32>>,
    cr4: AtomicU64,
    vmxon_fails: AtomicBool,
    pub vmxon_count: AtomicUsize,
    live_pages: Mutex<HashSet<usize>>,
    pub page_allocs: AtomicUsize,
    pub preempt_balance: AtomicIsize,
    pub fpu_restores: AtomicUsize,
    pub vtx: MockBackend,
    pub amdv: MockBackend,
}

/// The [`AxHmHal`] of the tests. Clones share the same simulated machine.
#[derive(Clone)]
pub(crate) struct MockHal(Arc<MockHw>);

impl Deref for MockHal {
    type Target = MockHw;

    fn deref(&self) -> &MockHw {
        &self.0
    }
}

impl MockHal {
    fn new(cpus: usize, vendor: &[u8; 12], leaves: &[(u32, CpuIdResult)]) -> Self {
        let (ebx, ecx, edx) = vendor_regs(vendor);
        let mut cpuid: HashMap<u32, CpuIdResult> = leaves.iter().copied().collect();
        cpuid.insert(0, regs(1, ebx, ecx, edx));
        cpuid.entry(0x8000_0000).or_insert(regs(0x8000_0001, 0, 0, 0));
        Self(Arc::new(MockHw {
            online: vec![true; cpus],
            cpuid,
            has_cpuid: true,
            msrs: Mutex::new(HashMap::new()),
            read_only_msrs: Mutex::new(HashSet::new()),
            cr4: AtomicU64::new(0x20),
            vmxon_fails: AtomicBool::new(false),
            vmxon_count: AtomicUsize::new(0),
            live_pages: Mutex::new(HashSet::new()),
            page_allocs: AtomicUsize::new(0),
            preempt_balance: AtomicIsize::new(0),
            fpu_restores: AtomicUsize::new(0),
            vtx: MockBackend::default(),
            amdv: MockBackend::default(),
        }))
    }

    /// An Intel host with VMX, EPT and VPID, `IA32_FEATURE_CONTROL` left unlocked.
    pub fn intel(cpus: usize) -> Self {
        let hal = Self::new(cpus, b"GenuineIntel", &[(1, regs(0, 0, 1 << 5, 0))]);
        hal.set_msr(MSR_IA32_FEATURE_CONTROL, 0);
        hal.set_msr(MSR_IA32_VMX_BASIC, VMCS_REVISION);
        hal.set_msr(MSR_IA32_VMX_PROCBASED_CTLS, (1 << 31) << 32);
        hal.set_msr(MSR_IA32_VMX_PROCBASED_CTLS2, ((1 << 1) | (1 << 5)) << 32);
        hal
    }

    /// An AMD host with SVM and nested paging.
    pub fn amd(cpus: usize) -> Self {
        let hal = Self::new(
            cpus,
            b"AuthenticAMD",
            &[
                (1, regs(0, 0, 0, 0)),
                (0x8000_0000, regs(0x8000_000a, 0, 0, 0)),
                (0x8000_0001, regs(0, 0, 1 << 2, 0)),
                (0x8000_000a, regs(1, SVM_ASIDS, 0, 1)),
            ],
        );
        hal.set_msr(MSR_EFER, 0xd01);
        hal.set_msr(MSR_VM_CR, 0);
        hal.set_msr(MSR_VM_HSAVE_PA, 0);
        hal
    }

    /// An Intel host without VMX.
    pub fn no_virt(cpus: usize) -> Self {
        Self::new(cpus, b"GenuineIntel", &[(1, regs(0, 0, 0, 0))])
    }

    pub fn unknown_vendor(cpus: usize) -> Self {
        Self::new(cpus, b"SomeVendorXY", &[(1, regs(0, 0, 1 << 5, 0))])
    }

    pub fn without_cpuid(mut self) -> Self {
        if let Some(hw) = Arc::get_mut(&mut self.0) {
            hw.has_cpuid = false;
        }
        self
    }

    pub fn with_offline(mut self, cpu: usize) -> Self {
        if let Some(hw) = Arc::get_mut(&mut self.0) {
            hw.online[cpu] = false;
        }
        self
    }

    pub fn msr(&self, msr: u32) -> u64 {
        self.msrs.lock().unwrap().get(&msr).copied().unwrap_or(0)
    }

    pub fn set_msr(&self, msr: u32, value: u64) {
        self.msrs.lock().unwrap().insert(msr, value);
    }

    pub fn make_msr_read_only(&self, msr: u32) {
        self.read_only_msrs.lock().unwrap().insert(msr);
    }

    pub fn cr4(&self) -> u64 {
        self.cr4.load(Ordering::SeqCst)
    }

    pub fn fail_vmxon(&self) {
        self.vmxon_fails.store(true, Ordering::SeqCst);
    }

    pub fn live_pages(&self) -> usize {
        self.live_pages.lock().unwrap().len()
    }

    fn page_layout() -> std::alloc::Layout {
        std::alloc::Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap()
    }
}

impl AxHmHal for MockHal {
    type VtxBackend = MockBackend;
    type AmdVBackend = MockBackend;

    fn vtx_backend(&self) -> &MockBackend {
        &self.vtx
    }

    fn amdv_backend(&self) -> &MockBackend {
        &self.amdv
    }

    fn current_thread_id() -> u64 {
        THREAD_ID.with(|id| *id)
    }

    fn current_cpu_id() -> usize {
        CURRENT_CPU.with(|c| c.get())
    }

    fn cpu_num(&self) -> usize {
        self.online.len()
    }

    fn is_cpu_online(&self, cpu_id: usize) -> bool {
        self.online.get(cpu_id).copied().unwrap_or(false)
    }

    fn run_on_each_cpu(&self, f: &(dyn Fn(usize) + Sync)) {
        std::thread::scope(|s| {
            for cpu in (0..self.cpu_num()).filter(|&cpu| self.is_cpu_online(cpu)) {
                s.spawn(move || {
                    CURRENT_CPU.with(|c| c.set(cpu));
                    f(cpu)
                });
            }
        });
    }

    fn preempt_disable(&self) {
        self.preempt_balance.fetch_add(1, Ordering::SeqCst);
    }

    fn preempt_enable(&self) {
        self.preempt_balance.fetch_sub(1, Ordering::SeqCst);
    }

    fn alloc_contiguous_page(&self) -> Option<HostPhysAddr> {
        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(Self::page_layout()) };
        if ptr.is_null() {
            return None;
        }
        self.page_allocs.fetch_add(1, Ordering::SeqCst);
        self.live_pages.lock().unwrap().insert(ptr as usize);
        Some(HostPhysAddr::from(ptr as usize))
    }

    fn dealloc_contiguous_page(&self, paddr: HostPhysAddr) {
        assert!(
            self.live_pages.lock().unwrap().remove(&paddr.as_usize()),
            "freeing unknown page {:?}",
            paddr
        );
        // SAFETY: the page came from `alloc_contiguous_page` with the same layout.
        unsafe { std::alloc::dealloc(paddr.as_usize() as *mut u8, Self::page_layout()) }
    }

    fn phys_to_virt(&self, paddr: HostPhysAddr) -> HostVirtAddr {
        HostVirtAddr::from(paddr.as_usize())
    }

    fn has_cpuid(&self) -> bool {
        self.has_cpuid
    }

    fn cpuid(&self, leaf: u32, _subleaf: u32) -> CpuIdResult {
        self.cpuid
            .get(&leaf)
            .copied()
            .unwrap_or(regs(0, 0, 0, 0))
    }

    fn read_msr(&self, msr: u32) -> u64 {
        self.msr(msr)
    }

    fn write_msr(&self, msr: u32, value: u64) {
        if !self.read_only_msrs.lock().unwrap().contains(&msr) {
            self.set_msr(msr, value);
        }
    }

    fn read_cr4(&self) -> u64 {
        self.cr4.load(Ordering::SeqCst)
    }

    fn write_cr4(&self, value: u64) {
        self.cr4.store(value, Ordering::SeqCst);
    }

    fn vmxon(&self, region: HostPhysAddr) -> bool {
        assert_ne!(self.cr4() & crate::caps::CR4_VMXE, 0, "VMXON with CR4.VMXE clear");
        // SAFETY: `region` is a live mock page, identity mapped.
        let revision = unsafe { (region.as_usize() as *const u32).read_volatile() };
        assert_eq!(revision as u64, VMCS_REVISION);
        self.vmxon_count.fetch_add(1, Ordering::SeqCst);
        !self.vmxon_fails.load(Ordering::SeqCst)
    }

    fn vmxoff(&self) {}

    fn fpu_save_guest_restore_host(&self, _ctx: &mut GuestCpuContext) {
        self.fpu_restores.fetch_add(1, Ordering::SeqCst);
    }
}

/// Vendor backend recording every call.
#[derive(Default)]
pub(crate) struct MockBackend {
    call_log: Mutex<Vec<String>>,
    /// Name of the method that fails, and the CPU it fails on for per-CPU methods.
    fail: Mutex<Option<(&'static str, Option<usize>)>>,
    exit: Mutex<Option<AxVCpuExitReason>>,
    activate_fpu: AtomicBool,
}

impl MockBackend {
    pub fn calls(&self) -> Vec<String> {
        self.call_log.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.call_log
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == call)
            .count()
    }

    pub fn clear_calls(&self) {
        self.call_log.lock().unwrap().clear();
    }

    pub fn fail_on(&self, method: &'static str) {
        *self.fail.lock().unwrap() = Some((method, None));
    }

    pub fn fail_on_cpu(&self, method: &'static str, cpu: usize) {
        *self.fail.lock().unwrap() = Some((method, Some(cpu)));
    }

    pub fn stop_failing(&self) {
        *self.fail.lock().unwrap() = None;
    }

    pub fn set_exit(&self, exit: AxVCpuExitReason) {
        *self.exit.lock().unwrap() = Some(exit);
    }

    pub fn activate_guest_fpu(&self, activate: bool) {
        self.activate_fpu.store(activate, Ordering::SeqCst);
    }

    fn record(&self, call: String, method: &str, cpu: Option<usize>) -> AxResult {
        self.call_log.lock().unwrap().push(call);
        match *self.fail.lock().unwrap() {
            Some((m, None)) if m == method => Err(AxError::BadState),
            Some((m, Some(c))) if m == method && cpu == Some(c) => Err(AxError::BadState),
            _ => Ok(()),
        }
    }
}

impl AxArchHm<MockHal> for MockBackend {
    fn enable_cpu(&self, cpu_id: usize, page: &ControlPage, caps: &HmCapabilities) -> AxResult {
        assert_eq!(MockHal::current_cpu_id(), cpu_id);
        assert!(caps.is_supported());
        page.write_u32(0, 0xfeed);
        self.record(format!("enable_cpu({})", cpu_id), "enable_cpu", Some(cpu_id))
    }

    fn disable_cpu(&self, cpu_id: usize, page: &ControlPage) -> AxResult {
        assert_eq!(MockHal::current_cpu_id(), cpu_id);
        assert_eq!(page.read_u32(0), 0xfeed);
        self.record(format!("disable_cpu({})", cpu_id), "disable_cpu", Some(cpu_id))
    }

    fn setup_vm(&self, vm: &mut VmHmContext) -> AxResult {
        vm.vendor_data = 0x5e7;
        self.record("setup_vm".to_string(), "setup_vm", None)
    }

    fn enter(&self, _vm: &AxVm<MockHal>, vcpu: &AxVCpu<MockHal>) -> AxResult {
        self.record("enter".to_string(), "enter", Some(vcpu.id()))
    }

    fn save_host_state(&self, _vm: &AxVm<MockHal>, vcpu: &AxVCpu<MockHal>) -> AxResult {
        self.record("save_host_state".to_string(), "save_host_state", Some(vcpu.id()))
    }

    fn load_guest_state(&self, _vm: &AxVm<MockHal>, vcpu: &AxVCpu<MockHal>) -> AxResult {
        self.record("load_guest_state".to_string(), "load_guest_state", Some(vcpu.id()))
    }

    fn run_guest_code(
        &self,
        _vm: &AxVm<MockHal>,
        vcpu: &AxVCpu<MockHal>,
    ) -> AxResult<AxVCpuExitReason> {
        self.record("run_guest_code".to_string(), "run_guest_code", Some(vcpu.id()))?;
        if self.activate_fpu.load(Ordering::SeqCst) {
            vcpu.get_guest_context().fpu_active = true;
        }
        Ok(self
            .exit
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(AxVCpuExitReason::Nothing))
    }

    fn leave(&self, _vm: &AxVm<MockHal>, vcpu: &AxVCpu<MockHal>) -> AxResult {
        self.record("leave".to_string(), "leave", Some(vcpu.id()))
    }
}

pub(crate) fn create_host(hal: &MockHal) -> Arc<AxHmHost<MockHal>> {
    create_host_with(hal, AxHmConfig::default())
}

pub(crate) fn create_host_with(hal: &MockHal, config: AxHmConfig) -> Arc<AxHmHost<MockHal>> {
    Arc::new(AxHmHost::new(hal.clone(), config))
}

/// A one-vcpu machine whose vcpu 0 is bound to the calling thread.
pub(crate) fn create_vm_on_emt(hal: &MockHal) -> AxVm<MockHal> {
    let vm = AxVm::new(0, create_host(hal), 1).unwrap();
    vm.vcpu(0).unwrap().bind_emt().unwrap();
    vm
}
