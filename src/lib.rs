// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! AxHm - Hardware-assisted virtualization core for ArceOS hypervisors.
//!
//! This crate detects and switches on VT-x or AMD-V, signals pending host work to virtual CPUs
//! through forced-action flags, and drives the world switch between host and guest. The
//! instruction sequences that program a VMCS or VMCB live behind the `AxArchHm` trait; host
//! services (CPU enumeration, memory, registers) live behind the `AxHmHal` trait.
//!
//! # Features
//!
//! - Lock-free forced-action registries per machine and per vcpu, grouped by priority class
//! - VCpu state machine owned by a single emulation thread (EMT)
//! - One-time capability detection with distinct, stored failure reasons
//! - Global or per-entry enablement of VT-x/AMD-V on physical CPUs
//! - Enter / run / leave world switch with lazy guest FPU handling

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;

// Core modules
mod arch_hm; // Vendor (VT-x / AMD-V) backend trait
mod caps; // Capability detection
mod config; // Host configuration
mod context; // Per-machine virtualization context
mod emt; // One step of the EMT dispatch loop
mod exit; // VM exit reasons
mod ff; // Forced-action flags
mod guest; // Guest register state
mod hal; // Hardware abstraction layer interfaces
mod host; // Host-wide enablement state
mod percpu; // Per-CPU virtualization state
mod vcpu; // VCpu state machine
mod vm; // Machine state
mod world_switch; // Enter / run / leave

#[cfg(test)]
mod test;

// Public API exports
pub use arch_hm::AxArchHm;
pub use caps::*;
pub use config::AxHmConfig;
pub use context::{VmHmContext, VmHmState};
pub use emt::{AxEmtHandler, EmtEvent};
pub use exit::{AccessWidth, AxVCpuExitReason, GuestPhysAddr};
pub use ff::*;
pub use guest::GuestCpuContext;
pub use hal::{AxHmHal, HostPhysAddr, HostVirtAddr};
pub use host::AxHmHost;
pub use percpu::{ControlPage, HmEnableMode, PhysCpuSlot};
pub use vcpu::{AxVCpu, HmPhase, VCpuState};
pub use vm::{AxVm, VmState};
