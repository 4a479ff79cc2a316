//! Hypervisor abstractions.

pub mod proxmox;
mod traits;

pub use traits::{
    primary_ipv4, CreateVmRequest, Hypervisor, IsoRequest, ProviderError, VmHandle, VmStatus,
};
