//! CPUID shaping (spec.md §4.9).
//!
//! KVM's supported-CPUID query returns the host's raw feature set. Before
//! installing it on a vCPU we rewrite three things the guest kernel inspects
//! during early boot:
//!
//! - The KVM signature leaf (`0x4000_0000`) is rewritten to the canonical
//!   "KVMKVMKVM" string so the guest recognizes it's running under KVM.
//! - CPUID leaf 1 gets the hypervisor-present bit (ECX bit 31) set.
//! - CPUID leaf 7's EDX gets the FSRM bit (bit 4) cleared, because this VMM
//!   does not model the fast short REP MOVSB microarchitectural behavior the
//!   bit advertises.

use kvm_bindings::CpuId;

use super::KvmError;

const KVM_SIGNATURE_LEAF: u32 = 0x4000_0000;
const CPUID_LEAF_FEATURES: u32 = 0x1;
const CPUID_LEAF_EXTENDED_FEATURES: u32 = 0x7;

const HYPERVISOR_PRESENT_BIT: u32 = 1 << 31;
const FSRM_BIT: u32 = 1 << 4;

/// Rewrites `cpuid` per spec.md §4.9 and returns it ready to install on a
/// vCPU.
///
/// # Errors
///
/// Returns [`KvmError::NotReady`] if the host's supported-CPUID list doesn't
/// advertise a KVM signature leaf to rewrite — this would mean we're not
/// actually running under KVM.
pub fn shape(mut cpuid: CpuId) -> Result<CpuId, KvmError> {
    let mut found_signature = false;

    for entry in cpuid.as_mut_slice() {
        match entry.function {
            KVM_SIGNATURE_LEAF => {
                found_signature = true;
                entry.eax = KVM_SIGNATURE_LEAF + 1;
                entry.ebx = 0x4b4d_564b; // "KVMK"
                entry.ecx = 0x564b_4d56; // "VMKV"
                entry.edx = 0x0000_004d; // "M\0\0\0"
            }
            CPUID_LEAF_FEATURES => {
                entry.ecx |= HYPERVISOR_PRESENT_BIT;
            }
            CPUID_LEAF_EXTENDED_FEATURES if entry.index == 0 => {
                entry.edx &= !FSRM_BIT;
            }
            _ => {}
        }
    }

    if !found_signature {
        return Err(KvmError::NotReady);
    }

    Ok(cpuid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvm_bindings::kvm_cpuid_entry2;

    fn entry(function: u32, index: u32) -> kvm_cpuid_entry2 {
        kvm_cpuid_entry2 {
            function,
            index,
            eax: 0xffff_ffff,
            ebx: 0xffff_ffff,
            ecx: 0xffff_ffff,
            edx: 0xffff_ffff,
            ..Default::default()
        }
    }

    #[test]
    fn rewrites_kvm_signature_leaf() {
        let cpuid = CpuId::from_entries(&[entry(KVM_SIGNATURE_LEAF, 0)]).unwrap();
        let shaped = shape(cpuid).unwrap();
        let e = &shaped.as_slice()[0];
        assert_eq!(e.ebx, 0x4b4d_564b);
        assert_eq!(e.ecx, 0x564b_4d56);
        assert_eq!(e.edx, 0x0000_004d);
    }

    #[test]
    fn sets_hypervisor_bit_on_leaf_one() {
        let cpuid =
            CpuId::from_entries(&[entry(KVM_SIGNATURE_LEAF, 0), entry(CPUID_LEAF_FEATURES, 0)])
                .unwrap();
        let shaped = shape(cpuid).unwrap();
        let leaf1 = shaped
            .as_slice()
            .iter()
            .find(|e| e.function == CPUID_LEAF_FEATURES)
            .unwrap();
        assert_ne!(leaf1.ecx & HYPERVISOR_PRESENT_BIT, 0);
    }

    #[test]
    fn clears_fsrm_bit_on_leaf_seven() {
        let cpuid = CpuId::from_entries(&[
            entry(KVM_SIGNATURE_LEAF, 0),
            entry(CPUID_LEAF_EXTENDED_FEATURES, 0),
        ])
        .unwrap();
        let shaped = shape(cpuid).unwrap();
        let leaf7 = shaped
            .as_slice()
            .iter()
            .find(|e| e.function == CPUID_LEAF_EXTENDED_FEATURES)
            .unwrap();
        assert_eq!(leaf7.edx & FSRM_BIT, 0);
    }

    #[test]
    fn missing_signature_leaf_is_an_error() {
        let cpuid = CpuId::from_entries(&[entry(CPUID_LEAF_FEATURES, 0)]).unwrap();
        assert!(matches!(shape(cpuid), Err(KvmError::NotReady)));
    }
}
