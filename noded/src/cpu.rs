// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Host CPU generation detection and the instance-type table it drives
//! (§4.1). Detection is injected behind [`CpuDetector`] so tests fix a
//! `(vendor, family, model, arch)` tuple instead of reading `/proc/cpuinfo`.

use common::types::{FamilyClass, InstanceType};
use std::fs;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuIdentity {
    pub vendor: String,
    pub family: u32,
    pub model: u32,
    pub arch: String,
}

pub trait CpuDetector: Send + Sync {
    fn detect(&self) -> CpuIdentity;
}

/// Reads `vendor_id` / `cpu family` / `model` from `/proc/cpuinfo` on Linux;
/// falls back to an "unknown" identity on any other architecture or parse
/// failure, which the generation table maps to the `t3`/`t3a`/`t4g` floor.
pub struct LinuxCpuDetector;

impl CpuDetector for LinuxCpuDetector {
    fn detect(&self) -> CpuIdentity {
        let arch = std::env::consts::ARCH.to_string();
        if arch != "x86_64" && arch != "x86" {
            return CpuIdentity {
                vendor: "unknown".into(),
                family: 0,
                model: 0,
                arch,
            };
        }
        let Ok(contents) = fs::read_to_string("/proc/cpuinfo") else {
            return CpuIdentity {
                vendor: "unknown".into(),
                family: 0,
                model: 0,
                arch,
            };
        };
        let mut vendor = "unknown".to_string();
        let mut family = 0u32;
        let mut model = 0u32;
        for line in contents.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            match key {
                "vendor_id" => vendor = value.to_string(),
                "cpu family" => family = value.parse().unwrap_or(0),
                "model" => model = value.parse().unwrap_or(0),
                _ => {}
            }
            if key == "model" {
                break;
            }
        }
        CpuIdentity {
            vendor,
            family,
            model,
            arch,
        }
    }
}

/// Fixed identity for unit tests.
pub struct FixedCpuDetector(pub CpuIdentity);

impl CpuDetector for FixedCpuDetector {
    fn detect(&self) -> CpuIdentity {
        self.0.clone()
    }
}

/// One CPU generation: a burstable family plus one compute/balanced/memory
/// family, and the generation suffix used in instance-type names (§6.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub suffix: &'static str,
    pub burstable: &'static str,
    pub compute: &'static str,
    pub balanced: &'static str,
    pub memory: &'static str,
    pub current: bool,
}

/// Maps a detected CPU identity to its generation table entry (§4.1).
pub fn generation_for(id: &CpuIdentity) -> Generation {
    match id.arch.as_str() {
        "aarch64" | "arm" => {
            return Generation {
                suffix: "g",
                burstable: "t4g",
                compute: "c7g",
                balanced: "m7g",
                memory: "r7g",
                current: true,
            }
        }
        "x86_64" | "x86" => {}
        _ => {
            return Generation {
                suffix: "",
                burstable: "t3",
                compute: "c5",
                balanced: "m5",
                memory: "r5",
                current: false,
            }
        }
    }

    let is_intel = id.vendor.contains("Intel") || id.vendor == "GenuineIntel";
    let is_amd = id.vendor.contains("AMD") || id.vendor == "AuthenticAMD";

    if is_intel && id.family == 6 {
        return match id.model {
            79 | 86 => Generation {
                suffix: "",
                burstable: "t3",
                compute: "c5",
                balanced: "m5",
                memory: "r5",
                current: false,
            },
            85 => Generation {
                suffix: "",
                burstable: "t3",
                compute: "c5",
                balanced: "m5",
                memory: "r5",
                current: false,
            },
            106 | 108 | 151 | 154 => Generation {
                suffix: "",
                burstable: "t3",
                compute: "c6i",
                balanced: "m6i",
                memory: "r6i",
                current: true,
            },
            143 | 207 | 183 | 191 => Generation {
                suffix: "",
                burstable: "t3",
                compute: "c7i",
                balanced: "m7i",
                memory: "r7i",
                current: true,
            },
            173 | 174 | 197 | 198 => Generation {
                suffix: "",
                burstable: "t3",
                compute: "c8i",
                balanced: "m8i",
                memory: "r8i",
                current: true,
            },
            _ => Generation {
                suffix: "",
                burstable: "t3",
                compute: "c5",
                balanced: "m5",
                memory: "r5",
                current: false,
            },
        };
    }

    if is_amd {
        return match id.family {
            23 => Generation {
                suffix: "a",
                burstable: "t3a",
                compute: "c5a",
                balanced: "m5a",
                memory: "r5a",
                current: false,
            },
            25 => {
                let zen3 = id.model <= 0x0F || (0x20..=0x5F).contains(&id.model);
                if zen3 {
                    Generation {
                        suffix: "a",
                        burstable: "t3a",
                        compute: "c6a",
                        balanced: "m6a",
                        memory: "r6a",
                        current: true,
                    }
                } else {
                    Generation {
                        suffix: "a",
                        burstable: "t3a",
                        compute: "c7a",
                        balanced: "m7a",
                        memory: "r7a",
                        current: true,
                    }
                }
            }
            26 => Generation {
                suffix: "a",
                burstable: "t3a",
                compute: "c8a",
                balanced: "m8a",
                memory: "r8a",
                current: true,
            },
            _ => Generation {
                suffix: "a",
                burstable: "t3a",
                compute: "c5a",
                balanced: "m5a",
                memory: "r5a",
                current: false,
            },
        };
    }

    // Unknown x86 vendor/branding: burstable-only floor (§4.1).
    Generation {
        suffix: "",
        burstable: "t3",
        compute: "c5",
        balanced: "m5",
        memory: "r5",
        current: false,
    }
}

const BURSTABLE_SIZES: &[(&str, u32, f64)] = &[
    ("nano", 2, 0.5),
    ("micro", 2, 1.0),
    ("small", 2, 2.0),
    ("medium", 2, 4.0),
    ("large", 2, 8.0),
    ("xlarge", 4, 16.0),
    ("2xlarge", 8, 32.0),
];

const CURRENT_SIZES: &[(&str, u32)] = &[
    ("large", 2),
    ("xlarge", 4),
    ("2xlarge", 8),
    ("4xlarge", 16),
    ("8xlarge", 32),
    ("12xlarge", 48),
    ("16xlarge", 64),
    ("24xlarge", 96),
];

const PREVIOUS_SIZES: &[(&str, u32)] = &[
    ("large", 2),
    ("xlarge", 4),
    ("2xlarge", 8),
    ("4xlarge", 16),
    ("8xlarge", 32),
    ("12xlarge", 48),
];

/// Generates every instance type for the host's detected generation (§3.1, §6.3).
pub fn generate_instance_types(detector: &dyn CpuDetector) -> Vec<InstanceType> {
    let id = detector.detect();
    let gen = generation_for(&id);
    let mut out = Vec::new();

    for (size, vcpu, mem_gib) in BURSTABLE_SIZES {
        out.push(InstanceType {
            name: format!("{}{}.{}", gen.burstable, gen.suffix, size),
            vcpus: *vcpu,
            memory_mib: (mem_gib * 1024.0) as u64,
            architecture: id.arch.clone(),
            current_generation: true,
            burstable: true,
        });
    }

    let sizes = if gen.current { CURRENT_SIZES } else { PREVIOUS_SIZES };
    for (family, class) in [
        (gen.compute, FamilyClass::Compute),
        (gen.balanced, FamilyClass::Balanced),
        (gen.memory, FamilyClass::Memory),
    ] {
        for (size, vcpu) in sizes {
            let mem_gib = match class {
                FamilyClass::Compute => 2.0 * *vcpu as f64,
                FamilyClass::Balanced => 4.0 * *vcpu as f64,
                FamilyClass::Memory => 8.0 * *vcpu as f64,
                FamilyClass::Burstable => unreachable!(),
            };
            out.push(InstanceType {
                name: format!("{family}.{size}"),
                vcpus: *vcpu,
                memory_mib: (mem_gib * 1024.0) as u64,
                architecture: id.arch.clone(),
                current_generation: gen.current,
                burstable: false,
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadwell_maps_to_previous_generation() {
        let id = CpuIdentity {
            vendor: "GenuineIntel".into(),
            family: 6,
            model: 79,
            arch: "x86_64".into(),
        };
        let gen = generation_for(&id);
        assert_eq!(gen.compute, "c5");
        assert!(!gen.current);
    }

    #[test]
    fn ice_lake_maps_to_current_generation() {
        let id = CpuIdentity {
            vendor: "GenuineIntel".into(),
            family: 6,
            model: 106,
            arch: "x86_64".into(),
        };
        let gen = generation_for(&id);
        assert_eq!(gen.compute, "c6i");
        assert!(gen.current);
    }

    #[test]
    fn zen3_vs_zen4_split_by_model_range() {
        let zen3 = generation_for(&CpuIdentity {
            vendor: "AuthenticAMD".into(),
            family: 25,
            model: 0x10,
            arch: "x86_64".into(),
        });
        assert_eq!(zen3.compute, "c7a");

        let zen4 = generation_for(&CpuIdentity {
            vendor: "AuthenticAMD".into(),
            family: 25,
            model: 0x00,
            arch: "x86_64".into(),
        });
        assert_eq!(zen4.compute, "c6a");
    }

    #[test]
    fn burstable_family_has_seven_sizes_current_family_has_eight() {
        let detector = FixedCpuDetector(CpuIdentity {
            vendor: "GenuineIntel".into(),
            family: 6,
            model: 106,
            arch: "x86_64".into(),
        });
        let types = generate_instance_types(&detector);
        let burstable_count = types.iter().filter(|t| t.burstable).count();
        let compute_count = types
            .iter()
            .filter(|t| t.name.starts_with("c6i."))
            .count();
        assert_eq!(burstable_count, 7);
        assert_eq!(compute_count, 8);
    }

    #[test]
    fn unknown_arm_maps_to_graviton_equivalent() {
        let id = CpuIdentity {
            vendor: "unknown".into(),
            family: 0,
            model: 0,
            arch: "aarch64".into(),
        };
        let gen = generation_for(&id);
        assert_eq!(gen.burstable, "t4g");
    }
}
