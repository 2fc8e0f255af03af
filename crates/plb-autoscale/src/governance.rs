//! Resource governance limits derived from service package policies.
//!
//! The engine computes the limits an enforcement layer should apply to
//! every code package of a governed service package. CPU is split across
//! code packages by their `cpu_shares` (equally when no package declares
//! shares); a code package pinned to a cpuset gets one core per listed CPU.

use plb_core::{PlbConfig, ResourceGovernancePolicy};

use crate::error::{AutoScaleError, AutoScaleResult};

/// Which processes a memory limit covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryScope {
    MainProcess,
    ProcessTree,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CodePackageLimits {
    pub name: String,
    pub cpu_cores: f64,
    pub cpuset: Option<Vec<u32>>,
    pub memory_in_mb: u64,
    pub memory_swap_in_mb: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PackageLimits {
    pub cpu_cores: f64,
    pub memory_in_mb: u64,
    pub memory_scope: MemoryScope,
    /// False in local resource manager test mode: limits are reported only.
    pub enforce: bool,
    pub code_packages: Vec<CodePackageLimits>,
}

/// Parse a cpuset list such as `"0-3,6,8-9"` into sorted, distinct CPU ids.
pub fn parse_cpuset(spec: &str) -> AutoScaleResult<Vec<u32>> {
    let invalid = || AutoScaleError::InvalidCpuset(spec.to_string());
    let mut cpus = Vec::new();
    for part in spec.split(',').map(str::trim) {
        if part.is_empty() {
            return Err(invalid());
        }
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo.trim().parse().map_err(|_| invalid())?;
                let hi: u32 = hi.trim().parse().map_err(|_| invalid())?;
                if lo > hi {
                    return Err(invalid());
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(part.parse().map_err(|_| invalid())?),
        }
    }
    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}

/// Limits for every code package of a governed service package.
pub fn package_limits(policy: &ResourceGovernancePolicy, config: &PlbConfig) -> AutoScaleResult<PackageLimits> {
    let mut pinned = Vec::with_capacity(policy.code_packages.len());
    for cp in &policy.code_packages {
        pinned.push(cp.cpuset_cpus.as_deref().map(parse_cpuset).transpose()?);
    }

    let shared: Vec<usize> = (0..policy.code_packages.len()).filter(|i| pinned[*i].is_none()).collect();
    let total_shares: u64 = shared.iter().map(|i| u64::from(policy.code_packages[*i].cpu_shares)).sum();
    let share_of = |i: usize| -> f64 {
        if shared.is_empty() {
            0.0
        } else if total_shares == 0 {
            policy.cpu_cores / shared.len() as f64
        } else {
            policy.cpu_cores * f64::from(policy.code_packages[i].cpu_shares) / total_shares as f64
        }
    };

    let code_packages = policy
        .code_packages
        .iter()
        .zip(pinned)
        .enumerate()
        .map(|(i, (cp, cpuset))| CodePackageLimits {
            name: cp.name.clone(),
            cpu_cores: cpuset.as_ref().map_or_else(|| share_of(i), |cpus| cpus.len() as f64),
            cpuset,
            memory_in_mb: if cp.memory_in_mb > 0 { cp.memory_in_mb } else { policy.memory_in_mb },
            memory_swap_in_mb: cp.memory_swap_in_mb,
        })
        .collect();

    Ok(PackageLimits {
        cpu_cores: policy.cpu_cores,
        memory_in_mb: policy.memory_in_mb,
        memory_scope: if config.govern_only_main_memory_for_processes {
            MemoryScope::MainProcess
        } else {
            MemoryScope::ProcessTree
        },
        enforce: !config.local_resource_manager_test_mode,
        code_packages,
    })
}

/// Whether moving from `old` to `new` asks for more CPU or memory on every
/// node hosting the package.
pub fn governance_grows(old: Option<&ResourceGovernancePolicy>, new: Option<&ResourceGovernancePolicy>) -> bool {
    let (old_cpu, old_mem) = old.map_or((0.0, 0), |p| (p.cpu_cores, p.memory_in_mb));
    let (new_cpu, new_mem) = new.map_or((0.0, 0), |p| (p.cpu_cores, p.memory_in_mb));
    new_cpu > old_cpu || new_mem > old_mem
}

#[cfg(test)]
mod tests {
    use plb_core::CodePackageGovernance;

    use super::*;

    fn code_package(name: &str, shares: u32, cpuset: Option<&str>, memory: u64) -> CodePackageGovernance {
        CodePackageGovernance {
            name: name.into(),
            cpu_shares: shares,
            cpuset_cpus: cpuset.map(str::to_string),
            memory_in_mb: memory,
            memory_swap_in_mb: 0,
        }
    }

    #[test]
    fn cpuset_ranges() {
        assert_eq!(parse_cpuset("0-3,5").unwrap(), vec![0, 1, 2, 3, 5]);
        assert_eq!(parse_cpuset(" 4, 2-3 ,2").unwrap(), vec![2, 3, 4]);
        assert!(parse_cpuset("3-1").is_err());
        assert!(parse_cpuset("a").is_err());
        assert!(parse_cpuset("1,,2").is_err());
    }

    #[test]
    fn cpu_split_by_shares() {
        let policy = ResourceGovernancePolicy {
            cpu_cores: 3.0,
            memory_in_mb: 1024,
            code_packages: vec![code_package("main", 2, None, 0), code_package("side", 1, None, 256)],
        };
        let limits = package_limits(&policy, &PlbConfig::default()).unwrap();
        assert_eq!(limits.code_packages[0].cpu_cores, 2.0);
        assert_eq!(limits.code_packages[1].cpu_cores, 1.0);
        assert_eq!(limits.code_packages[0].memory_in_mb, 1024);
        assert_eq!(limits.code_packages[1].memory_in_mb, 256);
        assert_eq!(limits.memory_scope, MemoryScope::ProcessTree);
        assert!(limits.enforce);
    }

    #[test]
    fn equal_split_and_cpuset_override() {
        let policy = ResourceGovernancePolicy {
            cpu_cores: 2.0,
            memory_in_mb: 0,
            code_packages: vec![
                code_package("a", 0, None, 0),
                code_package("b", 0, None, 0),
                code_package("pinned", 0, Some("0-1"), 0),
            ],
        };
        let mut config = PlbConfig::default();
        config.govern_only_main_memory_for_processes = true;
        config.local_resource_manager_test_mode = true;
        let limits = package_limits(&policy, &config).unwrap();
        assert_eq!(limits.code_packages[0].cpu_cores, 1.0);
        assert_eq!(limits.code_packages[1].cpu_cores, 1.0);
        assert_eq!(limits.code_packages[2].cpu_cores, 2.0);
        assert_eq!(limits.code_packages[2].cpuset.as_deref(), Some(&[0, 1][..]));
        assert_eq!(limits.memory_scope, MemoryScope::MainProcess);
        assert!(!limits.enforce);
    }

    #[test]
    fn growth_detection() {
        let small = ResourceGovernancePolicy {
            cpu_cores: 1.0,
            memory_in_mb: 512,
            code_packages: vec![],
        };
        let more_memory = ResourceGovernancePolicy {
            memory_in_mb: 1024,
            ..small.clone()
        };
        assert!(governance_grows(Some(&small), Some(&more_memory)));
        assert!(!governance_grows(Some(&more_memory), Some(&small)));
        assert!(governance_grows(None, Some(&small)));
        assert!(!governance_grows(Some(&small), None));
    }
}
