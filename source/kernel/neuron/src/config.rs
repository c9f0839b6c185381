// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Build-time fault-policy selection and the runtime configuration derived from it.

use crate::mm::fault::{LazyPolicy, LocalityPolicy, Policy, LOCALITY_WINDOW};

#[cfg(all(feature = "lazy-alloc", feature = "locality-alloc"))]
compile_error!("features `lazy-alloc` and `locality-alloc` are mutually exclusive");

#[cfg(not(any(feature = "lazy-alloc", feature = "locality-alloc")))]
compile_error!("enable exactly one of the `lazy-alloc` or `locality-alloc` features");

/// Page-fault allocation strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyKind {
    /// Back only the faulting page.
    Lazy,
    /// Back the faulting page and prefetch forward neighbours.
    Locality,
}

/// Policy chosen by the enabled cargo feature.
#[cfg(feature = "lazy-alloc")]
pub const BUILD_POLICY: PolicyKind = PolicyKind::Lazy;
/// Policy chosen by the enabled cargo feature.
#[cfg(all(feature = "locality-alloc", not(feature = "lazy-alloc")))]
pub const BUILD_POLICY: PolicyKind = PolicyKind::Locality;

/// Virtual-memory configuration fixed at kernel start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmConfig {
    /// Fault allocation strategy.
    pub policy: PolicyKind,
    /// Pages materialized per fault under [`PolicyKind::Locality`].
    pub locality_window: usize,
}

impl VmConfig {
    /// Configuration selected at build time.
    pub const fn from_build() -> Self {
        Self::with_policy(BUILD_POLICY)
    }

    /// Configuration with an explicit policy and the default locality window.
    pub const fn with_policy(policy: PolicyKind) -> Self {
        Self { policy, locality_window: LOCALITY_WINDOW }
    }

    /// Instantiates the fault policy described by this configuration.
    pub fn fault_policy(&self) -> Policy {
        match self.policy {
            PolicyKind::Lazy => Policy::Lazy(LazyPolicy),
            PolicyKind::Locality => Policy::Locality(LocalityPolicy::new(self.locality_window)),
        }
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::from_build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_follows_build_feature() {
        assert_eq!(VmConfig::default().policy, BUILD_POLICY);
        assert_eq!(VmConfig::default().locality_window, LOCALITY_WINDOW);
    }

    #[test]
    fn explicit_policy_builds_matching_strategy() {
        let locality = VmConfig::with_policy(PolicyKind::Locality).fault_policy();
        assert_eq!(locality, Policy::Locality(LocalityPolicy::new(3)));
        assert_eq!(VmConfig::with_policy(PolicyKind::Lazy).fault_policy(), Policy::Lazy(LazyPolicy));
    }
}
