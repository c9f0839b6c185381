// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Property-based tests for demand paging
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - Fault handler backs exactly the touched pages (Lazy) or a clamped forward window (Locality)
//!   - Growth/shrink sequences never leak or double-release frames
//!
//! TEST_SCENARIOS:
//!   - lazy_faults_back_exactly_touched_pages(): resident set equals the set of touched pages
//!   - locality_window_is_clamped(): one fault installs min(3, pages left below size)
//!   - grow_shrink_sequences_conserve_frames(): free + resident + tables == capacity at every step

use super::address_space::AddressSpace;
use super::fault::{handle_fault, LazyPolicy, LocalityPolicy};
use super::frame::FramePool;
use super::PAGE_SIZE;
use alloc::collections::BTreeSet;
use proptest::prelude::*;

proptest! {
    #[test]
    fn lazy_faults_back_exactly_touched_pages(
        pages in 1usize..24,
        touches in proptest::collection::vec(0usize..4096 * 24, 0..32),
    ) {
        let pool = FramePool::new(64);
        let mut space = AddressSpace::new(&pool).expect("space");
        space.grow(&pool, (pages * PAGE_SIZE) as isize).expect("grow");
        let mut touched = BTreeSet::new();
        for va in touches {
            let result = handle_fault(&mut space, &pool, &LazyPolicy, va);
            if va < pages * PAGE_SIZE {
                let first = touched.insert(va / PAGE_SIZE);
                prop_assert_eq!(result, Ok(usize::from(first)));
            } else {
                prop_assert!(result.is_err());
            }
        }
        prop_assert_eq!(space.resident_pages(&pool), touched.len());
    }

    #[test]
    fn locality_window_is_clamped(pages in 1usize..16, fault_page in 0usize..16) {
        prop_assume!(fault_page < pages);
        let pool = FramePool::new(32);
        let mut space = AddressSpace::new(&pool).expect("space");
        space.grow(&pool, (pages * PAGE_SIZE) as isize).expect("grow");
        let installed = handle_fault(&mut space, &pool, &LocalityPolicy::default(), fault_page * PAGE_SIZE)
            .expect("fault");
        prop_assert_eq!(installed, core::cmp::min(3, pages - fault_page));
        prop_assert_eq!(space.resident_pages(&pool), installed);
    }

    #[test]
    fn grow_shrink_sequences_conserve_frames(
        ops in proptest::collection::vec((-6isize..=6, 0usize..8), 1..24),
    ) {
        let pool = FramePool::new(64);
        let mut space = AddressSpace::new(&pool).expect("space");
        for (delta_pages, touch) in ops {
            let _ = space.grow(&pool, delta_pages * PAGE_SIZE as isize);
            let _ = handle_fault(&mut space, &pool, &LocalityPolicy::default(), touch * PAGE_SIZE);
            let accounted = pool.free_frames()
                + space.resident_pages(&pool)
                + space.page_table().table_frames();
            prop_assert_eq!(accounted, pool.capacity());
        }
        space.destroy(&pool);
        prop_assert_eq!(pool.free_frames(), pool.capacity());
    }
}
