//! Property tests for the accounting primitives.

use std::collections::BTreeSet;

use proptest::prelude::*;

use cinder::accounting::bitmap::SpaceBitmap;
use cinder::accounting::card_table::{age_card, CARD_AGED, CARD_CLEAN, CARD_DIRTY};
use cinder::accounting::ObjectStack;
use cinder::object::{Address, ObjectRef};

const HEAP_BEGIN: usize = 0x1000_0000;
const HEAP_CAPACITY: usize = 1 << 20;

fn obj(offset: usize) -> ObjectRef {
    ObjectRef::from_address(Address::from_usize(HEAP_BEGIN + offset)).unwrap()
}

proptest! {
    #[test]
    fn bitmap_walk_reports_exactly_the_set_bits(
        offsets in proptest::collection::btree_set(0usize..(HEAP_CAPACITY / 8), 0..200)
    ) {
        let bitmap = SpaceBitmap::new("prop", Address::from_usize(HEAP_BEGIN), HEAP_CAPACITY);
        let expected: BTreeSet<usize> = offsets.iter().map(|slot| slot * 8).collect();
        for &offset in &expected {
            bitmap.set(obj(offset));
        }

        let mut walked = Vec::new();
        bitmap.walk(&mut |o| walked.push(o.to_address().as_usize() - HEAP_BEGIN));

        // Ascending and exact.
        let sorted: Vec<usize> = expected.iter().copied().collect();
        prop_assert_eq!(walked, sorted);
        prop_assert_eq!(bitmap.count(), expected.len());
    }

    #[test]
    fn bitmap_clear_range_is_exact(
        offsets in proptest::collection::btree_set(0usize..(HEAP_CAPACITY / 8), 1..100),
        range_start in 0usize..(HEAP_CAPACITY / 8),
        range_len in 1usize..2000,
    ) {
        let bitmap = SpaceBitmap::new("prop", Address::from_usize(HEAP_BEGIN), HEAP_CAPACITY);
        for &slot in &offsets {
            bitmap.set(obj(slot * 8));
        }
        let clear_begin = range_start * 8;
        let clear_end = ((range_start + range_len) * 8).min(HEAP_CAPACITY);
        bitmap.clear_range(
            Address::from_usize(HEAP_BEGIN + clear_begin),
            Address::from_usize(HEAP_BEGIN + clear_end),
        );
        for &slot in &offsets {
            let offset = slot * 8;
            let inside = offset >= clear_begin && offset < clear_end;
            prop_assert_eq!(bitmap.test(obj(offset)), !inside);
        }
    }

    #[test]
    fn card_aging_is_monotone(card in proptest::sample::select(vec![
        CARD_CLEAN, CARD_AGED, CARD_DIRTY, 0x33u8,
    ])) {
        // DIRTY decays to AGED, everything else decays to CLEAN, and CLEAN
        // is a fixed point.
        let once = age_card(card);
        let twice = age_card(once);
        if card == CARD_DIRTY {
            prop_assert_eq!(once, CARD_AGED);
        } else {
            prop_assert_eq!(once, CARD_CLEAN);
        }
        prop_assert_eq!(twice, CARD_CLEAN);
        prop_assert_eq!(age_card(CARD_CLEAN), CARD_CLEAN);
    }

    #[test]
    fn object_stack_round_trips(
        offsets in proptest::collection::vec(0usize..(HEAP_CAPACITY / 8), 0..128)
    ) {
        let stack = ObjectStack::new("prop", 256);
        for &slot in &offsets {
            prop_assert!(stack.push_back(obj(slot * 8)));
        }
        prop_assert_eq!(stack.len(), offsets.len());

        stack.sort();
        for &slot in &offsets {
            prop_assert!(stack.contains_sorted(obj(slot * 8)));
        }

        let drained = stack.drain();
        prop_assert_eq!(drained.len(), offsets.len());
        prop_assert!(stack.is_empty());
    }
}
