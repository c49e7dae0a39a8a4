//! Mod-union tables: remembered sets between spaces of differing collection
//! cadence.
//!
//! A table is attached to a space that is collected less often than its
//! neighbors (the image space, the zygote space, or the mature space in the
//! generational semi-space configuration). `clear_cards` snapshots and
//! clears the covered cards before each collection; the recorded cards
//! accumulate, so the table always over-approximates every reference the
//! space has ever written out of itself. `update_and_mark_references`
//! replays the recorded cards, letting the active collector mark referents
//! and rewrite slots whose targets were moved.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashSet;
use parking_lot::Mutex;

use crate::object::{load_ref_slot, Address, ObjectModel, ObjectRef};
use crate::space::ContinuousSpace;

use super::card_table::{CardTable, CARD_CLEAN, CARD_DIRTY, CARD_SIZE};

pub trait ModUnionTable: Send + Sync {
    fn name(&self) -> &str;

    /// Snapshot and clear the cards covering the owning space, folding the
    /// dirty ones into the table.
    fn clear_cards(&self);

    /// Visit every recorded reference slot so the collector can mark the
    /// referent and update the slot if the referent moved.
    fn update_and_mark_references(&self, visitor: &mut dyn FnMut(Address));

    /// Check that every recorded outgoing reference points at a live object.
    /// Returns the number of violations found (and logs each).
    fn verify(&self, is_live: &dyn Fn(ObjectRef) -> bool) -> usize;

    fn dump(&self) -> String;
}

/// Card-grained variant: remembers which cards of the owning space were ever
/// dirtied and re-scans the objects on them each collection.
pub struct ModUnionTableCardCache {
    name: String,
    card_table: Arc<CardTable>,
    model: Arc<dyn ObjectModel>,
    space: Arc<dyn ContinuousSpace>,
    cleared_cards: DashSet<usize>,
}

impl ModUnionTableCardCache {
    pub fn new(
        name: &str,
        card_table: Arc<CardTable>,
        model: Arc<dyn ObjectModel>,
        space: Arc<dyn ContinuousSpace>,
    ) -> ModUnionTableCardCache {
        ModUnionTableCardCache {
            name: name.to_string(),
            card_table,
            model,
            space,
            cleared_cards: DashSet::new(),
        }
    }

    fn visit_recorded_objects(&self, visitor: &mut dyn FnMut(ObjectRef)) {
        let live_bitmap = self.space.live_bitmap();
        let mut cards: Vec<usize> = self.cleared_cards.iter().map(|e| *e).collect();
        cards.sort_unstable();
        for card_begin in cards {
            let begin = Address::from_usize(card_begin);
            live_bitmap.visit_marked_range(begin, begin + CARD_SIZE, visitor);
        }
    }
}

impl ModUnionTable for ModUnionTableCardCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn clear_cards(&self) {
        self.card_table.modify_cards_atomic(
            self.space.begin(),
            self.space.end(),
            &|_| CARD_CLEAN,
            &mut |card_begin, old| {
                if old == CARD_DIRTY {
                    self.cleared_cards.insert(card_begin.as_usize());
                }
            },
        );
    }

    fn update_and_mark_references(&self, visitor: &mut dyn FnMut(Address)) {
        let model = Arc::clone(&self.model);
        self.visit_recorded_objects(&mut |obj| {
            model.visit_reference_slots(obj, &mut |slot| visitor(slot));
        });
    }

    fn verify(&self, is_live: &dyn Fn(ObjectRef) -> bool) -> usize {
        let model = Arc::clone(&self.model);
        let mut failures = 0;
        self.visit_recorded_objects(&mut |obj| {
            model.visit_reference_slots(obj, &mut |slot| {
                // SAFETY: slots come from the model for live objects.
                if let Some(target) = unsafe { load_ref_slot(slot) } {
                    if !is_live(target) {
                        tracing::error!(
                            table = %self.name,
                            referrer = ?obj,
                            slot = %slot,
                            target = ?target,
                            "mod-union card cache references dead object"
                        );
                        failures += 1;
                    }
                }
            });
        });
        failures
    }

    fn dump(&self) -> String {
        format!("{}: {} remembered cards", self.name, self.cleared_cards.len())
    }
}

/// Reference-grained variant used for the image and zygote spaces: remembers
/// the exact slot addresses on each dirtied card that point out of the
/// owning space.
pub struct ModUnionTableReferenceCache {
    name: String,
    card_table: Arc<CardTable>,
    model: Arc<dyn ObjectModel>,
    space: Arc<dyn ContinuousSpace>,
    /// Cards cleared this cycle, pending re-scan.
    cleared_cards: Mutex<Vec<usize>>,
    /// card begin -> recorded outgoing reference slots on that card.
    references: Mutex<HashMap<usize, Vec<usize>>>,
}

impl ModUnionTableReferenceCache {
    pub fn new(
        name: &str,
        card_table: Arc<CardTable>,
        model: Arc<dyn ObjectModel>,
        space: Arc<dyn ContinuousSpace>,
    ) -> ModUnionTableReferenceCache {
        ModUnionTableReferenceCache {
            name: name.to_string(),
            card_table,
            model,
            space,
            cleared_cards: Mutex::new(Vec::new()),
            references: Mutex::new(HashMap::new()),
        }
    }

    fn points_out_of_space(&self, slot: Address) -> bool {
        // SAFETY: slot addresses come from the model for live objects.
        match unsafe { load_ref_slot(slot) } {
            Some(target) => {
                let addr = target.to_address();
                addr < self.space.begin() || addr >= self.space.limit()
            }
            None => false,
        }
    }
}

impl ModUnionTable for ModUnionTableReferenceCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn clear_cards(&self) {
        let mut cleared = self.cleared_cards.lock();
        self.card_table.modify_cards_atomic(
            self.space.begin(),
            self.space.end(),
            &|_| CARD_CLEAN,
            &mut |card_begin, old| {
                if old == CARD_DIRTY {
                    cleared.push(card_begin.as_usize());
                }
            },
        );
    }

    fn update_and_mark_references(&self, visitor: &mut dyn FnMut(Address)) {
        let live_bitmap = self.space.live_bitmap();
        let mut references = self.references.lock();

        // Fold this cycle's cleared cards into the reference map.
        for card_begin in self.cleared_cards.lock().drain(..) {
            let begin = Address::from_usize(card_begin);
            let mut slots = Vec::new();
            live_bitmap.visit_marked_range(begin, begin + CARD_SIZE, &mut |obj| {
                self.model.visit_reference_slots(obj, &mut |slot| {
                    if self.points_out_of_space(slot) {
                        slots.push(slot.as_usize());
                    }
                });
            });
            references.insert(card_begin, slots);
        }

        for slots in references.values() {
            for &slot in slots {
                visitor(Address::from_usize(slot));
            }
        }
    }

    fn verify(&self, is_live: &dyn Fn(ObjectRef) -> bool) -> usize {
        let references = self.references.lock();
        let mut failures = 0;
        for (card, slots) in references.iter() {
            for &slot in slots {
                let slot = Address::from_usize(slot);
                // SAFETY: recorded slots belong to live image/zygote objects.
                if let Some(target) = unsafe { load_ref_slot(slot) } {
                    if !is_live(target) {
                        tracing::error!(
                            table = %self.name,
                            card = %Address::from_usize(*card),
                            slot = %slot,
                            target = ?target,
                            "mod-union reference cache references dead object"
                        );
                        failures += 1;
                    }
                }
            }
        }
        failures
    }

    fn dump(&self) -> String {
        let references = self.references.lock();
        let slots: usize = references.values().map(Vec::len).sum();
        format!(
            "{}: {} remembered cards, {} outgoing references",
            self.name,
            references.len(),
            slots
        )
    }
}
