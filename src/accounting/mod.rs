//! Heap accounting structures: bitmaps, object sets, the card table, object
//! stacks, and mod-union remembered sets.

pub mod atomic_stack;
pub mod bitmap;
pub mod card_table;
pub mod mod_union;

pub use atomic_stack::ObjectStack;
pub use bitmap::{LargeObjectSet, SpaceBitmap};
pub use card_table::{CardTable, CARD_AGED, CARD_CLEAN, CARD_DIRTY, CARD_SHIFT, CARD_SIZE};
pub use mod_union::{ModUnionTable, ModUnionTableCardCache, ModUnionTableReferenceCache};
