//! The variable-shape list containers: packed bools, fixed-width numbers,
//! byte/string arenas and lazily decoded struct lists.
//!
//! Containers are cheap-clone handles. Each one carries a weak back
//! reference to the struct that owns it; every mutation reports its size
//! delta there so the change propagates up the parent chain.

pub mod bools;
pub mod bytes;
pub mod numbers;
pub mod structs;

pub use bools::Bools;
pub use bytes::{BytesList, Strings};
pub use numbers::Numbers;
pub use structs::Structs;

use std::cell::RefCell;
use std::rc::Weak;

use crate::errors::ClawError;
use crate::structs::StructInner;

/// Weak back reference from a container to the struct slot holding it.
#[derive(Clone)]
pub(crate) struct ListOwner {
    pub(crate) owner: Weak<RefCell<StructInner>>,
}

impl ListOwner {
    /// Verifies a pending growth fits the 40-bit size field at every level
    /// of the parent chain. Nothing is mutated on failure.
    pub(crate) fn check_grow(&self, delta: u64) -> Result<(), ClawError> {
        match self.owner.upgrade() {
            Some(cell) => cell.borrow().check_grow(delta),
            None => Ok(()),
        }
    }

    /// Applies a size delta to the owning struct and marks it modified.
    pub(crate) fn touch(&self, delta: i64) {
        if let Some(cell) = self.owner.upgrade() {
            cell.borrow_mut().touch(delta);
        }
    }
}
