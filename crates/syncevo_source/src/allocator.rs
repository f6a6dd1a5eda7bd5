//! Allocation of numeric LUIDs for new items.

use crate::error::{SourceError, SourceResult};
use crate::types::Luid;
use tracing::debug;

/// Hands out fresh numeric LUIDs.
///
/// The counter is seeded from the highest numeric LUID known when the source
/// is opened and only ever moves forward, so IDs returned by one allocator
/// are pairwise distinct.
///
/// Uniqueness against items created behind the allocator's back (another
/// process writing into the same store) is the caller's responsibility: it
/// must check at commit time and ask for another ID if the one it got is
/// already taken, see [`ItemIdAllocator::allocate_with`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemIdAllocator {
    next: Option<u64>,
}

impl ItemIdAllocator {
    /// Creates an allocator whose first ID is `first`.
    #[must_use]
    pub const fn starting_at(first: u64) -> Self {
        Self { next: Some(first) }
    }

    /// Creates an allocator that starts above every numeric LUID in `luids`.
    ///
    /// Non-numeric LUIDs are ignored. Without numeric LUIDs the first ID is 1.
    pub fn seeded<'a, I>(luids: I) -> Self
    where
        I: IntoIterator<Item = &'a Luid>,
    {
        let mut allocator = Self::starting_at(1);
        for luid in luids {
            allocator.observe(luid);
        }
        allocator
    }

    /// Moves the counter past `luid` if it is numeric and not below it.
    pub fn observe(&mut self, luid: &Luid) {
        let Some(value) = luid.as_number() else {
            return;
        };
        if let Some(next) = self.next {
            if value >= next {
                self.next = value.checked_add(1);
            }
        }
    }

    /// Returns the ID the next call to [`ItemIdAllocator::allocate`] yields.
    #[must_use]
    pub fn peek(&self) -> Option<u64> {
        self.next
    }

    /// Returns a new LUID.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::IdSpaceExhausted`] once `u64::MAX` was handed
    /// out.
    pub fn allocate(&mut self) -> SourceResult<Luid> {
        let value = self.next.ok_or(SourceError::IdSpaceExhausted)?;
        self.next = value.checked_add(1);
        Ok(Luid::new(value.to_string()))
    }

    /// Returns a new LUID for which `exists` reports false.
    ///
    /// IDs that turn out to be taken are skipped; the loop ends when a free
    /// one is found or the ID space is exhausted.
    ///
    /// # Errors
    ///
    /// Propagates errors from `exists` and returns
    /// [`SourceError::IdSpaceExhausted`] when no ID is left.
    pub fn allocate_with<F>(&mut self, mut exists: F) -> SourceResult<Luid>
    where
        F: FnMut(&Luid) -> SourceResult<bool>,
    {
        loop {
            let luid = self.allocate()?;
            if !exists(&luid)? {
                return Ok(luid);
            }
            debug!(%luid, "item ID already taken, trying next");
        }
    }
}

impl Default for ItemIdAllocator {
    fn default() -> Self {
        Self::starting_at(1)
    }
}
