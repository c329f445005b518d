//! Typed indices for TGC's arena-addressed data structures.
//!
//! Every arena in the compiler (graph nodes, values, interned layouts)
//! is addressed by a stable integer handle rather than a reference, so
//! that in-place graph mutation can never dangle. This crate provides
//! the [`Idx`] trait shared by all handle types, the [`define_index!`]
//! macro that stamps them out, and [`IndexVec`], a `Vec` indexed by a
//! typed handle.

#![warn(missing_docs)]

use std::fmt;
use std::marker::PhantomData;

/// A type that can be used as a dense arena index.
pub trait Idx: Copy + Eq + 'static {
    /// Create an index from a raw `usize`.
    fn new(idx: usize) -> Self;

    /// Get the raw `usize` value of this index.
    fn index(self) -> usize;
}

/// Define one or more `u32`-backed index newtypes implementing [`Idx`].
///
/// ```
/// use tgc_index::{define_index, Idx};
///
/// define_index! {
///     /// Index into the widget arena.
///     pub struct WidgetId;
/// }
///
/// let w = WidgetId::new(3);
/// assert_eq!(w.index(), 3);
/// ```
#[macro_export]
macro_rules! define_index {
    ($($(#[$attr:meta])* $vis:vis struct $name:ident;)+) => {
        $(
            $(#[$attr])*
            #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash,
                     serde::Serialize, serde::Deserialize)]
            #[repr(transparent)]
            $vis struct $name(pub u32);

            impl $crate::Idx for $name {
                #[inline]
                fn new(idx: usize) -> Self {
                    assert!(idx <= u32::MAX as usize);
                    Self(idx as u32)
                }

                #[inline]
                fn index(self) -> usize {
                    self.0 as usize
                }
            }

            impl ::std::fmt::Display for $name {
                fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )+
    };
}

/// A vector addressed by a typed index.
///
/// Pushing returns the handle of the new element; the handle stays
/// valid for the life of the vector regardless of later pushes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexVec<I: Idx, T> {
    raw: Vec<T>,
    _marker: PhantomData<fn(I)>,
}

impl<I: Idx, T> IndexVec<I, T> {
    /// Create an empty `IndexVec`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            raw: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Create an `IndexVec` with the given capacity.
    #[must_use]
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            raw: Vec::with_capacity(cap),
            _marker: PhantomData,
        }
    }

    /// Push an element, returning its handle.
    pub fn push(&mut self, value: T) -> I {
        let idx = I::new(self.raw.len());
        self.raw.push(value);
        idx
    }

    /// The number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Whether the vector is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// The handle that the next push will return.
    #[must_use]
    pub fn next_index(&self) -> I {
        I::new(self.raw.len())
    }

    /// Get an element by handle, if in bounds.
    #[must_use]
    pub fn get(&self, index: I) -> Option<&T> {
        self.raw.get(index.index())
    }

    /// Iterate over `(handle, element)` pairs.
    pub fn iter_enumerated(&self) -> impl Iterator<Item = (I, &T)> {
        self.raw.iter().enumerate().map(|(i, t)| (I::new(i), t))
    }

    /// Iterate over elements in index order.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.raw.iter()
    }
}

impl<I: Idx, T> Default for IndexVec<I, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Idx, T> std::ops::Index<I> for IndexVec<I, T> {
    type Output = T;

    fn index(&self, index: I) -> &T {
        &self.raw[index.index()]
    }
}

impl<I: Idx, T> std::ops::IndexMut<I> for IndexVec<I, T> {
    fn index_mut(&mut self, index: I) -> &mut T {
        &mut self.raw[index.index()]
    }
}

impl<I: Idx, T: fmt::Display> fmt::Display for IndexVec<I, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, t) in self.raw.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{t}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    define_index! {
        /// Test index.
        pub struct TestId;
    }

    #[test]
    fn test_define_index_roundtrip() {
        let id = TestId::new(7);
        assert_eq!(id.index(), 7);
        assert_eq!(id.to_string(), "7");
    }

    #[test]
    fn test_index_vec_push_and_lookup() {
        let mut v: IndexVec<TestId, &str> = IndexVec::new();
        let a = v.push("a");
        let b = v.push("b");

        assert_eq!(v[a], "a");
        assert_eq!(v[b], "b");
        assert_eq!(v.len(), 2);
        assert_eq!(v.next_index(), TestId::new(2));
    }

    #[test]
    fn test_index_vec_enumerated() {
        let mut v: IndexVec<TestId, u32> = IndexVec::new();
        v.push(10);
        v.push(20);

        let pairs: Vec<_> = v.iter_enumerated().collect();
        assert_eq!(pairs, vec![(TestId::new(0), &10), (TestId::new(1), &20)]);
    }
}
