/// Determines whether a [`SliceStack`][crate::SliceStack] is responsible for the memory
/// behind its slices.
///
/// The policy is chosen when the stack is created and never changes.
///
/// # Examples
///
/// ```
/// use volume_store::{OwnershipPolicy, SliceStack};
///
/// let stack = SliceStack::<u8>::new(8, 8, 4, OwnershipPolicy::OwnsSlices, None).unwrap();
/// assert_eq!(stack.policy(), OwnershipPolicy::OwnsSlices);
///
/// let stack = SliceStack::<u8>::new(8, 8, 4, OwnershipPolicy::BorrowsSlices, None).unwrap();
/// assert_eq!(stack.policy(), OwnershipPolicy::BorrowsSlices);
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum OwnershipPolicy {
    /// The stack creates its slices and releases their memory (freeing it or returning it to
    /// the pool) when the stack is dropped or a slice is replaced. This is the default.
    #[default]
    OwnsSlices,

    /// The stack only references slices bound to it by the caller and never releases their
    /// memory. The borrow checker keeps the bound slices alive for as long as the stack.
    BorrowsSlices,
}
