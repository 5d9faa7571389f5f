use std::rc::Rc;

/// Remaining stack below which recursive passes switch to a fresh segment.
pub const RED_ZONE: usize = 64 * 1024;
/// Size of each freshly allocated stack segment.
pub const STACK_SEGMENT: usize = 16 * 1024 * 1024;

/// Run `f`, growing the stack first if it is close to running out.
///
/// Every pass over the IR is structurally recursive, so nesting depth in the
/// input turns directly into native stack depth.
#[inline]
pub fn ensure_stack<R>(f: impl FnOnce() -> R) -> R {
    stacker::maybe_grow(RED_ZONE, STACK_SEGMENT, f)
}

/// Stack reserved per IR node by [`with_stack_for`].
pub const STACK_PER_NODE: usize = 2 * 1024;

/// Run `f` on a stack sized for a tree of `nodes` nodes.
///
/// For code that recurses through third-party structures (pretty-printer
/// documents) where [`ensure_stack`] cannot be inserted.
pub fn with_stack_for<R>(nodes: usize, f: impl FnOnce() -> R) -> R {
    stacker::grow(STACK_SEGMENT.max(nodes.saturating_mul(STACK_PER_NODE)), f)
}

/// Compare two trees for equality.
pub trait TreeEq {
    fn tree_eq(&self, other: &Self) -> bool;
}

/// Fixedpoint function to find a fixed point of a function `f` applied to an initial value `start`.
/// It will iterate until either the maximum number of iterations is reached or the value stabilizes.
///
/// Stabilized value is the last value that did not change after applying `f`.
pub fn fixedpoint<T, E, F>(start: T, max: Option<usize>) -> impl FnOnce(F) -> Result<(T, usize), E>
where
    T: TreeEq,
    F: Fn(&T) -> Result<T, E>,
{
    move |f: F| {
        let max_iterations = max.unwrap_or(usize::MAX);

        let mut current = start;

        for iteration in 0..max_iterations {
            let next = f(&current)?;
            if next.tree_eq(&current) {
                return Ok((current, iteration + 1));
            }
            current = next;
        }

        Ok((current, max_iterations))
    }
}

impl<T: TreeEq> TreeEq for Rc<T> {
    fn tree_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(self, other) || self.as_ref().tree_eq(other.as_ref())
    }
}

impl<T: TreeEq> TreeEq for Vec<T> {
    fn tree_eq(&self, other: &Self) -> bool {
        if self.len() != other.len() {
            return false;
        }
        self.iter().zip(other.iter()).all(|(a, b)| a.tree_eq(b))
    }
}
