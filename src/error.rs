//! Fatal error kinds the allocator core can return (spec.md §7).
//!
//! None of these are recoverable within a single `alloc_frame` attempt: the
//! core does not retry, does not fall back to a different strategy, and does
//! not attempt partial progress. A caller that wants resilience (e.g. retry
//! with a spill-capable allocator) builds that on top; see spec.md §1's
//! Non-goals.

use failure_derive::Fail;

/// Result type returned by fallible allocator operations.
pub type AllocResult<T> = Result<T, AllocError>;

/// A fatal condition that aborts one `Allocator::alloc_frame` call.
#[derive(Debug, Fail)]
pub enum AllocError {
    /// The pq-test could not classify every node as trivially colorable and
    /// no further coalescing progress remains: the function needs a spill
    /// slot, which this allocator does not implement (spec.md §1, §4.4).
    #[fail(
        display = "register allocation requires a spill, which this allocator does not implement"
    )]
    UnimplementedSpill,

    /// `combine` or `common_class` was asked to reconcile two incomparable
    /// register classes. Indicates a bug in the (out-of-scope) instruction
    /// selector that produced the input instruction list, not a condition
    /// the core can work around.
    #[fail(display = "incomparable register classes `{}` and `{}`", a, b)]
    ClassMismatch {
        /// Debug name of the first class.
        a: String,
        /// Debug name of the second class.
        b: String,
    },

    /// Liveness could not be computed because an instruction names a
    /// control-flow successor outside the instruction list.
    #[fail(display = "malformed control-flow graph: {}", detail)]
    MalformedCFG {
        /// Description of the unresolved reference.
        detail: String,
    },
}
