//! Assertion verification
//!
//! An [`AssertionSpec`] lists rules about what an agent should and should not
//! have done; [`evaluate`] checks them against a finished [`CallHistory`].
//!
//! # Example
//!
//! ```rust
//! use mcpcheck_core::assertions::{evaluate, AssertionSpec, Matcher, Verdict};
//! use mcpcheck_core::history::{CallKind, Recorder};
//!
//! let spec = AssertionSpec::new()
//!     .tool_used(Matcher::pattern("kubernetes", "pods_.*"))
//!     .tool_not_used(Matcher::exact("kubernetes", "pods_delete"))
//!     .max_tool_calls(5)
//!     .then(CallKind::Tool, "kubernetes", "pods_list")
//!     .no_duplicate_calls();
//!
//! let history = Recorder::new().snapshot();
//! let verdict = Verdict::from(evaluate(&history, &spec));
//! assert!(!verdict.passed);
//! ```
//!
//! [`CallHistory`]: crate::history::CallHistory

mod engine;
mod model;
mod result;

pub use engine::evaluate;
pub use model::{AssertionSpec, Matcher, NameMatcher, OrderItem};
pub use result::{AssertionResult, CompositeAssertionResult, Verdict};
