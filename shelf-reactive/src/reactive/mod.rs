//! Reactive Primitives
//!
//! This module implements the core reactive system: signals, computeds and
//! effects, plus the runtime that owns them.
//!
//! # Concepts
//!
//! ## Signals
//!
//! A Signal is a container for mutable state. When a signal's value is read
//! inside a computed or effect, the signal registers that computation as an
//! observer. When the signal's value changes, every observer is marked dirty.
//!
//! ## Computeds
//!
//! A Computed is a derived value that caches its result. It is evaluated on
//! first read and re-evaluated only after one of its sources changed.
//!
//! ## Effects
//!
//! An Effect is a side-effecting computation that runs whenever its
//! dependencies change. Effects run during a flush, after every computed
//! they could observe has settled, so they never see a half-updated graph.
//!
//! # Implementation Notes
//!
//! Dependency tracking is automatic: each runtime keeps a stack of the
//! computations currently evaluating, and every read links the value to the
//! computation on top of it. [`Runtime::untrack`] hides the stack for the
//! duration of a closure.

mod computed;
mod context;
mod effect;
mod runtime;
mod signal;
mod store;
mod subscriber;

pub use computed::{Computed, ComputedOptions};
pub use effect::{Cleanup, Effect, IntoCleanup};
pub use runtime::{NodeInfo, Runtime, RuntimeBuilder};
pub use signal::{Signal, SignalOptions};
pub use store::Store;
pub use subscriber::{SubscriberId, Subscription};
