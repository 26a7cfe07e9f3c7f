//! Shelf Reactive
//!
//! This crate provides the reactive runtime behind the Shelf game catalog.
//! It implements:
//!
//! - Reactive primitives (signals, computeds, effects)
//! - Automatic dependency tracking with dynamic re-tracking
//! - A level-ordered, glitch-free update scheduler
//! - Batching, untracked reads and a keyed reactive store
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: The runtime and the signal, computed and effect handles
//! - `graph`: Node arena, edge bookkeeping and the flush scheduler
//! - `config`: Runtime settings and flush modes
//! - `executor`: Task queues used by deferred flushing
//! - `error`: The error type shared by every fallible operation
//!
//! # Example
//!
//! ```rust
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! use shelf_reactive::Runtime;
//!
//! let rt = Runtime::new();
//! let count = rt.signal(0);
//!
//! // Create a derived value
//! let doubled = {
//!     let count = count.clone();
//!     rt.computed(move || count.get() * 2)
//! };
//!
//! // Create an effect
//! let log = Rc::new(RefCell::new(Vec::new()));
//! let _effect = {
//!     let (doubled, log) = (doubled.clone(), log.clone());
//!     rt.effect(move || log.borrow_mut().push(doubled.get()))
//! };
//!
//! // Update the signal and flush
//! count.set(5);
//! rt.flush().unwrap();
//! assert_eq!(*log.borrow(), vec![0, 10]);
//! ```

pub mod config;
pub mod error;
pub mod executor;
pub mod graph;
pub mod reactive;

pub use config::{FlushMode, RuntimeConfig};
pub use error::{FailurePhase, NodeFailure, ReactiveError, Result};
pub use executor::{Executor, MicrotaskQueue};
#[cfg(feature = "tokio")]
pub use executor::TokioLocalExecutor;
pub use graph::{FlushStats, NodeId, NodeType};
pub use reactive::{
    Cleanup, Computed, ComputedOptions, Effect, IntoCleanup, NodeInfo, Runtime, RuntimeBuilder,
    Signal, SignalOptions, Store, Subscription,
};
