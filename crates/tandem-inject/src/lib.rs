//! Deterministic single-event-upset injection.
//!
//! A single-event upset (SEU) is a transient bit flip in memory or CPU
//! state. This crate produces them on purpose, deterministically, so a
//! double-execution core can be soak-tested: the same seed always yields
//! the same flips at the same element boundaries.
//!
//! - [`faults`] — the catalog of injectable upsets
//! - [`schedule`] — pin specific upsets to specific element numbers
//! - [`injector`] — the seeded engine the execution loop polls
//!
//! # Example
//!
//! ```
//! use tandem_inject::faults::Seu;
//! use tandem_inject::injector::{InjectorConfig, SeuInjector};
//! use tandem_inject::schedule::SeuScheduleBuilder;
//!
//! let schedule = SeuScheduleBuilder::new()
//!     .at_pe(3, Seu::ShadowBit { entry: 0, run: 0, byte: 7, bit: 2 })
//!     .build();
//! let mut injector = SeuInjector::new(InjectorConfig {
//!     seed: 42,
//!     schedule: Some(schedule),
//!     ..Default::default()
//! });
//!
//! assert!(injector.poll(2).is_empty());
//! assert_eq!(injector.poll(3).len(), 1);
//! assert_eq!(injector.injected(), 1);
//! ```

pub mod faults;
pub mod injector;
pub mod schedule;

pub use faults::Seu;
pub use injector::{InjectorConfig, SeuInjector};
pub use schedule::{SeuSchedule, SeuScheduleBuilder};
