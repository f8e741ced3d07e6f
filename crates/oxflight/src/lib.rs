//! Single-flight call coalescing.
//!
//! A [`Coalescer`] makes sure that concurrent requests for the same key
//! run the underlying work at most once, with every caller observing the
//! same result. It collapses thundering-herd duplicate work such as many
//! threads reloading the same cache entry at once.
//!
//! # Lifecycle of a key
//!
//! ```text
//!   ABSENT ──execute()──▶ IN_FLIGHT ──owner finishes──▶ ABSENT
//!                            │  ▲
//!                 joiners ───┘  └─── wait for the owner's outcome
//! ```
//!
//! The owner unregisters the key before waking its joiners, so results are
//! never cached beyond the flight that produced them.
//!
//! # Features
//!
//! - `async` (default): [`AsyncCoalescer`] for futures, using tokio's
//!   broadcast channel for fan-out.

pub mod config;
pub mod error;
pub mod outcome;
pub mod stats;

mod call;
mod coalescer;

#[cfg(feature = "async")]
mod async_coalescer;

pub use coalescer::Coalescer;
pub use config::CoalescerConfig;
pub use error::WaitError;
pub use outcome::{Execution, Panicked, Role};
pub use stats::{CoalescerStats, CoalescerStatsSnapshot};

#[cfg(feature = "async")]
pub use async_coalescer::AsyncCoalescer;
