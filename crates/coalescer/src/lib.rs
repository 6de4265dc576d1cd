//! Coalesces concurrent calls to the same function and briefly reuses their results.
//!
//! A [`Coalescer`] wraps an async or synchronous function. Calls whose arguments map to the same
//! key share a single execution while it is in flight, and a successful result is served from
//! memory for a short while afterwards.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use coalescer::CoalescerBuilder;
//!
//! # async fn fetch_user(id: String) -> Result<String, String> { Ok(id) }
//! # async fn run() {
//! let users = CoalescerBuilder::new()
//!     .name("users")
//!     .cache_duration(Duration::from_secs(1))
//!     .build(|(id,): (String,)| fetch_user(id));
//!
//! let (a, b) = tokio::join!(users.call(("42".into(),)), users.call(("42".into(),)));
//! assert_eq!(a, b);
//! # }
//! ```

#[macro_use]
pub mod metrics;

mod coalescer;
pub mod config;
pub mod error;
pub mod key;
pub mod logging;


pub use crate::coalescer::{CallFuture, Coalescer, CoalescerBuilder};
pub use crate::config::{CoalescerConfig, Config};
pub use crate::error::CoalesceError;
pub use crate::key::KeyError;
