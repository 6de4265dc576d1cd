//! Helpers for testing coalescers.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test, e.g. `let dir = test::tempdir()`.
//!
//!  - Wrap the function under test around a [`CallCounter`] to observe how often it actually ran.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::ser::{Serialize, SerializeStruct, Serializer};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `coalescer` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("coalescer=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Counts the invocations of a wrapped function, and remembers what it was called with.
///
/// Clones share their counts.
#[derive(Clone, Debug, Default)]
pub struct CallCounter {
    calls: Arc<AtomicUsize>,
    history: Arc<Mutex<Vec<String>>>,
}

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a call and returns how many calls happened before it.
    pub fn hit(&self, args: impl std::fmt::Debug) -> usize {
        self.history.lock().unwrap().push(format!("{args:?}"));
        self.calls.fetch_add(1, Ordering::SeqCst)
    }

    /// The number of recorded calls.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The `Debug` output of the arguments of all calls, in call order.
    pub fn history(&self) -> Vec<String> {
        self.history.lock().unwrap().clone()
    }
}

/// A value that contains a reference to itself.
///
/// Serializing it never terminates on its own, which makes it useful for checking that key
/// derivation bails out of cyclic arguments.
#[derive(Debug)]
pub struct SelfRef {
    name: String,
    me: Weak<SelfRef>,
}

impl SelfRef {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            name: name.to_owned(),
            me: me.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Serialize for SelfRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("SelfRef", 2)?;
        state.serialize_field("name", &self.name)?;
        state.serialize_field("self", &self.me.upgrade())?;
        state.end()
    }
}
