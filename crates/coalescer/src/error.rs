use std::any::Any;

use thiserror::Error;

/// The error returned by a coalesced call.
///
/// Every caller waiting on the same execution receives a clone of the same error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoalesceError<E> {
    /// The wrapped function returned an error.
    #[error("call failed: {0}")]
    Failed(E),
    /// The wrapped function panicked, either while being invoked or while its future was polled.
    ///
    /// The attached string contains the panic message, if it had one.
    #[error("call panicked: {0}")]
    Panicked(String),
    /// The execution was dropped before it settled, for example because the runtime shut down.
    #[error("call was abandoned before completion")]
    Abandoned,
}

impl<E> CoalesceError<E> {
    /// Returns the error of the wrapped function, if that is what failed.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Box<dyn Any>".to_owned()
    }
}
