use futures::future::BoxFuture;
use thiserror::Error;

use crate::config::Device;
use crate::messages::Outcome;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("could not publish to {topic}: {source}")]
    Publish {
        topic: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Forwards a device's outcome to the message bus. Must be callable from
/// several device tasks at once.
pub trait Notifier: Send + Sync {
    fn notify<'a>(&'a self, device: &'a Device, outcome: Outcome) -> BoxFuture<'a, Result<(), NotifyError>>;
}
