//! Request coordination between the primary and its workers.
//!
//! Workers never bind. A worker's `listen` becomes a message to the primary,
//! which binds through its [`PortBinder`](crate::binder::PortBinder) and
//! answers with exactly one `bind` acknowledgement carrying the same
//! correlation id.

mod primary;
mod worker;

pub use primary::{PrimaryCoordinator, WorkerSession};
pub use worker::{Listening, VirtualHandle, WorkerCoordinator, DEFAULT_MAX_EXPIRED};

use crate::config::Role;
use crate::error::BrokerError;

/// The coordinator for this process's role.
#[derive(Clone)]
pub enum Coordinator {
    Primary(PrimaryCoordinator),
    Worker(WorkerCoordinator),
}

impl Coordinator {
    pub fn role(&self) -> Role {
        match self {
            Coordinator::Primary(_) => Role::Primary,
            Coordinator::Worker(_) => Role::Worker,
        }
    }

    /// Request a listening port.
    ///
    /// Only workers may call this; in the primary it fails with
    /// [`BrokerError::Role`] without sending anything.
    pub async fn listen(&self, port: u16, host: &str) -> Result<Listening, BrokerError> {
        match self {
            Coordinator::Primary(_) => Err(BrokerError::Role),
            Coordinator::Worker(worker) => worker.listen(port, host).await,
        }
    }
}

impl From<PrimaryCoordinator> for Coordinator {
    fn from(primary: PrimaryCoordinator) -> Self {
        Coordinator::Primary(primary)
    }
}

impl From<WorkerCoordinator> for Coordinator {
    fn from(worker: WorkerCoordinator) -> Self {
        Coordinator::Worker(worker)
    }
}
