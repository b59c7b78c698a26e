//! Connection identity model and event kernel for Airlink

use thiserror::Error;

pub mod connection;
pub mod events;
pub mod manager;
pub mod types;

pub use connection::ConnectionIdentifier;
pub use events::{EventHandle, EventScheduler, Time};
pub use manager::{CidAllocator, ConnectionDeletedObserver, ConnectionManager};
pub use types::{Cid, ConnectionType, Direction, QosCategory, StationId, StationType};

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("no connection registered for CID {0}")]
    CidNotFound(Cid),

    #[error("no basic connection for station {0}")]
    NoBasicConnection(StationId),
}
