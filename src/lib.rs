// Venue slot discovery and booking engine

pub mod auth;
pub mod catalog;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod mock_server;
pub mod monitor;
pub mod orchestrator;
pub mod policy;
pub mod schedule;
pub mod session;
pub mod status;
pub mod transactor;
pub mod upstream;
pub mod window;

// Re-export key types for convenience
pub use auth::{AuthGuard, AuthStatus, ExpiryReason};
pub use catalog::{Discovery, Slot, SlotCatalog};
pub use config::{BookingConfig, ConfigStore, Requester};
pub use error::{ApiError, ConfigError, SessionError, StartError};
pub use monitor::{AvailabilityMonitor, MonitorPass, WindowReport};
pub use orchestrator::Orchestrator;
pub use policy::PriorityPolicy;
pub use session::{Credentials, SessionStore};
pub use status::{RunOutcome, RunState, StatusSnapshot};
pub use transactor::{BookingOutcome, BookingRecord, BookingTransactor, RejectReason};
pub use upstream::{HttpVenueApi, VenueApi};
pub use window::{Clock, SystemClock, TimeWindow};
