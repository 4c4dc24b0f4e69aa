pub mod amount;
pub mod batch;
pub mod config;
pub mod csv;
pub mod memory;
pub mod model;
pub mod policy;
pub mod ports;
pub mod progress;
pub mod router;
pub mod status;

pub use amount::Amount;
pub use batch::Batch;
pub use config::Config;
pub use model::{Action, ApprovalRequest, RoutingResult, Stage, Status};
pub use policy::{Policy, PolicyConfig};
pub use progress::ProgressTracker;
pub use router::{RouteError, Router};
pub use status::StatusStore;
