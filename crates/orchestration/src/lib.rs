pub mod backend;
pub mod dispatch;
#[cfg(feature = "gateway")]
pub mod gateway;
pub mod keys;
pub mod local;
pub mod normalize;
pub mod stage;
pub mod types;

pub use backend::{ChangeNotifier, Collaborators, DelegationStore, EventLog, WorkItemStore};
pub use dispatch::{DispatchOutcome, Dispatcher, EventRefs};
#[cfg(feature = "gateway")]
pub use gateway::{DelegationError, GatewayBackend};
pub use keys::{KeyCandidate, KeyCandidates, KeyFormat};
pub use local::LocalBackend;
pub use normalize::normalize;
pub use stage::{StageGuard, StageOutcome};
pub use types::*;
