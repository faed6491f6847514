pub mod collaborator;
pub mod cpu;
pub mod debt;
pub mod driver;
pub mod error;
pub mod fetch;
pub mod metrics;
pub mod mode;
pub mod runner;
pub mod sim;
pub mod state;
pub mod types;

pub use collaborator::{ExecError, FetchError, TaskExecutor, WorkFetcher};
pub use debt::{entitlement_deltas, DebtAccountant, DebtUpdate, EligibleSets};
pub use driver::{DriverHandle, SchedulerDriver};
pub use error::SchedError;
pub use fetch::{FetchPlan, ProjectUrgency, WorkFetchPolicy};
pub use metrics::{ProjectStatus, SchedulerMetrics};
pub use mode::{select_mode, ModeDecision};
pub use runner::{ClientScheduler, SchedulerEvent};
pub use sim::{HostSimulator, ProjectSpec, Scenario, SimReport};
pub use state::{SchedulerState, Slot};
pub use types::{Decision, DispatchCommand, FetchOutcome, SchedulerMode, Urgency, WorkRequest};
