pub mod pricing;
pub mod reconciler;
pub mod recovery;
pub mod scheduler;
pub mod spend_gate;
pub mod usage;

pub use reconciler::Reconciler;
pub use recovery::{RecoveryConfig, RecoverySweep};
pub use scheduler::RecoveryScheduler;
pub use spend_gate::SpendGate;
pub use usage::UsageService;
