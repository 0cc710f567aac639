pub mod bootstrapper;
pub mod finalizer;

pub use bootstrapper::{BootstrapResult, SessionBootstrapper};
pub use finalizer::{SessionFinalizer, TeardownReport, commit_message};
