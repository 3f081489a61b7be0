pub mod backoff;
pub mod orchestrator;
pub mod reconcile;
pub mod transfer;
