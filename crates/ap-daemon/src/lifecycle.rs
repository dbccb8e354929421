use async_trait::async_trait;

use crate::activity::EngineActivity;

/// What the supervisor needs from the thing it supervises.
#[async_trait]
pub trait EngineLifecycle: Send + Sync {
    /// Start the loop. Calling it while already running is a no-op.
    async fn start(&self);

    /// Stop the loop, aborting any in-flight dispatch, and wait for it to exit.
    async fn stop(&self);

    /// Pause or resume ticking without tearing the loop down.
    async fn set_resting(&self, resting: bool);

    fn activity(&self) -> EngineActivity;
}
