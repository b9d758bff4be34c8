use crate::prelude::*;
use autopin_shared::TaskSet;

/// A per-task performance sensor.
///
/// Monitors are shared between the pinning strategy and the data loggers, so every method takes
/// `&self` and implementations keep their per-task state behind interior mutability.
pub trait PerformanceMonitor: Send + Sync {
    fn name(&self) -> &str;

    /// Starts measuring `tid`.
    fn start(&self, tid: i32) -> Result<()>;

    /// Current value for `tid`.
    fn value(&self, tid: i32) -> Result<f64>;

    /// Stops measuring `tid` and returns the last value.
    fn stop(&self, tid: i32) -> Result<f64>;

    /// Resets the accumulated value of `tid`.
    fn clear(&self, tid: i32) -> Result<()>;

    fn monitored_tasks(&self) -> TaskSet;

    /// Unit of the values, if they have one.
    fn unit(&self) -> Option<&str> {
        None
    }
}
