//! Brakes - Circuit breakers for async operations
//!
//! This crate provides a circuit breaker with:
//! - Time-budgeted execution of async (or callback-style) operations
//! - Rolling-window statistics with latency percentiles
//! - State machine for the breaker lifecycle (Closed → Open → Closed)
//! - Recovery through a fixed (optionally jittered) timer or a health check
//! - A registry streaming snapshots in the Hystrix dashboard format
//!
//! # Example
//!
//! ```rust
//! use brakes::{BoxError, CircuitBreaker, Operation};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), brakes::BrakesError> {
//! let breaker = CircuitBreaker::builder("payments")
//!     .wait_threshold(20)
//!     .threshold(0.5)
//!     .timeout(Duration::from_millis(500))
//!     .register_global(false)
//!     .on_open(|name| println!("Circuit {} opened!", name))
//!     .operation(Operation::new(|amount: u32| async move {
//!         // Your service call here
//!         Ok::<_, BoxError>(format!("charged {}", amount))
//!     }))
//!     .build()?;
//!
//! // Execute with circuit protection
//! let receipt = breaker.exec(42).await?;
//! assert_eq!(receipt, "charged 42");
//!
//! // Check circuit state
//! if breaker.is_open() {
//!     println!("Circuit is open, skipping call");
//! }
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod bucket;
pub mod builder;
pub mod circuit;
pub mod errors;
pub mod events;
pub mod hystrix;
pub mod operation;
pub mod registry;
pub mod stats;

pub use breaker::{CircuitBreaker, Config};
pub use bucket::{Bucket, BucketField};
pub use builder::BreakerBuilder;
pub use circuit::{Circuit, CircuitOptions};
pub use errors::{BrakesError, CallbackDropped, RegistryError, StatsError};
pub use events::{BreakerEvent, Listeners, Subscription};
pub use hystrix::HystrixRecord;
pub use operation::{Done, HealthCheck, Operation, OperationFuture};
pub use registry::{GlobalRegistry, SnapshotPublisher};
pub use stats::{LatencyPercentiles, Snapshot, StatsEvent, StatsWindow, Totals};

/// Error type produced by wrapped operations, fallbacks and health checks
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
