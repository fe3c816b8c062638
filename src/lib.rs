pub mod error;
pub mod pipeline;
pub mod runtime;
pub mod task;

pub use error::TaskError;
pub use pipeline::{
    BatchFlush, BatchProcess, BatchProcessor, Duplicator, Hole, Map, Mapper, SinkTask,
};
pub use runtime::config::{TaskConfig, TaskConfigBuilder, TaskConfigParams};
pub use runtime::fatal::{FatalError, FatalErrorHandler};
pub use runtime::runner::Runner;
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use task::{
    Repeat, RetryClassifier, RetryDisposition, RetryPolicy, Task, TaskFuture, Watchdog,
    WorkerPool,
};
