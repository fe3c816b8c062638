//! Pipeline stages built on [`Task`](crate::Task).
//!
//! Stages are wired together with bounded `tokio::sync::mpsc` channels. Each
//! stage owns its input receiver and finishes on its own once that channel
//! closes, which cascades the close downstream.

mod batch;
pub mod duplicator;
pub mod hole;
pub mod mapper;
pub mod processor;
pub mod sink;

pub use duplicator::Duplicator;
pub use hole::{BatchFlush, Hole};
pub use mapper::{Map, Mapper};
pub use processor::{BatchProcess, BatchProcessor};
pub use sink::SinkTask;
