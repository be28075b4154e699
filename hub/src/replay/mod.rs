//! Replay engine: channel registry and paced delivery.

pub mod pipeline;
pub mod registry;

pub use pipeline::{ReplayPipeline, ReplaySummary, DEFAULT_PAGE_SIZE, MIN_PAGE_SIZE};
pub use registry::{
    spawn_sweeper, ChannelRegistry, CreatedStream, RegistrySettings, StreamDescriptor,
    StreamRequest,
};
