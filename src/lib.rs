pub mod config;
pub mod credit;
pub mod engine;
pub mod error;
pub mod fabric;
pub mod graph;
pub mod hazard;
pub mod orchestrator;
pub mod ring;
pub mod types;

pub use config::WeftConfig;
pub use credit::{BufferManager, CreditPool, PoolKey};
pub use engine::{BufferedEngineQueue, EngineSink, Instruction, ScaleOutTransport, SobTable};
pub use error::{Result, WeftError};
pub use fabric::FabricTopology;
pub use graph::SignalGraphScheduler;
pub use graph::event::{SignalKind, SyncBinding, WaitMethod, WaitPoint};
pub use hazard::RangeHazardTracker;
pub use orchestrator::{CollectiveOrchestrator, IterationHandle, SchedQueue};
pub use ring::{CompletionRecord, RingConsumer, RingProducer, completion_ring};
pub use types::{
    AccessKind, BufferKind, CollectiveOp, DataType, EngineKind, MemoryRange, NO_WAIT, QueueId,
    ShapeDescriptor, SyncAddress, TargetValue,
};
