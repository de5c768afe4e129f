//! Row-oriented streaming engine: bounded row channels, per-copy step
//! runners, and the orchestrator that wires a step graph together.

pub mod channel;
pub mod config;
pub mod errors;
pub mod graph;
pub mod injector;
pub mod logic_cache;
pub mod orchestrator;
pub mod result;
pub mod runner;
pub mod settings;
pub mod step;
pub mod steps;

// Re-export public API for convenience
pub use channel::{ChannelError, ChannelListener, HopSchema, Recv, RowChannel};
pub use errors::{PipelineError, StructuralError};
pub use graph::{
    FanPolicy, HopDecl, InputPolicy, PipelineGraph, RowErrorPolicy, StepDecl, Wiring,
};
pub use injector::{InjectError, RowInjector};
pub use logic_cache::LogicCache;
pub use orchestrator::{check_pipeline, run_pipeline, Pipeline, PipelineBuilder};
pub use result::{CheckResult, PipelineResult};
pub use runner::{RowCollector, RowListener};
pub use settings::{EngineSettings, OnStepError};
pub use step::{FactoryContext, Flow, RowEmitter, StepContext, StepFactory, StepLogic, StepRegistry};
