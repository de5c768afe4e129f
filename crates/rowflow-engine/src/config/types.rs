use rowflow_types::{FieldMeta, Schema};
use serde::{Deserialize, Serialize};

use crate::graph::{
    FanPolicy, HopDecl, InputPolicy, PipelineGraph, RowErrorPolicy, StepDecl, Wiring,
};
use crate::settings::EngineSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub version: String,
    pub pipeline: String,
    #[serde(default)]
    pub settings: EngineSettings,
    pub steps: Vec<StepConfig>,
    #[serde(default)]
    pub hops: Vec<HopConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    pub name: String,
    #[serde(rename = "use")]
    pub use_ref: String,
    #[serde(default = "default_copies")]
    pub copies: usize,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub input_policy: InputPolicy,
    #[serde(default)]
    pub on_row_error: RowErrorPolicy,
}

fn default_copies() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HopConfig {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub fan: FanPolicy,
    #[serde(default)]
    pub wiring: Wiring,
    #[serde(default)]
    pub error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Vec<FieldMeta>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
}

impl PipelineConfig {
    /// Graph description of this pipeline.
    #[must_use]
    pub fn to_graph(&self) -> PipelineGraph {
        let mut graph = PipelineGraph::new(self.pipeline.clone());
        for step in &self.steps {
            graph = graph.step(
                StepDecl::new(step.name.clone(), step.use_ref.clone())
                    .with_copies(step.copies)
                    .with_config(step.config.clone())
                    .with_input_policy(step.input_policy)
                    .with_row_error_policy(step.on_row_error),
            );
        }
        for hop in &self.hops {
            let mut decl = HopDecl::new(hop.from.clone(), hop.to.clone())
                .with_fan(hop.fan)
                .with_wiring(hop.wiring);
            decl.error = hop.error;
            decl.schema = hop.schema.clone().map(Schema::new);
            decl.capacity = hop.capacity;
            graph = graph.hop(decl);
        }
        graph
    }
}
