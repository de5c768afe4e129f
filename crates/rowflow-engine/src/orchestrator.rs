//! Pipeline orchestrator: wires channels between step-copies, runs one
//! runner per step-copy on the blocking pool, and aggregates the result.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rowflow_types::{Schema, StepCopyStats, StepState};
use tokio::task::JoinSet;

use crate::channel::{ChannelListener, HopSchema, RowChannel};
use crate::config::types::PipelineConfig;
use crate::errors::{PipelineError, StructuralError};
use crate::graph::{PipelineGraph, Wiring};
use crate::injector::RowInjector;
use crate::logic_cache::LogicCache;
use crate::result::{CheckResult, PipelineResult};
use crate::runner::{
    OutputHop, RowListener, RunnerControl, RunnerSpec, StepRunner, StopSignal,
};
use crate::settings::{EngineSettings, OnStepError};
use crate::step::{FactoryContext, StepContext, StepLogic, StepRegistry};

/// Everything wired to one step-copy before it starts.
struct CopySlot {
    step: usize,
    copy: usize,
    logic: Box<dyn StepLogic>,
    inputs: Vec<Arc<RowChannel>>,
    outputs: Vec<OutputHop>,
    error_outputs: Vec<OutputHop>,
    listeners: Vec<Arc<dyn RowListener>>,
    control: Arc<RunnerControl>,
}

/// Channels of one step-copy, collected while walking the hops.
#[derive(Default)]
struct CopyWiring {
    inputs: Vec<Arc<RowChannel>>,
    outputs: Vec<OutputHop>,
    error_outputs: Vec<OutputHop>,
}

/// Builds a [`Pipeline`] from a [`PipelineGraph`].
pub struct PipelineBuilder {
    graph: PipelineGraph,
    registry: StepRegistry,
    settings: EngineSettings,
    parallelism: Vec<(String, usize)>,
    logic_cache: Option<Arc<LogicCache>>,
}

impl PipelineBuilder {
    /// Builder using the built-in step registry and default settings.
    #[must_use]
    pub fn new(graph: PipelineGraph) -> Self {
        Self {
            graph,
            registry: StepRegistry::with_builtins(),
            settings: EngineSettings::default(),
            parallelism: Vec::new(),
            logic_cache: None,
        }
    }

    #[must_use]
    pub fn registry(mut self, registry: StepRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Override the number of copies of `step`.
    #[must_use]
    pub fn parallelism(mut self, step: impl Into<String>, copies: usize) -> Self {
        self.parallelism.push((step.into(), copies));
        self
    }

    /// Share a logic cache with other pipelines instead of creating one.
    #[must_use]
    pub fn logic_cache(mut self, cache: Arc<LogicCache>) -> Self {
        self.logic_cache = Some(cache);
        self
    }

    /// Validate the graph, create every channel, and instantiate one step
    /// logic per step-copy. Nothing is instantiated if the graph is invalid.
    pub fn build(self) -> Result<Pipeline, PipelineError> {
        let Self {
            mut graph,
            registry,
            settings,
            parallelism,
            logic_cache,
        } = self;

        for (step, copies) in parallelism {
            let decl = graph
                .steps
                .iter_mut()
                .find(|s| s.name == step)
                .ok_or_else(|| StructuralError::UnknownStep {
                    name: step.clone(),
                    referenced_by: "parallelism override".to_string(),
                })?;
            decl.copies = copies;
        }

        graph.validate(&registry)?;
        let order: Vec<usize> = {
            let index: HashMap<&str, usize> = graph
                .steps
                .iter()
                .enumerate()
                .map(|(i, s)| (s.name.as_str(), i))
                .collect();
            graph
                .topological_order()?
                .into_iter()
                .filter_map(|name| index.get(name).copied())
                .collect()
        };

        // Slot offsets: copies of step i occupy offsets[i]..offsets[i] + copies.
        let mut offsets = Vec::with_capacity(graph.steps.len());
        let mut total = 0usize;
        for step in &graph.steps {
            offsets.push(total);
            total += step.copies;
        }
        let step_index: HashMap<&str, usize> = graph
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();

        let mut wiring: Vec<CopyWiring> = (0..total).map(|_| CopyWiring::default()).collect();
        let mut channels = Vec::new();
        for hop in &graph.hops {
            let (Some(&from), Some(&to)) =
                (step_index.get(hop.from.as_str()), step_index.get(hop.to.as_str()))
            else {
                continue;
            };
            let from_copies = graph.steps[from].copies;
            let to_copies = graph.steps[to].copies;
            let capacity = hop.capacity.unwrap_or(settings.channel_capacity);
            let schema = HopSchema::new(hop.schema.clone().map(Schema::into_ref));
            let suffix = if hop.error { " (error)" } else { "" };

            for p in 0..from_copies {
                let consumers: Vec<usize> = match hop.wiring.resolve(from_copies, to_copies) {
                    Wiring::Partitioned => vec![p],
                    Wiring::AllToAll | Wiring::Auto => (0..to_copies).collect(),
                };
                let mut targets = Vec::with_capacity(consumers.len());
                for c in consumers {
                    let channel = Arc::new(RowChannel::for_hop(
                        format!("{}.{p} -> {}.{c}{suffix}", hop.from, hop.to),
                        capacity,
                        Arc::clone(&schema),
                    ));
                    wiring[offsets[to] + c].inputs.push(Arc::clone(&channel));
                    targets.push(Arc::clone(&channel));
                    channels.push(channel);
                }
                let output = OutputHop::new(hop.fan, targets);
                let producer = &mut wiring[offsets[from] + p];
                if hop.error {
                    producer.error_outputs.push(output);
                } else {
                    producer.outputs.push(output);
                }
            }
        }

        let logic_cache = logic_cache
            .unwrap_or_else(|| Arc::new(LogicCache::new(settings.logic_cache_size)));
        let mut logics: Vec<Option<Box<dyn StepLogic>>> = (0..total).map(|_| None).collect();
        for &step in &order {
            let decl = &graph.steps[step];
            let factory = registry
                .factory(&decl.logic)
                .ok_or_else(|| StructuralError::UnknownLogic {
                    step: decl.name.clone(),
                    logic: decl.logic.clone(),
                })?;
            for copy in 0..decl.copies {
                let ctx = FactoryContext {
                    pipeline: graph.name.clone(),
                    decl: decl.clone(),
                    copy,
                    logic_cache: Arc::clone(&logic_cache),
                };
                let logic = factory.create(&ctx).map_err(|error| PipelineError::Step {
                    step: decl.name.clone(),
                    copy,
                    error,
                })?;
                logics[offsets[step] + copy] = Some(logic);
            }
        }

        let mut slots = Vec::with_capacity(total);
        for (step, decl) in graph.steps.iter().enumerate() {
            for copy in 0..decl.copies {
                let slot = offsets[step] + copy;
                let logic = logics[slot].take().ok_or_else(|| {
                    PipelineError::Infrastructure(anyhow::anyhow!(
                        "step '{}' copy {copy} was not instantiated",
                        decl.name
                    ))
                })?;
                let w = std::mem::take(&mut wiring[slot]);
                slots.push(CopySlot {
                    step,
                    copy,
                    logic,
                    inputs: w.inputs,
                    outputs: w.outputs,
                    error_outputs: w.error_outputs,
                    listeners: Vec::new(),
                    control: Arc::new(RunnerControl::default()),
                });
            }
        }

        tracing::debug!(
            pipeline = graph.name,
            steps = graph.steps.len(),
            step_copies = slots.len(),
            channels = channels.len(),
            "Pipeline built"
        );

        let controls = slots.iter().map(|s| Arc::clone(&s.control)).collect();
        Ok(Pipeline {
            order: order
                .iter()
                .map(|&i| graph.steps[i].name.clone())
                .collect(),
            graph,
            settings,
            slots,
            channels,
            channel_listeners: Vec::new(),
            controls,
            signal: Arc::new(StopSignal::new()),
            logic_cache,
            tasks: None,
            completed: Vec::new(),
            started_at: None,
            result: None,
        })
    }
}

/// A built pipeline: wired, instantiated, and ready to start once.
pub struct Pipeline {
    graph: PipelineGraph,
    order: Vec<String>,
    settings: EngineSettings,
    slots: Vec<CopySlot>,
    channels: Vec<Arc<RowChannel>>,
    channel_listeners: Vec<Arc<dyn ChannelListener>>,
    controls: Vec<Arc<RunnerControl>>,
    signal: Arc<StopSignal>,
    logic_cache: Arc<LogicCache>,
    tasks: Option<JoinSet<StepCopyStats>>,
    completed: Vec<StepCopyStats>,
    started_at: Option<Instant>,
    result: Option<PipelineResult>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.graph.name)
            .field("step_copies", &self.controls.len())
            .field("channels", &self.channels.len())
            .field("started", &self.started_at.is_some())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.graph.name
    }

    #[must_use]
    pub fn graph(&self) -> &PipelineGraph {
        &self.graph
    }

    #[must_use]
    pub fn logic_cache(&self) -> &Arc<LogicCache> {
        &self.logic_cache
    }

    /// Step names in execution-safe order, producers first.
    #[must_use]
    pub fn order(&self) -> &[String] {
        &self.order
    }

    #[must_use]
    pub fn step_copies(&self) -> usize {
        self.controls.len()
    }

    /// Number of row channels, injector entries included.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Summary of the wiring, for dry checks.
    #[must_use]
    pub fn check_result(&self) -> CheckResult {
        CheckResult {
            pipeline: self.graph.name.clone(),
            steps: self.graph.steps.len(),
            step_copies: self.step_copies(),
            channels: self.channel_count(),
            order: self.order.clone(),
        }
    }

    /// Attach an external row source to `step` copy `copy`. Must be called
    /// before [`Pipeline::start`].
    pub fn add_injector(&mut self, step: &str, copy: usize) -> Result<RowInjector, PipelineError> {
        self.ensure_not_started("add an injector")?;
        let capacity = self.settings.channel_capacity;
        let channel = Arc::new(RowChannel::new(format!("injector -> {step}.{copy}"), capacity));
        let slot = self.slot_mut(step, copy, "injector")?;
        slot.inputs.push(Arc::clone(&channel));
        self.channels.push(Arc::clone(&channel));
        Ok(RowInjector::new(channel, step, copy))
    }

    /// Observe the rows `step` copy `copy` reads, writes, and rejects.
    pub fn add_row_listener(
        &mut self,
        step: &str,
        copy: usize,
        listener: Arc<dyn RowListener>,
    ) -> Result<(), PipelineError> {
        self.ensure_not_started("add a row listener")?;
        self.slot_mut(step, copy, "row listener")?
            .listeners
            .push(listener);
        Ok(())
    }

    /// Observe traffic on every channel, injector entries included.
    pub fn add_channel_listener(
        &mut self,
        listener: Arc<dyn ChannelListener>,
    ) -> Result<(), PipelineError> {
        self.ensure_not_started("add a channel listener")?;
        self.channel_listeners.push(listener);
        Ok(())
    }

    /// Spawn one runner per step-copy on the blocking pool and return.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        self.ensure_not_started("start")?;
        let handle = tokio::runtime::Handle::try_current().map_err(|e| {
            PipelineError::Infrastructure(anyhow::anyhow!(
                "pipeline must be started inside a tokio runtime: {e}"
            ))
        })?;

        for listener in &self.channel_listeners {
            for channel in &self.channels {
                channel.add_listener(Arc::clone(listener));
            }
        }

        tracing::info!(
            pipeline = self.graph.name,
            steps = self.graph.steps.len(),
            step_copies = self.controls.len(),
            channels = self.channels.len(),
            "Starting pipeline"
        );

        self.started_at = Some(Instant::now());
        let mut tasks = JoinSet::new();
        for slot in self.slots.drain(..) {
            let decl = &self.graph.steps[slot.step];
            let ctx = StepContext {
                pipeline: self.graph.name.clone(),
                step: decl.name.clone(),
                copy: slot.copy,
                copies: decl.copies,
                inputs: slot.inputs.len(),
                outputs: slot.outputs.iter().map(OutputHop::len).sum(),
                config: decl.config.clone(),
            };
            let spec = RunnerSpec {
                ctx,
                logic: slot.logic,
                inputs: slot.inputs,
                input_policy: decl.input_policy,
                outputs: slot.outputs,
                error_outputs: slot.error_outputs,
                on_row_error: decl.on_row_error,
                listeners: slot.listeners,
            };
            let runner = StepRunner::new(
                spec,
                slot.control,
                Arc::clone(&self.signal),
                self.settings.on_step_error,
                self.settings.poll_interval(),
            );
            tasks.spawn_blocking_on(move || runner.run(), &handle);
        }
        self.tasks = Some(tasks);
        Ok(())
    }

    /// Ask every runner to stop. Runners finish the row in hand, skip the
    /// end-of-stream flush, and close their channels.
    pub fn stop_all(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.signal.stop(reason.clone()) {
            tracing::info!(pipeline = self.graph.name, reason, "Stopping pipeline");
        }
    }

    /// Whether any runner of a started pipeline has not terminated yet.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.started_at.is_some() && self.controls.iter().any(|c| !c.state().is_terminal())
    }

    /// Whether any runner failed or counted a row error so far.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.controls.iter().any(|c| c.has_errors())
    }

    /// Current state of `step` copy `copy`.
    #[must_use]
    pub fn step_state(&self, step: &str, copy: usize) -> Option<StepState> {
        let offset = self.copy_offset(step, copy)?;
        self.controls.get(offset).map(|c| c.state())
    }

    /// Wait for every runner and aggregate the result. Later calls return
    /// the same result.
    pub async fn wait_until_finished(&mut self) -> Result<PipelineResult, PipelineError> {
        if let Some(result) = &self.result {
            return Ok(result.clone());
        }
        let Some(tasks) = self.tasks.as_mut() else {
            return Err(not_started());
        };
        collect_runner_results(
            tasks,
            &mut self.completed,
            &self.signal,
            self.settings.on_step_error,
        )
        .await?;
        Ok(self.finalize())
    }

    /// Like [`Pipeline::wait_until_finished`], but gives up after `timeout`
    /// and returns `None`. Runners that finished in the meantime are kept.
    pub async fn wait_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<PipelineResult>, PipelineError> {
        if let Some(result) = &self.result {
            return Ok(Some(result.clone()));
        }
        let Some(tasks) = self.tasks.as_mut() else {
            return Err(not_started());
        };
        let collected = tokio::time::timeout(
            timeout,
            collect_runner_results(
                tasks,
                &mut self.completed,
                &self.signal,
                self.settings.on_step_error,
            ),
        )
        .await;
        match collected {
            Ok(outcome) => {
                outcome?;
                Ok(Some(self.finalize()))
            }
            Err(_) => Ok(None),
        }
    }

    fn finalize(&mut self) -> PipelineResult {
        let position: HashMap<&str, usize> = self
            .graph
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();
        let mut steps = std::mem::take(&mut self.completed);
        steps.sort_by_key(|s| (position.get(s.step.as_str()).copied(), s.copy));

        let duration_secs = self
            .started_at
            .map_or(0.0, |t| t.elapsed().as_secs_f64());
        let result = PipelineResult::from_steps(
            self.graph.name.clone(),
            steps,
            self.signal.reason(),
            duration_secs,
        );

        tracing::info!(
            pipeline = result.pipeline,
            success = result.success,
            stopped = result.stopped,
            rows_read = result.rows_read,
            rows_written = result.rows_written,
            rows_rejected = result.rows_rejected,
            rows_discarded = result.rows_discarded,
            errors = result.error_count,
            duration_secs = result.duration_secs,
            "Pipeline run finished"
        );
        self.result = Some(result.clone());
        result
    }

    fn ensure_not_started(&self, action: &str) -> Result<(), PipelineError> {
        if self.started_at.is_some() {
            return Err(PipelineError::Infrastructure(anyhow::anyhow!(
                "cannot {action}: pipeline '{}' already started",
                self.graph.name
            )));
        }
        Ok(())
    }

    fn copy_offset(&self, step: &str, copy: usize) -> Option<usize> {
        let mut offset = 0;
        for decl in &self.graph.steps {
            if decl.name == step {
                return (copy < decl.copies).then_some(offset + copy);
            }
            offset += decl.copies;
        }
        None
    }

    fn slot_mut(
        &mut self,
        step: &str,
        copy: usize,
        referenced_by: &str,
    ) -> Result<&mut CopySlot, PipelineError> {
        let decl = self
            .graph
            .find_step(step)
            .ok_or_else(|| StructuralError::UnknownStep {
                name: step.to_string(),
                referenced_by: referenced_by.to_string(),
            })?;
        if copy >= decl.copies {
            return Err(StructuralError::UnknownCopy {
                step: step.to_string(),
                copy,
                copies: decl.copies,
            }
            .into());
        }
        let offset = self.copy_offset(step, copy).ok_or_else(not_started)?;
        self.slots.get_mut(offset).ok_or_else(not_started)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.result.is_none() && self.is_running() {
            self.stop_all("pipeline dropped before completion");
        }
    }
}

fn not_started() -> PipelineError {
    PipelineError::Infrastructure(anyhow::anyhow!("pipeline has not been started"))
}

async fn collect_runner_results(
    tasks: &mut JoinSet<StepCopyStats>,
    completed: &mut Vec<StepCopyStats>,
    signal: &StopSignal,
    on_step_error: OnStepError,
) -> Result<(), PipelineError> {
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(stats) => {
                if stats.failed() && on_step_error == OnStepError::Cascade {
                    signal.stop(format!("step '{}' copy {} failed", stats.step, stats.copy));
                }
                completed.push(stats);
            }
            Err(join_err) => {
                return Err(PipelineError::Infrastructure(anyhow::anyhow!(
                    "Step runner task panicked: {join_err}"
                )));
            }
        }
    }
    Ok(())
}

/// Build, start, and wait for the pipeline described by `config`, using the
/// built-in step types.
///
/// # Errors
///
/// Returns a `PipelineError` if the pipeline is structurally invalid, a step
/// cannot be instantiated, or the runtime fails. A run whose steps fail still
/// returns `Ok` with an unsuccessful result.
pub async fn run_pipeline(config: &PipelineConfig) -> Result<PipelineResult, PipelineError> {
    let mut pipeline = PipelineBuilder::new(config.to_graph())
        .settings(config.settings.clone())
        .build()?;
    pipeline.start()?;
    pipeline.wait_until_finished().await
}

/// Build the pipeline described by `config` without running it.
///
/// # Errors
///
/// Returns a `PipelineError` if the pipeline is structurally invalid or a
/// step cannot be instantiated.
pub fn check_pipeline(config: &PipelineConfig) -> Result<CheckResult, PipelineError> {
    let pipeline = PipelineBuilder::new(config.to_graph())
        .settings(config.settings.clone())
        .build()?;
    Ok(pipeline.check_result())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{HopDecl, StepDecl};

    fn graph() -> PipelineGraph {
        PipelineGraph::new("unit")
            .step(StepDecl::new("in", "injector"))
            .step(StepDecl::new("mid", "dummy").with_copies(2))
            .step(StepDecl::new("out", "dummy"))
            .hop(HopDecl::new("in", "mid"))
            .hop(HopDecl::new("mid", "out"))
    }

    #[test]
    fn test_build_creates_one_channel_per_copy_pair() {
        let pipeline = PipelineBuilder::new(graph()).build().unwrap();
        // in(1) -> mid(2): 2 channels, mid(2) -> out(1): 2 channels.
        assert_eq!(pipeline.channel_count(), 4);
        assert_eq!(pipeline.step_copies(), 4);
        assert_eq!(pipeline.order(), ["in", "mid", "out"]);
        assert!(!pipeline.is_running());
    }

    #[test]
    fn test_parallelism_override() {
        let pipeline = PipelineBuilder::new(graph())
            .parallelism("out", 2)
            .build()
            .unwrap();
        // mid(2) -> out(2) is now partitioned.
        assert_eq!(pipeline.channel_count(), 4);
        assert_eq!(pipeline.step_copies(), 5);
    }

    #[test]
    fn test_parallelism_override_unknown_step() {
        let err = PipelineBuilder::new(graph())
            .parallelism("ghost", 2)
            .build()
            .unwrap_err();
        assert!(matches!(
            err.as_structural(),
            Some(StructuralError::UnknownStep { .. })
        ));
    }

    #[test]
    fn test_add_injector_validates_target() {
        let mut pipeline = PipelineBuilder::new(graph()).build().unwrap();
        assert!(pipeline.add_injector("ghost", 0).is_err());
        let err = pipeline.add_injector("mid", 2).unwrap_err();
        assert!(matches!(
            err.as_structural(),
            Some(StructuralError::UnknownCopy { copies: 2, .. })
        ));
        let injector = pipeline.add_injector("in", 0).unwrap();
        assert_eq!(pipeline.channel_count(), 5);
        injector.finish();
    }

    #[test]
    fn test_start_requires_runtime() {
        let mut pipeline = PipelineBuilder::new(graph()).build().unwrap();
        let err = pipeline.start().unwrap_err();
        assert!(err.to_string().contains("tokio runtime"));
    }

    #[tokio::test]
    async fn test_wait_before_start_fails() {
        let mut pipeline = PipelineBuilder::new(graph()).build().unwrap();
        assert!(pipeline.wait_until_finished().await.is_err());
    }

    #[test]
    fn test_step_state_before_start() {
        let pipeline = PipelineBuilder::new(graph()).build().unwrap();
        assert_eq!(pipeline.step_state("mid", 1), Some(StepState::Created));
        assert_eq!(pipeline.step_state("mid", 2), None);
    }
}
