use crate::ambiguity::AmbiguityDetector;
use crate::cache::ResponseCache;
use crate::config::PipelineConfig;
use crate::context::ContextEngineer;
use crate::db::DbAdapter;
use crate::error::{Nl2SqlError, Result};
use crate::executor::Executor;
use crate::llm::LlmProvider;
use crate::observability::{MetricsSink, NoopMetrics};
use crate::pipeline::orchestrator::{Pipeline, DEFAULT_MAX_REPAIR_ATTEMPTS};
use crate::safety::SafetyFilter;
use crate::stages::{
    AmbiguityCheck, ExecuteStage, GenerateStage, Generator, NoopExecutor, NoopRepair, NoopVerifier,
    PlanStage, Planner, Repair, RepairStage, SafetyGate, VerifyStage,
};
use crate::verifier::Verifier;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Assembles a [`Pipeline`] from explicit stage implementations.
///
/// Planner and generator are required. Without an executor, verifier or
/// repair stage the no-op variants are used.
#[derive(Default)]
pub struct PipelineBuilder {
    detector: Option<Arc<dyn AmbiguityCheck>>,
    context: Option<ContextEngineer>,
    planner: Option<Arc<dyn PlanStage>>,
    generator: Option<Arc<dyn GenerateStage>>,
    safety: Option<Arc<dyn SafetyGate>>,
    executor: Option<Arc<dyn ExecuteStage>>,
    verifier: Option<Arc<dyn VerifyStage>>,
    repair: Option<Arc<dyn RepairStage>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    cache: Option<Arc<ResponseCache>>,
    max_repair_attempts: Option<usize>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn detector(mut self, detector: Arc<dyn AmbiguityCheck>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn context(mut self, context: ContextEngineer) -> Self {
        self.context = Some(context);
        self
    }

    pub fn planner(mut self, planner: Arc<dyn PlanStage>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn generator(mut self, generator: Arc<dyn GenerateStage>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn safety(mut self, safety: Arc<dyn SafetyGate>) -> Self {
        self.safety = Some(safety);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn ExecuteStage>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn verifier(mut self, verifier: Arc<dyn VerifyStage>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn repair(mut self, repair: Arc<dyn RepairStage>) -> Self {
        self.repair = Some(repair);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn max_repair_attempts(mut self, attempts: usize) -> Self {
        self.max_repair_attempts = Some(attempts);
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        let planner = self
            .planner
            .ok_or_else(|| Nl2SqlError::Config("pipeline requires a planner".to_string()))?;
        let generator = self
            .generator
            .ok_or_else(|| Nl2SqlError::Config("pipeline requires a generator".to_string()))?;

        Ok(Pipeline {
            detector: self.detector.unwrap_or_else(|| Arc::new(AmbiguityDetector::new())),
            context: self.context.unwrap_or_default(),
            planner,
            generator,
            safety: self.safety.unwrap_or_else(|| Arc::new(SafetyFilter::new())),
            executor: self.executor.unwrap_or_else(|| Arc::new(NoopExecutor)),
            verifier: self.verifier.unwrap_or_else(|| Arc::new(NoopVerifier)),
            repair: self.repair.unwrap_or_else(|| Arc::new(NoopRepair)),
            metrics: self.metrics.unwrap_or_else(|| Arc::new(NoopMetrics)),
            cache: self.cache,
            max_repair_attempts: self.max_repair_attempts.unwrap_or(DEFAULT_MAX_REPAIR_ATTEMPTS),
        })
    }
}

/// Collaborators handed to stage constructors
#[derive(Clone)]
pub struct StageDeps {
    pub llm: Option<Arc<dyn LlmProvider>>,
    pub db: Option<Arc<dyn DbAdapter>>,
    pub metrics: Arc<dyn MetricsSink>,
}

impl StageDeps {
    pub fn new() -> Self {
        Self {
            llm: None,
            db: None,
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmProvider>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_db(mut self, db: Arc<dyn DbAdapter>) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    fn llm(&self, stage: &str) -> Result<Arc<dyn LlmProvider>> {
        self.llm
            .clone()
            .ok_or_else(|| Nl2SqlError::Config(format!("{} stage requires an LLM provider", stage)))
    }

    fn db(&self, stage: &str) -> Result<Arc<dyn DbAdapter>> {
        self.db
            .clone()
            .ok_or_else(|| {
                Nl2SqlError::Config(format!("{} stage requires a database adapter", stage))
            })
    }
}

impl Default for StageDeps {
    fn default() -> Self {
        Self::new()
    }
}

pub type StageCtor<T> = fn(&PipelineConfig, &StageDeps) -> Result<Arc<T>>;

/// Constructors for one stage kind, keyed by config string
struct Ctors<T: ?Sized> {
    kind: &'static str,
    by_key: HashMap<String, StageCtor<T>>,
}

impl<T: ?Sized> Ctors<T> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            by_key: HashMap::new(),
        }
    }

    fn with(mut self, key: &str, ctor: StageCtor<T>) -> Self {
        self.by_key.insert(key.to_string(), ctor);
        self
    }

    fn resolve(&self, key: &str, config: &PipelineConfig, deps: &StageDeps) -> Result<Arc<T>> {
        let ctor = self.by_key.get(key).ok_or_else(|| {
            let mut known: Vec<&str> = self.by_key.keys().map(String::as_str).collect();
            known.sort_unstable();
            Nl2SqlError::Config(format!(
                "unknown {} '{}' (known: {})",
                self.kind,
                key,
                known.join(", ")
            ))
        })?;
        ctor(config, deps)
    }
}

/// Maps config strings to stage constructors. Resolved once, at startup.
pub struct StageRegistry {
    detectors: Ctors<dyn AmbiguityCheck>,
    planners: Ctors<dyn PlanStage>,
    generators: Ctors<dyn GenerateStage>,
    safety: Ctors<dyn SafetyGate>,
    executors: Ctors<dyn ExecuteStage>,
    verifiers: Ctors<dyn VerifyStage>,
    repairs: Ctors<dyn RepairStage>,
}

impl StageRegistry {
    /// Registry with the built-in `default` stages and the `noop`
    /// executor, verifier and repair.
    pub fn with_defaults() -> Self {
        Self {
            detectors: Ctors::<dyn AmbiguityCheck>::new("detector")
                .with("default", |_, _| Ok(Arc::new(AmbiguityDetector::new()))),
            planners: Ctors::<dyn PlanStage>::new("planner").with("default", |config, deps| {
                Ok(Arc::new(Planner::new(deps.llm("planner")?, config.llm_timeout())))
            }),
            generators: Ctors::<dyn GenerateStage>::new("generator").with(
                "default",
                |config, deps| {
                    Ok(Arc::new(Generator::new(deps.llm("generator")?, config.llm_timeout())))
                },
            ),
            safety: Ctors::<dyn SafetyGate>::new("safety").with("default", |config, _| {
                Ok(Arc::new(SafetyFilter::new().with_explain(config.allow_explain)))
            }),
            executors: Ctors::<dyn ExecuteStage>::new("executor")
                .with("default", |config, deps| {
                    Ok(Arc::new(
                        Executor::new(deps.db("executor")?, config.db_timeout())
                            .with_cost_guardrail(config.cost_guardrail),
                    ))
                })
                .with("noop", |_, _| Ok(Arc::new(NoopExecutor))),
            verifiers: Ctors::<dyn VerifyStage>::new("verifier")
                .with("default", |config, _| {
                    Ok(Arc::new(
                        Verifier::new().with_parse_failure_policy(config.verifier_parse_failure),
                    ))
                })
                .with("noop", |_, _| Ok(Arc::new(NoopVerifier))),
            repairs: Ctors::<dyn RepairStage>::new("repair")
                .with("default", |config, deps| {
                    Ok(Arc::new(Repair::new(deps.llm("repair")?, config.llm_timeout())))
                })
                .with("noop", |_, _| Ok(Arc::new(NoopRepair))),
        }
    }

    pub fn register_detector(&mut self, key: &str, ctor: StageCtor<dyn AmbiguityCheck>) {
        self.detectors.by_key.insert(key.to_string(), ctor);
    }

    pub fn register_planner(&mut self, key: &str, ctor: StageCtor<dyn PlanStage>) {
        self.planners.by_key.insert(key.to_string(), ctor);
    }

    pub fn register_generator(&mut self, key: &str, ctor: StageCtor<dyn GenerateStage>) {
        self.generators.by_key.insert(key.to_string(), ctor);
    }

    pub fn register_safety(&mut self, key: &str, ctor: StageCtor<dyn SafetyGate>) {
        self.safety.by_key.insert(key.to_string(), ctor);
    }

    pub fn register_executor(&mut self, key: &str, ctor: StageCtor<dyn ExecuteStage>) {
        self.executors.by_key.insert(key.to_string(), ctor);
    }

    pub fn register_verifier(&mut self, key: &str, ctor: StageCtor<dyn VerifyStage>) {
        self.verifiers.by_key.insert(key.to_string(), ctor);
    }

    pub fn register_repair(&mut self, key: &str, ctor: StageCtor<dyn RepairStage>) {
        self.repairs.by_key.insert(key.to_string(), ctor);
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Builds pipelines from configuration through a [`StageRegistry`]
#[derive(Default)]
pub struct PipelineFactory {
    registry: StageRegistry,
}

impl PipelineFactory {
    pub fn new(registry: StageRegistry) -> Self {
        Self { registry }
    }

    /// Resolve every configured stage key. Unknown keys and missing
    /// collaborators fail here, never at request time.
    pub fn from_config(&self, config: &PipelineConfig, deps: &StageDeps) -> Result<Pipeline> {
        config.validate()?;
        let r = &self.registry;

        let mut builder = PipelineBuilder::new()
            .detector(r.detectors.resolve(&config.detector, config, deps)?)
            .context(ContextEngineer::new(config.budget))
            .planner(r.planners.resolve(&config.planner, config, deps)?)
            .generator(r.generators.resolve(&config.generator, config, deps)?)
            .safety(r.safety.resolve(&config.safety, config, deps)?)
            .executor(r.executors.resolve(&config.executor, config, deps)?)
            .verifier(r.verifiers.resolve(&config.verifier, config, deps)?)
            .repair(r.repairs.resolve(&config.repair, config, deps)?)
            .metrics(Arc::clone(&deps.metrics))
            .max_repair_attempts(config.max_repair_attempts);

        if config.cache_ttl_secs > 0 {
            let cache = ResponseCache::new(config.cache_ttl(), config.cache_max_entries);
            builder = builder.cache(Arc::new(cache));
        }

        info!(
            executor = %config.executor,
            verifier = %config.verifier,
            repair = %config.repair,
            max_repair_attempts = config.max_repair_attempts,
            "Pipeline assembled from config"
        );
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::FixedProvider;

    fn deps() -> StageDeps {
        StageDeps::new().with_llm(Arc::new(FixedProvider::new()))
    }

    #[test]
    fn test_builder_requires_planner_and_generator() {
        let err = PipelineBuilder::new().build().err().unwrap();
        assert!(err.to_string().contains("planner"));
    }

    #[test]
    fn test_factory_resolves_noop_stages_without_db() {
        let config = PipelineConfig {
            executor: "noop".to_string(),
            cache_ttl_secs: 0,
            ..PipelineConfig::default()
        };
        let pipeline = PipelineFactory::default().from_config(&config, &deps()).unwrap();
        assert_eq!(pipeline.max_repair_attempts(), 2);
    }

    #[test]
    fn test_default_executor_needs_database() {
        let err = PipelineFactory::default()
            .from_config(&PipelineConfig::default(), &deps())
            .err()
            .unwrap();
        assert!(err.to_string().contains("database adapter"));
    }

    #[test]
    fn test_unknown_key_is_config_error() {
        let config = PipelineConfig {
            verifier: "strict".to_string(),
            executor: "noop".to_string(),
            ..PipelineConfig::default()
        };
        let err = PipelineFactory::default().from_config(&config, &deps()).err().unwrap();
        assert!(matches!(err, Nl2SqlError::Config(_)));
        assert!(err.to_string().contains("unknown verifier 'strict'"));
    }

    #[test]
    fn test_custom_registration() {
        let mut registry = StageRegistry::with_defaults();
        registry.register_executor("always-empty", |_, _| Ok(Arc::new(NoopExecutor)));
        let config = PipelineConfig {
            executor: "always-empty".to_string(),
            ..PipelineConfig::default()
        };
        assert!(PipelineFactory::new(registry).from_config(&config, &deps()).is_ok());
    }
}
