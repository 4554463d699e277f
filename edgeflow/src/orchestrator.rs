//! The explicitly constructed context owning every component.

use crate::api::{OperationHandler, OperationRegistry};
use crate::cache::{InvalidationRules, SmartCache};
use crate::changelist::{ChangelistProtocol, TransactionManager};
use crate::coalesce::RequestCoalescer;
use crate::config::EdgeflowConfig;
use crate::context::{TenantId, TenantResolver};
use crate::errors::{EdgeflowError, ValidationError};
use crate::recovery::ErrorClassifier;
use crate::runner::OperationRunner;
use crate::workflow::{
    build_plan, ExecutionPlan, TemplateRegistry, WorkflowExecutor, WorkflowOptions,
    WorkflowResult, WorkflowTemplate,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Builder for [`Orchestrator`].
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: EdgeflowConfig,
    protocol: Option<Arc<dyn ChangelistProtocol>>,
    classifier: Option<Arc<ErrorClassifier>>,
    tenant_resolver: Option<Arc<dyn TenantResolver>>,
    registry: Option<Arc<OperationRegistry>>,
    rules: Option<InvalidationRules>,
}

impl OrchestratorBuilder {
    /// Sets the configuration.
    #[must_use]
    pub fn with_config(mut self, config: EdgeflowConfig) -> Self {
        self.config = config;
        self
    }

    /// Enables changelist transactions over `protocol`.
    #[must_use]
    pub fn with_changelist_protocol(mut self, protocol: Arc<dyn ChangelistProtocol>) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Replaces the default classifier.
    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<ErrorClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Sets the fallback tenant source.
    #[must_use]
    pub fn with_tenant_resolver(mut self, resolver: Arc<dyn TenantResolver>) -> Self {
        self.tenant_resolver = Some(resolver);
        self
    }

    /// Shares an existing operation registry.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<OperationRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Replaces the default cache invalidation rules.
    #[must_use]
    pub fn with_invalidation_rules(mut self, rules: InvalidationRules) -> Self {
        self.rules = Some(rules);
        self
    }

    /// Wires the components together.
    #[must_use]
    pub fn build(self) -> Orchestrator {
        let config = self.config;
        let classifier = self
            .classifier
            .unwrap_or_else(|| Arc::new(ErrorClassifier::with_defaults(&config.recovery)));
        let registry = self.registry.unwrap_or_default();

        let mut cache = SmartCache::from_config(&config.cache);
        if let Some(rules) = self.rules {
            cache = cache.with_rules(rules);
        }
        let cache = Arc::new(cache);
        let coalescer = Arc::new(RequestCoalescer::from_config(&config.coalescer));
        let runner = OperationRunner::new(Arc::clone(&registry), Arc::clone(&cache), Arc::clone(&coalescer));

        let transactions = self.protocol.map(|protocol| {
            Arc::new(TransactionManager::new(
                protocol,
                Arc::clone(&classifier),
                &config.changelist,
            ))
        });

        let mut executor =
            WorkflowExecutor::new(runner.clone(), Arc::clone(&classifier), config.workflow.clone());
        if let Some(manager) = &transactions {
            executor = executor.with_transactions(Arc::clone(manager));
        }

        tracing::debug!(
            changelists = transactions.is_some(),
            cache_capacity = cache.capacity(),
            "Orchestrator built"
        );

        Orchestrator {
            config,
            registry,
            templates: Arc::new(TemplateRegistry::new()),
            cache,
            coalescer,
            classifier,
            transactions,
            runner,
            executor,
            tenant_resolver: self.tenant_resolver,
        }
    }
}

/// Owns one instance of each component and exposes the single-operation
/// and workflow paths.
pub struct Orchestrator {
    config: EdgeflowConfig,
    registry: Arc<OperationRegistry>,
    templates: Arc<TemplateRegistry>,
    cache: Arc<SmartCache>,
    coalescer: Arc<RequestCoalescer>,
    classifier: Arc<ErrorClassifier>,
    transactions: Option<Arc<TransactionManager>>,
    runner: OperationRunner,
    executor: WorkflowExecutor,
    tenant_resolver: Option<Arc<dyn TenantResolver>>,
}

impl Orchestrator {
    /// Starts a builder.
    #[must_use]
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    /// An orchestrator with `config` and no changelist protocol.
    #[must_use]
    pub fn new(config: EdgeflowConfig) -> Self {
        Self::builder().with_config(config).build()
    }

    /// Registers an operation handler.
    pub fn register_operation(&self, handler: Arc<dyn OperationHandler>) {
        self.registry.register(handler);
    }

    /// Registers a workflow template.
    pub fn register_template(&self, template: WorkflowTemplate) {
        self.templates.register(template);
    }

    /// Parses and registers a JSON template, returning its name.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed JSON.
    pub fn load_template_json(&self, json: &str) -> Result<String, EdgeflowError> {
        Ok(self.templates.load_json(json)?)
    }

    /// Builds the plan a registered template would run with `params`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an unknown template, otherwise
    /// whatever [`build_plan`] rejects.
    pub fn build_plan(
        &self,
        template: &str,
        params: &serde_json::Value,
    ) -> Result<ExecutionPlan, EdgeflowError> {
        let template = self.template(template)?;
        build_plan(&template, params)
    }

    /// Runs a registered template.
    ///
    /// Task failures are reported inside the [`WorkflowResult`].
    ///
    /// # Errors
    ///
    /// Fails before any task runs when the template is unknown, the plan is
    /// invalid, or no tenant can be resolved.
    pub async fn execute(
        &self,
        template: &str,
        params: serde_json::Value,
        options: WorkflowOptions,
    ) -> Result<WorkflowResult, EdgeflowError> {
        let template = self.template(template)?;
        self.execute_template(&template, params, options).await
    }

    /// Runs an unregistered template.
    ///
    /// # Errors
    ///
    /// See [`Orchestrator::execute`].
    pub async fn execute_template(
        &self,
        template: &WorkflowTemplate,
        params: serde_json::Value,
        options: WorkflowOptions,
    ) -> Result<WorkflowResult, EdgeflowError> {
        let tenant = self.resolve_tenant(options.tenant.as_ref())?;
        let plan = build_plan(template, &params)?;
        Ok(self.executor.execute(&plan, &tenant, &options).await)
    }

    /// Runs one operation through coalescer and cache.
    ///
    /// # Errors
    ///
    /// Returns the handler's error, or a validation error for an unknown
    /// operation.
    pub async fn run_operation(
        &self,
        tenant: &TenantId,
        operation: &str,
        params: serde_json::Value,
    ) -> Result<Arc<serde_json::Value>, EdgeflowError> {
        self.runner.run(tenant, operation, params).await
    }

    /// Picks `explicit`, else the resolver's tenant.
    ///
    /// # Errors
    ///
    /// Returns a validation error when neither yields a tenant.
    pub fn resolve_tenant(&self, explicit: Option<&TenantId>) -> Result<TenantId, EdgeflowError> {
        explicit
            .cloned()
            .or_else(|| self.tenant_resolver.as_ref().and_then(|r| r.current_tenant()))
            .ok_or_else(|| ValidationError::new("No tenant given and none could be resolved").into())
    }

    /// Spawns a loop that expires overdue transactions and purges terminal
    /// ones every `every`. Returns `None` without a changelist protocol.
    pub fn spawn_sweeper(&self, every: Duration) -> Option<JoinHandle<()>> {
        let manager = Arc::clone(self.transactions.as_ref()?);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.sweep_expired().await;
                let purged = manager.purge_terminal().await;
                if purged > 0 {
                    tracing::debug!(purged, "Purged terminal changelist transactions");
                }
            }
        }))
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &EdgeflowConfig {
        &self.config
    }

    /// Operation registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    /// Template registry.
    #[must_use]
    pub fn templates(&self) -> &Arc<TemplateRegistry> {
        &self.templates
    }

    /// Shared cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<SmartCache> {
        &self.cache
    }

    /// Shared coalescer.
    #[must_use]
    pub fn coalescer(&self) -> &Arc<RequestCoalescer> {
        &self.coalescer
    }

    /// Error classifier.
    #[must_use]
    pub fn classifier(&self) -> &Arc<ErrorClassifier> {
        &self.classifier
    }

    /// Transaction manager, when a changelist protocol is configured.
    #[must_use]
    pub fn transactions(&self) -> Option<&Arc<TransactionManager>> {
        self.transactions.as_ref()
    }

    fn template(&self, name: &str) -> Result<Arc<WorkflowTemplate>, EdgeflowError> {
        self.templates
            .get(name)
            .ok_or_else(|| ValidationError::new(format!("Unknown workflow template '{name}'")).into())
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("operations", &self.registry.names())
            .field("templates", &self.templates.names())
            .field("cache", &self.cache)
            .field("coalescer", &self.coalescer)
            .field("transactions", &self.transactions)
            .finish_non_exhaustive()
    }
}
