use crate::plugin::{Phase, PluginContext, PluginInstance, PluginResult};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

/// The plugin execution pipeline for one route.
///
/// Built once per distinct route config and cached by `ProxyWorker`
/// (see `relay-proxy::proxy::get_or_build_pipeline`). Plugins run
/// synchronously on the monoio worker thread — no async overhead.
pub struct PluginPipeline {
    /// Instances bucketed by phase, sorted by descending priority.
    phases: HashMap<Phase, Vec<Arc<dyn PluginInstance>>>,
    has_auth: bool,
}

impl PluginPipeline {
    /// Build a pipeline from already-configured instances.
    ///
    /// `has_auth` is precomputed by the caller (it already knows which
    /// plugin names are auth plugins) so the pipeline itself stays
    /// agnostic to plugin identity beyond name/priority/phases.
    pub fn build(mut instances: Vec<Arc<dyn PluginInstance>>, has_auth: bool) -> Self {
        instances.sort_by(|a, b| b.priority().cmp(&a.priority()));

        let mut phases: HashMap<Phase, Vec<Arc<dyn PluginInstance>>> = HashMap::new();
        for instance in instances {
            for phase in instance.phases() {
                phases.entry(*phase).or_default().push(Arc::clone(&instance));
            }
        }

        Self { phases, has_auth }
    }

    /// Whether this pipeline carries an auth plugin (key-auth, jwt-auth,
    /// basic-auth). Consulted by the proxy to decide whether a consumer
    /// lookup is needed after the access phase.
    pub fn has_auth_plugins(&self) -> bool {
        self.has_auth
    }

    /// Execute every instance registered for `phase`, in priority order.
    /// Short-circuits on the first non-`Continue` result.
    pub fn execute_phase(&self, phase: Phase, ctx: &mut PluginContext) -> PluginResult {
        let Some(plugins) = self.phases.get(&phase) else {
            return PluginResult::Continue;
        };

        for instance in plugins {
            debug!(plugin = %instance.name(), phase = %phase, "Executing plugin");

            let result = match phase {
                Phase::Rewrite => instance.rewrite(ctx),
                Phase::Access => instance.access(ctx),
                Phase::BeforeProxy => instance.before_proxy(ctx),
                Phase::HeaderFilter => instance.header_filter(ctx),
                Phase::BodyFilter => instance.body_filter(ctx),
                Phase::Log => {
                    instance.log(ctx);
                    PluginResult::Continue
                }
            };

            match result {
                PluginResult::Continue => {}
                PluginResult::Response { status, headers, body } => {
                    debug!(plugin = %instance.name(), phase = %phase, status, "Plugin short-circuited with response");
                    return PluginResult::Response { status, headers, body };
                }
                PluginResult::Error(msg) => {
                    error!(plugin = %instance.name(), phase = %phase, error = %msg, "Plugin execution error");
                    return PluginResult::Error(msg);
                }
            }
        }

        PluginResult::Continue
    }

    /// Execute all pre-proxy phases in order: Rewrite -> Access -> BeforeProxy.
    pub fn execute_request_phases(&self, ctx: &mut PluginContext) -> PluginResult {
        for phase in &[Phase::Rewrite, Phase::Access, Phase::BeforeProxy] {
            match self.execute_phase(*phase, ctx) {
                PluginResult::Continue => {}
                other => return other,
            }
        }
        PluginResult::Continue
    }

    /// Execute response phases: HeaderFilter -> BodyFilter.
    pub fn execute_response_phases(&self, ctx: &mut PluginContext) -> PluginResult {
        for phase in &[Phase::HeaderFilter, Phase::BodyFilter] {
            match self.execute_phase(*phase, ctx) {
                PluginResult::Continue => {}
                other => return other,
            }
        }
        PluginResult::Continue
    }

    /// Execute the log phase (always runs, fire-and-forget).
    pub fn execute_log_phase(&self, ctx: &mut PluginContext) {
        if let Some(plugins) = self.phases.get(&Phase::Log) {
            for instance in plugins {
                instance.log(ctx);
            }
        }
    }

    /// Get the number of plugin instances across all phases (an instance
    /// registered under N phases counts N times).
    pub fn plugin_count(&self) -> usize {
        self.phases.values().map(|v| v.len()).sum()
    }
}
