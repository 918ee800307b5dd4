use relay_plugin::plugin::{Phase, Plugin, PluginContext, PluginInstance, PluginResult};
use relay_plugin::transform::{apply_request_transform, TransformRule};

pub struct RequestTransformPlugin;

struct RequestTransformInstance {
    rule: TransformRule,
}

impl Plugin for RequestTransformPlugin {
    fn name(&self) -> &str {
        "request-transformer"
    }

    fn priority(&self) -> i32 {
        3000
    }

    fn phases(&self) -> &[Phase] {
        &[Phase::Rewrite]
    }

    fn configure(&self, config: &serde_json::Value) -> anyhow::Result<Box<dyn PluginInstance>> {
        let rule: TransformRule = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("request-transformer config error: {e}"))?;
        Ok(Box::new(RequestTransformInstance { rule }))
    }
}

impl PluginInstance for RequestTransformInstance {
    fn name(&self) -> &str {
        "request-transformer"
    }

    fn priority(&self) -> i32 {
        3000
    }

    fn phases(&self) -> &[Phase] {
        &[Phase::Rewrite]
    }

    fn rewrite(&self, ctx: &mut PluginContext) -> PluginResult {
        apply_request_transform(&self.rule, ctx);
        PluginResult::Continue
    }
}
