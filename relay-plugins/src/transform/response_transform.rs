use relay_plugin::plugin::{Phase, Plugin, PluginContext, PluginInstance, PluginResult};
use relay_plugin::transform::{apply_response_transform, TransformRule};

pub struct ResponseTransformPlugin;

struct ResponseTransformInstance {
    rule: TransformRule,
}

impl Plugin for ResponseTransformPlugin {
    fn name(&self) -> &str {
        "response-transformer"
    }

    fn priority(&self) -> i32 {
        1000
    }

    fn phases(&self) -> &[Phase] {
        &[Phase::HeaderFilter, Phase::BodyFilter]
    }

    fn configure(&self, config: &serde_json::Value) -> anyhow::Result<Box<dyn PluginInstance>> {
        let rule: TransformRule = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("response-transformer config error: {e}"))?;
        Ok(Box::new(ResponseTransformInstance { rule }))
    }
}

impl PluginInstance for ResponseTransformInstance {
    fn name(&self) -> &str {
        "response-transformer"
    }

    fn priority(&self) -> i32 {
        1000
    }

    fn phases(&self) -> &[Phase] {
        &[Phase::HeaderFilter, Phase::BodyFilter]
    }

    // Status remap, header ops, CORS and error-template substitution all
    // need to land before body filtering can see the final status, so they
    // all run in header_filter; body_filter only carries the body-shaped
    // ops forward (error templates already ran if they applied).
    fn header_filter(&self, ctx: &mut PluginContext) -> PluginResult {
        apply_response_transform(&self.rule, ctx);
        PluginResult::Continue
    }

    fn body_filter(&self, _ctx: &mut PluginContext) -> PluginResult {
        PluginResult::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ctx_with_status(status: u16) -> PluginContext {
        let mut ctx = PluginContext::new(
            "GET".into(),
            "/api".into(),
            HashMap::new(),
            "127.0.0.1".into(),
            "r1".into(),
        );
        ctx.response_status = Some(status);
        ctx
    }

    #[test]
    fn header_filter_remaps_status_and_adds_header() {
        let cfg = serde_json::json!({
            "status_map": {"500": 502},
            "add_headers": {"x-proxied-by": "relay"}
        });
        let instance = ResponseTransformPlugin.configure(&cfg).unwrap();
        let mut ctx = ctx_with_status(500);
        let result = instance.header_filter(&mut ctx);
        assert!(matches!(result, PluginResult::Continue));
        assert_eq!(ctx.response_status, Some(502));
        assert_eq!(
            ctx.response_headers.get("x-proxied-by").map(String::as_str),
            Some("relay")
        );
    }

    #[test]
    fn plugin_runs_in_both_response_phases() {
        assert_eq!(
            ResponseTransformPlugin.phases(),
            &[Phase::HeaderFilter, Phase::BodyFilter]
        );
    }
}
