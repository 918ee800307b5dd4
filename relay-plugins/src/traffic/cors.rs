use relay_plugin::plugin::{Phase, Plugin, PluginContext, PluginInstance, PluginResult};
use serde::Deserialize;

pub struct CorsPlugin;

#[derive(Debug, Deserialize, Clone)]
struct CorsConfig {
    #[serde(default = "default_allow_origins")]
    allow_origins: Vec<String>,
    #[serde(default = "default_allow_methods")]
    allow_methods: Vec<String>,
    #[serde(default = "default_allow_headers")]
    allow_headers: Vec<String>,
    #[serde(default)]
    allow_credentials: bool,
    #[serde(default = "default_max_age")]
    max_age: u32,
}

fn default_allow_origins() -> Vec<String> {
    vec!["*".to_string()]
}
fn default_allow_methods() -> Vec<String> {
    vec![
        "GET".to_string(),
        "POST".to_string(),
        "PUT".to_string(),
        "DELETE".to_string(),
        "OPTIONS".to_string(),
    ]
}
fn default_allow_headers() -> Vec<String> {
    vec!["*".to_string()]
}
fn default_max_age() -> u32 {
    5
}

struct CorsInstance {
    cfg: CorsConfig,
}

impl Plugin for CorsPlugin {
    fn name(&self) -> &str {
        "cors"
    }

    fn priority(&self) -> i32 {
        2000
    }

    fn phases(&self) -> &[Phase] {
        &[Phase::Access]
    }

    fn configure(&self, config: &serde_json::Value) -> anyhow::Result<Box<dyn PluginInstance>> {
        let cfg: CorsConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("cors config error: {e}"))?;
        Ok(Box::new(CorsInstance { cfg }))
    }
}

impl CorsInstance {
    /// Returns the matched origin string, or None if origin is disallowed.
    fn resolve_origin(&self, origin: &str) -> Option<String> {
        if self.cfg.allow_origins.iter().any(|o| o == "*") {
            return Some("*".to_string());
        }
        if self.cfg.allow_origins.iter().any(|o| o == origin) {
            return Some(origin.to_string());
        }
        None
    }

    fn cors_headers(&self, origin_value: &str) -> Vec<(String, String)> {
        let mut h = vec![
            (
                "access-control-allow-origin".to_string(),
                origin_value.to_string(),
            ),
            (
                "access-control-allow-methods".to_string(),
                self.cfg.allow_methods.join(", "),
            ),
            (
                "access-control-allow-headers".to_string(),
                self.cfg.allow_headers.join(", "),
            ),
            (
                "access-control-max-age".to_string(),
                self.cfg.max_age.to_string(),
            ),
        ];
        if self.cfg.allow_credentials {
            h.push((
                "access-control-allow-credentials".to_string(),
                "true".to_string(),
            ));
        }
        h
    }
}

impl PluginInstance for CorsInstance {
    fn name(&self) -> &str {
        "cors"
    }

    fn priority(&self) -> i32 {
        2000
    }

    fn access(&self, ctx: &mut PluginContext) -> PluginResult {
        let origin = match ctx.request_headers.get("origin") {
            Some(o) => o.clone(),
            None => return PluginResult::Continue, // not a CORS request
        };

        let resolved = match self.resolve_origin(&origin) {
            Some(o) => o,
            None => {
                return PluginResult::Response {
                    status: 403,
                    headers: vec![("content-type".to_string(), "application/json".to_string())],
                    body: Some(
                        br#"{"error":"Forbidden - origin not allowed","status":403}"#.to_vec(),
                    ),
                };
            }
        };

        // Preflight
        if ctx.request_method == "OPTIONS" {
            let mut headers = self.cors_headers(&resolved);
            headers.push(("content-length".to_string(), "0".to_string()));
            return PluginResult::Response {
                status: 204,
                headers,
                body: None,
            };
        }

        // Add CORS headers to context variables for response phase (simple request)
        for (k, v) in self.cors_headers(&resolved) {
            ctx.vars
                .insert(format!("_cors_{k}"), serde_json::Value::String(v));
        }

        PluginResult::Continue
    }
}
