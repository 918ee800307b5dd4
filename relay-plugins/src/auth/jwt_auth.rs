use relay_plugin::plugin::{Phase, Plugin, PluginContext, PluginInstance, PluginResult};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

pub struct JwtAuthPlugin;

#[derive(Debug, Deserialize)]
struct JwtAuthConfig {
    /// Secret for HMAC algorithms (HS256 / HS384 / HS512).
    #[serde(default)]
    secret: Option<String>,
    /// PEM/DER public key for RS/EC algorithms.
    #[serde(default)]
    public_key: Option<String>,
    /// Algorithm — default "HS256".
    #[serde(default = "default_algorithm")]
    algorithm: String,
    /// Header that carries the token — default "authorization".
    #[serde(default = "default_header")]
    header: String,
}

fn default_algorithm() -> String {
    "HS256".to_string()
}
fn default_header() -> String {
    "authorization".to_string()
}

/// Minimal JWT claims we extract.
#[derive(Debug, Serialize, Deserialize, Clone)]
struct Claims {
    sub: Option<String>,
    exp: Option<u64>,
    #[serde(flatten)]
    extra: std::collections::HashMap<String, serde_json::Value>,
}

struct JwtAuthInstance {
    decoding_key: DecodingKey,
    validation: Validation,
    header: String,
}

impl Plugin for JwtAuthPlugin {
    fn name(&self) -> &str {
        "jwt-auth"
    }

    fn priority(&self) -> i32 {
        2510
    }

    fn phases(&self) -> &[Phase] {
        &[Phase::Access]
    }

    fn configure(&self, config: &serde_json::Value) -> anyhow::Result<Box<dyn PluginInstance>> {
        let cfg: JwtAuthConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("jwt-auth config error: {e}"))?;

        let algorithm: Algorithm = cfg
            .algorithm
            .parse()
            .map_err(|_| anyhow::anyhow!("unknown JWT algorithm: {}", cfg.algorithm))?;

        let decoding_key = match algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                let secret = cfg
                    .secret
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("jwt-auth requires 'secret' for HMAC algorithms"))?;
                DecodingKey::from_secret(secret.as_bytes())
            }
            _ => {
                let key = cfg
                    .public_key
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("jwt-auth requires 'public_key' for asymmetric algorithms"))?;
                DecodingKey::from_rsa_pem(key.as_bytes())
                    .map_err(|e| anyhow::anyhow!("invalid public key: {e}"))?
            }
        };

        let mut validation = Validation::new(algorithm);
        validation.validate_exp = true;

        Ok(Box::new(JwtAuthInstance {
            decoding_key,
            validation,
            header: cfg.header.to_lowercase(),
        }))
    }
}

impl PluginInstance for JwtAuthInstance {
    fn name(&self) -> &str {
        "jwt-auth"
    }

    fn priority(&self) -> i32 {
        2510
    }

    fn access(&self, ctx: &mut PluginContext) -> PluginResult {
        let raw_header = match ctx.request_headers.get(&self.header) {
            Some(h) => h.clone(),
            None => {
                return deny_401(br#"{"error":"Missing Authorization header","status":401}"#);
            }
        };

        let token = if raw_header.to_lowercase().starts_with("bearer ") {
            raw_header[7..].trim()
        } else {
            raw_header.trim()
        };

        let data = match decode::<Claims>(token, &self.decoding_key, &self.validation) {
            Ok(d) => d,
            Err(e) => {
                let msg = format!(
                    "{{\"error\":\"Invalid token: {}\",\"status\":401}}",
                    e.to_string().replace('"', "'")
                );
                return PluginResult::Response {
                    status: 401,
                    headers: vec![
                        ("content-type".to_string(), "application/json".to_string()),
                        ("www-authenticate".to_string(), "Bearer".to_string()),
                    ],
                    body: Some(msg.into_bytes()),
                };
            }
        };

        if let Some(sub) = data.claims.sub {
            ctx.vars.insert("_jwt_sub".to_string(), serde_json::Value::String(sub));
        }

        PluginResult::Continue
    }
}

fn deny_401(body: &'static [u8]) -> PluginResult {
    PluginResult::Response {
        status: 401,
        headers: vec![
            ("content-type".to_string(), "application/json".to_string()),
            ("www-authenticate".to_string(), "Bearer".to_string()),
        ],
        body: Some(body.to_vec()),
    }
}
