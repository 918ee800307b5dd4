//! Request/response transformation rules, applied in a fixed operation
//! order so overlapping rules (e.g. a header rename followed by a CORS
//! plugin) compose predictably regardless of how an operator lists them.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

use crate::plugin::PluginContext;

/// A single transform rule, as configured on a route or service. All
/// fields are optional — an absent field means "no operation of that
/// kind", not "clear existing state".
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TransformRule {
    /// Remap a response status code (e.g. map upstream 500 to 502).
    #[serde(default)]
    pub status_map: HashMap<u16, u16>,

    #[serde(default)]
    pub add_headers: HashMap<String, String>,
    #[serde(default)]
    pub remove_headers: Vec<String>,
    /// old-name -> new-name
    #[serde(default)]
    pub rename_headers: HashMap<String, String>,
    /// name -> literal replacement value, only applied if the header
    /// already exists.
    #[serde(default)]
    pub modify_headers: HashMap<String, String>,
    /// name -> (regex pattern, replacement), applied after `modify_headers`
    /// to headers that already exist. Invalid patterns are skipped rather
    /// than rejecting the whole rule.
    #[serde(default)]
    pub modify_headers_regex: HashMap<String, (String, String)>,

    #[serde(default)]
    pub cors: Option<CorsRule>,

    /// status -> body template (supports `{status}` / `{message}` placeholders)
    #[serde(default)]
    pub error_templates: HashMap<u16, String>,

    #[serde(default)]
    pub add_query_params: HashMap<String, String>,
    #[serde(default)]
    pub remove_query_params: Vec<String>,
    #[serde(default)]
    pub modify_query_params: HashMap<String, String>,

    /// Regex (or literal prefix) -> replacement for the request path.
    #[serde(default)]
    pub path_rewrite: Option<PathRewrite>,

    #[serde(default)]
    pub body_transform: Option<BodyTransform>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorsRule {
    pub allow_origin: String,
    #[serde(default)]
    pub allow_methods: Option<String>,
    #[serde(default)]
    pub allow_headers: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathRewrite {
    pub from_prefix: String,
    pub to_prefix: String,
}

/// Body rewriting for structured payloads. `Json` adds/removes top-level
/// keys on an object body; `FormToJson` parses `application/x-www-form-
/// urlencoded` into a JSON object (and vice versa for `JsonToForm`).
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BodyTransform {
    Json {
        #[serde(default)]
        add_fields: HashMap<String, Value>,
        #[serde(default)]
        remove_fields: Vec<String>,
    },
    FormToJson,
    JsonToForm,
}

/// Apply the request-side subset of a rule: query params, then path
/// rewrite. (Header ops are shared with the response side via
/// [`apply_header_ops`] and are applied to the request separately by the
/// caller when used in the Rewrite phase.)
pub fn apply_request_transform(rule: &TransformRule, ctx: &mut PluginContext) {
    apply_header_ops(rule, &mut ctx.request_headers);

    if !rule.add_query_params.is_empty()
        || !rule.remove_query_params.is_empty()
        || !rule.modify_query_params.is_empty()
    {
        ctx.request_query = apply_query_ops(rule, &ctx.request_query);
    }

    if let Some(rewrite) = &rule.path_rewrite {
        if let Some(rest) = ctx.request_path.strip_prefix(rewrite.from_prefix.as_str()) {
            ctx.request_path = format!("{}{}", rewrite.to_prefix, rest);
        }
    }

    if let Some(bt) = &rule.body_transform {
        if let Some(body) = ctx.request_body.take() {
            ctx.request_body = Some(apply_body_transform(bt, body));
        }
    }
}

/// Apply the response-side subset of a rule, in spec order: status remap
/// → header ops → CORS → error template → body transform.
pub fn apply_response_transform(rule: &TransformRule, ctx: &mut PluginContext) {
    if let Some(status) = ctx.response_status {
        if let Some(mapped) = rule.status_map.get(&status) {
            ctx.response_status = Some(*mapped);
        }
    }

    apply_header_ops(rule, &mut ctx.response_headers);

    if let Some(cors) = &rule.cors {
        ctx.response_headers.insert(
            "access-control-allow-origin".to_string(),
            cors.allow_origin.clone(),
        );
        if let Some(methods) = &cors.allow_methods {
            ctx.response_headers.insert(
                "access-control-allow-methods".to_string(),
                methods.clone(),
            );
        }
        if let Some(headers) = &cors.allow_headers {
            ctx.response_headers.insert(
                "access-control-allow-headers".to_string(),
                headers.clone(),
            );
        }
    }

    if let Some(status) = ctx.response_status {
        if let Some(template) = rule.error_templates.get(&status) {
            let message = status_message(status);
            let rendered = template
                .replace("{status}", &status.to_string())
                .replace("{message}", message);
            ctx.response_body = Some(rendered.into_bytes());
            ctx.response_headers
                .insert("content-type".to_string(), "application/json".to_string());
        }
    }

    if let Some(bt) = &rule.body_transform {
        if let Some(body) = ctx.response_body.take() {
            ctx.response_body = Some(apply_body_transform(bt, body));
        }
    }
}

/// Fixed order per spec: add -> remove (wildcard) -> rename -> modify.
fn apply_header_ops(rule: &TransformRule, headers: &mut HashMap<String, String>) {
    for (name, value) in &rule.add_headers {
        headers.insert(name.clone(), value.clone());
    }
    for name in &rule.remove_headers {
        if name == "*" {
            headers.clear();
        } else {
            remove_header_ci(headers, name);
        }
    }
    for (old_name, new_name) in &rule.rename_headers {
        if let Some(value) = remove_header_ci(headers, old_name) {
            headers.insert(new_name.clone(), value);
        }
    }
    for (name, value) in &rule.modify_headers {
        if get_header_ci(headers, name).is_some() {
            remove_header_ci(headers, name);
            headers.insert(name.clone(), value.clone());
        }
    }
    for (name, (pattern, replacement)) in &rule.modify_headers_regex {
        let Some(current) = get_header_ci(headers, name).cloned() else {
            continue;
        };
        let Ok(re) = regex::Regex::new(pattern) else {
            continue;
        };
        let replaced = re.replace_all(&current, replacement.as_str()).into_owned();
        remove_header_ci(headers, name);
        headers.insert(name.clone(), replaced);
    }
}

fn get_header_ci<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a String> {
    let lower = name.to_ascii_lowercase();
    headers
        .iter()
        .find(|(k, _)| k.to_ascii_lowercase() == lower)
        .map(|(_, v)| v)
}

fn remove_header_ci(headers: &mut HashMap<String, String>, name: &str) -> Option<String> {
    let lower = name.to_ascii_lowercase();
    let key = headers
        .keys()
        .find(|k| k.to_ascii_lowercase() == lower)
        .cloned()?;
    headers.remove(&key)
}

fn apply_query_ops(rule: &TransformRule, query: &str) -> String {
    let mut params: Vec<(String, String)> = query
        .split('&')
        .filter(|s| !s.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect();

    params.retain(|(k, _)| !rule.remove_query_params.iter().any(|r| r == k));

    for (k, v) in &rule.modify_query_params {
        if let Some(entry) = params.iter_mut().find(|(pk, _)| pk == k) {
            entry.1 = v.clone();
        }
    }
    for (k, v) in &rule.add_query_params {
        if !params.iter().any(|(pk, _)| pk == k) {
            params.push((k.clone(), v.clone()));
        }
    }

    params
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn apply_body_transform(bt: &BodyTransform, body: Vec<u8>) -> Vec<u8> {
    match bt {
        BodyTransform::Json {
            add_fields,
            remove_fields,
        } => {
            let Ok(mut value) = serde_json::from_slice::<Value>(&body) else {
                return body;
            };
            if let Value::Object(map) = &mut value {
                for field in remove_fields {
                    map.remove(field);
                }
                for (k, v) in add_fields {
                    map.insert(k.clone(), v.clone());
                }
            }
            serde_json::to_vec(&value).unwrap_or(body)
        }
        BodyTransform::FormToJson => {
            let text = String::from_utf8_lossy(&body);
            let mut map = serde_json::Map::new();
            for pair in text.split('&').filter(|s| !s.is_empty()) {
                let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
                map.insert(k.to_string(), Value::String(v.to_string()));
            }
            serde_json::to_vec(&Value::Object(map)).unwrap_or(body)
        }
        BodyTransform::JsonToForm => {
            let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(&body) else {
                return body;
            };
            map.iter()
                .map(|(k, v)| {
                    let v = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    format!("{k}={v}")
                })
                .collect::<Vec<_>>()
                .join("&")
                .into_bytes()
        }
    }
}

fn status_message(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ctx() -> PluginContext {
        PluginContext::new(
            "GET".into(),
            "/api/users?page=1".into(),
            HashMap::new(),
            "127.0.0.1".into(),
            "r1".into(),
        )
    }

    #[test]
    fn header_ops_apply_add_remove_rename_modify() {
        let mut c = ctx();
        c.request_headers.insert("x-old".into(), "v".into());
        c.request_headers.insert("x-keep".into(), "1".into());

        let mut rule = TransformRule::default();
        rule.add_headers.insert("x-new".into(), "added".into());
        rule.remove_headers.push("x-keep".into());
        rule.rename_headers.insert("x-old".into(), "x-renamed".into());

        apply_request_transform(&rule, &mut c);

        assert_eq!(c.request_headers.get("x-new").map(String::as_str), Some("added"));
        assert!(!c.request_headers.contains_key("x-keep"));
        assert_eq!(
            c.request_headers.get("x-renamed").map(String::as_str),
            Some("v")
        );
        assert!(!c.request_headers.contains_key("x-old"));
    }

    #[test]
    fn remove_headers_wildcard_clears_everything() {
        let mut c = ctx();
        c.request_headers.insert("x-a".into(), "1".into());
        c.request_headers.insert("x-b".into(), "2".into());
        let mut rule = TransformRule::default();
        rule.remove_headers.push("*".into());
        rule.add_headers.insert("x-new".into(), "kept".into());

        apply_request_transform(&rule, &mut c);

        // add runs before remove, so a wildcard remove clears it too.
        assert!(c.request_headers.is_empty());
    }

    #[test]
    fn add_then_remove_order_means_add_can_be_removed() {
        let mut c = ctx();
        let mut rule = TransformRule::default();
        rule.add_headers.insert("x-temp".into(), "v".into());
        rule.remove_headers.push("x-temp".into());

        apply_request_transform(&rule, &mut c);

        assert!(!c.request_headers.contains_key("x-temp"));
    }

    #[test]
    fn modify_headers_regex_rewrites_existing_value() {
        let mut c = ctx();
        c.request_headers.insert("x-trace".into(), "req-12345".into());
        let mut rule = TransformRule::default();
        rule.modify_headers_regex
            .insert("x-trace".into(), (r"\d+".into(), "REDACTED".into()));

        apply_request_transform(&rule, &mut c);

        assert_eq!(
            c.request_headers.get("x-trace").map(String::as_str),
            Some("req-REDACTED")
        );
    }

    #[test]
    fn modify_headers_only_touches_existing() {
        let mut c = ctx();
        c.request_headers.insert("host".into(), "a.com".into());
        let mut rule = TransformRule::default();
        rule.modify_headers.insert("host".into(), "b.com".into());
        rule.modify_headers.insert("absent".into(), "x".into());

        apply_request_transform(&rule, &mut c);

        assert_eq!(c.request_headers.get("host").map(String::as_str), Some("b.com"));
        assert!(!c.request_headers.contains_key("absent"));
    }

    #[test]
    fn query_params_add_remove_modify() {
        let mut c = ctx();
        let mut rule = TransformRule::default();
        rule.add_query_params.insert("limit".into(), "10".into());
        rule.modify_query_params.insert("page".into(), "2".into());

        apply_request_transform(&rule, &mut c);

        assert!(c.request_query.contains("page=2"));
        assert!(c.request_query.contains("limit=10"));
    }

    #[test]
    fn path_rewrite_replaces_matching_prefix() {
        let mut c = ctx();
        c.request_path = "/v1/users/42".into();
        let mut rule = TransformRule::default();
        rule.path_rewrite = Some(PathRewrite {
            from_prefix: "/v1".into(),
            to_prefix: "/internal/v1".into(),
        });

        apply_request_transform(&rule, &mut c);

        assert_eq!(c.request_path, "/internal/v1/users/42");
    }

    #[test]
    fn status_map_remaps_response_status() {
        let mut c = ctx();
        c.response_status = Some(500);
        let mut rule = TransformRule::default();
        rule.status_map.insert(500, 502);

        apply_response_transform(&rule, &mut c);

        assert_eq!(c.response_status, Some(502));
    }

    #[test]
    fn error_template_renders_placeholders() {
        let mut c = ctx();
        c.response_status = Some(404);
        let mut rule = TransformRule::default();
        rule.error_templates
            .insert(404, r#"{"code":{status},"msg":"{message}"}"#.into());

        apply_response_transform(&rule, &mut c);

        let body = String::from_utf8(c.response_body.unwrap()).unwrap();
        assert_eq!(body, r#"{"code":404,"msg":"Not Found"}"#);
    }

    #[test]
    fn cors_rule_sets_response_headers() {
        let mut c = ctx();
        let mut rule = TransformRule::default();
        rule.cors = Some(CorsRule {
            allow_origin: "*".into(),
            allow_methods: Some("GET, POST".into()),
            allow_headers: None,
        });

        apply_response_transform(&rule, &mut c);

        assert_eq!(
            c.response_headers.get("access-control-allow-origin").map(String::as_str),
            Some("*")
        );
        assert_eq!(
            c.response_headers
                .get("access-control-allow-methods")
                .map(String::as_str),
            Some("GET, POST")
        );
    }

    #[test]
    fn json_body_transform_adds_and_removes_fields() {
        let mut rule = TransformRule::default();
        rule.body_transform = Some(BodyTransform::Json {
            add_fields: HashMap::from([("injected".to_string(), Value::Bool(true))]),
            remove_fields: vec!["secret".to_string()],
        });

        let mut c = ctx();
        c.response_status = Some(200);
        c.response_body = Some(br#"{"secret":"x","keep":1}"#.to_vec());

        apply_response_transform(&rule, &mut c);

        let v: Value = serde_json::from_slice(&c.response_body.unwrap()).unwrap();
        assert_eq!(v["injected"], Value::Bool(true));
        assert_eq!(v["keep"], 1);
        assert!(v.get("secret").is_none());
    }

    #[test]
    fn form_to_json_transform_converts_body() {
        let mut rule = TransformRule::default();
        rule.body_transform = Some(BodyTransform::FormToJson);

        let mut c = ctx();
        c.request_body = Some(b"a=1&b=2".to_vec());

        apply_request_transform(&rule, &mut c);

        let v: Value = serde_json::from_slice(c.request_body.as_ref().unwrap()).unwrap();
        assert_eq!(v["a"], "1");
        assert_eq!(v["b"], "2");
    }
}
