use std::collections::HashMap;
use std::time::Duration;

use identity::logic::permission::PermissionBit;
use identity::repository::PermissionBits;
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use shared::error::BridgeError;
use utoipa::ToSchema;

/// Operation class of a tool; decides the permission bit, cacheability and
/// retry eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Read,
    Write,
    Meta,
}

impl ToolKind {
    pub fn required_bit(&self) -> PermissionBit {
        match self {
            ToolKind::Read => PermissionBit::Read,
            ToolKind::Write => PermissionBit::Write,
            ToolKind::Meta => PermissionBit::Execute,
        }
    }

    pub fn is_cacheable(&self) -> bool {
        matches!(self, ToolKind::Read)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ToolKind::Read)
    }
}

/// A concrete HTTP request against the hub's REST API.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamRequest {
    pub method: http::Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
}

type BuildFn = fn(&serde_json::Value) -> Result<UpstreamRequest, BridgeError>;
type PostProcessFn = fn(serde_json::Value, &serde_json::Value) -> serde_json::Value;

pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: ToolKind,
    pub input_schema: serde_json::Value,
    /// Per-tool TTL override; `None` uses the cache default.
    pub cache_ttl: Option<Duration>,
    /// Read tools whose cached results a successful call invalidates.
    pub invalidates: &'static [&'static str],
    /// Whether the tool is enabled for users by default.
    pub default_enabled: bool,
    build: BuildFn,
    /// Bridge-side shaping of the upstream response (e.g. domain filter).
    postprocess: Option<PostProcessFn>,
}

impl ToolDescriptor {
    pub fn build_request(
        &self,
        arguments: &serde_json::Value,
    ) -> Result<UpstreamRequest, BridgeError> {
        (self.build)(arguments)
    }

    pub fn postprocess(
        &self,
        response: serde_json::Value,
        arguments: &serde_json::Value,
    ) -> serde_json::Value {
        match self.postprocess {
            Some(f) => f(response, arguments),
            None => response,
        }
    }
}

/// The hub returns all states; restrict to the requested domain here.
fn filter_entities_by_domain(
    response: serde_json::Value,
    arguments: &serde_json::Value,
) -> serde_json::Value {
    let Some(domain) = arguments.get("domain").and_then(|d| d.as_str()) else {
        return response;
    };
    let serde_json::Value::Array(states) = response else {
        return response;
    };
    let prefix = format!("{domain}.");
    serde_json::Value::Array(
        states
            .into_iter()
            .filter(|state| {
                state
                    .get("entity_id")
                    .and_then(|id| id.as_str())
                    .is_some_and(|id| id.starts_with(&prefix))
            })
            .collect(),
    )
}

fn parse_args<T: serde::de::DeserializeOwned>(
    arguments: &serde_json::Value,
) -> Result<T, BridgeError> {
    let value = if arguments.is_null() {
        serde_json::json!({})
    } else {
        arguments.clone()
    };
    serde_json::from_value(value).map_err(|e| BridgeError::InvalidArgument {
        msg: format!("invalid tool arguments: {e}"),
    })
}

fn schema_json<T: JsonSchema>() -> serde_json::Value {
    serde_json::to_value(schema_for!(T)).unwrap_or(serde_json::json!({ "type": "object" }))
}

fn validate_entity_id(entity_id: &str) -> Result<(), BridgeError> {
    let valid = entity_id.split_once('.').is_some_and(|(domain, object)| {
        !domain.is_empty()
            && !object.is_empty()
            && entity_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_'))
    });
    if !valid {
        return Err(BridgeError::InvalidArgument {
            msg: "entity_id must look like 'domain.object_id'".to_string(),
        });
    }
    Ok(())
}

fn validate_slug(value: &str, what: &str) -> Result<(), BridgeError> {
    if value.is_empty() || !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(BridgeError::InvalidArgument {
            msg: format!("{what} must be a lowercase identifier"),
        });
    }
    Ok(())
}

// ============================================
// Tool argument shapes
// ============================================

#[derive(Debug, Deserialize, JsonSchema)]
struct GetEntitiesArgs {
    /// Restrict to one domain, e.g. `light`
    domain: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct EntityArgs {
    entity_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct GetHistoryArgs {
    entity_id: String,
    /// Look-back window in hours (default 24, max 168)
    hours: Option<u32>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct CallServiceArgs {
    domain: String,
    service: String,
    entity_id: Option<String>,
    /// Extra service data merged into the payload
    data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SetEntityStateArgs {
    entity_id: String,
    state: String,
    attributes: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct RenderTemplateArgs {
    template: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct FireEventArgs {
    event_type: String,
    data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct NoArgs {}

// ============================================
// Request builders
// ============================================

fn build_get_entities(args: &serde_json::Value) -> Result<UpstreamRequest, BridgeError> {
    let args: GetEntitiesArgs = parse_args(args)?;
    if let Some(domain) = &args.domain {
        validate_slug(domain, "domain")?;
    }
    // Domain filtering happens bridge-side; the hub returns all states
    Ok(UpstreamRequest {
        method: http::Method::GET,
        path: "/api/states".to_string(),
        body: None,
    })
}

fn build_get_entity_state(args: &serde_json::Value) -> Result<UpstreamRequest, BridgeError> {
    let args: EntityArgs = parse_args(args)?;
    validate_entity_id(&args.entity_id)?;
    Ok(UpstreamRequest {
        method: http::Method::GET,
        path: format!("/api/states/{}", args.entity_id),
        body: None,
    })
}

fn build_get_history(args: &serde_json::Value) -> Result<UpstreamRequest, BridgeError> {
    let args: GetHistoryArgs = parse_args(args)?;
    validate_entity_id(&args.entity_id)?;
    let hours = args.hours.unwrap_or(24).min(168);
    Ok(UpstreamRequest {
        method: http::Method::GET,
        path: format!(
            "/api/history/period?filter_entity_id={}&hours={hours}",
            args.entity_id
        ),
        body: None,
    })
}

fn build_get_services(args: &serde_json::Value) -> Result<UpstreamRequest, BridgeError> {
    let _: NoArgs = parse_args(args)?;
    Ok(UpstreamRequest {
        method: http::Method::GET,
        path: "/api/services".to_string(),
        body: None,
    })
}

fn build_get_config(args: &serde_json::Value) -> Result<UpstreamRequest, BridgeError> {
    let _: NoArgs = parse_args(args)?;
    Ok(UpstreamRequest {
        method: http::Method::GET,
        path: "/api/config".to_string(),
        body: None,
    })
}

fn build_render_template(args: &serde_json::Value) -> Result<UpstreamRequest, BridgeError> {
    let args: RenderTemplateArgs = parse_args(args)?;
    Ok(UpstreamRequest {
        method: http::Method::POST,
        path: "/api/template".to_string(),
        body: Some(serde_json::json!({ "template": args.template })),
    })
}

fn build_call_service(args: &serde_json::Value) -> Result<UpstreamRequest, BridgeError> {
    let args: CallServiceArgs = parse_args(args)?;
    validate_slug(&args.domain, "domain")?;
    validate_slug(&args.service, "service")?;

    let mut body = match args.data {
        Some(serde_json::Value::Object(map)) => serde_json::Value::Object(map),
        None => serde_json::json!({}),
        Some(_) => {
            return Err(BridgeError::InvalidArgument {
                msg: "data must be an object".to_string(),
            });
        }
    };
    if let Some(entity_id) = args.entity_id {
        validate_entity_id(&entity_id)?;
        body["entity_id"] = serde_json::Value::String(entity_id);
    }

    Ok(UpstreamRequest {
        method: http::Method::POST,
        path: format!("/api/services/{}/{}", args.domain, args.service),
        body: Some(body),
    })
}

fn build_set_entity_state(args: &serde_json::Value) -> Result<UpstreamRequest, BridgeError> {
    let args: SetEntityStateArgs = parse_args(args)?;
    validate_entity_id(&args.entity_id)?;

    let mut body = serde_json::json!({ "state": args.state });
    if let Some(attributes) = args.attributes {
        body["attributes"] = attributes;
    }

    Ok(UpstreamRequest {
        method: http::Method::POST,
        path: format!("/api/states/{}", args.entity_id),
        body: Some(body),
    })
}

fn build_fire_event(args: &serde_json::Value) -> Result<UpstreamRequest, BridgeError> {
    let args: FireEventArgs = parse_args(args)?;
    validate_slug(&args.event_type, "event_type")?;
    Ok(UpstreamRequest {
        method: http::Method::POST,
        path: format!("/api/events/{}", args.event_type),
        body: args.data,
    })
}

fn build_restart_hub(args: &serde_json::Value) -> Result<UpstreamRequest, BridgeError> {
    let _: NoArgs = parse_args(args)?;
    Ok(UpstreamRequest {
        method: http::Method::POST,
        path: "/api/services/homeassistant/restart".to_string(),
        body: Some(serde_json::json!({})),
    })
}

fn build_check_config(args: &serde_json::Value) -> Result<UpstreamRequest, BridgeError> {
    let _: NoArgs = parse_args(args)?;
    Ok(UpstreamRequest {
        method: http::Method::POST,
        path: "/api/config/core/check_config".to_string(),
        body: Some(serde_json::json!({})),
    })
}

/// Every read tool that reflects entity state; the conservative
/// invalidation set for mutating tools.
const ENTITY_READS: &[&str] = &["get_entities", "get_entity_state", "get_history"];

/// The tool catalogue. Dispatch decisions (permission bit, cacheability,
/// retry, invalidation) all come off the descriptor.
pub struct ToolRegistry {
    tools: Vec<ToolDescriptor>,
    by_name: HashMap<&'static str, usize>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        let tools = vec![
            ToolDescriptor {
                name: "get_entities",
                description: "List entity states, optionally filtered by domain",
                kind: ToolKind::Read,
                input_schema: schema_json::<GetEntitiesArgs>(),
                cache_ttl: None,
                invalidates: &[],
                default_enabled: true,
                build: build_get_entities,
                postprocess: Some(filter_entities_by_domain),
            },
            ToolDescriptor {
                name: "get_entity_state",
                description: "Get the state of a single entity",
                kind: ToolKind::Read,
                input_schema: schema_json::<EntityArgs>(),
                cache_ttl: None,
                invalidates: &[],
                default_enabled: true,
                build: build_get_entity_state,
                postprocess: None,
            },
            ToolDescriptor {
                name: "get_history",
                description: "State history of an entity over a look-back window",
                kind: ToolKind::Read,
                input_schema: schema_json::<GetHistoryArgs>(),
                cache_ttl: Some(Duration::from_secs(120)),
                invalidates: &[],
                default_enabled: true,
                build: build_get_history,
                postprocess: None,
            },
            ToolDescriptor {
                name: "get_services",
                description: "List the services the hub exposes",
                kind: ToolKind::Read,
                input_schema: schema_json::<NoArgs>(),
                cache_ttl: Some(Duration::from_secs(300)),
                invalidates: &[],
                default_enabled: true,
                build: build_get_services,
                postprocess: None,
            },
            ToolDescriptor {
                name: "get_config",
                description: "Hub configuration and version information",
                kind: ToolKind::Read,
                input_schema: schema_json::<NoArgs>(),
                cache_ttl: Some(Duration::from_secs(300)),
                invalidates: &[],
                default_enabled: true,
                build: build_get_config,
                postprocess: None,
            },
            ToolDescriptor {
                name: "render_template",
                description: "Render a hub template expression",
                kind: ToolKind::Read,
                input_schema: schema_json::<RenderTemplateArgs>(),
                cache_ttl: Some(Duration::from_secs(5)),
                invalidates: &[],
                default_enabled: true,
                build: build_render_template,
                postprocess: None,
            },
            ToolDescriptor {
                name: "call_service",
                description: "Call a hub service, e.g. light.turn_on",
                kind: ToolKind::Write,
                input_schema: schema_json::<CallServiceArgs>(),
                cache_ttl: None,
                invalidates: ENTITY_READS,
                default_enabled: true,
                build: build_call_service,
                postprocess: None,
            },
            ToolDescriptor {
                name: "set_entity_state",
                description: "Set an entity's state representation directly",
                kind: ToolKind::Write,
                input_schema: schema_json::<SetEntityStateArgs>(),
                cache_ttl: None,
                invalidates: ENTITY_READS,
                default_enabled: true,
                build: build_set_entity_state,
                postprocess: None,
            },
            ToolDescriptor {
                name: "fire_event",
                description: "Fire an event on the hub's event bus",
                kind: ToolKind::Write,
                input_schema: schema_json::<FireEventArgs>(),
                cache_ttl: None,
                invalidates: ENTITY_READS,
                default_enabled: true,
                build: build_fire_event,
                postprocess: None,
            },
            ToolDescriptor {
                name: "restart_hub",
                description: "Restart the hub core",
                kind: ToolKind::Meta,
                input_schema: schema_json::<NoArgs>(),
                cache_ttl: None,
                invalidates: &["get_entities", "get_entity_state", "get_history", "get_services", "get_config"],
                // Destructive; off until an admin grants it
                default_enabled: false,
                build: build_restart_hub,
                postprocess: None,
            },
            ToolDescriptor {
                name: "check_config",
                description: "Ask the hub to validate its configuration",
                kind: ToolKind::Meta,
                input_schema: schema_json::<NoArgs>(),
                cache_ttl: None,
                invalidates: &[],
                default_enabled: true,
                build: build_check_config,
                postprocess: None,
            },
        ];

        let by_name = tools
            .iter()
            .enumerate()
            .map(|(idx, tool)| (tool.name, idx))
            .collect();

        Self { tools, by_name }
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.by_name.get(name).map(|&idx| &self.tools[idx])
    }

    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    /// `(tool, required bit)` pairs for permission-filtered listings.
    pub fn permission_catalogue(&self) -> Vec<(String, PermissionBit)> {
        self.tools
            .iter()
            .map(|tool| (tool.name.to_string(), tool.kind.required_bit()))
            .collect()
    }

    /// Rows seeded into `default_tool_permission` at bootstrap.
    pub fn default_permissions(&self) -> Vec<(String, PermissionBits)> {
        self.tools
            .iter()
            .map(|tool| {
                (
                    tool.name.to_string(),
                    PermissionBits {
                        can_read: true,
                        can_write: matches!(tool.kind, ToolKind::Write),
                        can_execute: matches!(tool.kind, ToolKind::Meta),
                        enabled: tool.default_enabled,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogue_contains_the_core_tools() {
        let registry = ToolRegistry::new();
        for name in ["get_entities", "call_service", "get_history"] {
            assert!(registry.get(name).is_some(), "missing tool {name}");
        }
        assert!(registry.get("no_such_tool").is_none());
    }

    #[test]
    fn call_service_builds_a_post_with_entity() {
        let registry = ToolRegistry::new();
        let request = registry
            .get("call_service")
            .unwrap()
            .build_request(&serde_json::json!({
                "domain": "light",
                "service": "turn_on",
                "entity_id": "light.kitchen",
                "data": { "brightness": 128 }
            }))
            .unwrap();

        assert_eq!(request.method, http::Method::POST);
        assert_eq!(request.path, "/api/services/light/turn_on");
        let body = request.body.unwrap();
        assert_eq!(body["entity_id"], "light.kitchen");
        assert_eq!(body["brightness"], 128);
    }

    #[test]
    fn malformed_entity_ids_are_rejected() {
        let registry = ToolRegistry::new();
        let result = registry
            .get("get_entity_state")
            .unwrap()
            .build_request(&serde_json::json!({ "entity_id": "../admin" }));
        assert!(matches!(result, Err(BridgeError::InvalidArgument { .. })));

        let result = registry
            .get("call_service")
            .unwrap()
            .build_request(&serde_json::json!({ "domain": "light/../x", "service": "turn_on" }));
        assert!(matches!(result, Err(BridgeError::InvalidArgument { .. })));
    }

    #[test]
    fn null_arguments_mean_empty_object() {
        let registry = ToolRegistry::new();
        let request = registry
            .get("get_entities")
            .unwrap()
            .build_request(&serde_json::Value::Null)
            .unwrap();
        assert_eq!(request.path, "/api/states");
    }

    #[test]
    fn history_window_is_clamped() {
        let registry = ToolRegistry::new();
        let request = registry
            .get("get_history")
            .unwrap()
            .build_request(&serde_json::json!({ "entity_id": "light.kitchen", "hours": 99999 }))
            .unwrap();
        assert!(request.path.contains("hours=168"));
    }

    #[test]
    fn kinds_map_to_bits_and_policies() {
        let registry = ToolRegistry::new();
        let read = registry.get("get_entities").unwrap();
        assert_eq!(read.kind.required_bit(), PermissionBit::Read);
        assert!(read.kind.is_cacheable());
        assert!(read.kind.is_retryable());

        let write = registry.get("call_service").unwrap();
        assert_eq!(write.kind.required_bit(), PermissionBit::Write);
        assert!(!write.kind.is_cacheable());
        assert!(!write.kind.is_retryable());
        assert!(write.invalidates.contains(&"get_entities"));

        let meta = registry.get("restart_hub").unwrap();
        assert_eq!(meta.kind.required_bit(), PermissionBit::Execute);
        assert!(!meta.default_enabled);
    }

    #[test]
    fn schemas_are_objects() {
        let registry = ToolRegistry::new();
        for tool in registry.tools() {
            assert!(
                tool.input_schema.is_object(),
                "tool {} has a non-object schema",
                tool.name
            );
        }
    }
}
