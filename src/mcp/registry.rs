//! Aggregated tool namespace across all connected MCP servers.

use crate::mcp::events::{AuditEvent, AuditSink};
use crate::mcp::validate::compile_schema;
use chrono::Utc;
use rust_mcp_schema::Tool;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::warn;

/// Immutable description of one registered tool.
///
/// Replaced wholesale when the owning server's catalog is refreshed.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub server_id: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

/// A descriptor plus its compiled argument validator.
pub struct RegisteredTool {
    pub descriptor: ToolDescriptor,
    pub validator: jsonschema::Validator,
}

struct RegistryInner {
    /// Per-session catalogs in registration order; rebuilding the index by
    /// folding this list in order gives later-registration-wins shadowing,
    /// and un-shadows earlier entries when the winner deregisters.
    catalogs: Vec<(String, Vec<Arc<RegisteredTool>>)>,
    index: HashMap<String, Arc<RegisteredTool>>,
    generation: u64,
}

/// One shared namespace of tools, aggregated from every active session.
///
/// The only structure mutated by multiple components: registration on
/// connect/refresh, deregistration on disconnect, lookups on every
/// dispatch. Reads take snapshots under a reader lock so no lookup ever
/// observes a half-applied mutation.
pub struct ToolRegistry {
    inner: RwLock<RegistryInner>,
    audit: AuditSink,
}

impl ToolRegistry {
    pub fn new(audit: AuditSink) -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                catalogs: Vec::new(),
                index: HashMap::new(),
                generation: 0,
            }),
            audit,
        }
    }

    /// Replaces `session_id`'s contribution atomically.
    ///
    /// Tools whose schemas do not compile are excluded and reported; a name
    /// collision with another session keeps the later registration and
    /// emits a warning-grade event.
    pub fn register(&self, session_id: &str, tools: &[Tool]) {
        let mut accepted = Vec::with_capacity(tools.len());
        for tool in tools {
            let input_schema = match serde_json::to_value(&tool.input_schema) {
                Ok(value) => value,
                Err(err) => {
                    self.reject_tool(session_id, &tool.name, err.to_string());
                    continue;
                }
            };
            let validator = match compile_schema(&input_schema) {
                Ok(validator) => validator,
                Err(reason) => {
                    self.reject_tool(session_id, &tool.name, reason);
                    continue;
                }
            };
            accepted.push(Arc::new(RegisteredTool {
                descriptor: ToolDescriptor {
                    name: tool.name.clone(),
                    server_id: session_id.to_string(),
                    description: tool.description.clone(),
                    input_schema,
                },
                validator,
            }));
        }

        let mut inner = self.inner.write().expect("registry lock poisoned");
        inner.catalogs.retain(|(id, _)| id != session_id);
        inner.catalogs.push((session_id.to_string(), accepted));
        self.rebuild_index(&mut inner, Some(session_id));
    }

    /// Removes all tools owned by `session_id`.
    pub fn deregister(&self, session_id: &str) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let before = inner.catalogs.len();
        inner.catalogs.retain(|(id, _)| id != session_id);
        if inner.catalogs.len() != before {
            self.rebuild_index(&mut inner, None);
        }
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<RegisteredTool>> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.index.get(name).cloned()
    }

    /// Every currently visible (non-shadowed) tool, for advertising to the
    /// model.
    pub fn visible_tools(&self) -> Vec<ToolDescriptor> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let mut tools: Vec<ToolDescriptor> = inner
            .index
            .values()
            .map(|tool| tool.descriptor.clone())
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Monotonic counter, bumped on every mutation.
    pub fn generation(&self) -> u64 {
        self.inner.read().expect("registry lock poisoned").generation
    }

    /// Rebuilds the name index by folding catalogs in registration order.
    /// Shadow warnings are only emitted for the session whose registration
    /// triggered the rebuild, so standing collisions are reported once.
    fn rebuild_index(&self, inner: &mut RegistryInner, announce_for: Option<&str>) {
        let mut index: HashMap<String, Arc<RegisteredTool>> = HashMap::new();
        for (session_id, tools) in &inner.catalogs {
            for tool in tools {
                if let Some(previous) = index.insert(tool.descriptor.name.clone(), tool.clone()) {
                    let shadowed = &previous.descriptor.server_id;
                    if shadowed != session_id && announce_for == Some(session_id.as_str()) {
                        warn!(
                            tool_name = %tool.descriptor.name,
                            shadowed_server_id = %shadowed,
                            winning_server_id = %session_id,
                            "Tool name collision; later registration wins"
                        );
                        self.audit.emit(AuditEvent::ToolShadowed {
                            tool_name: tool.descriptor.name.clone(),
                            shadowed_server_id: shadowed.clone(),
                            winning_server_id: session_id.clone(),
                            timestamp: Utc::now(),
                        });
                    }
                }
            }
        }
        inner.index = index;
        inner.generation += 1;
    }

    fn reject_tool(&self, session_id: &str, tool_name: &str, reason: String) {
        warn!(
            server_id = %session_id,
            tool_name = %tool_name,
            reason = %reason,
            "Rejecting tool with invalid input schema"
        );
        self.audit.emit(AuditEvent::ToolSchemaRejected {
            tool_name: tool_name.to_string(),
            server_id: session_id.to_string(),
            reason,
            timestamp: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::testing::{schema_tool, tool_with_schema};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn registry() -> ToolRegistry {
        ToolRegistry::new(AuditSink::disabled())
    }

    #[test]
    fn lookup_finds_registered_tools() {
        let registry = registry();
        registry.register("alpha", &[schema_tool("search")]);

        let tool = registry.lookup("search").expect("tool should be present");
        assert_eq!(tool.descriptor.server_id, "alpha");
    }

    #[test]
    fn lookups_are_idempotent_between_registrations() {
        let registry = registry();
        registry.register("alpha", &[schema_tool("search"), schema_tool("fetch")]);

        let first: Vec<String> = registry
            .visible_tools()
            .into_iter()
            .map(|t| t.name)
            .collect();
        let second: Vec<String> = registry
            .visible_tools()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn registration_replaces_prior_contribution_atomically() {
        let registry = registry();
        registry.register("alpha", &[schema_tool("search")]);
        registry.register("alpha", &[schema_tool("fetch")]);

        assert!(registry.lookup("search").is_none());
        assert!(registry.lookup("fetch").is_some());
    }

    #[test]
    fn deregistration_removes_all_session_tools_within_one_generation() {
        let registry = registry();
        registry.register("alpha", &[schema_tool("search")]);
        let generation = registry.generation();

        registry.deregister("alpha");

        assert!(registry.lookup("search").is_none());
        assert_eq!(registry.generation(), generation + 1);
    }

    #[test]
    fn deregistering_an_unknown_session_is_harmless() {
        let registry = registry();
        let generation = registry.generation();
        registry.deregister("ghost");
        assert_eq!(registry.generation(), generation);
    }

    #[test]
    fn later_registration_shadows_and_emits_warning() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = ToolRegistry::new(AuditSink::new(tx));
        registry.register("alpha", &[schema_tool("search")]);
        registry.register("beta", &[schema_tool("search")]);

        let tool = registry.lookup("search").expect("tool should be present");
        assert_eq!(tool.descriptor.server_id, "beta");

        let event = rx.try_recv().expect("shadow event expected");
        assert!(matches!(event, AuditEvent::ToolShadowed { .. }));
    }

    #[test]
    fn shadowed_tool_reappears_when_winner_deregisters() {
        let registry = registry();
        registry.register("alpha", &[schema_tool("search")]);
        registry.register("beta", &[schema_tool("search")]);
        registry.deregister("beta");

        let tool = registry.lookup("search").expect("tool should be present");
        assert_eq!(tool.descriptor.server_id, "alpha");
    }

    #[test]
    fn tools_with_uncompilable_schemas_are_excluded() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = ToolRegistry::new(AuditSink::new(tx));
        registry.register(
            "alpha",
            &[tool_with_schema(
                "broken",
                json!({
                    "type": "object",
                    "properties": {"x": {"type": "definitely-not-a-type"}}
                }),
            )],
        );

        assert!(registry.lookup("broken").is_none());
        let event = rx.try_recv().expect("rejection event expected");
        assert!(matches!(event, AuditEvent::ToolSchemaRejected { .. }));
    }
}
