//! Workflow definition schema.
//!
//! Mirrors the workflow YAML document. All types derive Serde traits; keys
//! are camelCase on the wire. A `Workflow` value is immutable once loaded and
//! is shared behind `Arc` by every request served against it.

use serde::{Deserialize, Serialize};

/// Methods registered for a route that declares none.
pub const DEFAULT_ROUTE_METHODS: [&str; 5] = ["GET", "POST", "PUT", "DELETE", "PATCH"];

pub const DEFAULT_CORS_METHODS: &str = "GET, POST, PUT, DELETE, PATCH, OPTIONS";
pub const DEFAULT_CORS_HEADERS: &str = "Content-Type, Authorization";

/// Versioned workflow definition served by the gateway.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Workflow {
    pub api_version: String,
    pub kind: String,
    pub metadata: WorkflowMetadata,
    pub settings: WorkflowSettings,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Resource>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkflowMetadata {
    pub name: String,
    pub description: String,
    pub version: String,
    #[serde(rename = "targetActionId")]
    pub target_action_id: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkflowSettings {
    pub api_server_mode: bool,
    pub web_server_mode: bool,
    pub api_server: Option<ApiServerConfig>,
    pub web_server: Option<WebServerConfig>,
    /// Runtime/agent settings consumed by the executor; opaque to the gateway.
    pub agent_settings: serde_json::Value,
}

impl WorkflowSettings {
    /// Routes declared for the API server, empty when none are configured.
    pub fn routes(&self) -> &[Route] {
        self.api_server
            .as_ref()
            .map(|api| api.routes.as_slice())
            .unwrap_or_default()
    }

    /// Effective CORS policy. Absent configuration means enabled for any origin.
    pub fn cors_config(&self) -> Cors {
        self.api_server
            .as_ref()
            .and_then(|api| api.cors.clone())
            .unwrap_or_else(|| Cors {
                enable_cors: Some(true),
                allow_origins: vec!["*".to_string()],
                ..Cors::default()
            })
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ApiServerConfig {
    #[serde(rename = "hostIp")]
    pub host_ip: String,
    pub port_num: u16,
    pub routes: Vec<Route>,
    pub cors: Option<Cors>,
}

/// An API route: path pattern plus the methods dispatched to the executor.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Route {
    pub path: String,
    pub methods: Vec<String>,
}

impl Route {
    /// Declared methods, upper-cased, or the defaults when none are declared.
    pub fn effective_methods(&self) -> Vec<String> {
        if self.methods.is_empty() {
            DEFAULT_ROUTE_METHODS.iter().map(|m| m.to_string()).collect()
        } else {
            self.methods.iter().map(|m| m.to_ascii_uppercase()).collect()
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Cors {
    /// `None` is treated as enabled.
    pub enable_cors: Option<bool>,
    pub allow_origins: Vec<String>,
    pub allow_methods: Vec<String>,
    pub allow_headers: Vec<String>,
    pub allow_credentials: bool,
}

impl Cors {
    pub fn is_enabled(&self) -> bool {
        self.enable_cors.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct WebServerConfig {
    #[serde(rename = "hostIp")]
    pub host_ip: String,
    pub port_num: u16,
    pub routes: Vec<WebRoute>,
}

/// How a web route serves its sub-tree.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    #[default]
    Static,
    App,
    #[serde(other)]
    Unsupported,
}

/// A URL prefix served from disk or proxied to a local application process.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct WebRoute {
    pub path: String,
    pub server_type: ServerType,
    pub public_path: String,
    pub app_port: u16,
    /// Shell command spawning the app process; empty means externally managed.
    pub command: String,
}

/// A named unit of work inside a workflow.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Resource {
    pub api_version: String,
    pub kind: String,
    pub metadata: ResourceMetadata,
    /// Execution block, interpreted only by the executor.
    pub run: serde_json::Value,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ResourceMetadata {
    #[serde(rename = "actionId")]
    pub action_id: String,
    pub name: String,
    pub description: String,
    pub requires: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_camel_case_yaml() {
        let yaml = r#"
apiVersion: kdeps.io/v1
kind: Workflow
metadata:
  name: chat
  version: "1.0.0"
  targetActionId: respond
settings:
  apiServerMode: true
  apiServer:
    hostIp: 127.0.0.1
    portNum: 16395
    routes:
      - path: /api/v1/chat
        methods: [post]
    cors:
      enableCors: false
  webServer:
    routes:
      - path: /ui
        serverType: app
        appPort: 5173
        command: npm run dev
"#;
        let wf: Workflow = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(wf.metadata.target_action_id, "respond");
        let api = wf.settings.api_server.as_ref().unwrap();
        assert_eq!(api.host_ip, "127.0.0.1");
        assert_eq!(api.routes[0].effective_methods(), vec!["POST".to_string()]);
        assert!(!wf.settings.cors_config().is_enabled());
        let web = wf.settings.web_server.as_ref().unwrap();
        assert_eq!(web.routes[0].server_type, ServerType::App);
        assert_eq!(web.routes[0].app_port, 5173);
    }

    #[test]
    fn default_cors_allows_any_origin() {
        let settings = WorkflowSettings::default();
        let cors = settings.cors_config();
        assert!(cors.is_enabled());
        assert_eq!(cors.allow_origins, vec!["*".to_string()]);
    }

    #[test]
    fn empty_methods_fall_back_to_defaults() {
        let route = Route { path: "/x".into(), methods: vec![] };
        assert_eq!(route.effective_methods().len(), DEFAULT_ROUTE_METHODS.len());
    }

    #[test]
    fn unknown_server_type_is_unsupported() {
        let route: WebRoute = serde_yaml::from_str("path: /x\nserverType: ftp\n").unwrap();
        assert_eq!(route.server_type, ServerType::Unsupported);
    }
}
