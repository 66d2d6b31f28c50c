use serde::{
    Deserialize,
    Serialize,
};

use crate::utils::error::ConfigError;

pub const DEFAULT_GROUP: &str = "default";

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

/// A persistent port-forward definition.
///
/// The `type` tag is embedded in the JSON representation; an unknown tag
/// fails deserialization so that nothing unstartable can enter the
/// registry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ForwardDefinition {
    Socket(SocketForward),
    Kubernetes(KubernetesForward),
}

/// Relay to a raw TCP endpoint resolved by the OS resolver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketForward {
    pub name: String,
    #[serde(default = "default_group")]
    pub group: String,
    pub local_port: u16,
    #[serde(default)]
    pub enabled: bool,
    pub remote_host: String,
    pub remote_port: u16,
}

/// Relay to a pod picked from a Service, over the API server's
/// port-forward subresource.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesForward {
    pub name: String,
    #[serde(default = "default_group")]
    pub group: String,
    pub local_port: u16,
    #[serde(default)]
    pub enabled: bool,
    pub context: String,
    pub namespace: String,
    pub service: String,
    pub service_port: u16,
}

impl ForwardDefinition {
    pub fn name(&self) -> &str {
        match self {
            ForwardDefinition::Socket(f) => &f.name,
            ForwardDefinition::Kubernetes(f) => &f.name,
        }
    }

    pub fn group(&self) -> &str {
        match self {
            ForwardDefinition::Socket(f) => &f.group,
            ForwardDefinition::Kubernetes(f) => &f.group,
        }
    }

    pub fn local_port(&self) -> u16 {
        match self {
            ForwardDefinition::Socket(f) => f.local_port,
            ForwardDefinition::Kubernetes(f) => f.local_port,
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            ForwardDefinition::Socket(f) => f.enabled,
            ForwardDefinition::Kubernetes(f) => f.enabled,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ForwardDefinition::Socket(_) => "socket",
            ForwardDefinition::Kubernetes(_) => "kubernetes",
        }
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        match self {
            ForwardDefinition::Socket(f) => f.name = name.into(),
            ForwardDefinition::Kubernetes(f) => f.name = name.into(),
        }
    }

    pub fn set_group(&mut self, group: impl Into<String>) {
        match self {
            ForwardDefinition::Socket(f) => f.group = group.into(),
            ForwardDefinition::Kubernetes(f) => f.group = group.into(),
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        match self {
            ForwardDefinition::Socket(f) => f.enabled = enabled,
            ForwardDefinition::Kubernetes(f) => f.enabled = enabled,
        }
    }

    /// Validates the definition. Definitions that fail validation must
    /// never be stored.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name().trim().is_empty() {
            return Err(ConfigError::Validation("name must not be empty".into()));
        }
        if self.group().trim().is_empty() {
            return Err(ConfigError::Validation("group must not be empty".into()));
        }
        if self.local_port() == 0 {
            return Err(ConfigError::Validation(
                "localPort must be between 1 and 65535".into(),
            ));
        }

        match self {
            ForwardDefinition::Socket(f) => {
                if f.remote_host.trim().is_empty() {
                    return Err(ConfigError::Validation(
                        "remoteHost must not be empty".into(),
                    ));
                }
                if f.remote_port == 0 {
                    return Err(ConfigError::Validation(
                        "remotePort must be between 1 and 65535".into(),
                    ));
                }
            }
            ForwardDefinition::Kubernetes(f) => {
                if f.context.trim().is_empty() {
                    return Err(ConfigError::Validation("context must not be empty".into()));
                }
                if f.namespace.trim().is_empty() {
                    return Err(ConfigError::Validation(
                        "namespace must not be empty".into(),
                    ));
                }
                if f.service.trim().is_empty() {
                    return Err(ConfigError::Validation("service must not be empty".into()));
                }
                if f.service_port == 0 {
                    return Err(ConfigError::Validation(
                        "servicePort must be between 1 and 65535".into(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Returns true when switching from `self` to `other` requires the
    /// running forwarder to be torn down and recreated: the local port,
    /// the variant, or any routing parameter changed. Group and enabled
    /// flips alone never force a restart.
    pub fn routing_changed(&self, other: &ForwardDefinition) -> bool {
        match (self, other) {
            (ForwardDefinition::Socket(a), ForwardDefinition::Socket(b)) => {
                a.local_port != b.local_port
                    || a.remote_host != b.remote_host
                    || a.remote_port != b.remote_port
            }
            (ForwardDefinition::Kubernetes(a), ForwardDefinition::Kubernetes(b)) => {
                a.local_port != b.local_port
                    || a.context != b.context
                    || a.namespace != b.namespace
                    || a.service != b.service
                    || a.service_port != b.service_port
            }
            _ => true,
        }
    }
}
