//! Messages exchanged between the worker and plugin processes.
//!
//! All messages are JSON documents carried inside length-prefixed frames.
//! Raw item bytes travel as standard base64 strings.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{ProtocolError, Result};
use crate::hash::ContentHash;

/// String-to-string configuration map
pub type Config = BTreeMap<String, String>;

// ============================================================================
// Operation
// ============================================================================

/// What a request asks the plugin to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Configure,
    Extract,
    Transform,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Configure => "configure",
            Operation::Extract => "extract",
            Operation::Transform => "transform",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Action
// ============================================================================

/// A unit of extraction work, either seeded by an operator or emitted by a plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    #[serde(default)]
    pub config: Config,
    /// Plugin that should run this action. Unset means the plugin that emitted it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_id: Option<String>,
    /// Hash of the item that led to this action, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_hash: Option<String>,
}

impl Action {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_plugin(mut self, plugin_id: impl Into<String>) -> Self {
        self.plugin_id = Some(plugin_id.into());
        self
    }

    pub fn with_parent(mut self, parent_hash: impl Into<String>) -> Self {
        self.parent_hash = Some(parent_hash.into());
        self
    }
}

// ============================================================================
// DataItem
// ============================================================================

/// A piece of extracted content plus provenance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataItem {
    pub plugin_id: String,
    pub source_id: String,
    pub kind: String,
    /// Unix seconds
    #[serde(default)]
    pub timestamp: i64,
    pub content_type: String,
    /// Hash of `raw_data`, as declared by the producer.
    #[serde(default)]
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_hash: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: Config,
    #[serde(default, with = "base64_bytes")]
    pub raw_data: Vec<u8>,
}

impl DataItem {
    pub fn new(
        plugin_id: impl Into<String>,
        source_id: impl Into<String>,
        kind: impl Into<String>,
        content_type: impl Into<String>,
        raw_data: Vec<u8>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            source_id: source_id.into(),
            kind: kind.into(),
            content_type: content_type.into(),
            raw_data,
            ..Default::default()
        }
    }

    /// Hash of the current `raw_data`.
    pub fn computed_hash(&self) -> ContentHash {
        ContentHash::of(&self.raw_data)
    }

    /// Set `hash` from `raw_data`.
    pub fn seal(&mut self) {
        self.hash = self.computed_hash().to_string();
    }

    /// Check the declared hash against `raw_data`.
    pub fn verify(&self) -> Result<()> {
        let computed = self.computed_hash();
        if self.hash != computed.as_str() {
            return Err(ProtocolError::HashMismatch {
                source_id: self.source_id.clone(),
                declared: self.hash.clone(),
                computed: computed.to_string(),
            });
        }
        Ok(())
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(de::Error::custom)
    }
}

// ============================================================================
// Request / Response
// ============================================================================

/// Worker -> plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginRequest {
    /// Correlates responses; equals the task id for extract/transform.
    pub id: String,
    pub plugin_id: String,
    pub operation: Operation,
    #[serde(default)]
    pub config: Config,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<DataItem>,
}

impl PluginRequest {
    pub fn configure(id: impl Into<String>, plugin_id: impl Into<String>, config: Config) -> Self {
        Self {
            id: id.into(),
            plugin_id: plugin_id.into(),
            operation: Operation::Configure,
            config,
            action: None,
            item: None,
        }
    }

    pub fn extract(id: impl Into<String>, plugin_id: impl Into<String>, action: Action) -> Self {
        Self {
            id: id.into(),
            plugin_id: plugin_id.into(),
            operation: Operation::Extract,
            config: Config::new(),
            action: Some(action),
            item: None,
        }
    }

    pub fn transform(id: impl Into<String>, plugin_id: impl Into<String>, item: DataItem) -> Self {
        Self {
            id: id.into(),
            plugin_id: plugin_id.into(),
            operation: Operation::Transform,
            config: Config::new(),
            action: None,
            item: Some(item),
        }
    }
}

/// Body of a plugin response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsePayload {
    Error { message: String },
    Item { item: DataItem },
    Action { action: Action },
    /// The request named by `request_id` is finished.
    Done,
    /// The plugin will send nothing more.
    Closed,
}

/// Plugin -> worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginResponse {
    pub plugin_id: String,
    /// Empty for messages not tied to a request (stderr lines, closed).
    #[serde(default)]
    pub request_id: String,
    pub payload: ResponsePayload,
}

impl PluginResponse {
    pub fn new(
        plugin_id: impl Into<String>,
        request_id: impl Into<String>,
        payload: ResponsePayload,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            request_id: request_id.into(),
            payload,
        }
    }

    pub fn error(
        plugin_id: impl Into<String>,
        request_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            plugin_id,
            request_id,
            ResponsePayload::Error {
                message: message.into(),
            },
        )
    }

    pub fn item(plugin_id: impl Into<String>, request_id: impl Into<String>, item: DataItem) -> Self {
        Self::new(plugin_id, request_id, ResponsePayload::Item { item })
    }

    pub fn action(
        plugin_id: impl Into<String>,
        request_id: impl Into<String>,
        action: Action,
    ) -> Self {
        Self::new(plugin_id, request_id, ResponsePayload::Action { action })
    }

    pub fn done(plugin_id: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self::new(plugin_id, request_id, ResponsePayload::Done)
    }

    pub fn closed(plugin_id: impl Into<String>) -> Self {
        Self::new(plugin_id, String::new(), ResponsePayload::Closed)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.payload, ResponsePayload::Closed)
    }
}

// ============================================================================
// Encoding helpers
// ============================================================================

/// Serialize a message body for framing.
pub fn encode_message<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

/// Deserialize a framed message body.
pub fn decode_message<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(body)?)
}
