//! Discovery manifest types. The manifest itself is emitted by the
//! surrounding host, but its payload shapes are honored by the state machine,
//! so the types live next to it.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub protocol_mode: ProtocolMode,
    pub min_protocol_version: u32,
    pub max_protocol_version: u32,
    pub services: Vec<ServiceManifest>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolMode {
    #[serde(rename = "BIDI_STREAM")]
    BidiStream,
    #[serde(rename = "REQUEST_RESPONSE")]
    RequestResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceType {
    Service,
    VirtualObject,
    Workflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandlerType {
    Shared,
    Exclusive,
    Workflow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceManifest {
    pub name: String,
    pub ty: ServiceType,
    pub handlers: Vec<HandlerManifest>,
    /// Milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_completion_retention: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerManifest {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ty: Option<HandlerType>,
    pub input: InputPayload,
    pub output: OutputPayload,
    /// Milliseconds. Surfaced as a hint; enforcement is the supervisor's job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inactivity_timeout: Option<u64>,
    /// Milliseconds. Surfaced as a hint; enforcement is the supervisor's job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_timeout: Option<u64>,
    /// Milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_retention: Option<u64>,
    /// Milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub journal_retention: Option<u64>,
    pub ingress_private: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set_content_type_if_empty: Option<bool>,
}
