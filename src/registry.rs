//! Explicit service registration, replacing reflection-driven discovery: the
//! process registers [`ServiceDefinition`]s at startup and the registry maps
//! (service, handler) to an invokable entry point plus its manifest shape.

use crate::discovery::{
    HandlerManifest, HandlerType, InputPayload, Manifest, OutputPayload, ProtocolMode,
    ServiceManifest, ServiceType,
};
use crate::machine::{HandlerFn, MachineOptions};
use crate::protocol::Version;

use std::collections::HashMap;
use std::time::Duration;

const DEFAULT_CONTENT_TYPE: &str = "application/json";

#[derive(Clone)]
pub struct HandlerDefinition {
    pub name: String,
    pub ty: Option<HandlerType>,
    pub input_content_type: String,
    pub output_content_type: String,
    pub inactivity_timeout: Option<Duration>,
    pub abort_timeout: Option<Duration>,
    pub idempotency_retention: Option<Duration>,
    pub journal_retention: Option<Duration>,
    pub ingress_private: bool,
    pub invoke: HandlerFn,
}

impl HandlerDefinition {
    pub fn new(name: impl Into<String>, invoke: HandlerFn) -> Self {
        Self {
            name: name.into(),
            ty: None,
            input_content_type: DEFAULT_CONTENT_TYPE.to_owned(),
            output_content_type: DEFAULT_CONTENT_TYPE.to_owned(),
            inactivity_timeout: None,
            abort_timeout: None,
            idempotency_retention: None,
            journal_retention: None,
            ingress_private: false,
            invoke,
        }
    }

    pub fn shared(mut self) -> Self {
        self.ty = Some(HandlerType::Shared);
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.ty = Some(HandlerType::Exclusive);
        self
    }

    pub fn workflow(mut self) -> Self {
        self.ty = Some(HandlerType::Workflow);
        self
    }

    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = Some(timeout);
        self
    }

    pub fn with_abort_timeout(mut self, timeout: Duration) -> Self {
        self.abort_timeout = Some(timeout);
        self
    }

    pub fn ingress_private(mut self) -> Self {
        self.ingress_private = true;
        self
    }

    fn manifest(&self) -> HandlerManifest {
        HandlerManifest {
            name: self.name.clone(),
            ty: self.ty,
            input: InputPayload {
                content_type: Some(self.input_content_type.clone()),
                required: None,
            },
            output: OutputPayload {
                content_type: Some(self.output_content_type.clone()),
                set_content_type_if_empty: Some(false),
            },
            inactivity_timeout: self.inactivity_timeout.map(|d| d.as_millis() as u64),
            abort_timeout: self.abort_timeout.map(|d| d.as_millis() as u64),
            idempotency_retention: self.idempotency_retention.map(|d| d.as_millis() as u64),
            journal_retention: self.journal_retention.map(|d| d.as_millis() as u64),
            ingress_private: self.ingress_private,
        }
    }
}

#[derive(Clone)]
pub struct ServiceDefinition {
    pub name: String,
    pub ty: ServiceType,
    pub workflow_completion_retention: Option<Duration>,
    handlers: HashMap<String, HandlerDefinition>,
}

impl ServiceDefinition {
    pub fn service(name: impl Into<String>) -> Self {
        Self::new(name, ServiceType::Service)
    }

    pub fn virtual_object(name: impl Into<String>) -> Self {
        Self::new(name, ServiceType::VirtualObject)
    }

    pub fn workflow(name: impl Into<String>) -> Self {
        Self::new(name, ServiceType::Workflow)
    }

    fn new(name: impl Into<String>, ty: ServiceType) -> Self {
        Self {
            name: name.into(),
            ty,
            workflow_completion_retention: None,
            handlers: HashMap::new(),
        }
    }

    pub fn handler(mut self, handler: HandlerDefinition) -> Self {
        self.handlers.insert(handler.name.clone(), handler);
        self
    }

    pub fn get_handler(&self, name: &str) -> Option<&HandlerDefinition> {
        self.handlers.get(name)
    }

    fn manifest(&self) -> ServiceManifest {
        let mut handlers: Vec<HandlerManifest> =
            self.handlers.values().map(|h| h.manifest()).collect();
        handlers.sort_by(|a, b| a.name.cmp(&b.name));
        ServiceManifest {
            name: self.name.clone(),
            ty: self.ty,
            handlers,
            workflow_completion_retention: self
                .workflow_completion_retention
                .map(|d| d.as_millis() as u64),
        }
    }
}

/// Maps service names to definitions and carries the endpoint configuration
/// that every invocation machine is constructed with.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, ServiceDefinition>,
    options: MachineOptions,
}

impl ServiceRegistry {
    pub fn new(options: MachineOptions) -> Self {
        Self {
            services: HashMap::new(),
            options,
        }
    }

    pub fn options(&self) -> &MachineOptions {
        &self.options
    }

    pub fn register(&mut self, service: ServiceDefinition) -> &mut Self {
        self.services.insert(service.name.clone(), service);
        self
    }

    pub fn resolve(&self, service: &str, handler: &str) -> Option<&HandlerDefinition> {
        self.services.get(service)?.get_handler(handler)
    }

    pub fn manifest(&self) -> Manifest {
        let mut services: Vec<ServiceManifest> =
            self.services.values().map(|s| s.manifest()).collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        Manifest {
            protocol_mode: ProtocolMode::BidiStream,
            min_protocol_version: Version::minimum_supported_version() as u32,
            max_protocol_version: Version::maximum_supported_version() as u32,
            services,
        }
    }
}
