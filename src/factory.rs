// Copyright 2020 Joyent, Inc.

//! Per-export wiring: builds the proxy and dispatcher pair for an exported
//! object.

use std::sync::Arc;

use slog::{debug, o, trace, Drain, Logger};

use crate::config::FactoryConfig;
use crate::dispatcher::{
    AtomicInvocationDispatcher, InvocationDispatcher, PermissionFn, Remote,
};
use crate::error::{Error, Result};
use crate::handler::{AtomicInvocationHandler, Proxy};
use crate::loader::Loader;
use crate::marshal::DEFAULT_MAX_OBJECT_LEN;
use crate::method::{Interface, Method};
use crate::security::Permission;
use crate::string_constraints::StringMethodConstraints;
use crate::transport::{ObjectEndpoint, ServerCapabilities};

/// The client and server halves of one export.
pub struct Instances {
    pub proxy: Proxy,
    pub dispatcher: Box<dyn InvocationDispatcher>,
}

/// Exporters call `create_instances` exactly once per export.
pub trait InvocationLayerFactory {
    fn create_instances(
        &self,
        remote: &dyn Remote,
        object_endpoint: ObjectEndpoint,
        server_capabilities: Arc<dyn ServerCapabilities>,
    ) -> Result<Instances>;
}

/// Factory for proxies and dispatchers whose calls travel over atomic
/// marshal streams.
#[derive(Clone)]
pub struct AtomicILFactory {
    server_constraints: Option<StringMethodConstraints>,
    permission: Option<PermissionFn>,
    loader: Option<Loader>,
    use_codebase_annotations: bool,
    max_object_len: usize,
    log: Logger,
}

impl AtomicILFactory {
    pub fn new(
        server_constraints: Option<StringMethodConstraints>,
        permission: Option<PermissionFn>,
        loader: Option<Loader>,
        log: Option<&Logger>,
    ) -> AtomicILFactory {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        AtomicILFactory {
            server_constraints,
            permission,
            loader,
            use_codebase_annotations: false,
            max_object_len: DEFAULT_MAX_OBJECT_LEN,
            log,
        }
    }

    pub fn from_config(
        config: FactoryConfig,
        loader: Option<Loader>,
        log: Option<&Logger>,
    ) -> AtomicILFactory {
        let permission: Option<PermissionFn> = if config.check_access {
            Some(Permission::for_method)
        } else {
            None
        };
        AtomicILFactory::new(config.server_constraints, permission, loader, log)
            .with_codebase_annotations(config.use_codebase_annotations)
            .with_max_object_len(config.max_object_len)
    }

    pub fn with_codebase_annotations(mut self, enabled: bool) -> AtomicILFactory {
        self.use_codebase_annotations = enabled;
        self
    }

    pub fn with_max_object_len(mut self, max: usize) -> AtomicILFactory {
        self.max_object_len = max;
        self
    }

    pub fn server_constraints(&self) -> Option<&StringMethodConstraints> {
        self.server_constraints.as_ref()
    }

    pub fn loader(&self) -> Option<&Loader> {
        self.loader.as_ref()
    }

    pub fn use_codebase_annotations(&self) -> bool {
        self.use_codebase_annotations
    }

    pub fn create_invocation_handler(
        &self,
        interfaces: &[Interface],
        remote: Option<&dyn Remote>,
        object_endpoint: ObjectEndpoint,
    ) -> Result<AtomicInvocationHandler> {
        remote.ok_or(Error::NullArgument("impl"))?;
        trace!(self.log, "creating invocation handler";
            "object_id" => %object_endpoint.id(), "interfaces" => interfaces.len());
        let handler = AtomicInvocationHandler::new(
            object_endpoint,
            self.server_constraints.clone(),
            self.use_codebase_annotations,
            Some(&self.log),
        );
        Ok(handler.with_max_object_len(self.max_object_len))
    }

    pub fn create_invocation_dispatcher(
        &self,
        methods: Vec<Method>,
        remote: Option<&dyn Remote>,
        server_capabilities: Arc<dyn ServerCapabilities>,
    ) -> Result<AtomicInvocationDispatcher> {
        remote.ok_or(Error::NullArgument("impl"))?;
        let dispatcher = AtomicInvocationDispatcher::new(
            methods,
            server_capabilities,
            self.server_constraints.clone(),
            self.permission,
            self.loader.clone(),
            self.use_codebase_annotations,
            Some(&self.log),
        )?;
        Ok(dispatcher.with_max_object_len(self.max_object_len))
    }

    fn proxy_loader(&self, remote: &dyn Remote) -> Loader {
        self.loader
            .clone()
            .or_else(|| remote.loader())
            .unwrap_or_else(Loader::system)
    }
}

impl InvocationLayerFactory for AtomicILFactory {
    fn create_instances(
        &self,
        remote: &dyn Remote,
        object_endpoint: ObjectEndpoint,
        server_capabilities: Arc<dyn ServerCapabilities>,
    ) -> Result<Instances> {
        let interfaces = remote.interfaces();
        if interfaces.is_empty() {
            return Err(Error::Export(String::from(
                "exported object implements no remote interfaces",
            )));
        }
        let methods: Vec<Method> = interfaces
            .iter()
            .flat_map(|i| i.methods().iter().cloned())
            .collect();

        debug!(self.log, "creating invocation layer";
            "object_id" => %object_endpoint.id(), "methods" => methods.len());

        let handler =
            self.create_invocation_handler(&interfaces, Some(remote), object_endpoint)?;
        let dispatcher =
            self.create_invocation_dispatcher(methods, Some(remote), server_capabilities)?;
        let proxy = Proxy::new(interfaces, handler, self.proxy_loader(remote));

        Ok(Instances {
            proxy,
            dispatcher: Box::new(dispatcher),
        })
    }
}
