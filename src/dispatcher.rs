// Copyright 2020 Joyent, Inc.

//! Server side of the invocation layer.
//!
//! A dispatcher reads one call from an inbound request, invokes the exported
//! object at most once and writes the reply. Exceptions raised by the remote
//! method travel back to the client as `ReplyStatus::Thrown`; anything that
//! keeps the call from reaching the method (an unreadable request, an
//! unknown method, unsupported constraints, a failed access check) is
//! reported as `ReplyStatus::Failed`. Only a failure to write the reply
//! itself is returned to the transport.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use slog::{debug, error, o, trace, Drain, Logger};

use crate::constraint::{InvocationConstraint, InvocationConstraints, MethodConstraints};
use crate::error::{Error, Result};
use crate::loader::Loader;
use crate::marshal::{
    self, AtomicMarshalInputStream, AtomicMarshalOutputStream, ContextElement,
    Object, RemoteException, DEFAULT_MAX_OBJECT_LEN,
};
use crate::method::{Interface, Method};
use crate::protocol::{self, ReplyStatus};
use crate::security::{self, Permission};
use crate::string_constraints::StringMethodConstraints;
use crate::transport::{InboundRequest, ServerCapabilities};

/// Maps a method to the permission a caller needs to invoke it.
pub type PermissionFn = fn(&Method) -> Permission;

/// An exported object.
pub trait Remote: Send + Sync {
    fn interfaces(&self) -> Vec<Interface>;

    /// Runs `method`. An `Err` is an application exception and is returned
    /// to the caller as such.
    fn invoke(
        &self,
        method: &Method,
        args: Vec<Object>,
    ) -> std::result::Result<Object, RemoteException>;

    /// The loader for the classes this object sends and receives, if it
    /// has its own.
    fn loader(&self) -> Option<Loader> {
        None
    }
}

pub trait InvocationDispatcher: Send + Sync {
    /// Handles one inbound call to `remote`.
    fn dispatch(
        &self,
        remote: Option<&dyn Remote>,
        request: &mut dyn InboundRequest,
        context: &[ContextElement],
    ) -> Result<()>;
}

/// The generic dispatch algorithm. Implementors supply method lookup,
/// constraints, the access check and the construction of the marshal
/// streams.
pub trait DispatchHooks {
    fn method_for_hash(&self, hash: u64) -> Option<&Method>;

    fn server_constraints_for(&self, method: &Method) -> InvocationConstraints;

    /// Checked in the access context of the dispatching thread.
    fn check_access(&self, method: &Method, context: &[ContextElement]) -> Result<()>;

    fn logger(&self) -> &Logger;

    fn create_marshal_input_stream<'r>(
        &self,
        remote: Option<&dyn Remote>,
        request: &'r mut dyn InboundRequest,
        integrity: bool,
        context: &[ContextElement],
    ) -> Result<AtomicMarshalInputStream<'r>>;

    /// `method` is `None` when the call could not be read far enough to
    /// know it.
    fn create_marshal_output_stream<'r>(
        &self,
        remote: Option<&dyn Remote>,
        method: Option<&Method>,
        request: &'r mut dyn InboundRequest,
        context: &[ContextElement],
    ) -> Result<AtomicMarshalOutputStream<'r>>;

    fn dispatch_call(
        &self,
        remote: Option<&dyn Remote>,
        request: &mut dyn InboundRequest,
        context: &[ContextElement],
    ) -> Result<()> {
        let remote = remote.ok_or(Error::NullArgument("impl"))?;
        let log = self.logger();

        let (method, status, reply) = match read_call(self, remote, request, context) {
            Ok((method, args)) => {
                trace!(log, "invoking method"; "method" => %method);
                match remote.invoke(method, args) {
                    Ok(value) if value.class() == method.return_type() => {
                        (Some(method), ReplyStatus::Return, Ok(value))
                    }
                    Ok(value) => {
                        let e = Error::InvalidObject(format!(
                            "{} returned {}",
                            method,
                            value.class()
                        ));
                        debug!(log, "bad return value"; "method" => %method, "err" => %e);
                        (Some(method), ReplyStatus::Failed, Object::new(&failure(&e)))
                    }
                    Err(exc) => {
                        debug!(log, "method threw"; "method" => %method, "exception" => %exc);
                        (Some(method), ReplyStatus::Thrown, Object::new(&exc))
                    }
                }
            }
            Err((method, e)) => {
                debug!(log, "call not dispatched"; "err" => %e);
                (method, ReplyStatus::Failed, Object::new(&failure(&e)))
            }
        };

        let (status, reply) = match reply {
            Ok(reply) => (status, reply),
            Err(e) => {
                debug!(log, "reply not encodable"; "status" => ?status, "err" => %e);
                let exc = RemoteException::new("ServerException", &e.to_string());
                match Object::new(&exc) {
                    Ok(reply) => (ReplyStatus::Failed, reply),
                    Err(e) => {
                        error!(log, "failed to encode failure reply"; "err" => %e);
                        request.abort();
                        return Err(e);
                    }
                }
            }
        };

        if let Err(e) = write_reply(self, remote, method, request, context, status, &reply) {
            error!(log, "failed to write reply"; "status" => ?status, "err" => %e);
            request.abort();
            return Err(e);
        }
        Ok(())
    }
}

type CallResult<'h> =
    std::result::Result<(&'h Method, Vec<Object>), (Option<&'h Method>, Error)>;

fn read_call<'h, H: DispatchHooks + ?Sized>(
    hooks: &'h H,
    remote: &dyn Remote,
    request: &mut dyn InboundRequest,
    context: &[ContextElement],
) -> CallResult<'h> {
    let capabilities = request.capabilities();
    let integrity = protocol::read_request_header(request.request_input())
        .map_err(|e| (None, e))?;

    let mut context = context.to_vec();
    context.push(ContextElement::IntegrityEnforcement(integrity));

    let mut input = hooks
        .create_marshal_input_stream(Some(remote), &mut *request, integrity, &context)
        .map_err(|e| (None, e))?;
    let hash = input.read_u64().map_err(|e| (None, e))?;
    let method = hooks.method_for_hash(hash).ok_or_else(|| {
        let msg = format!("unrecognized method hash {:#018x}", hash);
        (None, Error::InvalidObject(msg))
    })?;

    read_args(hooks, method, &*capabilities, integrity, &context, &mut input)
        .map(|args| (method, args))
        .map_err(|e| (Some(method), e))
}

/// Everything between method lookup and invocation: the constraint and
/// access checks, then the arguments.
fn read_args<H: DispatchHooks + ?Sized>(
    hooks: &H,
    method: &Method,
    capabilities: &dyn ServerCapabilities,
    integrity: bool,
    context: &[ContextElement],
    input: &mut AtomicMarshalInputStream,
) -> Result<Vec<Object>> {
    let constraints = hooks.server_constraints_for(method);
    let unfulfilled = capabilities.check_constraints(&constraints)?;
    if !integrity && unfulfilled.requires(&InvocationConstraint::INTEGRITY_YES) {
        return Err(Error::UnsupportedConstraint(InvocationConstraints::required(
            vec![InvocationConstraint::INTEGRITY_YES],
        )));
    }

    hooks.check_access(method, context)?;

    let mut args = Vec::with_capacity(method.parameter_types().len());
    for declared in method.parameter_types() {
        let arg = input.read_value()?;
        if arg.class() != declared.as_str() {
            return Err(Error::InvalidObject(format!(
                "{} expects {}, got {}",
                method,
                declared,
                arg.class()
            )));
        }
        args.push(arg);
    }
    Ok(args)
}

fn write_reply<H: DispatchHooks + ?Sized>(
    hooks: &H,
    remote: &dyn Remote,
    method: Option<&Method>,
    request: &mut dyn InboundRequest,
    context: &[ContextElement],
    status: ReplyStatus,
    reply: &Object,
) -> Result<()> {
    protocol::write_reply_status(request.response_output(), status)?;
    let mut out =
        hooks.create_marshal_output_stream(Some(remote), method, &mut *request, context)?;
    out.write_value(reply)?;
    out.flush()
}

/// The exception reported to the client for a call that did not reach the
/// method.
fn failure(err: &Error) -> RemoteException {
    let kind = match err {
        Error::UnsupportedConstraint(_) => "UnsupportedConstraintException",
        Error::AccessDenied(_) => "AccessControlException",
        Error::InvalidObject(_) | Error::ClassNotFound(_) | Error::Io(_) => {
            "UnmarshalException"
        }
        Error::NullArgument(_) | Error::IllegalArgument(_) => "IllegalArgumentException",
        _ => "ServerException",
    };
    RemoteException::new(kind, &err.to_string())
}

/// Dispatcher whose calls travel over atomic marshal streams.
pub struct AtomicInvocationDispatcher {
    methods: HashMap<u64, Method>,
    server_capabilities: Arc<dyn ServerCapabilities>,
    server_constraints: Option<StringMethodConstraints>,
    permission: Option<PermissionFn>,
    loader: Option<Loader>,
    use_codebase_annotations: bool,
    max_object_len: usize,
    log: Logger,
}

impl AtomicInvocationDispatcher {
    /// Methods with the same signature in several interfaces share one
    /// entry. Fails with `Error::Export` if two different signatures share a
    /// hash, or if the
    /// server capabilities cannot support every constraint set the server
    /// constraints can produce.
    pub fn new(
        methods: Vec<Method>,
        server_capabilities: Arc<dyn ServerCapabilities>,
        server_constraints: Option<StringMethodConstraints>,
        permission: Option<PermissionFn>,
        loader: Option<Loader>,
        use_codebase_annotations: bool,
        log: Option<&Logger>,
    ) -> Result<AtomicInvocationDispatcher> {
        let mut table: HashMap<u64, Method> = HashMap::with_capacity(methods.len());
        for method in methods {
            match table.entry(method.hash()) {
                Entry::Vacant(e) => {
                    e.insert(method);
                }
                // declared by more than one interface
                Entry::Occupied(e) if e.get().same_signature(&method) => (),
                Entry::Occupied(e) => {
                    return Err(Error::Export(format!(
                        "method hash collision between {} and {}",
                        e.get(),
                        method
                    )));
                }
            }
        }

        let possible: Vec<InvocationConstraints> = match &server_constraints {
            Some(sc) => sc.possible_constraints().collect(),
            None => vec![InvocationConstraints::EMPTY],
        };
        for constraints in &possible {
            server_capabilities
                .check_constraints(constraints)
                .map_err(|e| {
                    Error::Export(format!("server constraints not supported: {}", e))
                })?;
        }

        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

        Ok(AtomicInvocationDispatcher {
            methods: table,
            server_capabilities,
            server_constraints,
            permission,
            loader,
            use_codebase_annotations,
            max_object_len: DEFAULT_MAX_OBJECT_LEN,
            log,
        })
    }

    pub fn with_max_object_len(mut self, max: usize) -> AtomicInvocationDispatcher {
        self.max_object_len = max;
        self
    }

    pub fn methods(&self) -> impl Iterator<Item = &Method> {
        self.methods.values()
    }

    pub fn server_capabilities(&self) -> &Arc<dyn ServerCapabilities> {
        &self.server_capabilities
    }

    pub fn server_constraints(&self) -> Option<&StringMethodConstraints> {
        self.server_constraints.as_ref()
    }

    /// The configured loader, else the object's own, else the system
    /// loader.
    fn stream_loader(&self, remote: &dyn Remote) -> Result<Loader> {
        if let Some(loader) = &self.loader {
            return Ok(loader.clone());
        }
        match remote.loader() {
            Some(loader) => Ok(loader),
            None => Loader::system_checked(),
        }
    }
}

impl DispatchHooks for AtomicInvocationDispatcher {
    fn method_for_hash(&self, hash: u64) -> Option<&Method> {
        self.methods.get(&hash)
    }

    fn server_constraints_for(&self, method: &Method) -> InvocationConstraints {
        self.server_constraints
            .as_ref()
            .map_or(InvocationConstraints::EMPTY, |c| c.get_constraints(method))
    }

    fn check_access(&self, method: &Method, _context: &[ContextElement]) -> Result<()> {
        match self.permission {
            Some(permission) => security::check_permission(&permission(method)),
            None => Ok(()),
        }
    }

    fn logger(&self) -> &Logger {
        &self.log
    }

    fn create_marshal_input_stream<'r>(
        &self,
        remote: Option<&dyn Remote>,
        request: &'r mut dyn InboundRequest,
        integrity: bool,
        context: &[ContextElement],
    ) -> Result<AtomicMarshalInputStream<'r>> {
        let remote = remote.ok_or(Error::NullArgument("impl"))?;

        let source = request.request_input();
        let context = marshal::snapshot(context);
        let use_annotations = self.use_codebase_annotations;
        let max_object_len = self.max_object_len;
        security::privileged_stream(move || {
            // move, not reborrow
            let source = source;
            let loader = self.stream_loader(remote)?;
            let input = AtomicMarshalInputStream::new(
                source,
                loader.clone(),
                integrity,
                loader,
                context,
                use_annotations,
            )?;
            Ok(input.with_max_object_len(max_object_len))
        })
    }

    fn create_marshal_output_stream<'r>(
        &self,
        remote: Option<&dyn Remote>,
        _method: Option<&Method>,
        request: &'r mut dyn InboundRequest,
        context: &[ContextElement],
    ) -> Result<AtomicMarshalOutputStream<'r>> {
        let remote = remote.ok_or(Error::NullArgument("impl"))?;

        let sink = request.response_output();
        let context = marshal::snapshot(context);
        let use_annotations = self.use_codebase_annotations;
        security::privileged_stream(move || {
            // move, not reborrow
            let sink = sink;
            let loader = self.stream_loader(remote)?;
            AtomicMarshalOutputStream::new(sink, loader, context, use_annotations)
        })
    }
}

impl InvocationDispatcher for AtomicInvocationDispatcher {
    fn dispatch(
        &self,
        remote: Option<&dyn Remote>,
        request: &mut dyn InboundRequest,
        context: &[ContextElement],
    ) -> Result<()> {
        self.dispatch_call(remote, request, context)
    }
}

impl fmt::Debug for AtomicInvocationDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AtomicInvocationDispatcher")
            .field("methods", &self.methods.len())
            .field("server_constraints", &self.server_constraints)
            .field("loader", &self.loader)
            .field("use_codebase_annotations", &self.use_codebase_annotations)
            .finish()
    }
}
