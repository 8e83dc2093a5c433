// Copyright 2020 Joyent, Inc.

//! Client side of the invocation layer: the proxy and its invocation
//! handler.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use slog::{debug, o, trace, Drain, Logger};

use crate::constraint::{InvocationConstraint, InvocationConstraints, MethodConstraints};
use crate::error::{Error, Result};
use crate::loader::{Loader, Serializable};
use crate::marshal::{
    self, AtomicMarshalInputStream, AtomicMarshalOutputStream, ContextElement,
    Object, RemoteException, DEFAULT_MAX_OBJECT_LEN,
};
use crate::method::{Interface, Method};
use crate::protocol::{self, ReplyStatus};
use crate::security;
use crate::string_constraints::StringMethodConstraints;
use crate::transport::{ObjectEndpoint, OutboundRequest};

/// The generic client call algorithm. Implementors decide how the marshal
/// streams for each call are built.
pub trait InvocationHandler: Send + Sync {
    fn object_endpoint(&self) -> &ObjectEndpoint;

    /// The constraints a call to `method` must satisfy.
    fn call_constraints(&self, method: &Method) -> InvocationConstraints;

    fn logger(&self) -> &Logger;

    fn create_marshal_output_stream<'r>(
        &self,
        proxy: Option<&Proxy>,
        method: Option<&Method>,
        request: &'r mut dyn OutboundRequest,
        context: &[ContextElement],
    ) -> Result<AtomicMarshalOutputStream<'r>>;

    fn create_marshal_input_stream<'r>(
        &self,
        proxy: Option<&Proxy>,
        method: Option<&Method>,
        request: &'r mut dyn OutboundRequest,
        integrity: bool,
        context: &[ContextElement],
    ) -> Result<AtomicMarshalInputStream<'r>>;

    /// Performs one remote call. An exception thrown by the remote method
    /// comes back as `Error::Application`; a call the server could not carry
    /// out comes back as `Error::Server`.
    fn invoke(&self, proxy: &Proxy, method: &Method, args: &[Object]) -> Result<Object> {
        if args.len() != method.parameter_types().len() {
            return Err(Error::IllegalArgument(format!(
                "{} takes {} arguments, {} given",
                method,
                method.parameter_types().len(),
                args.len()
            )));
        }

        let constraints = self.call_constraints(method);
        let endpoint = self.object_endpoint();
        debug!(self.logger(), "invoking remote method";
            "method" => %method, "object_id" => %endpoint.id());

        let mut request = endpoint.new_call(&constraints)?;
        let result = invoke_once(self, proxy, method, args, &mut *request);
        match &result {
            Ok(_) | Err(Error::Application(_)) | Err(Error::Server(_)) => (),
            Err(e) => {
                debug!(self.logger(), "remote call failed";
                    "method" => %method, "err" => %e);
                request.abort();
            }
        }
        result
    }
}

fn invoke_once<H: InvocationHandler + ?Sized>(
    handler: &H,
    proxy: &Proxy,
    method: &Method,
    args: &[Object],
    request: &mut dyn OutboundRequest,
) -> Result<Object> {
    let integrity = request
        .unfulfilled_constraints()
        .requires(&InvocationConstraint::INTEGRITY_YES);
    let context = [ContextElement::IntegrityEnforcement(integrity)];

    protocol::write_request_header(request.request_output(), integrity)?;
    {
        let mut out = handler.create_marshal_output_stream(
            Some(proxy),
            Some(method),
            &mut *request,
            &context,
        )?;
        out.write_u64(method.hash());
        for arg in args {
            out.write_value(arg)?;
        }
        out.flush()?;
    }
    request.close_request()?;

    handler.object_endpoint().execute_call(&mut *request)?;
    let status = protocol::read_reply_status(request.response_input())?;
    trace!(handler.logger(), "received reply"; "status" => ?status);

    let mut input = handler.create_marshal_input_stream(
        Some(proxy),
        Some(method),
        &mut *request,
        integrity,
        &context,
    )?;
    match status {
        ReplyStatus::Return => {
            let value = input.read_value()?;
            if value.class() != method.return_type() {
                return Err(Error::InvalidObject(format!(
                    "{} returned {}",
                    method,
                    value.class()
                )));
            }
            Ok(value)
        }
        ReplyStatus::Thrown => Err(Error::Application(input.read_object()?)),
        ReplyStatus::Failed => {
            Err(Error::Server(input.read_object::<RemoteException>()?))
        }
    }
}

/// Invocation handler whose calls travel over atomic marshal streams.
///
/// Equality covers the object endpoint, the server constraints and the
/// codebase annotation flag. Client constraints are left out: they are an
/// overlay a holder of the proxy may change, and two proxies that differ
/// only in them still refer to the same remote object.
pub struct AtomicInvocationHandler {
    object_endpoint: ObjectEndpoint,
    server_constraints: Option<StringMethodConstraints>,
    client_constraints: Option<StringMethodConstraints>,
    use_codebase_annotations: bool,
    max_object_len: usize,
    log: Logger,
}

impl AtomicInvocationHandler {
    pub fn new(
        object_endpoint: ObjectEndpoint,
        server_constraints: Option<StringMethodConstraints>,
        use_codebase_annotations: bool,
        log: Option<&Logger>,
    ) -> AtomicInvocationHandler {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        AtomicInvocationHandler {
            log: log.new(o!("object_id" => object_endpoint.id().to_string())),
            object_endpoint,
            server_constraints,
            client_constraints: None,
            use_codebase_annotations,
            max_object_len: DEFAULT_MAX_OBJECT_LEN,
        }
    }

    pub fn with_max_object_len(mut self, max: usize) -> AtomicInvocationHandler {
        self.max_object_len = max;
        self
    }

    /// A copy of this handler carrying `constraints` as its client
    /// constraints.
    pub fn with_client_constraints(
        &self,
        constraints: Option<StringMethodConstraints>,
    ) -> AtomicInvocationHandler {
        AtomicInvocationHandler {
            object_endpoint: self.object_endpoint.clone(),
            server_constraints: self.server_constraints.clone(),
            client_constraints: constraints,
            use_codebase_annotations: self.use_codebase_annotations,
            max_object_len: self.max_object_len,
            log: self.log.clone(),
        }
    }

    pub fn server_constraints(&self) -> Option<&StringMethodConstraints> {
        self.server_constraints.as_ref()
    }

    pub fn client_constraints(&self) -> Option<&StringMethodConstraints> {
        self.client_constraints.as_ref()
    }

    pub fn use_codebase_annotations(&self) -> bool {
        self.use_codebase_annotations
    }

    /// Equal, and with the same client constraints.
    pub fn check_trust_equivalence(&self, other: &AtomicInvocationHandler) -> bool {
        self == other && self.client_constraints == other.client_constraints
    }

    fn proxy_loader(proxy: &Proxy) -> Loader {
        proxy.loader().clone()
    }
}

impl InvocationHandler for AtomicInvocationHandler {
    fn object_endpoint(&self) -> &ObjectEndpoint {
        &self.object_endpoint
    }

    fn call_constraints(&self, method: &Method) -> InvocationConstraints {
        let server = self
            .server_constraints
            .as_ref()
            .map_or(InvocationConstraints::EMPTY, |c| c.get_constraints(method));
        let client = self
            .client_constraints
            .as_ref()
            .map_or(InvocationConstraints::EMPTY, |c| c.get_constraints(method));
        InvocationConstraints::combine(&server, &client)
    }

    fn logger(&self) -> &Logger {
        &self.log
    }

    fn create_marshal_output_stream<'r>(
        &self,
        proxy: Option<&Proxy>,
        method: Option<&Method>,
        request: &'r mut dyn OutboundRequest,
        context: &[ContextElement],
    ) -> Result<AtomicMarshalOutputStream<'r>> {
        let proxy = proxy.ok_or(Error::NullArgument("proxy"))?;
        method.ok_or(Error::NullArgument("method"))?;

        let sink = request.request_output();
        let context = marshal::snapshot(context);
        let use_annotations = self.use_codebase_annotations;
        security::privileged_stream(move || {
            // move, not reborrow
            let sink = sink;
            let loader = AtomicInvocationHandler::proxy_loader(proxy);
            AtomicMarshalOutputStream::new(sink, loader, context, use_annotations)
        })
    }

    fn create_marshal_input_stream<'r>(
        &self,
        proxy: Option<&Proxy>,
        method: Option<&Method>,
        request: &'r mut dyn OutboundRequest,
        integrity: bool,
        context: &[ContextElement],
    ) -> Result<AtomicMarshalInputStream<'r>> {
        method.ok_or(Error::NullArgument("method"))?;
        let proxy = proxy.ok_or(Error::NullArgument("proxy"))?;
        if !proxy.is_handled_by(self) {
            return Err(Error::IllegalArgument(String::from(
                "proxy is not associated with this handler",
            )));
        }

        let source = request.response_input();
        let context = marshal::snapshot(context);
        let use_annotations = self.use_codebase_annotations;
        let max_object_len = self.max_object_len;
        security::privileged_stream(move || {
            // move, not reborrow
            let source = source;
            let loader = AtomicInvocationHandler::proxy_loader(proxy);
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
}

impl PartialEq for AtomicInvocationHandler {
    fn eq(&self, other: &AtomicInvocationHandler) -> bool {
        self.use_codebase_annotations == other.use_codebase_annotations
            && self.object_endpoint == other.object_endpoint
            && self.server_constraints == other.server_constraints
    }
}

impl Eq for AtomicInvocationHandler {}

impl Hash for AtomicInvocationHandler {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.use_codebase_annotations.hash(state);
        self.object_endpoint.hash(state);
        self.server_constraints.hash(state);
    }
}

impl fmt::Debug for AtomicInvocationHandler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AtomicInvocationHandler")
            .field("object_endpoint", &self.object_endpoint)
            .field("server_constraints", &self.server_constraints)
            .field("client_constraints", &self.client_constraints)
            .field("use_codebase_annotations", &self.use_codebase_annotations)
            .finish()
    }
}

/// A client's reference to a remote object.
#[derive(Clone)]
pub struct Proxy {
    interfaces: Vec<Interface>,
    handler: Arc<AtomicInvocationHandler>,
    loader: Loader,
}

impl Proxy {
    pub fn new(
        interfaces: Vec<Interface>,
        handler: AtomicInvocationHandler,
        loader: Loader,
    ) -> Proxy {
        Proxy {
            interfaces,
            handler: Arc::new(handler),
            loader,
        }
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    pub fn handler(&self) -> &AtomicInvocationHandler {
        &self.handler
    }

    /// The loader used to resolve classes in replies to this proxy.
    pub fn loader(&self) -> &Loader {
        &self.loader
    }

    pub fn implements(&self, method: &Method) -> bool {
        self.interfaces
            .iter()
            .any(|i| i.methods().iter().any(|m| m == method))
    }

    pub fn invoke(&self, method: &Method, args: &[Object]) -> Result<Object> {
        if !self.implements(method) {
            return Err(Error::IllegalArgument(format!(
                "{} is not a method of this proxy",
                method
            )));
        }
        self.handler.invoke(self, method, args)
    }

    /// `invoke`, decoding the return value as a `T`.
    pub fn call<T: Serializable>(&self, method: &Method, args: &[Object]) -> Result<T> {
        self.invoke(method, args)?.decode()
    }

    /// A new proxy for the same remote object whose calls also satisfy
    /// `constraints`.
    pub fn set_constraints(&self, constraints: Option<StringMethodConstraints>) -> Proxy {
        Proxy {
            interfaces: self.interfaces.clone(),
            handler: Arc::new(self.handler.with_client_constraints(constraints)),
            loader: self.loader.clone(),
        }
    }

    pub fn get_constraints(&self) -> Option<&StringMethodConstraints> {
        self.handler.client_constraints()
    }

    pub fn check_trust_equivalence(&self, other: &Proxy) -> bool {
        self.interfaces == other.interfaces
            && self.handler.check_trust_equivalence(&other.handler)
    }

    pub(crate) fn is_handled_by(&self, handler: &AtomicInvocationHandler) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.handler), handler)
    }
}

impl PartialEq for Proxy {
    fn eq(&self, other: &Proxy) -> bool {
        self.interfaces == other.interfaces && self.handler == other.handler
    }
}

impl Eq for Proxy {}

impl Hash for Proxy {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.handler.hash(state);
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("interfaces", &self.interfaces)
            .field("handler", &self.handler)
            .finish()
    }
}
