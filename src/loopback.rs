// Copyright 2020 Joyent, Inc.

//! An in-process transport and object table.
//!
//! Requests are buffered in memory and dispatched when the client closes
//! them. Each dispatch runs on its own thread so that it starts from a clean
//! access context, optionally restricted to a fixed set of client
//! permissions.

use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};
use std::mem;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::thread;

use slog::{debug, info, o, Drain, Logger};
use uuid::Uuid;

use crate::constraint::{InvocationConstraint, InvocationConstraints};
use crate::dispatcher::{InvocationDispatcher, Remote};
use crate::error::{Error, Result};
use crate::factory::InvocationLayerFactory;
use crate::handler::Proxy;
use crate::marshal::ContextElement;
use crate::security::{self, Permission};
use crate::transport::{
    self, Endpoint, InboundRequest, ObjectEndpoint, OutboundRequest,
    ServerCapabilities, ACK_FOUND, ACK_NO_SUCH_OBJECT,
};

/// What a loopback connection can guarantee. Nothing leaves the process,
/// so integrity and confidentiality hold either way; authentication and
/// delegation are not available. Integrity, when required, is left to the
/// invocation layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackCapabilities;

impl ServerCapabilities for LoopbackCapabilities {
    fn check_constraints(
        &self,
        constraints: &InvocationConstraints,
    ) -> Result<InvocationConstraints> {
        for c in constraints.requirements() {
            let supported = match c {
                InvocationConstraint::Integrity(_)
                | InvocationConstraint::Confidentiality(_)
                | InvocationConstraint::ConnectionRelativeTime(_) => true,
                InvocationConstraint::ServerAuthentication(b)
                | InvocationConstraint::ClientAuthentication(b)
                | InvocationConstraint::Delegation(b) => !b,
                InvocationConstraint::ServerMinPrincipal(_)
                | InvocationConstraint::ClientMinPrincipal(_) => false,
            };
            if !supported {
                return Err(Error::UnsupportedConstraint(constraints.clone()));
            }
        }

        if constraints.requires(&InvocationConstraint::INTEGRITY_YES) {
            Ok(InvocationConstraints::required(vec![
                InvocationConstraint::INTEGRITY_YES,
            ]))
        } else {
            Ok(InvocationConstraints::EMPTY)
        }
    }
}

struct Target {
    remote: Arc<dyn Remote>,
    dispatcher: Arc<dyn InvocationDispatcher>,
}

pub struct LoopbackServer {
    id: Uuid,
    objects: RwLock<HashMap<Uuid, Target>>,
    client_permissions: Option<Vec<Permission>>,
    log: Logger,
}

impl LoopbackServer {
    pub fn new(log: Option<&Logger>) -> Arc<LoopbackServer> {
        LoopbackServer::build(None, log)
    }

    /// A server whose dispatches run limited to `permissions`.
    pub fn with_client_permissions(
        permissions: Vec<Permission>,
        log: Option<&Logger>,
    ) -> Arc<LoopbackServer> {
        LoopbackServer::build(Some(permissions), log)
    }

    fn build(
        client_permissions: Option<Vec<Permission>>,
        log: Option<&Logger>,
    ) -> Arc<LoopbackServer> {
        let id = transport::new_object_id();
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        Arc::new(LoopbackServer {
            id,
            objects: RwLock::new(HashMap::new()),
            client_permissions,
            log: log.new(o!("server" => id.to_string())),
        })
    }

    pub fn endpoint(self: &Arc<Self>) -> Arc<dyn Endpoint> {
        Arc::new(LoopbackEndpoint {
            server: Arc::downgrade(self),
            descriptor: format!("loopback:{}", self.id),
        })
    }

    /// Exports `remote` under a fresh object id and returns the proxy
    /// clients use to call it.
    pub fn export(
        self: &Arc<Self>,
        remote: Arc<dyn Remote>,
        factory: &dyn InvocationLayerFactory,
    ) -> Result<Proxy> {
        let id = transport::new_object_id();
        let object_endpoint = ObjectEndpoint::new(id, self.endpoint());
        let instances = factory.create_instances(
            &*remote,
            object_endpoint,
            Arc::new(LoopbackCapabilities),
        )?;

        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                Target {
                    remote,
                    dispatcher: Arc::from(instances.dispatcher),
                },
            );
        info!(self.log, "exported object"; "object_id" => %id);
        Ok(instances.proxy)
    }

    /// Returns whether the object was exported.
    pub fn unexport(&self, id: &Uuid) -> bool {
        let removed = self
            .objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some();
        if removed {
            info!(self.log, "unexported object"; "object_id" => %id);
        }
        removed
    }

    /// Runs one buffered request and returns the response bytes.
    fn handle(&self, request: Vec<u8>) -> Result<Vec<u8>> {
        let mut input = Cursor::new(request);
        let id = transport::read_object_id(&mut input)?;

        let target = self
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|t| (Arc::clone(&t.remote), Arc::clone(&t.dispatcher)));
        let (remote, dispatcher) = match target {
            Some(t) => t,
            None => {
                debug!(self.log, "call to unknown object"; "object_id" => %id);
                return Ok(vec![ACK_NO_SUCH_OBJECT]);
            }
        };

        let mut inbound = LoopbackInbound {
            input,
            output: vec![ACK_FOUND],
            aborted: false,
        };
        let context = [ContextElement::ClientHost(String::from("loopback"))];
        let permissions = self.client_permissions.clone();

        let dispatched = thread::scope(|s| {
            s.spawn(|| {
                let mut run = || dispatcher.dispatch(Some(&*remote), &mut inbound, &context);
                match permissions {
                    Some(p) => security::with_permissions(p, run),
                    None => run(),
                }
            })
            .join()
        });

        match dispatched {
            Ok(Ok(())) if !inbound.aborted => Ok(inbound.output),
            Ok(Ok(())) => Err(Error::Io(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "request aborted",
            ))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Io(io::Error::new(
                io::ErrorKind::Other,
                "dispatch thread panicked",
            ))),
        }
    }
}

struct LoopbackEndpoint {
    server: Weak<LoopbackServer>,
    descriptor: String,
}

impl Endpoint for LoopbackEndpoint {
    fn new_request(
        &self,
        constraints: &InvocationConstraints,
    ) -> Result<Box<dyn OutboundRequest>> {
        let server = self.server.upgrade().ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("{} is gone", self.descriptor),
            ))
        })?;
        let unfulfilled = LoopbackCapabilities.check_constraints(constraints)?;

        Ok(Box::new(LoopbackOutbound {
            server,
            request: Vec::new(),
            response: Cursor::new(Vec::new()),
            unfulfilled,
        }))
    }

    fn descriptor(&self) -> String {
        self.descriptor.clone()
    }
}

struct LoopbackOutbound {
    server: Arc<LoopbackServer>,
    request: Vec<u8>,
    response: Cursor<Vec<u8>>,
    unfulfilled: InvocationConstraints,
}

impl OutboundRequest for LoopbackOutbound {
    fn request_output(&mut self) -> &mut dyn Write {
        &mut self.request
    }

    fn response_input(&mut self) -> &mut dyn Read {
        &mut self.response
    }

    fn unfulfilled_constraints(&self) -> InvocationConstraints {
        self.unfulfilled.clone()
    }

    fn close_request(&mut self) -> Result<()> {
        let request = mem::take(&mut self.request);
        self.response = Cursor::new(self.server.handle(request)?);
        Ok(())
    }

    fn abort(&mut self) {
        self.request.clear();
        self.response = Cursor::new(Vec::new());
    }
}

struct LoopbackInbound {
    input: Cursor<Vec<u8>>,
    output: Vec<u8>,
    aborted: bool,
}

impl InboundRequest for LoopbackInbound {
    fn request_input(&mut self) -> &mut dyn Read {
        &mut self.input
    }

    fn response_output(&mut self) -> &mut dyn Write {
        &mut self.output
    }

    fn capabilities(&self) -> Arc<dyn ServerCapabilities> {
        Arc::new(LoopbackCapabilities)
    }

    fn abort(&mut self) {
        self.aborted = true;
    }
}
