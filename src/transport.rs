// Copyright 2020 Joyent, Inc.

//! What the invocation layer needs from a transport.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::io::{Read, Write};
use std::sync::Arc;

use byteorder::ReadBytesExt;
use uuid::Uuid;

use crate::constraint::InvocationConstraints;
use crate::error::{Error, Result};

/// Sent by the server ahead of the reply when the target object exists.
pub const ACK_FOUND: u8 = 0x1;
/// Sent by the server instead of a reply when the target object does not
/// exist.
pub const ACK_NO_SUCH_OBJECT: u8 = 0x0;

/// The client side of a single call.
pub trait OutboundRequest: Send {
    fn request_output(&mut self) -> &mut dyn Write;

    fn response_input(&mut self) -> &mut dyn Read;

    /// Constraints the transport could not satisfy on its own and that the
    /// layers above must enforce. Integrity is the one this layer handles.
    fn unfulfilled_constraints(&self) -> InvocationConstraints;

    /// Marks the end of the request data.
    fn close_request(&mut self) -> Result<()>;

    fn abort(&mut self);
}

/// The server side of a single call.
pub trait InboundRequest: Send {
    fn request_input(&mut self) -> &mut dyn Read;

    fn response_output(&mut self) -> &mut dyn Write;

    /// What the connection carrying this request can guarantee. Owned, so
    /// the check can run while the request streams are borrowed.
    fn capabilities(&self) -> Arc<dyn ServerCapabilities>;

    fn abort(&mut self);
}

/// Checks a constraint set against what a server or connection supports.
/// Returns the constraints left for the invocation layer to enforce.
pub trait ServerCapabilities: Send + Sync {
    fn check_constraints(
        &self,
        constraints: &InvocationConstraints,
    ) -> Result<InvocationConstraints>;
}

/// A remote communication endpoint: somewhere requests can be sent.
pub trait Endpoint: Send + Sync {
    fn new_request(
        &self,
        constraints: &InvocationConstraints,
    ) -> Result<Box<dyn OutboundRequest>>;

    /// Two endpoints with the same descriptor reach the same server.
    fn descriptor(&self) -> String;
}

pub fn new_object_id() -> Uuid {
    Uuid::new_v4()
}

pub fn read_object_id(input: &mut dyn Read) -> Result<Uuid> {
    let mut bytes = [0u8; 16];
    input.read_exact(&mut bytes)?;
    Ok(Uuid::from_bytes(bytes))
}

/// A remote object's address: its object id and the endpoint of the server
/// exporting it.
#[derive(Clone)]
pub struct ObjectEndpoint {
    id: Uuid,
    endpoint: Arc<dyn Endpoint>,
}

impl ObjectEndpoint {
    pub fn new(id: Uuid, endpoint: Arc<dyn Endpoint>) -> ObjectEndpoint {
        ObjectEndpoint { id, endpoint }
    }

    pub fn id(&self) -> &Uuid {
        &self.id
    }

    pub fn endpoint(&self) -> &Arc<dyn Endpoint> {
        &self.endpoint
    }

    /// Starts a call to the object: opens a request and writes the object
    /// id ahead of the call data.
    pub fn new_call(
        &self,
        constraints: &InvocationConstraints,
    ) -> Result<Box<dyn OutboundRequest>> {
        let mut request = self.endpoint.new_request(constraints)?;
        request.request_output().write_all(self.id.as_bytes())?;
        Ok(request)
    }

    /// Reads the server's acknowledgement that the object exists. The reply
    /// follows on success.
    pub fn execute_call(&self, request: &mut dyn OutboundRequest) -> Result<()> {
        match request.response_input().read_u8()? {
            ACK_FOUND => Ok(()),
            ACK_NO_SUCH_OBJECT => Err(Error::NoSuchObject),
            b => Err(Error::InvalidObject(format!(
                "unexpected call acknowledgement {:#04x}",
                b
            ))),
        }
    }
}

impl PartialEq for ObjectEndpoint {
    fn eq(&self, other: &ObjectEndpoint) -> bool {
        self.id == other.id
            && self.endpoint.descriptor() == other.endpoint.descriptor()
    }
}

impl Eq for ObjectEndpoint {}

impl Hash for ObjectEndpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.endpoint.descriptor().hash(state);
    }
}

impl fmt::Debug for ObjectEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ObjectEndpoint")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint.descriptor())
            .finish()
    }
}
