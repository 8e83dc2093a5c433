// Copyright 2020 Joyent, Inc.

use std::io;

use thiserror::Error;

use crate::constraint::InvocationConstraints;
use crate::marshal::RemoteException;
use crate::security::Permission;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} is null")]
    NullArgument(&'static str),
    #[error("illegal argument: {0}")]
    IllegalArgument(String),
    #[error("invalid object: {0}")]
    InvalidObject(String),
    #[error("class not found: {0}")]
    ClassNotFound(String),
    #[error("access denied: {0}")]
    AccessDenied(Permission),
    #[error("unsupported constraints: {0:?}")]
    UnsupportedConstraint(InvocationConstraints),
    #[error("export failed: {0}")]
    Export(String),
    #[error("no such object in table")]
    NoSuchObject,
    #[error("remote method threw {0}")]
    Application(RemoteException),
    #[error("server failed to dispatch call: {0}")]
    Server(RemoteException),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Programming and permission errors. These are never wrapped when they
    /// escape a privileged stream construction.
    pub fn is_runtime(&self) -> bool {
        match self {
            Error::NullArgument(_)
            | Error::IllegalArgument(_)
            | Error::AccessDenied(_) => true,
            _ => false,
        }
    }

    /// Translation applied to failures raised while constructing a marshal
    /// stream: I/O and runtime errors pass through, anything else becomes
    /// an I/O error carrying the original as its source.
    pub fn into_stream_error(self) -> Error {
        match self {
            Error::Io(_) => self,
            e if e.is_runtime() => e,
            e => Error::Io(io::Error::new(io::ErrorKind::Other, e)),
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            Error::NullArgument(_) | Error::IllegalArgument(_) => {
                io::Error::new(io::ErrorKind::InvalidInput, err)
            }
            Error::AccessDenied(_) => {
                io::Error::new(io::ErrorKind::PermissionDenied, err)
            }
            Error::InvalidObject(_) | Error::ClassNotFound(_) => {
                io::Error::new(io::ErrorKind::InvalidData, err)
            }
            _ => io::Error::new(io::ErrorKind::Other, err),
        }
    }
}
