// Copyright 2020 Joyent, Inc.

//! atomic-jeri: an invocation layer for remote objects that only ever hands
//! fully validated objects to application code.
//!
//! An exported object is described by its remote interfaces. For each export
//! an `AtomicILFactory` builds a pair:
//!
//! * a `Proxy`, held by clients. Calling a method on it marshals the call
//!   through its `AtomicInvocationHandler`.
//!
//! * an `AtomicInvocationDispatcher`, held by the server. It unmarshals the
//!   call, invokes the object and marshals the reply.
//!
//! Both sides read and write objects through atomic marshal streams (see
//! `marshal`). An object read from such a stream has been completely rebuilt
//! and validated before the caller sees it; a truncated, corrupted or forged
//! stream fails the read instead.
//!
//! Constraints
//!
//! Calls can be required to satisfy invocation constraints (integrity,
//! confidentiality, authentication and so on). The constraints for a method
//! come from an ordered list of method rules, `StringMethodConstraints`:
//!
//! * an exact method name, optionally restricted to a parameter type list
//!
//! * a name with one leading or trailing `*` wildcard
//!
//! * a default rule, which must come last
//!
//! The first rule that matches a method wins. Rule lists are checked when
//! they are built: a rule that would hide a later one is an error.
//!
//! Call format
//!
//! The framing of requests and replies is described in `protocol`. A
//! transport only has to move bytes; `loopback` provides an in-process one.

#![allow(missing_docs)]

pub mod config;
pub mod constraint;
pub mod dispatcher;
pub mod error;
pub mod factory;
pub mod handler;
pub mod loader;
pub mod loopback;
pub mod marshal;
pub mod method;
pub mod protocol;
pub mod security;
pub mod string_constraints;
pub mod transport;

pub use crate::config::FactoryConfig;
pub use crate::constraint::{
    InvocationConstraint, InvocationConstraints, MethodConstraints,
};
pub use crate::dispatcher::{AtomicInvocationDispatcher, InvocationDispatcher, Remote};
pub use crate::error::{Error, Result};
pub use crate::factory::{AtomicILFactory, Instances, InvocationLayerFactory};
pub use crate::handler::{AtomicInvocationHandler, InvocationHandler, Proxy};
pub use crate::loader::{Loader, Serializable};
pub use crate::marshal::{Object, RemoteException};
pub use crate::method::{Interface, Method};
pub use crate::string_constraints::{MethodKey, StringMethodConstraints, StringMethodDesc};
