// Copyright 2020 Joyent, Inc.

//! Thread-scoped access control.
//!
//! Each thread carries a stack of frames. A restricted frame grants a fixed
//! set of permissions; a privileged frame ends the check, so code running
//! under it is not limited by the restricted frames of its callers. With no
//! frames at all every permission is granted.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::method::Method;

#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Permission {
    /// Construct an atomic marshal stream.
    CreateMarshalStream,
    /// Look up the system loader.
    GetLoader,
    /// Invoke the named remote method, `Interface.method`.
    Invoke(String),
}

impl Permission {
    pub fn for_method(method: &Method) -> Permission {
        Permission::Invoke(format!("{}.{}", method.declaring(), method.name()))
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Permission::CreateMarshalStream => write!(f, "createMarshalStream"),
            Permission::GetLoader => write!(f, "getLoader"),
            Permission::Invoke(name) => write!(f, "invoke {}", name),
        }
    }
}

enum Frame {
    Restricted(Arc<BTreeSet<Permission>>),
    Privileged,
}

thread_local! {
    static FRAMES: RefCell<Vec<Frame>> = RefCell::new(Vec::new());
}

struct FrameGuard;

impl FrameGuard {
    fn push(frame: Frame) -> FrameGuard {
        FRAMES.with(|frames| frames.borrow_mut().push(frame));
        FrameGuard
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        FRAMES.with(|frames| {
            frames.borrow_mut().pop();
        });
    }
}

pub fn check_permission(permission: &Permission) -> Result<()> {
    FRAMES.with(|frames| {
        for frame in frames.borrow().iter().rev() {
            match frame {
                Frame::Privileged => return Ok(()),
                Frame::Restricted(granted) => {
                    if !granted.contains(permission) {
                        return Err(Error::AccessDenied(permission.clone()));
                    }
                }
            }
        }
        Ok(())
    })
}

/// Runs `f` limited to `permissions`, on top of whatever the caller is
/// already limited to.
pub fn with_permissions<I, F, T>(permissions: I, f: F) -> T
where
    I: IntoIterator<Item = Permission>,
    F: FnOnce() -> T,
{
    let granted = Arc::new(permissions.into_iter().collect());
    let _guard = FrameGuard::push(Frame::Restricted(granted));
    f()
}

/// Runs `f` without the restrictions of the calling context. Keep the
/// closure to the single operation that needs it.
pub fn do_privileged<F, T>(f: F) -> T
where
    F: FnOnce() -> T,
{
    let _guard = FrameGuard::push(Frame::Privileged);
    f()
}

/// Marshal stream construction: runs privileged and translates failures the
/// way stream hooks report them.
pub fn privileged_stream<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    do_privileged(f).map_err(Error::into_stream_error)
}
