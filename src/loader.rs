// Copyright 2020 Joyent, Inc.

//! Type registries used to resolve the class names found in a marshal
//! stream.
//!
//! A `Loader` maps class names to validating decoders. An input stream only
//! accepts an object whose class its loader (or one of the loader's
//! parents) knows, and only hands the object out once the registered decoder
//! has rebuilt and validated it.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::marshal::RemoteException;
use crate::security::{self, Permission};

/// A type that can travel through an atomic marshal stream.
///
/// Deserialization rebuilds the whole value before `validate` runs; a value
/// is only returned to the caller when both succeed.
pub trait Serializable: Serialize + DeserializeOwned {
    fn class_name() -> Cow<'static, str>;

    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

macro_rules! builtin_class {
    ($($t:ty => $name:expr),* $(,)?) => {
        $(
            impl Serializable for $t {
                fn class_name() -> Cow<'static, str> {
                    Cow::Borrowed($name)
                }
            }
        )*
    };
}

builtin_class!(
    () => "()",
    bool => "bool",
    i32 => "i32",
    i64 => "i64",
    u32 => "u32",
    u64 => "u64",
    f64 => "f64",
    String => "String",
);

impl<T: Serializable> Serializable for Vec<T> {
    fn class_name() -> Cow<'static, str> {
        Cow::Owned(format!("[{}]", T::class_name()))
    }

    fn validate(&self) -> Result<()> {
        self.iter().try_for_each(Serializable::validate)
    }
}

/// Rebuilds a `T` from its serialized form and validates it.
pub(crate) fn decode<T: Serializable>(data: &Value) -> Result<T> {
    let obj = T::deserialize(data).map_err(|e| {
        Error::InvalidObject(format!("{}: {}", T::class_name(), e))
    })?;
    obj.validate()?;
    Ok(obj)
}

fn check<T: Serializable>(data: &Value) -> Result<()> {
    decode::<T>(data).map(|_| ())
}

/// A resolved class: its name and its validating decoder.
#[derive(Clone)]
pub struct ClassDesc {
    name: String,
    check: fn(&Value) -> Result<()>,
}

impl ClassDesc {
    fn of<T: Serializable>() -> ClassDesc {
        ClassDesc {
            name: T::class_name().into_owned(),
            check: check::<T>,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn check(&self, data: &Value) -> Result<()> {
        (self.check)(data)
    }
}

impl fmt::Debug for ClassDesc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ClassDesc").field("name", &self.name).finish()
    }
}

const DEFAULT_INTEGRITY_SCHEMES: &[&str] = &["httpmd", "https", "file"];

struct LoaderInner {
    name: String,
    codebase: Option<String>,
    parent: Option<Loader>,
    classes: HashMap<String, ClassDesc>,
    integrity_schemes: Vec<String>,
}

/// An immutable class registry. Loaders compare by identity.
#[derive(Clone)]
pub struct Loader {
    inner: Arc<LoaderInner>,
}

impl Loader {
    pub fn builder(name: &str) -> LoaderBuilder {
        LoaderBuilder {
            name: String::from(name),
            codebase: None,
            parent: Some(Loader::system()),
            classes: HashMap::new(),
            integrity_schemes: DEFAULT_INTEGRITY_SCHEMES
                .iter()
                .map(|s| String::from(*s))
                .collect(),
        }
    }

    /// The loader holding the builtin classes.
    pub fn system() -> Loader {
        static SYSTEM: OnceLock<Loader> = OnceLock::new();
        SYSTEM
            .get_or_init(|| {
                LoaderBuilder {
                    name: String::from("system"),
                    codebase: None,
                    parent: None,
                    classes: HashMap::new(),
                    integrity_schemes: DEFAULT_INTEGRITY_SCHEMES
                        .iter()
                        .map(|s| String::from(*s))
                        .collect(),
                }
                .register::<()>()
                .register::<bool>()
                .register::<i32>()
                .register::<i64>()
                .register::<u32>()
                .register::<u64>()
                .register::<f64>()
                .register::<String>()
                .register::<Vec<bool>>()
                .register::<Vec<i32>>()
                .register::<Vec<i64>>()
                .register::<Vec<u64>>()
                .register::<Vec<f64>>()
                .register::<Vec<String>>()
                .register::<RemoteException>()
                .build()
            })
            .clone()
    }

    /// The system loader, for callers holding `Permission::GetLoader`.
    pub fn system_checked() -> Result<Loader> {
        security::check_permission(&Permission::GetLoader)?;
        Ok(Loader::system())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The annotation written next to objects when codebase annotations
    /// are enabled.
    pub fn codebase(&self) -> Option<&str> {
        self.inner.codebase.as_deref()
    }

    pub fn parent(&self) -> Option<&Loader> {
        self.inner.parent.as_ref()
    }

    pub fn resolve(&self, class: &str) -> Result<&ClassDesc> {
        match self.inner.classes.get(class) {
            Some(desc) => Ok(desc),
            None => match &self.inner.parent {
                Some(parent) => parent.resolve(class),
                None => Err(Error::ClassNotFound(String::from(class))),
            },
        }
    }

    /// Every location in `annotation` (whitespace separated) must use a
    /// scheme that protects content integrity.
    pub fn verify_codebase_integrity(&self, annotation: &str) -> Result<()> {
        for location in annotation.split_whitespace() {
            let scheme = location.split(':').next().unwrap_or("");
            let trusted = location.contains(':')
                && self
                    .inner
                    .integrity_schemes
                    .iter()
                    .any(|s| s.eq_ignore_ascii_case(scheme));
            if !trusted {
                return Err(Error::InvalidObject(format!(
                    "codebase {} does not provide integrity",
                    location
                )));
            }
        }
        Ok(())
    }
}

impl PartialEq for Loader {
    fn eq(&self, other: &Loader) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Loader {}

impl fmt::Debug for Loader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Loader")
            .field("name", &self.inner.name)
            .field("codebase", &self.inner.codebase)
            .finish()
    }
}

pub struct LoaderBuilder {
    name: String,
    codebase: Option<String>,
    parent: Option<Loader>,
    classes: HashMap<String, ClassDesc>,
    integrity_schemes: Vec<String>,
}

impl LoaderBuilder {
    pub fn codebase(mut self, codebase: &str) -> LoaderBuilder {
        self.codebase = Some(String::from(codebase));
        self
    }

    pub fn parent(mut self, parent: Option<Loader>) -> LoaderBuilder {
        self.parent = parent;
        self
    }

    pub fn integrity_schemes(mut self, schemes: &[&str]) -> LoaderBuilder {
        self.integrity_schemes = schemes.iter().map(|s| String::from(*s)).collect();
        self
    }

    pub fn register<T: Serializable>(mut self) -> LoaderBuilder {
        let desc = ClassDesc::of::<T>();
        self.classes.insert(desc.name.clone(), desc);
        self
    }

    pub fn build(self) -> Loader {
        Loader {
            inner: Arc::new(LoaderInner {
                name: self.name,
                codebase: self.codebase,
                parent: self.parent,
                classes: self.classes,
                integrity_schemes: self.integrity_schemes,
            }),
        }
    }
}
