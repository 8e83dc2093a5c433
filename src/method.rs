// Copyright 2020 Joyent, Inc.

use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use serde_derive::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A remote method signature. Parameter and return types are canonical type
/// names, the same names constraint rules and marshal streams use.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Method {
    declaring: String,
    name: String,
    parameter_types: Vec<String>,
    return_type: String,
}

impl Method {
    pub fn new(
        declaring: &str,
        name: &str,
        parameter_types: &[&str],
        return_type: &str,
    ) -> Method {
        Method {
            declaring: String::from(declaring),
            name: String::from(name),
            parameter_types: parameter_types
                .iter()
                .map(|t| String::from(*t))
                .collect(),
            return_type: String::from(return_type),
        }
    }

    pub fn declaring(&self) -> &str {
        &self.declaring
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameter_types(&self) -> &[String] {
        &self.parameter_types
    }

    pub fn return_type(&self) -> &str {
        &self.return_type
    }

    /// Identifies the method on the wire. The first eight bytes of the
    /// SHA-256 digest of the signature string, big-endian.
    pub fn hash(&self) -> u64 {
        let digest = Sha256::digest(self.signature().as_bytes());
        BigEndian::read_u64(&digest[0..8])
    }

    /// Whether both methods have the same name, parameter types and return
    /// type, whichever interface declares them.
    pub fn same_signature(&self, other: &Method) -> bool {
        self.name == other.name
            && self.parameter_types == other.parameter_types
            && self.return_type == other.return_type
    }

    fn signature(&self) -> String {
        format!(
            "{}({}){}",
            self.name,
            self.parameter_types.join(","),
            self.return_type
        )
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.declaring, self.signature())
    }
}

/// A remote interface: a name and the methods callable through it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interface {
    name: String,
    methods: Vec<Method>,
}

impl Interface {
    pub fn new(name: &str, methods: Vec<Method>) -> Interface {
        Interface {
            name: String::from(name),
            methods,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn methods(&self) -> &[Method] {
        &self.methods
    }
}
