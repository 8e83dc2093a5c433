// Copyright 2020 Joyent, Inc.

use std::io::Read;

use serde_derive::Deserialize;

use crate::error::{Error, Result};
use crate::marshal::DEFAULT_MAX_OBJECT_LEN;
use crate::string_constraints::StringMethodConstraints;

/// Settings for an `AtomicILFactory`, usually read from a JSON file:
///
/// ```json
/// {
///     "server_constraints": [
///         { "name": "transfer", "constraints": { "requirements": [{ "Integrity": true }] } },
///         { "constraints": {} }
///     ],
///     "use_codebase_annotations": false,
///     "check_access": true
/// }
/// ```
///
/// The constraint rules are validated as they are read, so a badly ordered
/// or malformed list fails here.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FactoryConfig {
    #[serde(default)]
    pub server_constraints: Option<StringMethodConstraints>,
    #[serde(default)]
    pub use_codebase_annotations: bool,
    /// Check `Permission::Invoke` for each incoming call.
    #[serde(default)]
    pub check_access: bool,
    #[serde(default = "default_max_object_len")]
    pub max_object_len: usize,
}

fn default_max_object_len() -> usize {
    DEFAULT_MAX_OBJECT_LEN
}

impl Default for FactoryConfig {
    fn default() -> Self {
        FactoryConfig {
            server_constraints: None,
            use_codebase_annotations: false,
            check_access: false,
            max_object_len: DEFAULT_MAX_OBJECT_LEN,
        }
    }
}

impl FactoryConfig {
    pub fn from_json(s: &str) -> Result<FactoryConfig> {
        serde_json::from_str(s).map_err(config_error)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<FactoryConfig> {
        serde_json::from_reader(reader).map_err(config_error)
    }
}

fn config_error(e: serde_json::Error) -> Error {
    Error::IllegalArgument(format!("invalid factory configuration: {}", e))
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::constraint::{InvocationConstraint, MethodConstraints};
    use crate::method::Method;

    #[test]
    fn defaults() {
        let config = FactoryConfig::from_json("{}").unwrap();
        assert_eq!(config, FactoryConfig::default());
    }

    #[test]
    fn constraints_loaded() {
        let config = FactoryConfig::from_json(
            r#"{
                "server_constraints": [
                    { "name": "transfer",
                      "constraints": { "requirements": [{ "Integrity": true }] } },
                    { "constraints": {} }
                ],
                "check_access": true,
                "max_object_len": 4096
            }"#,
        )
        .unwrap();

        assert!(config.check_access);
        assert_eq!(config.max_object_len, 4096);
        let sc = config.server_constraints.unwrap();
        let transfer = Method::new("Bank", "transfer", &["i64"], "()");
        let balance = Method::new("Bank", "balance", &[], "i64");
        assert!(sc
            .get_constraints(&transfer)
            .requires(&InvocationConstraint::Integrity(true)));
        assert!(sc.get_constraints(&balance).is_empty());
    }

    #[test]
    fn misordered_constraints_rejected() {
        let res = FactoryConfig::from_json(
            r#"{ "server_constraints": [
                    { "name": "*er", "constraints": {} },
                    { "name": "transfer", "constraints": {} }
               ] }"#,
        );
        assert!(matches!(res, Err(Error::IllegalArgument(_))));
    }

    #[test]
    fn unknown_field_rejected() {
        assert!(FactoryConfig::from_json(r#"{ "use_annotations": true }"#).is_err());
    }
}
