//! Loading targets from TOML definition files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use compact_str::CompactString;
use quarry_cfg::Config;
use serde::Deserialize;

use crate::target::{Address, FieldValue, Target};

pub static DEFS_FILENAME: Config<&'static str> = Config::new(
    "defs_filename",
    "Name of the target definition file within a directory.",
    "quarry.toml",
);

#[derive(Debug, thiserror::Error)]
pub enum DefsError {
    #[error("failed to parse '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("target '{address}' field '{field}' has an unsupported type")]
    UnsupportedField { address: Address, field: String },
    #[error("failed to read '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The on-disk shape of a definitions file.
#[derive(Debug, Deserialize)]
struct WorkspaceSpec {
    #[serde(default)]
    target: Vec<TargetSpec>,
}

#[derive(Debug, Deserialize)]
struct TargetSpec {
    name: String,
    kind: String,
    #[serde(flatten)]
    fields: BTreeMap<String, toml::Value>,
}

/// Parse the targets in `text`, addressed under the directory `dir`.
///
/// Fields may be booleans, strings, or lists of strings. Anything else is
/// an error rather than silently dropped.
pub fn parse_defs(dir: &str, text: &str) -> Result<Vec<Target>, DefsError> {
    let spec: WorkspaceSpec = toml::from_str(text).map_err(|source| DefsError::Parse {
        path: dir.to_string(),
        source,
    })?;

    spec.target
        .into_iter()
        .map(|def| {
            let address = Address::new(dir, def.name.as_str());
            let mut fields: BTreeMap<CompactString, FieldValue> = BTreeMap::new();
            for (name, value) in def.fields {
                let value = match value {
                    toml::Value::Boolean(val) => FieldValue::Bool(val),
                    toml::Value::String(val) => FieldValue::String(val),
                    toml::Value::Array(items) => {
                        let mut strings = Vec::with_capacity(items.len());
                        for item in items {
                            let toml::Value::String(val) = item else {
                                return Err(DefsError::UnsupportedField {
                                    address,
                                    field: name,
                                });
                            };
                            strings.push(val);
                        }
                        FieldValue::StringList(strings)
                    }
                    _ => {
                        return Err(DefsError::UnsupportedField {
                            address,
                            field: name,
                        })
                    }
                };
                fields.insert(CompactString::new(&name), value);
            }
            Ok(Target::new(address, def.kind, fields))
        })
        .collect()
}

/// Read and parse the definitions file in `dir`, named per config.
pub fn load_defs(dir: &Path, configs: &quarry_cfg::ConfigSet) -> Result<Vec<Target>, DefsError> {
    let filename = DEFS_FILENAME.read(configs);
    let path = dir.join(filename.as_str());
    let text = std::fs::read_to_string(&path).map_err(|source| DefsError::Io {
        path: path.clone(),
        source,
    })?;
    let label = dir.to_string_lossy();
    let targets = parse_defs(&label, &text)?;
    tracing::debug!(path = %path.display(), targets = targets.len(), "loaded definitions");
    Ok(targets)
}
