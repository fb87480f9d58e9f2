//! Schema of the `.sl.json` config files that map shader names to their vertex
//! and fragment sources. The archive builder rewrites entries in memory and
//! re-serializes them, so unknown keys ride along in `extra` maps and survive the
//! round trip.
//!
//! Types:
//!
//! - `ConfigFile` holds the namespace, optional output format, and the ordered
//!   `data` entries.
//! - `ConfigEntry` stores one shader's names, stage, and source paths.
//!
//! Functions:
//!
//! - `ConfigFile::load` / `ConfigFile::parse` read and validate a config,
//!   failing with `JobError::InvalidConfig` when `data` is not a list or an entry
//!   lacks string `vsh`/`fsh` fields.
//! - `ConfigEntry::references_parent` flags paths that escape the config's
//!   directory and must be flattened before archiving.
use std::fs;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::JobError;

pub const CONFIG_SUFFIX: &str = ".sl.json";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(
        rename = "outputFormat",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub output_format: Option<String>,
    pub data: Vec<ConfigEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ConfigEntry {
    #[serde(rename = "fileName", default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(rename = "className", default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(rename = "vsh")]
    pub vertex: String,
    #[serde(rename = "fsh")]
    pub fragment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, JobError> {
        let raw = fs::read_to_string(path)?;
        Self::parse(&raw, path)
    }

    pub fn parse(raw: &str, origin: &Path) -> Result<Self, JobError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|err| JobError::invalid_config(origin, err))?;
        match value.get("data") {
            Some(Value::Array(_)) => {}
            _ => return Err(JobError::invalid_config(origin, "\"data\" is not a list")),
        }
        let config: Self =
            serde_json::from_value(value).map_err(|err| JobError::invalid_config(origin, err))?;
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> Result<String, JobError> {
        serde_json::to_string_pretty(self)
            .map_err(|err| JobError::invalid_config(Path::new("<generated>"), err))
    }

    /// Returns a copy that keeps only `entry`, used when a single shader is
    /// submitted on its own.
    pub fn narrowed_to(&self, entry: ConfigEntry) -> Self {
        Self {
            namespace: self.namespace.clone(),
            output_format: self.output_format.clone(),
            data: vec![entry],
            extra: self.extra.clone(),
        }
    }

    pub fn declared_output_format(&self) -> Option<&str> {
        self.output_format
            .as_deref()
            .map(str::trim)
            .filter(|format| !format.is_empty())
    }
}

impl ConfigEntry {
    pub fn shader_paths(&self) -> [&str; 2] {
        [self.vertex.as_str(), self.fragment.as_str()]
    }

    /// Finds the entry path whose file name equals `file_name`, returning it
    /// together with the sibling path of the other stage.
    pub fn match_file_name(&self, file_name: &str) -> Option<(&str, &str)> {
        if base_name(&self.vertex) == Some(file_name) {
            Some((self.vertex.as_str(), self.fragment.as_str()))
        } else if base_name(&self.fragment) == Some(file_name) {
            Some((self.fragment.as_str(), self.vertex.as_str()))
        } else {
            None
        }
    }
}

pub fn references_parent(path: &str) -> bool {
    matches!(
        Path::new(path).components().next(),
        Some(Component::ParentDir)
    )
}

pub fn base_name(path: &str) -> Option<&str> {
    Path::new(path).file_name().and_then(|name| name.to_str())
}

pub fn is_config_file(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(CONFIG_SUFFIX)
}
