//! Schema data: the per-firmware list of requests and their records.
//!
//! A [`SchemaProvider`] maps a device/firmware identifier (such as `"2.06"`)
//! to the ordered list of [`Request`]s that firmware understands. Schema
//! files are JSON documents of the form:
//!
//! ```json
//! {
//!   "requests": [
//!     { "name": "Version", "request_byte": "0xFD",
//!       "record_definitions": [
//!         { "name": "Version", "position": 4, "length": 2, "scale": 0.01, "data_type": "Sensor" }
//!       ] }
//!   ]
//! }
//! ```

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::types::{DataType, RecordDefinition, Request};

/// Supplies request definitions for a device/firmware identifier.
pub trait SchemaProvider: Send + Sync {
    /// Return the ordered requests for `id`, or [`Error::SchemaNotFound`].
    fn get_requests(&self, id: &str) -> Result<Vec<Request>>;
}

/// On-disk layout of a schema file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaFile {
    pub requests: Vec<Request>,
}

/// A validated set of requests for one firmware version.
#[derive(Debug, Clone)]
pub struct Schema {
    id: String,
    requests: Vec<Request>,
}

impl Schema {
    /// Validate and wrap a request list.
    ///
    /// Rejects duplicate request names, record lengths other than 1 or 2,
    /// and bit positions above 7.
    pub fn new(id: &str, requests: Vec<Request>) -> Result<Self> {
        let mut names = HashSet::new();
        for request in &requests {
            if !names.insert(request.name.to_ascii_lowercase()) {
                return Err(Error::Schema(format!(
                    "duplicate request name {:?} in schema {id}",
                    request.name
                )));
            }
            for record in &request.record_definitions {
                validate_record(&request.name, record)?;
            }
        }

        info!(schema = %id, requests = requests.len(), "loaded heat pump schema");
        for request in &requests {
            debug!(
                name = %request.name,
                description = %request.description,
                request_byte = %format!("0x{:02X}", request.request_byte),
                records = request.record_definitions.len(),
                "schema request"
            );
        }

        Ok(Schema {
            id: id.to_string(),
            requests,
        })
    }

    /// Parse a schema from a JSON document.
    pub fn from_json_str(id: &str, json: &str) -> Result<Self> {
        let file: SchemaFile = serde_json::from_str(json)?;
        Self::new(id, file.requests)
    }

    /// Load a schema file. The identifier is the file stem, so
    /// `schemas/2.06.json` yields schema `"2.06"`.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::Schema(format!("invalid schema path {}", path.display())))?;
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(id, &json)
    }

    /// Identifier this schema was loaded for.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// All requests in schema order.
    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    /// The special firmware-version request, if the schema defines one.
    pub fn version_request(&self) -> Option<&Request> {
        self.requests.iter().find(|r| r.is_version())
    }

    /// Look up a request by name (case-insensitive).
    pub fn request(&self, name: &str) -> Option<&Request> {
        self.requests
            .iter()
            .find(|r| r.name.eq_ignore_ascii_case(name))
    }

    /// Requests that carry at least one record of `data_type`, in schema
    /// order, excluding the version request.
    pub fn requests_with(&self, data_type: DataType) -> Vec<&Request> {
        self.requests
            .iter()
            .filter(|r| !r.is_version() && r.has_data_type(data_type))
            .collect()
    }

    /// Find the request that carries the named record.
    pub fn find_record(&self, name: &str) -> Option<(&Request, &RecordDefinition)> {
        self.requests
            .iter()
            .find_map(|req| req.record(name).map(|rec| (req, rec)))
    }
}

fn validate_record(request: &str, record: &RecordDefinition) -> Result<()> {
    if record.length != 1 && record.length != 2 {
        return Err(Error::Schema(format!(
            "record {} of request {request} has length {} (expected 1 or 2)",
            record.name, record.length
        )));
    }
    if let Some(bit) = record.bit_position {
        if bit >= 8 {
            return Err(Error::Schema(format!(
                "record {} of request {request} has bit position {bit} (expected 0..=7)",
                record.name
            )));
        }
    }
    Ok(())
}

/// In-memory provider, mostly for tests and embedded default schemas.
#[derive(Debug, Clone, Default)]
pub struct StaticSchemaProvider {
    schemas: HashMap<String, Vec<Request>>,
}

impl StaticSchemaProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the requests for one identifier.
    pub fn with_schema(mut self, id: &str, requests: Vec<Request>) -> Self {
        self.schemas.insert(id.to_string(), requests);
        self
    }
}

impl SchemaProvider for StaticSchemaProvider {
    fn get_requests(&self, id: &str) -> Result<Vec<Request>> {
        self.schemas
            .get(id)
            .cloned()
            .ok_or_else(|| Error::SchemaNotFound(id.to_string()))
    }
}

/// Provider reading `<dir>/<id>.json` files.
#[derive(Debug, Clone)]
pub struct DirectorySchemaProvider {
    dir: PathBuf,
}

impl DirectorySchemaProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        DirectorySchemaProvider { dir: dir.into() }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

impl SchemaProvider for DirectorySchemaProvider {
    fn get_requests(&self, id: &str) -> Result<Vec<Request>> {
        let path = self.path_for(id);
        debug!(path = %path.display(), "looking up schema file");
        if !path.is_file() {
            return Err(Error::SchemaNotFound(id.to_string()));
        }
        let json = std::fs::read_to_string(&path)?;
        let file: SchemaFile = serde_json::from_str(&json)?;
        Ok(file.requests)
    }
}
