//! STEP (ISO 10303-21) assembly model and codec.
//!
//! [`StepCodec::parse`] turns exchange-file text into a [`StepDocument`]: the
//! product tree with placements, plus opaque shape payloads for everything
//! outside the structural subset. [`StepCodec::serialize`] regenerates a
//! valid exchange file from a document with deterministic numbering.

pub mod document;
pub mod emit;
pub mod entity;
pub mod error;
pub mod parser;
pub mod placement;
pub mod structure;
pub mod writer;

use std::path::Path;

use chrono::Utc;
use tracing::{debug, info};

pub use document::{NodeKind, ProductNode, ShapePayload, StepDocument, StepHeader};
pub use entity::{Entity, EntityBody, EntityId, EntityTable, Record, Value};
pub use error::StepError;
pub use placement::{Placement, Position, Quaternion, TupleParseError};

/// Parser and serializer for exchange files.
pub struct StepCodec;

impl StepCodec {
    /// Parse exchange-file text.
    pub fn parse(text: &str) -> Result<StepDocument, StepError> {
        let file = parser::parse_exchange(text)?;
        debug!(entities = file.data.len(), "parsed exchange structure");
        structure::build_document(file)
    }

    /// Parse raw bytes; the content must be UTF-8.
    pub fn parse_bytes(bytes: &[u8]) -> Result<StepDocument, StepError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| StepError::malformed_file(format!("file is not valid UTF-8: {e}")))?;
        Self::parse(text)
    }

    /// Read and parse a file.
    pub fn parse_file(path: impl AsRef<Path>) -> Result<StepDocument, StepError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| StepError::io(path, e))?;
        let doc = Self::parse_bytes(&bytes)?;
        info!(
            path = %path.display(),
            nodes = doc.node_count(),
            warnings = doc.warnings.len(),
            "parsed STEP file"
        );
        Ok(doc)
    }

    /// Serialize a document. A document without header records gets a
    /// generated one.
    pub fn serialize(doc: &StepDocument) -> String {
        let entities = emit::emit_document(doc);
        if doc.header.records.is_empty() {
            let header = StepHeader::generated("", Utc::now());
            writer::write_exchange(&header.records, &entities)
        } else {
            writer::write_exchange(&doc.header.records, &entities)
        }
    }

    /// Serialize and write to `path`.
    pub fn write_file(doc: &StepDocument, path: impl AsRef<Path>) -> Result<(), StepError> {
        let path = path.as_ref();
        let text = Self::serialize(doc);
        std::fs::write(path, &text).map_err(|e| StepError::io(path, e))?;
        info!(path = %path.display(), bytes = text.len(), "wrote STEP file");
        Ok(())
    }
}
