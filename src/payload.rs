//! Vector point payload rendering.
//!
//! A point's payload either follows the fixed default shape or is rendered
//! from the knowledge base's schema fields, each a minijinja template
//! evaluated against `chunk`, `document` and `revision`. Both paths finish
//! by writing the identifying fields, so cleanup filters keyed on
//! `document_id` / `revision_id` always find the points no matter what a
//! template produced under those names.

use anyhow::{Context, Result};
use minijinja::Environment;
use serde_json::{json, Map, Value};

use crate::config::SchemaField;
use crate::models::{Chunk, VectorPoint};

/// Identifiers of the revision being written.
#[derive(Debug, Clone)]
pub struct PointScope<'a> {
    pub workspace_id: &'a str,
    pub base_id: &'a str,
    pub document_id: &'a str,
    pub version_id: &'a str,
    pub revision_id: &'a str,
    pub chunk_set_id: &'a str,
}

pub struct PayloadRenderer<'a> {
    env: Environment<'a>,
    fields: &'a [SchemaField],
}

impl<'a> PayloadRenderer<'a> {
    /// Compile the schema templates. An empty schema selects the default
    /// payload shape.
    pub fn new(fields: &'a [SchemaField]) -> Result<Self> {
        let mut env = Environment::new();
        for field in fields {
            env.add_template(&field.name, &field.template)
                .with_context(|| format!("invalid template for payload field '{}'", field.name))?;
        }
        Ok(Self { env, fields })
    }

    pub fn build_point(
        &self,
        scope: &PointScope<'_>,
        chunk: &Chunk,
        vector: Vec<f32>,
    ) -> Result<VectorPoint> {
        let mut payload = if self.fields.is_empty() {
            default_payload(chunk)
        } else {
            self.render_schema(scope, chunk)?
        };
        write_identity(&mut payload, scope, chunk);

        Ok(VectorPoint {
            id: chunk.vector_id.clone(),
            vector,
            payload,
        })
    }

    fn render_schema(&self, scope: &PointScope<'_>, chunk: &Chunk) -> Result<Map<String, Value>> {
        let ctx = minijinja::context! {
            chunk => chunk_json(chunk),
            document => json!({
                "id": scope.document_id,
                "workspace_id": scope.workspace_id,
                "base_id": scope.base_id,
                "version_id": scope.version_id,
            }),
            revision => json!({
                "id": scope.revision_id,
                "chunk_set_id": scope.chunk_set_id,
            }),
        };

        let mut payload = Map::new();
        for field in self.fields {
            let rendered = self
                .env
                .get_template(&field.name)
                .and_then(|t| t.render(&ctx))
                .with_context(|| format!("failed to render payload field '{}'", field.name))?;
            payload.insert(field.name.clone(), Value::String(rendered));
        }
        Ok(payload)
    }
}

fn chunk_json(chunk: &Chunk) -> Value {
    json!({
        "id": chunk.id,
        "text": chunk.text,
        "ordinal": chunk.chunk_ordinal,
        "char_start": chunk.char_start,
        "char_end": chunk.char_end,
        "char_count": chunk.char_count,
        "token_count": chunk.token_count,
        "content_hash": chunk.content_hash,
    })
}

fn default_payload(chunk: &Chunk) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("text".into(), json!(chunk.text));
    payload.insert("chunk_ordinal".into(), json!(chunk.chunk_ordinal));
    payload.insert("char_start".into(), json!(chunk.char_start));
    payload.insert("char_end".into(), json!(chunk.char_end));
    payload.insert("char_count".into(), json!(chunk.char_count));
    payload.insert("token_count".into(), json!(chunk.token_count));
    payload.insert("content_hash".into(), json!(chunk.content_hash));
    payload
}

fn write_identity(payload: &mut Map<String, Value>, scope: &PointScope<'_>, chunk: &Chunk) {
    payload.insert("workspace_id".into(), json!(scope.workspace_id));
    payload.insert("base_id".into(), json!(scope.base_id));
    payload.insert("document_id".into(), json!(scope.document_id));
    payload.insert("version_id".into(), json!(scope.version_id));
    payload.insert("revision_id".into(), json!(scope.revision_id));
    payload.insert("chunk_set_id".into(), json!(scope.chunk_set_id));
    payload.insert("chunk_id".into(), json!(chunk.id));
}
