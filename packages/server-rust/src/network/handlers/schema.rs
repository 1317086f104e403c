//! `GET /schema`: the hosted service's method table and its hash.

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use rpchost_core::{schema_hash, ServiceSchema};
use serde_json::json;

use super::is_get;
use crate::network::{RequestHead, RpcResponse};
use crate::service::endpoint::CustomEndpoint;
use crate::service::error::PipelineError;

pub const SCHEMA_PATH: &str = "/schema";

/// Serves a pre-rendered schema document.
#[derive(Debug, Clone)]
pub struct SchemaEndpoint {
    body: Bytes,
}

impl SchemaEndpoint {
    /// Renders `schema` once; the method table is fixed after startup.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be encoded as JSON.
    pub fn new(schema: &ServiceSchema) -> anyhow::Result<Self> {
        let document = json!({
            "schema": schema,
            "schemaHash": schema_hash(schema),
        });
        Ok(Self {
            body: Bytes::from(serde_json::to_vec(&document)?),
        })
    }
}

#[async_trait]
impl CustomEndpoint for SchemaEndpoint {
    fn name(&self) -> &'static str {
        "schema"
    }

    async fn try_handle(&self, head: &RequestHead) -> Result<Option<RpcResponse>, PipelineError> {
        Ok(is_get(head, SCHEMA_PATH).then(|| RpcResponse::json(StatusCode::OK, self.body.clone())))
    }
}
