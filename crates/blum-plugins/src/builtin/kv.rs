//! Key/value access to the persistent store in the `kv` namespace.
//!
//! Values are arbitrary JSON, stored as their serialized bytes. Every write
//! carries `expectedVersion` (`0` to create); stale versions come back to the
//! client as `VERSION_CONFLICT` errors and are never retried here.
//!
//! | topic       | payload                                               |
//! |-------------|-------------------------------------------------------|
//! | `kv.get`    | `{"key"}`                                             |
//! | `kv.put`    | `{"key", "value", "expectedVersion"}`                 |
//! | `kv.delete` | `{"key", "expectedVersion"}`                          |
//! | `kv.batch`  | `{"ops": [{"op": "put"\|"delete", "key", ...}]}`      |
//! | `kv.keys`   | none                                                  |

use std::sync::Arc;

use async_trait::async_trait;
use blum_core::{Message, Outgoing};
use blum_store::{RecordStore, StoreError, StoreOp, TransactionOutcome};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::builtin::builtin_metadata;
use crate::catalog::PluginEnv;
use crate::plugin::{Capability, Plugin, PluginContext, PluginError, PluginMetadata};

/// Catalog id.
pub const ID: &str = "kv";

/// Store namespace owned by this plugin.
pub const NAMESPACE: &str = "kv";

const GET: &str = "kv.get";
const PUT: &str = "kv.put";
const DELETE: &str = "kv.delete";
const BATCH: &str = "kv.batch";
const KEYS: &str = "kv.keys";

/// Exposes the store to clients.
pub struct KvPlugin;

/// Catalog constructor.
pub fn build(_env: &PluginEnv) -> Result<Arc<dyn Plugin>, PluginError> {
    Ok(Arc::new(KvPlugin))
}

#[derive(Deserialize)]
struct KeyRequest {
    key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PutRequest {
    key: String,
    value: Value,
    #[serde(default)]
    expected_version: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteRequest {
    key: String,
    expected_version: u64,
}

#[derive(Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
enum BatchOp {
    Put(PutRequest),
    Delete(DeleteRequest),
}

#[derive(Deserialize)]
struct BatchRequest {
    ops: Vec<BatchOp>,
}

#[async_trait]
impl Plugin for KvPlugin {
    fn id(&self) -> &str {
        ID
    }

    fn capabilities(&self) -> Vec<Capability> {
        [GET, PUT, DELETE, BATCH, KEYS]
            .into_iter()
            .map(Capability::topic)
            .collect()
    }

    fn metadata(&self) -> PluginMetadata {
        builtin_metadata("Key-value", "Versioned key-value records")
    }

    async fn handle(
        &self,
        ctx: &PluginContext,
        msg: &Message,
    ) -> Result<Vec<Outgoing>, PluginError> {
        let payload = match msg.topic() {
            GET => {
                let req: KeyRequest = PluginError::parse_payload(msg)?;
                let key = req.key.clone();
                let record = blocking(&ctx.store, move |s| s.get(NAMESPACE, &req.key)).await?;
                match record {
                    Some(rec) => json!({
                        "key": key,
                        "value": decode_value(&rec.value)?,
                        "version": rec.version,
                    }),
                    None => json!({ "key": key, "value": Value::Null, "version": 0 }),
                }
            }
            PUT => {
                let req: PutRequest = PluginError::parse_payload(msg)?;
                let bytes = encode_value(&req.value)?;
                let key = req.key.clone();
                let expected = req.expected_version;
                let version = blocking(&ctx.store, move |s| {
                    s.put(NAMESPACE, &req.key, &bytes, expected)
                })
                .await?;
                json!({ "key": key, "version": version })
            }
            DELETE => {
                let req: DeleteRequest = PluginError::parse_payload(msg)?;
                let key = req.key.clone();
                blocking(&ctx.store, move |s| {
                    s.delete(NAMESPACE, &req.key, req.expected_version)
                })
                .await?;
                json!({ "key": key, "deleted": true })
            }
            BATCH => {
                let req: BatchRequest = PluginError::parse_payload(msg)?;
                let ops = req
                    .ops
                    .into_iter()
                    .map(into_store_op)
                    .collect::<Result<Vec<_>, _>>()?;
                match blocking(&ctx.store, move |s| s.transaction(&ops)).await? {
                    TransactionOutcome::Committed { versions } => {
                        json!({ "committed": true, "versions": versions })
                    }
                    TransactionOutcome::RolledBack { conflict } => {
                        json!({ "committed": false, "conflict": conflict })
                    }
                }
            }
            KEYS => {
                let keys = blocking(&ctx.store, |s| s.keys(NAMESPACE)).await?;
                json!({ "keys": keys })
            }
            other => {
                return Err(PluginError::Failed(format!("kv cannot handle {other}")));
            }
        };
        Ok(vec![Outgoing::new(msg.topic(), payload)])
    }
}

/// Run a store call off the async workers.
async fn blocking<T, F>(store: &RecordStore, f: F) -> Result<T, PluginError>
where
    T: Send + 'static,
    F: FnOnce(&RecordStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| PluginError::Failed(format!("store task: {e}")))?
        .map_err(PluginError::from)
}

fn encode_value(value: &Value) -> Result<Vec<u8>, PluginError> {
    serde_json::to_vec(value).map_err(|e| PluginError::InvalidPayload(e.to_string()))
}

fn decode_value(bytes: &[u8]) -> Result<Value, PluginError> {
    serde_json::from_slice(bytes)
        .map_err(|e| PluginError::Failed(format!("stored value is not JSON: {e}")))
}

fn into_store_op(op: BatchOp) -> Result<StoreOp, PluginError> {
    Ok(match op {
        BatchOp::Put(req) => StoreOp::Put {
            namespace: NAMESPACE.to_owned(),
            key: req.key,
            value: encode_value(&req.value)?,
            expected_version: req.expected_version,
        },
        BatchOp::Delete(req) => StoreOp::Delete {
            namespace: NAMESPACE.to_owned(),
            key: req.key,
            expected_version: req.expected_version,
        },
    })
}
