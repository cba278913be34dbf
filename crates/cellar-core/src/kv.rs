//! Built-in `kv` backend: generic secret storage.
//!
//! Writes store a JSON object verbatim. Reads return it together with a
//! lease, whose TTL comes from the object's `ttl` (or `lease`) field when
//! present and from the mount default otherwise. Nothing is generated, so
//! revocation has nothing to undo and renewal grants whatever is asked.

use std::time::Duration;

use serde_json::{Value, json};

use crate::backend::{Backend, BackendRequest, BackendResponse, LeaseData, Operation, SecretLease};
use crate::error::BackendError;
use crate::view::StorageView;

/// Backend type name used in the mount table.
pub const BACKEND_TYPE: &str = "kv";

/// Generic secret storage over a mount's storage view.
#[derive(Debug, Clone)]
pub struct KvBackend {
    view: StorageView,
}

impl KvBackend {
    /// Create a backend storing into `view`.
    #[must_use]
    pub fn new(view: StorageView) -> Self {
        Self { view }
    }

    async fn read(&self, path: &str) -> Result<BackendResponse, BackendError> {
        if path.is_empty() {
            return Ok(BackendResponse::default());
        }
        let Some(bytes) = self.view.get(path).await? else {
            return Ok(BackendResponse::default());
        };
        let data: Value = serde_json::from_slice(&bytes).map_err(|e| BackendError::Internal {
            reason: format!("stored value at '{path}' is not JSON: {e}"),
        })?;
        let ttl = lease_ttl(&data)?;
        Ok(BackendResponse {
            data: Some(data),
            secret: Some(SecretLease {
                ttl,
                renewable: true,
                internal: json!({}),
            }),
        })
    }

    async fn write(&self, path: &str, data: Option<&Value>) -> Result<BackendResponse, BackendError> {
        if path.is_empty() || path.ends_with('/') {
            return Err(BackendError::InvalidRequest {
                reason: "a key is required to write".to_owned(),
            });
        }
        let Some(data @ Value::Object(_)) = data else {
            return Err(BackendError::InvalidRequest {
                reason: "write payload must be a JSON object".to_owned(),
            });
        };
        lease_ttl(data)?;

        let bytes = serde_json::to_vec(data).map_err(|e| BackendError::Internal {
            reason: format!("serialization failed: {e}"),
        })?;
        self.view.put(path, &bytes).await?;
        Ok(BackendResponse::default())
    }

    async fn list(&self, path: &str) -> Result<BackendResponse, BackendError> {
        let prefix = if path.is_empty() || path.ends_with('/') {
            path.to_owned()
        } else {
            format!("{path}/")
        };
        let keys = self.view.list(&prefix).await?;
        Ok(BackendResponse::with_data(json!({ "keys": keys })))
    }
}

#[async_trait::async_trait]
impl Backend for KvBackend {
    async fn handle_request(&self, req: &BackendRequest) -> Result<BackendResponse, BackendError> {
        match req.operation {
            Operation::Read => self.read(&req.path).await,
            Operation::Write => self.write(&req.path, req.data.as_ref()).await,
            Operation::Delete => {
                self.view.delete(&req.path).await?;
                Ok(BackendResponse::default())
            }
            Operation::List => self.list(&req.path).await,
        }
    }

    async fn handle_revoke(&self, _lease: &LeaseData) -> Result<(), BackendError> {
        Ok(())
    }

    async fn handle_renew(
        &self,
        _lease: &LeaseData,
        requested: Duration,
    ) -> Result<Duration, BackendError> {
        Ok(requested)
    }
}

/// Extract the TTL a stored object asks for, if any.
fn lease_ttl(data: &Value) -> Result<Option<Duration>, BackendError> {
    let Some(raw) = data.get("ttl").or_else(|| data.get("lease")) else {
        return Ok(None);
    };
    match raw {
        Value::Number(n) => n.as_u64().map(|secs| Some(Duration::from_secs(secs))).ok_or_else(
            || BackendError::InvalidRequest {
                reason: format!("ttl must be a non-negative integer, got {n}"),
            },
        ),
        Value::String(s) => parse_duration(s).map(Some),
        other => Err(BackendError::InvalidRequest {
            reason: format!("ttl must be a number or duration string, got {other}"),
        }),
    }
}

/// Parse `"90"`, `"60s"`, `"5m"`, `"1h30m"`, `"2d"` into a duration.
///
/// # Errors
///
/// Returns [`BackendError::InvalidRequest`] for anything else.
pub fn parse_duration(input: &str) -> Result<Duration, BackendError> {
    let invalid = || BackendError::InvalidRequest {
        reason: format!("invalid duration '{input}'"),
    };
    let input = input.trim();
    if input.is_empty() {
        return Err(invalid());
    }
    if let Ok(secs) = input.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total: u64 = 0;
    let mut digits = String::new();
    for c in input.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit: u64 = match c {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86_400,
            _ => return Err(invalid()),
        };
        let value: u64 = digits.parse().map_err(|_| invalid())?;
        digits.clear();
        total = value
            .checked_mul(unit)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(invalid)?;
    }
    if !digits.is_empty() {
        return Err(invalid());
    }
    Ok(Duration::from_secs(total))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use cellar_storage::MemoryBackend;

    use super::*;
    use crate::barrier::Barrier;
    use crate::crypto::EncryptionKey;

    async fn backend() -> KvBackend {
        let barrier = Arc::new(Barrier::new(Arc::new(MemoryBackend::new())));
        let root = EncryptionKey::generate();
        barrier.initialize(&root).await.unwrap();
        barrier.unseal(root).await.unwrap();
        KvBackend::new(StorageView::new(barrier, "logical/test/"))
    }

    fn request(operation: Operation, path: &str, data: Option<Value>) -> BackendRequest {
        BackendRequest {
            operation,
            path: path.to_owned(),
            data,
        }
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("60s").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(172_800));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("10m5").is_err());
    }

    #[tokio::test]
    async fn write_then_read_returns_data_and_lease() {
        let kv = backend().await;
        kv.handle_request(&request(
            Operation::Write,
            "x",
            Some(json!({"password": "hunter2", "ttl": "60s"})),
        ))
        .await
        .unwrap();

        let resp = kv
            .handle_request(&request(Operation::Read, "x", None))
            .await
            .unwrap();
        assert_eq!(resp.data.unwrap()["password"], "hunter2");
        let secret = resp.secret.unwrap();
        assert_eq!(secret.ttl, Some(Duration::from_secs(60)));
        assert!(secret.renewable);
    }

    #[tokio::test]
    async fn read_without_ttl_defers_to_mount_default() {
        let kv = backend().await;
        kv.handle_request(&request(Operation::Write, "x", Some(json!({"a": 1}))))
            .await
            .unwrap();
        let resp = kv
            .handle_request(&request(Operation::Read, "x", None))
            .await
            .unwrap();
        assert_eq!(resp.secret.unwrap().ttl, None);
    }

    #[tokio::test]
    async fn missing_key_reads_empty() {
        let kv = backend().await;
        let resp = kv
            .handle_request(&request(Operation::Read, "nope", None))
            .await
            .unwrap();
        assert_eq!(resp, BackendResponse::default());
    }

    #[tokio::test]
    async fn rejects_non_object_and_bad_ttl() {
        let kv = backend().await;
        assert!(matches!(
            kv.handle_request(&request(Operation::Write, "x", Some(json!("str"))))
                .await,
            Err(BackendError::InvalidRequest { .. })
        ));
        assert!(matches!(
            kv.handle_request(&request(Operation::Write, "x", Some(json!({"ttl": "soon"}))))
                .await,
            Err(BackendError::InvalidRequest { .. })
        ));
        assert!(matches!(
            kv.handle_request(&request(Operation::Write, "", Some(json!({}))))
                .await,
            Err(BackendError::InvalidRequest { .. })
        ));
    }

    #[tokio::test]
    async fn list_and_delete() {
        let kv = backend().await;
        for path in ["a", "dir/b", "dir/c"] {
            kv.handle_request(&request(Operation::Write, path, Some(json!({"v": 1}))))
                .await
                .unwrap();
        }
        let resp = kv
            .handle_request(&request(Operation::List, "", None))
            .await
            .unwrap();
        assert_eq!(resp.data.unwrap()["keys"], json!(["a", "dir/"]));

        let resp = kv
            .handle_request(&request(Operation::List, "dir", None))
            .await
            .unwrap();
        assert_eq!(resp.data.unwrap()["keys"], json!(["b", "c"]));

        kv.handle_request(&request(Operation::Delete, "a", None))
            .await
            .unwrap();
        let resp = kv
            .handle_request(&request(Operation::Read, "a", None))
            .await
            .unwrap();
        assert!(resp.data.is_none());
    }
}
