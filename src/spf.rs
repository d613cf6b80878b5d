use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::SpfConfig;
use crate::http::{HttpError, JsonClient};

pub const SPF_PASS: &str = "Pass";
pub const SPF_NONE: &str = "None";
pub const SPF_TEMP_ERROR: &str = "TempError";

/// Body sent to the SPF lookup service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpfRequest {
    #[serde(rename = "apiKey")]
    pub api_key: String,
    pub email: String,
    pub received: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpfVerdict {
    #[serde(default)]
    pub result: String,
    #[serde(rename = "sender-IP", default)]
    pub sender_ip: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SpfError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("Undecodable SPF verdict: {0}")]
    Decode(#[from] serde_json::Error),
}

#[async_trait]
pub trait SpfVerifier: Send + Sync {
    async fn verify(&self, request: &SpfRequest) -> Result<SpfVerdict, SpfError>;
}

/// Remote SPF lookup over the JSON client
pub struct HttpSpfVerifier {
    client: JsonClient,
    api_url: String,
}

impl HttpSpfVerifier {
    pub fn new(client: JsonClient, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into(),
        }
    }
}

#[async_trait]
impl SpfVerifier for HttpSpfVerifier {
    async fn verify(&self, request: &SpfRequest) -> Result<SpfVerdict, SpfError> {
        let body = serde_json::to_vec(request)?;
        let response = self.client.get_with_body(&self.api_url, &body).await?;
        Ok(serde_json::from_str(&response)?)
    }
}

/// Sender policy: lookup if enabled, downgrade failures to `TempError`
pub struct SpfPolicy {
    config: SpfConfig,
    verifier: Option<Arc<dyn SpfVerifier>>,
}

impl SpfPolicy {
    pub fn new(config: SpfConfig, verifier: Option<Arc<dyn SpfVerifier>>) -> Self {
        Self { config, verifier }
    }

    pub fn disabled() -> Self {
        Self::new(SpfConfig::default(), None)
    }

    /// Verdict for `sender`, before the require-pass gate
    pub async fn lookup(&self, sender: &str, received: &str) -> SpfVerdict {
        let verifier = match (&self.verifier, self.config.enabled) {
            (Some(verifier), true) => verifier,
            _ => {
                return SpfVerdict {
                    result: SPF_NONE.to_string(),
                    sender_ip: String::new(),
                }
            }
        };

        let request = SpfRequest {
            api_key: self.config.api_key.clone(),
            email: sender.to_string(),
            received: received.to_string(),
        };
        match verifier.verify(&request).await {
            Ok(verdict) => {
                debug!("SPF verdict for {}: {} ({})", sender, verdict.result, verdict.sender_ip);
                verdict
            }
            Err(e) => {
                warn!("SPF lookup for {} failed: {}", sender, e);
                SpfVerdict {
                    result: SPF_TEMP_ERROR.to_string(),
                    sender_ip: String::new(),
                }
            }
        }
    }

    /// Hard gate when a pass is required; anything but an exact `Pass` fails
    pub fn admits(&self, verdict: &SpfVerdict) -> bool {
        !self.config.require_pass || verdict.result == SPF_PASS
    }
}


#[cfg(test)]
mod tests {
    use super::scripted::ScriptedSpf;
    use super::*;
    use crate::http::mock::MockDatastore;

    fn enabled(require_pass: bool) -> SpfConfig {
        SpfConfig {
            enabled: true,
            require_pass,
            api_url: "http://spf.example.net/check".to_string(),
            api_key: "secret".to_string(),
        }
    }

    #[tokio::test]
    async fn test_disabled_yields_none() {
        let policy = SpfPolicy::disabled();
        let verdict = policy.lookup("a@b.c", "from x").await;
        assert_eq!(verdict.result, SPF_NONE);
        assert!(policy.admits(&verdict));
    }

    #[tokio::test]
    async fn test_failure_downgrades_to_temp_error() {
        let policy = SpfPolicy::new(enabled(false), Some(Arc::new(ScriptedSpf::failing())));
        let verdict = policy.lookup("a@b.c", "from x").await;
        assert_eq!(verdict.result, SPF_TEMP_ERROR);
        assert!(policy.admits(&verdict));
    }

    #[tokio::test]
    async fn test_require_pass_gate() {
        let fail = SpfPolicy::new(enabled(true), Some(Arc::new(ScriptedSpf::returning("Fail", "192.0.2.1"))));
        let verdict = fail.lookup("a@b.c", "").await;
        assert!(!fail.admits(&verdict));

        let pass = SpfPolicy::new(enabled(true), Some(Arc::new(ScriptedSpf::returning("Pass", "192.0.2.1"))));
        let verdict = pass.lookup("a@b.c", "").await;
        assert!(pass.admits(&verdict));
        assert_eq!(verdict.sender_ip, "192.0.2.1");

        let temp = SpfPolicy::new(enabled(true), Some(Arc::new(ScriptedSpf::failing())));
        let verdict = temp.lookup("a@b.c", "").await;
        assert!(!temp.admits(&verdict));
    }

    #[tokio::test]
    async fn test_request_carries_key_and_received() {
        let spf = Arc::new(ScriptedSpf::returning("Pass", "192.0.2.1"));
        let policy = SpfPolicy::new(enabled(false), Some(spf.clone()));
        policy.lookup("alice@example.org", "from mx.example.org").await;

        let seen = spf.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].api_key, "secret");
        assert_eq!(seen[0].email, "alice@example.org");
        assert_eq!(seen[0].received, "from mx.example.org");
    }

    #[tokio::test]
    async fn test_http_verifier_decodes_wire_format() {
        let url = "http://spf.example.net/check";
        let store = Arc::new(
            MockDatastore::new("http://store/count", 0)
                .with_response(url, r#"{"result": "SoftFail", "sender-IP": "198.51.100.7"}"#),
        );
        let verifier = HttpSpfVerifier::new(JsonClient::new(store.clone()), url);
        let verdict = verifier
            .verify(&SpfRequest {
                api_key: "k".to_string(),
                email: "e@x.y".to_string(),
                received: "r".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(verdict.result, "SoftFail");
        assert_eq!(verdict.sender_ip, "198.51.100.7");

        let sent = &store.requests()[0];
        assert_eq!(sent.body, r#"{"apiKey":"k","email":"e@x.y","received":"r"}"#);
    }

    #[tokio::test]
    async fn test_verdict_without_result_is_empty() {
        let url = "http://spf.example.net/check";
        let store = Arc::new(
            MockDatastore::new("http://store/count", 0).with_response(url, r#"{"sender-IP": "198.51.100.7"}"#),
        );
        let verifier: Arc<dyn SpfVerifier> = Arc::new(HttpSpfVerifier::new(JsonClient::new(store), url));

        let recorded = SpfPolicy::new(enabled(false), Some(verifier.clone()));
        let verdict = recorded.lookup("a@b.c", "").await;
        assert_eq!(verdict.result, "");
        assert_eq!(verdict.sender_ip, "198.51.100.7");
        assert!(recorded.admits(&verdict));

        let required = SpfPolicy::new(enabled(true), Some(verifier));
        let verdict = required.lookup("a@b.c", "").await;
        assert!(!required.admits(&verdict));
    }

    #[tokio::test]
    async fn test_http_verifier_rejects_garbage() {
        let url = "http://spf.example.net/check";
        let store = Arc::new(MockDatastore::new("http://store/count", 0).with_response(url, "<html>"));
        let verifier = HttpSpfVerifier::new(JsonClient::new(store), url);
        let err = verifier
            .verify(&SpfRequest {
                api_key: String::new(),
                email: String::new(),
                received: String::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SpfError::Decode(_)));
    }
}
