//! Request-time encryption interceptor.
//!
//! [`RequestEncryptionGateway::handle`] wraps any handler of the shape
//! `Request<Vec<u8>> -> Response<Vec<u8>>`. Protected endpoints fail closed:
//! a body that should be encrypted is never passed on, or returned, in
//! plaintext.

use http::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use http::{Request, Response, StatusCode};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::policy::{EndpointPolicy, PolicyTable};
use crate::service::E2eeService;
use crate::wire;
use keyledger_common::{Error, Operation, RequestContext, Result, TransactionId, UserId};

/// Authenticated caller, attached to the request as an extension by the
/// session layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdentity {
    pub user_id: UserId,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestIdentity {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            ip_address: None,
            user_agent: None,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

/// Status code for an engine error.
pub fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::DecryptionFailed | Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
        Error::KeyUnavailable { .. } => StatusCode::CONFLICT,
        Error::NoActiveKey(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::NotPermitted(_) => StatusCode::UNAUTHORIZED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// JSON error response. Server-side failures get a generic message.
pub fn error_response(error: &Error) -> Response<Vec<u8>> {
    let status = status_for(error);
    let message = if status.is_server_error() {
        "internal error".to_string()
    } else {
        error.to_string()
    };

    let body = serde_json::to_vec(&ErrorBody {
        error: error.code(),
        message,
    })
    .unwrap_or_else(|_| br#"{"error":"internal"}"#.to_vec());
    let len = body.len();

    let mut response = Response::new(body);
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    response
}

/// Policy-driven encrypt/decrypt around a request handler.
pub struct RequestEncryptionGateway {
    service: Arc<E2eeService>,
    policy: PolicyTable,
}

impl RequestEncryptionGateway {
    pub fn new(service: Arc<E2eeService>, policy: PolicyTable) -> Self {
        Self { service, policy }
    }

    pub fn policy(&self) -> &PolicyTable {
        &self.policy
    }

    /// Run `next` with the request body decrypted and encrypt its response,
    /// as the endpoint policy requires.
    pub async fn handle<F, Fut>(&self, request: Request<Vec<u8>>, next: F) -> Response<Vec<u8>>
    where
        F: FnOnce(Request<Vec<u8>>) -> Fut,
        Fut: Future<Output = Response<Vec<u8>>>,
    {
        let path = request.uri().path().to_string();
        let policy = self.policy.lookup(&path);
        if !policy.is_protected() {
            return next(request).await;
        }

        let Some(identity) = request.extensions().get::<RequestIdentity>().cloned() else {
            return error_response(&Error::NotPermitted(
                "authenticated identity required".to_string(),
            ));
        };
        let context = RequestContext {
            ip_address: identity.ip_address.clone(),
            user_agent: identity.user_agent.clone(),
            endpoint: Some(path.clone()),
        };

        let request = if policy.decrypt_request {
            match self.open_request(&identity, &context, request).await {
                Ok(request) => request,
                Err(e) => {
                    warn!(endpoint = %path, error = %e, "rejected request payload");
                    return error_response(&e);
                }
            }
        } else {
            request
        };

        let response = next(request).await;

        self.seal_response(policy, &identity, context, response)
            .await
            .unwrap_or_else(|e| {
                error!(endpoint = %path, error = %e, "failed to encrypt response");
                error_response(&e)
            })
    }

    async fn open_request(
        &self,
        identity: &RequestIdentity,
        context: &RequestContext,
        request: Request<Vec<u8>>,
    ) -> Result<Request<Vec<u8>>> {
        let (mut parts, body) = request.into_parts();
        let envelope = wire::open_body(&parts.headers, &body)?;

        // The payload names its key, which may be rotating by now.
        let tx = self
            .service
            .start_transaction_with_key(
                identity.user_id.clone(),
                Operation::Decrypt,
                context.clone(),
                &envelope.key_id,
            )
            .await
            .map_err(|e| match e {
                // An id naming no key is a forged or corrupt payload; it must
                // look the same to the client as a bad tag.
                Error::NotFound(_) => {
                    warn!(key_id = %envelope.key_id, "payload names an unknown key");
                    Error::DecryptionFailed
                }
                other => other,
            })?;

        let plaintext = self.service.decrypt(&tx, &envelope).await?;
        self.service.complete_transaction(&tx).await?;
        debug!(transaction_id = %tx, key_id = %envelope.key_id, "request payload decrypted");

        wire::clear(&mut parts.headers, plaintext.len());
        Ok(Request::from_parts(parts, plaintext))
    }

    async fn seal_response(
        &self,
        policy: EndpointPolicy,
        identity: &RequestIdentity,
        context: RequestContext,
        response: Response<Vec<u8>>,
    ) -> Result<Response<Vec<u8>>> {
        if !policy.encrypt_response {
            return Ok(response);
        }

        let tx = self
            .service
            .start_transaction(identity.user_id.clone(), Operation::Encrypt, context)
            .await?;

        let (mut parts, body) = response.into_parts();
        let sealed = match self.service.encrypt(&tx, &body).await {
            Ok(envelope) => wire::seal_body(&mut parts.headers, &envelope),
            Err(e) => Err(e),
        };
        let sealed = match sealed {
            Ok(sealed) => sealed,
            Err(e) => {
                self.abandon(&tx, &e).await;
                return Err(e);
            }
        };

        self.service.complete_transaction(&tx).await?;
        debug!(transaction_id = %tx, "response payload encrypted");
        Ok(Response::from_parts(parts, sealed))
    }

    async fn abandon(&self, tx: &TransactionId, cause: &Error) {
        if let Err(e) = self.service.fail_transaction(tx, cause.code()).await {
            warn!(transaction_id = %tx, error = %e, "could not fail transaction");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&Error::DecryptionFailed), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(&Error::KeyUnavailable {
                key_id: "k".to_string(),
                status: "revoked".to_string()
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&Error::NoActiveKey("none".to_string())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&Error::NotPermitted("who".to_string())),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_for(&Error::Storage("disk".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_body_hides_internals() {
        let response = error_response(&Error::Storage("/var/lib/db locked".to_string()));
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["error"], "storage_error");
        assert_eq!(body["message"], "internal error");

        let response = error_response(&Error::DecryptionFailed);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["error"], "decryption_failed");
        assert_eq!(body["message"], "Decryption failed");
    }
}
