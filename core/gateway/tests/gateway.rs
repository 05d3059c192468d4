mod common;

use http::{Request, Response, StatusCode};
use std::sync::atomic::{AtomicBool, Ordering};

use common::{user, Harness};
use keyledger_common::{AuditEventKind, KeyId, Operation, RequestContext};
use keyledger_crypto::Envelope;
use keyledger_gateway::{
    wire, EndpointPolicy, PolicyRule, PolicyTable, RequestEncryptionGateway, RequestIdentity,
};

fn policy() -> PolicyTable {
    PolicyTable::new(
        vec![
            PolicyRule::new("/health", EndpointPolicy::PASSTHROUGH),
            PolicyRule::new("/api/reflections*", EndpointPolicy::BOTH),
            PolicyRule::new(
                "/api/reports",
                EndpointPolicy {
                    decrypt_request: false,
                    encrypt_response: true,
                },
            ),
        ],
        EndpointPolicy::PASSTHROUGH,
    )
}

fn identity() -> RequestIdentity {
    RequestIdentity {
        user_id: user("student-7"),
        ip_address: Some("10.0.0.7".to_string()),
        user_agent: Some("tests".to_string()),
    }
}

fn request(path: &str, body: Vec<u8>) -> Request<Vec<u8>> {
    let mut request = Request::builder()
        .method("POST")
        .uri(path)
        .body(body)
        .unwrap();
    request.extensions_mut().insert(identity());
    request
}

/// Encrypt a body the way a client would.
async fn client_request(h: &Harness, path: &str, plaintext: &[u8]) -> (Request<Vec<u8>>, KeyId) {
    let tx = h
        .service
        .start_transaction(user("client"), Operation::Encrypt, RequestContext::default())
        .await
        .unwrap();
    let envelope = h.service.encrypt(&tx, plaintext).await.unwrap();
    h.service.complete_transaction(&tx).await.unwrap();

    let mut req = request(path, Vec::new());
    let body = wire::seal_body(req.headers_mut(), &envelope).unwrap();
    *req.body_mut() = body;
    (req, envelope.key_id)
}

async fn open_response(h: &Harness, response: &Response<Vec<u8>>) -> Vec<u8> {
    let envelope = wire::open_body(response.headers(), response.body()).unwrap();
    let rx = h
        .service
        .start_transaction_with_key(
            user("client"),
            Operation::Decrypt,
            RequestContext::default(),
            &envelope.key_id,
        )
        .await
        .unwrap();
    let plaintext = h.service.decrypt(&rx, &envelope).await.unwrap();
    h.service.complete_transaction(&rx).await.unwrap();
    plaintext
}

fn echo(req: Request<Vec<u8>>) -> impl std::future::Future<Output = Response<Vec<u8>>> {
    async move { Response::new(req.into_body()) }
}

fn error_code(response: &Response<Vec<u8>>) -> String {
    let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
    body["error"].as_str().unwrap_or_default().to_string()
}

#[tokio::test]
async fn test_passthrough_endpoint_is_untouched() {
    let h = Harness::new().await;
    let gateway = RequestEncryptionGateway::new(h.service.clone(), policy());

    let response = gateway
        .handle(Request::new(b"ping".to_vec()), |req| async move {
            assert_eq!(req.uri().path(), "/");
            Response::new(b"pong".to_vec())
        })
        .await;
    assert_eq!(response.body(), b"pong");

    let response = gateway.handle(request("/health", b"ok".to_vec()), echo).await;
    assert_eq!(response.body(), b"ok");
    assert!(!wire::is_encrypted(response.headers()));
}

#[tokio::test]
async fn test_encrypted_roundtrip() {
    let h = Harness::new().await;
    h.service.generate_key().await.unwrap();
    let gateway = RequestEncryptionGateway::new(h.service.clone(), policy());

    let (req, _) = client_request(&h, "/api/reflections/3", b"I learned a lot").await;
    let response = gateway
        .handle(req, |req| async move {
            assert!(!wire::is_encrypted(req.headers()));
            assert_eq!(req.body(), b"I learned a lot");
            Response::new(b"saved".to_vec())
        })
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(wire::is_encrypted(response.headers()));
    assert!(!response.body().windows(5).any(|w| w == b"saved"));
    assert_eq!(open_response(&h, &response).await, b"saved");

    // Client encrypt + gateway decrypt + gateway encrypt + client decrypt.
    let stats = h.service.stats().await.unwrap();
    assert_eq!(stats.ledger.counts.completed, 4);
    assert_eq!(stats.ledger.counts.pending, 0);
}

#[tokio::test]
async fn test_rotating_key_payload_is_accepted() {
    let h = Harness::new().await;
    h.service.generate_key().await.unwrap();
    let gateway = RequestEncryptionGateway::new(h.service.clone(), policy());

    let (req, old_key) = client_request(&h, "/api/reflections", b"before rotation").await;
    let new_key = h.service.rotate().await.unwrap();

    let response = gateway.handle(req, echo).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[wire::HEADER_KEY_ID],
        new_key.as_str(),
        "responses use the active key"
    );
    assert_ne!(old_key, new_key);
    assert_eq!(open_response(&h, &response).await, b"before rotation");
}

#[tokio::test]
async fn test_plaintext_is_rejected_without_calling_handler() {
    let h = Harness::new().await;
    h.service.generate_key().await.unwrap();
    let gateway = RequestEncryptionGateway::new(h.service.clone(), policy());
    let called = AtomicBool::new(false);

    let response = gateway
        .handle(
            request("/api/reflections", b"{\"text\":\"plain\"}".to_vec()),
            |req| async {
                called.store(true, Ordering::SeqCst);
                Response::new(req.into_body())
            },
        )
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&response), "invalid_input");
    assert!(!called.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_missing_identity_is_unauthorized() {
    let h = Harness::new().await;
    h.service.generate_key().await.unwrap();
    let gateway = RequestEncryptionGateway::new(h.service.clone(), policy());

    let response = gateway
        .handle(Request::builder().uri("/api/reports").body(Vec::new()).unwrap(), echo)
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_tampered_payload_fails_closed() {
    let h = Harness::new().await;
    h.service.generate_key().await.unwrap();
    let gateway = RequestEncryptionGateway::new(h.service.clone(), policy());

    let (mut req, _) = client_request(&h, "/api/reflections", b"do not leak me").await;
    let mut envelope = Envelope::from_bytes(req.body()).unwrap();
    envelope.tag[0] ^= 0x01;
    *req.body_mut() = envelope.to_bytes().unwrap();

    let called = AtomicBool::new(false);
    let response = gateway
        .handle(req, |req| async {
            called.store(true, Ordering::SeqCst);
            Response::new(req.into_body())
        })
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&response), "decryption_failed");
    assert!(!called.load(Ordering::SeqCst));
    assert_eq!(h.events(AuditEventKind::SecurityDecryptionFailed).await, 1);
    assert_eq!(h.service.stats().await.unwrap().ledger.counts.failed, 1);
}

#[tokio::test]
async fn test_unknown_key_id_looks_like_bad_payload() {
    let h = Harness::new().await;
    h.service.generate_key().await.unwrap();
    let gateway = RequestEncryptionGateway::new(h.service.clone(), policy());

    let (mut req, _) = client_request(&h, "/api/reflections", b"relabelled").await;
    let mut envelope = Envelope::from_bytes(req.body()).unwrap();
    envelope.key_id = KeyId::new("key_forged").unwrap();
    let body = wire::seal_body(req.headers_mut(), &envelope).unwrap();
    *req.body_mut() = body;

    let called = AtomicBool::new(false);
    let response = gateway
        .handle(req, |req| async {
            called.store(true, Ordering::SeqCst);
            Response::new(req.into_body())
        })
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&response), "decryption_failed");
    assert!(!called.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_revoked_key_payload_is_conflict() {
    let h = Harness::new().await;
    let k1 = h.service.generate_key().await.unwrap();
    let gateway = RequestEncryptionGateway::new(h.service.clone(), policy());

    let (req, key_id) = client_request(&h, "/api/reflections", b"old").await;
    assert_eq!(key_id, k1);
    h.service.revoke(&k1).await.unwrap();

    let response = gateway.handle(req, echo).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(error_code(&response), "key_unavailable");
}

#[tokio::test]
async fn test_no_active_key_never_returns_plaintext() {
    let h = Harness::new().await;
    let gateway = RequestEncryptionGateway::new(h.service.clone(), policy());

    let response = gateway
        .handle(request("/api/reports", Vec::new()), |_| async {
            Response::new(b"grades: A".to_vec())
        })
        .await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(error_code(&response), "no_active_key");
    assert!(!response.body().windows(6).any(|w| w == b"grades"));
}
