//! HTTP-level tests for the embedding client, the token service and the
//! Qdrant gateway, each against a wiremock server.

use kb_indexer::config::{AuthConfig, ProviderConfig, ProviderKind, VectorStoreConfig};
use kb_indexer::embedding::{EmbeddingClient, HttpEmbeddingClient};
use kb_indexer::error::{EmbeddingError, VectorStoreError};
use kb_indexer::models::VectorPoint;
use kb_indexer::token::TokenService;
use kb_indexer::ttl_store::TtlStore;
use kb_indexer::vector_store::{QdrantStore, VectorFilter, VectorStore};
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{body_json, body_string, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provider(kind: ProviderKind, url: String, model: &str, dims: Option<usize>) -> ProviderConfig {
    ProviderConfig {
        id: "test".to_string(),
        kind,
        url,
        model: model.to_string(),
        dims,
        active: true,
        timeout_secs: 5,
        auth: AuthConfig::None,
    }
}

fn qdrant(server: &MockServer) -> QdrantStore {
    QdrantStore::new(&VectorStoreConfig {
        url: server.uri(),
        api_key_env: None,
        collection_prefix: "kb".to_string(),
        timeout_secs: 5,
    })
}

// ─── Embedding client ───────────────────────────────────────────────

#[tokio::test]
async fn openai_request_and_response_shape() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .and(header("Authorization", "Bearer sk-test"))
        .and(body_json(json!({
            "model": "text-embedding-3-small",
            "input": "hello world",
            "dimensions": 3
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "object": "list",
            "data": [{ "object": "embedding", "index": 0, "embedding": [0.1, 0.2, 0.3] }],
            "model": "text-embedding-3-small",
            "usage": { "prompt_tokens": 2, "total_tokens": 2 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let p = provider(
        ProviderKind::OpenAi,
        format!("{}/v1/embeddings", server.uri()),
        "text-embedding-3-small",
        Some(3),
    );
    let embedding = HttpEmbeddingClient::new()
        .embed(&p, Some("sk-test"), "hello world")
        .await
        .unwrap();

    assert_eq!(embedding.vector.len(), 3);
    assert_eq!(embedding.usage_tokens, Some(2));
}

#[tokio::test]
async fn gigachat_request_and_response_shape() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/embeddings"))
        .and(body_json(json!({ "model": "Embeddings", "input": ["привет"] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "object": "list",
            "data": [{
                "object": "embedding",
                "embedding": [1.0, 0.0],
                "index": 0,
                "usage": { "prompt_tokens": 4 }
            }],
            "model": "Embeddings"
        })))
        .mount(&server)
        .await;

    let p = provider(
        ProviderKind::Gigachat,
        format!("{}/api/v1/embeddings", server.uri()),
        "Embeddings",
        None,
    );
    let embedding = HttpEmbeddingClient::new()
        .embed(&p, Some("tok"), "привет")
        .await
        .unwrap();

    assert_eq!(embedding.vector, vec![1.0, 0.0]);
    assert_eq!(embedding.usage_tokens, Some(4));
    assert_eq!(embedding.embedding_id.as_deref(), Some("0"));
}

#[tokio::test]
async fn server_error_is_api_error_with_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("model crashed"))
        .mount(&server)
        .await;

    let p = provider(ProviderKind::Ollama, format!("{}/api/embed", server.uri()), "m", None);
    let err = HttpEmbeddingClient::new()
        .embed(&p, None, "hello")
        .await
        .unwrap_err();

    match err {
        EmbeddingError::Api { status, body } => {
            assert_eq!(status, 500);
            assert_eq!(body, "model crashed");
        }
        other => panic!("expected api error, got {:?}", other),
    }
}

#[tokio::test]
async fn non_json_body_is_invalid_response_format() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>gateway</html>"))
        .mount(&server)
        .await;

    let p = provider(ProviderKind::Ollama, format!("{}/api/embed", server.uri()), "m", None);
    let err = HttpEmbeddingClient::new()
        .embed(&p, None, "hello")
        .await
        .unwrap_err();
    assert!(matches!(err, EmbeddingError::InvalidResponseFormat(_)), "{:?}", err);
}

#[tokio::test]
async fn refused_connection_is_transport_error() {
    // Nothing listens on the discard port
    let p = provider(ProviderKind::Ollama, "http://127.0.0.1:9/api/embed".into(), "m", None);
    let err = HttpEmbeddingClient::new()
        .embed(&p, None, "hello")
        .await
        .unwrap_err();
    assert!(matches!(err, EmbeddingError::Transport(_)), "{:?}", err);
    assert!(err.is_retryable());
}

// ─── Token service ──────────────────────────────────────────────────

#[tokio::test]
async fn oauth_token_is_cached_until_invalidated() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth"))
        .and(header("Authorization", "Basic dXNlcjpwYXNz"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "tok-1",
            "expires_in": 1800
        })))
        .expect(2)
        .mount(&server)
        .await;

    std::env::set_var("KB_INDEXER_TEST_OAUTH_CREDENTIALS", "user:pass");
    let mut p = provider(ProviderKind::Gigachat, server.uri(), "Embeddings", None);
    p.auth = AuthConfig::OAuth {
        token_url: format!("{}/oauth", server.uri()),
        credentials_env: "KB_INDEXER_TEST_OAUTH_CREDENTIALS".to_string(),
        scope: Some("GIGACHAT_API_PERS".to_string()),
    };

    let tokens = TokenService::new(Arc::new(TtlStore::new()));
    assert_eq!(tokens.access_token(&p).await.unwrap().as_deref(), Some("tok-1"));
    assert_eq!(tokens.access_token(&p).await.unwrap().as_deref(), Some("tok-1"));
    assert_eq!(tokens.cache().len(), 1);

    tokens.invalidate(&p.id);
    assert!(tokens.cache().is_empty());
    assert_eq!(tokens.access_token(&p).await.unwrap().as_deref(), Some("tok-1"));
}

#[tokio::test]
async fn oauth_scope_is_form_encoded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth"))
        .and(header("Content-Type", "application/x-www-form-urlencoded"))
        .and(body_string("scope=read+write%26admin"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "tok-scoped",
            "expires_in": 60
        })))
        .expect(1)
        .mount(&server)
        .await;

    std::env::set_var("KB_INDEXER_TEST_SCOPED_CREDENTIALS", "user:pass");
    let mut p = provider(ProviderKind::Gigachat, server.uri(), "Embeddings", None);
    p.auth = AuthConfig::OAuth {
        token_url: format!("{}/oauth", server.uri()),
        credentials_env: "KB_INDEXER_TEST_SCOPED_CREDENTIALS".to_string(),
        scope: Some("read write&admin".to_string()),
    };

    let tokens = TokenService::new(Arc::new(TtlStore::new()));
    assert_eq!(
        tokens.access_token(&p).await.unwrap().as_deref(),
        Some("tok-scoped")
    );
}

#[tokio::test]
async fn providers_without_auth_get_no_token() {
    let p = provider(ProviderKind::Ollama, "http://127.0.0.1:9".into(), "m", None);
    let tokens = TokenService::new(Arc::new(TtlStore::new()));
    assert_eq!(tokens.access_token(&p).await.unwrap(), None);
}

// ─── Qdrant gateway ─────────────────────────────────────────────────

#[tokio::test]
async fn ensure_collection_creates_missing_collection() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/collections/kb_ws_acme"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/collections/kb_ws_acme"))
        .and(body_json(json!({ "vectors": { "size": 4, "distance": "Cosine" } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": true })))
        .expect(1)
        .mount(&server)
        .await;

    qdrant(&server)
        .ensure_collection("kb_ws_acme", 4)
        .await
        .unwrap();
}

#[tokio::test]
async fn ensure_collection_rejects_dimension_mismatch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/collections/kb_ws_acme"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": { "config": { "params": { "vectors": { "size": 8, "distance": "Cosine" } } } }
        })))
        .mount(&server)
        .await;

    let err = qdrant(&server)
        .ensure_collection("kb_ws_acme", 4)
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            VectorStoreError::DimensionMismatch {
                expected: 4,
                actual: 8,
                ..
            }
        ),
        "{:?}",
        err
    );
}

#[tokio::test]
async fn upsert_sends_all_points_in_one_request() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/collections/kb_ws_acme/points"))
        .and(query_param("wait", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": { "operation_id": 1, "status": "completed" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let points: Vec<VectorPoint> = (0..3)
        .map(|i| {
            let mut payload = serde_json::Map::new();
            payload.insert("chunk_ordinal".into(), json!(i));
            VectorPoint {
                id: uuid::Uuid::new_v4().to_string(),
                vector: vec![0.5; 4],
                payload,
            }
        })
        .collect();

    qdrant(&server).upsert("kb_ws_acme", &points).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["points"].as_array().unwrap().len(), 3);
    assert_eq!(body["points"][2]["payload"]["chunk_ordinal"], 2);
}

#[tokio::test]
async fn delete_by_filter_counts_then_deletes() {
    let server = MockServer::start().await;
    let filter = VectorFilter::new()
        .must("workspace_id", "acme")
        .must("document_id", "intro")
        .must_not("revision_id", "r2");

    Mock::given(method("POST"))
        .and(path("/collections/kb_ws_acme/points/count"))
        .and(body_json(json!({ "filter": filter.to_qdrant(), "exact": true })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": { "count": 10 }
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/collections/kb_ws_acme/points/delete"))
        .and(body_json(json!({ "filter": filter.to_qdrant() })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": { "operation_id": 2, "status": "completed" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let deleted = qdrant(&server)
        .delete_by_filter("kb_ws_acme", &filter)
        .await
        .unwrap();
    assert_eq!(deleted, 10);
}

#[tokio::test]
async fn missing_collection_counts_zero_and_deletes_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/collections/kb_ws_ghost/points/count"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/collections/kb_ws_ghost/points/delete"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let store = qdrant(&server);
    let filter = VectorFilter::new().must("document_id", "intro");
    assert_eq!(store.count("kb_ws_ghost", &filter).await.unwrap(), 0);
    assert_eq!(store.delete_by_filter("kb_ws_ghost", &filter).await.unwrap(), 0);
}
