mod common;

use std::sync::Arc;
use std::time::Duration;

use graph_core::{
    AuthError, ClientSecret, CommandRequest, CredentialContext, GatewayError, MemoryTokenStore,
    TokenStore,
};
use serde_json::json;
use wiremock::matchers::{any, body_json, body_string_contains, header, method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

use common::{Harness, CLIENT, TENANT};

fn app_token(token: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "token_type": "Bearer",
        "expires_in": 3599,
        "access_token": token
    }))
}

#[tokio::test]
async fn test_get_me_with_client_credentials() {
    let h = Harness::start().await;
    Mock::given(method("POST"))
        .and(path(h.token_path()))
        .and(body_string_contains("grant_type=client_credentials"))
        .and(body_string_contains(&format!("client_id={}", CLIENT)))
        .and(body_string_contains("client_secret=process-secret"))
        .respond_with(app_token("app-token"))
        .expect(1)
        .mount(&h.idp)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1.0/me"))
        .and(header("authorization", "Bearer app-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "displayName": "Adele Vance",
            "mail": "adele@contoso.com"
        })))
        .expect(2)
        .mount(&h.graph)
        .await;

    let settings = h.settings(&[("AZURE_CLIENT_SECRET", "process-secret")]);
    let (dispatcher, _) = h.dispatcher(&settings);

    let result = dispatcher.execute(CommandRequest::get("me")).await.unwrap();
    assert_eq!(result.status, 200);
    assert_eq!(result.body["displayName"], "Adele Vance");

    // Cached token is reused: the token endpoint expectation stays at one call.
    let again = dispatcher.execute(CommandRequest::get("/me")).await.unwrap();
    assert_eq!(again.body["mail"], "adele@contoso.com");
}

#[tokio::test]
async fn test_query_string_passes_through() {
    let h = Harness::start().await;
    Mock::given(method("POST"))
        .and(path(h.token_path()))
        .respond_with(app_token("app-token"))
        .mount(&h.idp)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1.0/users"))
        .and(query_param("$top", "5"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": []})))
        .expect(1)
        .mount(&h.graph)
        .await;

    let settings = h.settings(&[("AZURE_CLIENT_SECRET", "s")]);
    let (dispatcher, _) = h.dispatcher(&settings);
    let result = dispatcher
        .execute(CommandRequest::get("users?$top=5"))
        .await
        .unwrap();
    assert_eq!(result.body["value"], json!([]));
}

#[tokio::test]
async fn test_unauthorized_triggers_one_refresh_and_retry() {
    let h = Harness::start().await;
    Mock::given(method("POST"))
        .and(path(h.token_path()))
        .respond_with(app_token("first"))
        .up_to_n_times(1)
        .mount(&h.idp)
        .await;
    Mock::given(method("POST"))
        .and(path(h.token_path()))
        .respond_with(app_token("second"))
        .expect(1)
        .mount(&h.idp)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1.0/me"))
        .and(header("authorization", "Bearer first"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {"code": "InvalidAuthenticationToken", "message": "Lifetime validation failed"}
        })))
        .expect(1)
        .mount(&h.graph)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1.0/me"))
        .and(header("authorization", "Bearer second"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "1"})))
        .expect(1)
        .mount(&h.graph)
        .await;

    let settings = h.settings(&[("AZURE_CLIENT_SECRET", "s")]);
    let (dispatcher, _) = h.dispatcher(&settings);
    let result = dispatcher.execute(CommandRequest::get("me")).await.unwrap();
    assert_eq!(result.status, 200);
    assert_eq!(result.body["id"], "1");
}

#[tokio::test]
async fn test_second_unauthorized_surfaces_as_graph_error() {
    let h = Harness::start().await;
    Mock::given(method("POST"))
        .and(path(h.token_path()))
        .respond_with(app_token("rejected"))
        .expect(2)
        .mount(&h.idp)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1.0/me"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {"code": "InvalidAuthenticationToken", "message": "Access token is empty."}
        })))
        .expect(2)
        .mount(&h.graph)
        .await;

    let settings = h.settings(&[("AZURE_CLIENT_SECRET", "s")]);
    let (dispatcher, _) = h.dispatcher(&settings);
    match dispatcher.execute(CommandRequest::get("me")).await {
        Err(GatewayError::GraphApi {
            status,
            code,
            message,
            ..
        }) => {
            assert_eq!(status, 401);
            assert_eq!(code.as_deref(), Some("InvalidAuthenticationToken"));
            assert_eq!(message, "Access token is empty.");
        }
        other => panic!("expected GraphApi error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_write_in_interactive_mode_is_refused_before_network() {
    let h = Harness::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&h.idp)
        .await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&h.graph)
        .await;

    let settings = h.settings(&[]);
    let (dispatcher, sink) = h.dispatcher(&settings);
    let request = CommandRequest::new("users", "POST").with_payload(json!({"displayName": "x"}));
    match dispatcher.execute(request).await {
        Err(GatewayError::Auth(AuthError::InsufficientPermission(_))) => {}
        other => panic!("expected InsufficientPermission, got {:?}", other),
    }
    assert_eq!(sink.count(), 0);
}

#[tokio::test]
async fn test_invalid_path_is_rejected_before_network() {
    let h = Harness::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&h.graph)
        .await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&h.idp)
        .await;

    let settings = h.settings(&[("AZURE_CLIENT_SECRET", "s")]);
    let (dispatcher, _) = h.dispatcher(&settings);
    for bad in ["../admin", "", "https://evil.example.com/me", "users/%2e%2e/admin"] {
        assert!(
            matches!(
                dispatcher.execute(CommandRequest::get(bad)).await,
                Err(GatewayError::Validation(_))
            ),
            "{:?} should be rejected",
            bad
        );
    }
    assert!(matches!(
        dispatcher.execute(CommandRequest::new("me", "TRACE")).await,
        Err(GatewayError::Validation(_))
    ));
}

#[tokio::test]
async fn test_get_is_retried_on_transport_failure() {
    let h = Harness::start().await;
    Mock::given(method("POST"))
        .and(path(h.token_path()))
        .respond_with(app_token("app-token"))
        .mount(&h.idp)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1.0/me"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .expect(3)
        .mount(&h.graph)
        .await;

    let settings = h.settings(&[
        ("AZURE_CLIENT_SECRET", "s"),
        ("GRAPH_REQUEST_TIMEOUT", "1"),
        ("GRAPH_MAX_RETRIES", "2"),
    ]);
    let (dispatcher, _) = h.dispatcher(&settings);
    match dispatcher.execute(CommandRequest::get("me")).await {
        Err(GatewayError::Transport { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("expected Transport error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_post_is_not_retried_on_transport_failure() {
    let h = Harness::start().await;
    Mock::given(method("POST"))
        .and(path(h.token_path()))
        .respond_with(app_token("app-token"))
        .mount(&h.idp)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1.0/groups"))
        .respond_with(ResponseTemplate::new(201).set_delay(Duration::from_secs(3)))
        .expect(1)
        .mount(&h.graph)
        .await;

    let settings = h.settings(&[
        ("AZURE_CLIENT_SECRET", "s"),
        ("GRAPH_REQUEST_TIMEOUT", "1"),
        ("GRAPH_MAX_RETRIES", "2"),
    ]);
    let (dispatcher, _) = h.dispatcher(&settings);
    let request = CommandRequest::new("groups", "POST").with_payload(json!({"displayName": "g"}));
    match dispatcher.execute(request).await {
        Err(GatewayError::Transport { attempts, .. }) => assert_eq!(attempts, 1),
        other => panic!("expected Transport error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_no_content_and_plain_text_responses() {
    let h = Harness::start().await;
    Mock::given(method("POST"))
        .and(path(h.token_path()))
        .respond_with(app_token("app-token"))
        .mount(&h.idp)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/v1.0/groups/g1"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&h.graph)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1.0/me/photo/$value"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&h.graph)
        .await;

    let settings = h.settings(&[("AZURE_CLIENT_SECRET", "s")]);
    let (dispatcher, _) = h.dispatcher(&settings);

    let deleted = dispatcher
        .execute(CommandRequest::new("groups/g1", "DELETE"))
        .await
        .unwrap();
    assert_eq!(deleted.status, 204);
    assert_eq!(
        deleted.body["message"],
        "Operation completed successfully (no content returned)"
    );

    let text = dispatcher
        .execute(CommandRequest::get("me/photo/$value"))
        .await
        .unwrap();
    assert_eq!(text.body["message"], "Operation completed successfully");
    assert_eq!(text.body["response_text"], "not json");
}

#[tokio::test]
async fn test_per_call_secret_enables_writes_in_interactive_mode() {
    let h = Harness::start().await;
    Mock::given(method("POST"))
        .and(path(h.token_path()))
        .and(body_string_contains("grant_type=client_credentials"))
        .and(body_string_contains("client_secret=per-call"))
        .respond_with(app_token("override-token"))
        .expect(1)
        .mount(&h.idp)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1.0/groups"))
        .and(header("authorization", "Bearer override-token"))
        .and(body_json(json!({"displayName": "Engineering"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "g1"})))
        .expect(1)
        .mount(&h.graph)
        .await;

    let settings = h.settings(&[]);
    let (dispatcher, sink) = h.dispatcher(&settings);
    let request = CommandRequest::new("groups", "post")
        .with_payload(json!({"displayName": "Engineering"}))
        .with_client_secret(ClientSecret::new("per-call"));
    let result = dispatcher.execute(request).await.unwrap();
    assert_eq!(result.status, 201);
    assert_eq!(result.body["id"], "g1");
    assert_eq!(sink.count(), 0);
}

#[tokio::test]
async fn test_rejected_secret_maps_to_auth_error() {
    let h = Harness::start().await;
    Mock::given(method("POST"))
        .and(path(h.token_path()))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": "invalid_client",
            "error_description": "AADSTS7000215: Invalid client secret provided.",
            "error_codes": [7000215]
        })))
        .expect(1)
        .mount(&h.idp)
        .await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&h.graph)
        .await;

    let settings = h.settings(&[("AZURE_CLIENT_SECRET", "wrong")]);
    let (dispatcher, _) = h.dispatcher(&settings);
    let err = dispatcher
        .execute(CommandRequest::get("users"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GatewayError::Auth(AuthError::SecretRejected(_))
    ));
    let payload = err.to_tool_payload();
    assert_eq!(payload["error"]["reason"], "secret_rejected");
}

#[tokio::test]
async fn test_application_flow_needs_concrete_tenant() {
    let h = Harness::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&h.idp)
        .await;

    let settings = h.settings(&[("AZURE_CLIENT_SECRET", "s"), ("AZURE_TENANT_ID", "common")]);
    let (dispatcher, _) = h.dispatcher(&settings);
    assert!(matches!(
        dispatcher.execute(CommandRequest::get("users")).await,
        Err(GatewayError::Auth(AuthError::IdentityMalformed(_)))
    ));
}

#[tokio::test]
async fn test_graph_error_envelope_is_preserved() {
    let h = Harness::start().await;
    Mock::given(method("POST"))
        .and(path(h.token_path()))
        .respond_with(app_token("app-token"))
        .mount(&h.idp)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1.0/users/nobody@contoso.com"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": {
                "code": "Request_ResourceNotFound",
                "message": "Resource 'nobody@contoso.com' does not exist."
            }
        })))
        .expect(1)
        .mount(&h.graph)
        .await;

    let settings = h.settings(&[("AZURE_CLIENT_SECRET", "s")]);
    let (dispatcher, _) = h.dispatcher(&settings);
    let err = dispatcher
        .execute(CommandRequest::get("users/nobody@contoso.com"))
        .await
        .unwrap_err();
    let payload = err.to_tool_payload();
    assert_eq!(payload["error"]["kind"], "graph_api_error");
    assert_eq!(payload["error"]["status_code"], 404);
    assert_eq!(payload["error"]["code"], "Request_ResourceNotFound");
    assert_eq!(
        payload["error"]["error_details"]["error"]["code"],
        "Request_ResourceNotFound"
    );
}

#[tokio::test]
async fn test_rejected_token_is_not_reused_after_failed_refresh() {
    let h = Harness::start().await;
    Mock::given(method("POST"))
        .and(path(h.token_path()))
        .respond_with(app_token("first"))
        .up_to_n_times(1)
        .mount(&h.idp)
        .await;
    Mock::given(method("POST"))
        .and(path(h.token_path()))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": "invalid_client",
            "error_description": "AADSTS7000222: The provided client secret keys are expired.",
            "error_codes": [7000222]
        })))
        .mount(&h.idp)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1.0/me"))
        .and(header("authorization", "Bearer first"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {"code": "InvalidAuthenticationToken", "message": "Token is not valid."}
        })))
        .expect(1)
        .mount(&h.graph)
        .await;

    let store = Arc::new(MemoryTokenStore::new());
    let settings = h.settings(&[("AZURE_CLIENT_SECRET", "s")]);
    let (dispatcher, _) = h.dispatcher_with_store(&settings, store.clone());

    for _ in 0..2 {
        assert!(matches!(
            dispatcher.execute(CommandRequest::get("me")).await,
            Err(GatewayError::Auth(AuthError::SecretRejected(_)))
        ));
    }

    let ctx = CredentialContext::new(TENANT, CLIENT, Some(ClientSecret::new("s")));
    assert!(store.load(&ctx.identity_key(&ctx.flow(None))).is_none());
}

#[tokio::test]
async fn test_resolve_with_override_uses_its_own_identity() {
    let h = Harness::start().await;
    Mock::given(method("POST"))
        .and(path(h.token_path()))
        .and(body_string_contains("client_secret=per-call"))
        .respond_with(app_token("override-token"))
        .expect(1)
        .mount(&h.idp)
        .await;

    let settings = h.settings(&[("AZURE_CLIENT_SECRET", "process-secret")]);
    let (dispatcher, _) = h.dispatcher(&settings);
    let resolver = dispatcher.resolver();
    let secret = ClientSecret::new("per-call");

    let token = resolver.resolve(Some(&secret)).await.unwrap();
    assert_eq!(token.access_token, "override-token");

    let ctx = resolver.context();
    let override_key = ctx.identity_key(&ctx.flow(Some(&secret)));
    assert_eq!(token.identity_key, override_key);
    assert_ne!(token.identity_key, ctx.identity_key(&ctx.flow(None)));
    assert_eq!(
        resolver.cache().peek(&override_key).unwrap().access_token,
        "override-token"
    );
    assert!(resolver
        .cache()
        .peek(&ctx.identity_key(&ctx.flow(None)))
        .is_none());
}
