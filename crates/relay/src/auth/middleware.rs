use crate::{
    auth::jwt::JwtAccessTokenService,
    error::{ErrorCode, RelayError},
};
use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use murmur_common::types::UserId;
use std::sync::Arc;

/// Caller of the conversation API, resolved from the bearer token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: UserId,
}

/// Conversation routes are user-only; anonymous callers exist only on
/// the chat socket.
pub async fn require_bearer_auth(
    State(jwt_service): State<Arc<JwtAccessTokenService>>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(request.headers()) else {
        return RelayError::new(ErrorCode::AuthInvalidToken, "missing bearer token")
            .into_response();
    };
    let Ok(user_id) = jwt_service.validate_user_token(token) else {
        return RelayError::new(ErrorCode::AuthInvalidToken, "invalid bearer token")
            .into_response();
    };

    request.extensions_mut().insert(AuthenticatedUser { user_id });
    next.run(request).await
}

/// Token from `Authorization: Bearer <token>`, scheme matched case-insensitively.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        extract::Extension,
        http::{HeaderValue, Request, StatusCode},
        middleware,
        routing::get,
        Router,
    };
    use serde_json::Value;
    use tower::ServiceExt;

    const TEST_SECRET: &str = "murmur_test_secret_that_is_definitely_long_enough";

    fn jwt(secret: &str) -> Arc<JwtAccessTokenService> {
        Arc::new(JwtAccessTokenService::new(secret).expect("service should initialize"))
    }

    /// Stand-in for the conversation list: answers with the caller's id.
    fn inbox_app() -> Router {
        Router::new()
            .route(
                "/v1/conversations",
                get(|Extension(caller): Extension<AuthenticatedUser>| async move {
                    caller.user_id.to_string()
                }),
            )
            .layer(middleware::from_fn_with_state(jwt(TEST_SECRET), require_bearer_auth))
    }

    async fn list_conversations(authorization: Option<String>) -> (StatusCode, String) {
        let mut request = Request::builder().uri("/v1/conversations");
        if let Some(value) = authorization {
            request = request.header(AUTHORIZATION, value);
        }
        let response = inbox_app()
            .oneshot(request.body(Body::empty()).expect("request should build"))
            .await
            .expect("request should return a response");
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body should read");
        (status, String::from_utf8(body.to_vec()).expect("body should be utf-8"))
    }

    fn headers_with(authorization: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static(authorization));
        headers
    }

    #[test]
    fn socket_clients_may_send_any_bearer_casing() {
        assert_eq!(bearer_token(&headers_with("Bearer abc.def")), Some("abc.def"));
        assert_eq!(bearer_token(&headers_with("BEARER  abc.def ")), Some("abc.def"));
        assert_eq!(bearer_token(&headers_with("Token abc.def")), None);
        assert_eq!(bearer_token(&headers_with("Bearer   ")), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn participant_token_reaches_the_conversation_routes() {
        let token = jwt(TEST_SECRET).issue_user_token(42).expect("token should be issued");

        let (status, body) = list_conversations(Some(format!("bearer {token}"))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "42");
    }

    #[tokio::test]
    async fn anonymous_and_foreign_callers_get_the_invalid_token_envelope() {
        let foreign = jwt("some_other_deployment_secret_that_is_long_enough")
            .issue_user_token(42)
            .expect("token should be issued");

        for (authorization, message) in [
            (None, "missing bearer token"),
            (Some("Basic YWxpY2U6c2VjcmV0".to_owned()), "missing bearer token"),
            (Some(format!("Bearer {foreign}")), "invalid bearer token"),
        ] {
            let (status, body) = list_conversations(authorization).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            let envelope: Value = serde_json::from_str(&body).expect("body should be json");
            assert_eq!(envelope["error"]["code"], "AUTH_INVALID_TOKEN");
            assert_eq!(envelope["error"]["message"], message);
            assert_eq!(envelope["error"]["retryable"], false);
        }
    }
}
