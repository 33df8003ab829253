use super::*;
use axum::body::to_bytes;

async fn body_json(response: Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[test]
fn test_status_mapping() {
    let cases = [
        (Error::NotFound("x".into()), StatusCode::NOT_FOUND),
        (Error::Validation("x".into()), StatusCode::BAD_REQUEST),
        (Error::Conflict("x".into()), StatusCode::CONFLICT),
        (Error::Unauthorized("x".into()), StatusCode::UNAUTHORIZED),
        (Error::Forbidden("x".into()), StatusCode::FORBIDDEN),
        (
            Error::RuntimeUnavailable("x".into()),
            StatusCode::SERVICE_UNAVAILABLE,
        ),
        (
            Error::ImagePullFailed("x".into()),
            StatusCode::SERVICE_UNAVAILABLE,
        ),
        (
            Error::UpstreamTimeout("x".into()),
            StatusCode::GATEWAY_TIMEOUT,
        ),
        (Error::Upstream("x".into()), StatusCode::BAD_GATEWAY),
        (
            Error::Internal("x".into()),
            StatusCode::INTERNAL_SERVER_ERROR,
        ),
    ];
    for (error, expected) in cases {
        assert_eq!(ApiError(error).status(), expected);
    }
}

#[tokio::test]
async fn test_response_body_shape() {
    let response = ApiError(Error::NotFound("agent a1".into())).into_response();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let body = body_json(response).await;
    assert_eq!(body["code"], 404);
    assert!(body["error"].as_str().unwrap().contains("agent a1"));
}

#[tokio::test]
async fn test_conflict_shape() {
    let response = ApiError(Error::Conflict("runner change".into())).into_response();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response).await;
    assert_eq!(body["code"], 409);
}
