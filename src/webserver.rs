use crate::state::Readiness;
use axum::extract::State;
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};

pub async fn readiness_probe(State(readiness): State<Readiness>) -> impl IntoResponse {
    if readiness.is_ready() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

pub async fn liveness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub fn create_app(readiness: Readiness) -> Router {
    Router::new()
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .with_state(readiness)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn status(app: Router, uri: &str) -> StatusCode {
        app.oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn liveness_is_always_ok() {
        let app = create_app(Readiness::default());
        assert_eq!(status(app, "/health/live").await, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn readiness_waits_for_first_audit() {
        let readiness = Readiness::default();

        let app = create_app(readiness.clone());
        assert_eq!(
            status(app, "/health/ready").await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        readiness.mark_ready();
        let app = create_app(readiness);
        assert_eq!(status(app, "/health/ready").await, StatusCode::NO_CONTENT);
    }
}
