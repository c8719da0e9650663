use async_trait::async_trait;
use http::{Response, StatusCode};
use pingora::{
    apps::http_app::ServeHttp, protocols::http::ServerSession, services::listening::Service,
};
use serde::Serialize;

use crate::{config::Status, core::status};

#[derive(Serialize)]
struct ReadyBody {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'static str>,
}

/// Readiness probe for the forwarder.
///
/// `GET /status/ready` answers 200 once a target list has been installed and
/// 503 before that, while queries are still being held.
pub struct ReadinessApp;

impl ReadinessApp {
    pub fn readiness_service(cfg: &Status) -> Service<Self> {
        let mut service = Service::new("Readiness HTTP".to_string(), ReadinessApp);
        service.add_tcp(&cfg.address.to_string());
        service
    }
}

#[async_trait]
impl ServeHttp for ReadinessApp {
    async fn response(&self, http_session: &mut ServerSession) -> Response<Vec<u8>> {
        http_session.set_keepalive(None);

        match http_session.req_header().uri.path() {
            "/status/ready" => ready_response(status::is_ready()),
            _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
        }
    }
}

fn ready_response(ready: bool) -> Response<Vec<u8>> {
    let (code, body) = if ready {
        (
            StatusCode::OK,
            ReadyBody {
                status: "ok",
                error: None,
            },
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            ReadyBody {
                status: "error",
                error: Some("No forward targets installed yet"),
            },
        )
    };

    let json = serde_json::to_vec(&body).unwrap_or_else(|e| {
        log::error!("Failed to serialize readiness response: {e}");
        b"{}".to_vec()
    });

    Response::builder()
        .status(code)
        .header("Content-Type", "application/json")
        .body(json)
        .unwrap_or_else(|e| {
            log::error!("Failed to build readiness response: {e}");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        })
}

fn text_response(code: StatusCode, body: &str) -> Response<Vec<u8>> {
    let mut response = Response::new(body.as_bytes().to_vec());
    *response.status_mut() = code;
    response
}
