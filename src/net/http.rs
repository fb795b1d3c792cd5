// HTTP surface: WebSocket upgrade plus read-only diagnostics and the reference point

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use super::websocket::ws_handler;
use crate::broker::{Broker, StatusReport};
use crate::constants::DEFAULT_LOCATIONS_LIMIT;
use crate::geodesy::ReferencePoint;
use crate::record::ProcessedRecord;

pub fn router(broker: Arc<Broker>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/ws", get(ws_handler))
        .route("/status", get(status))
        .route("/locations", get(locations))
        .route("/latest", get(latest))
        .route("/reference", get(get_reference).put(put_reference))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(broker)
}

/// Browsers connect straight to the root; plain GETs get a banner
async fn root(
    state: State<Arc<Broker>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    match ws {
        Some(ws) => ws_handler(state, peer, ws).await,
        None => "LOCUS relay".into_response(),
    }
}

async fn status(State(broker): State<Arc<Broker>>) -> Json<StatusReport> {
    Json(broker.status().await)
}

#[derive(Debug, Deserialize)]
struct LocationsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct LocationsResponse {
    /// Records currently held in history
    count: usize,
    locations: Vec<ProcessedRecord>,
}

async fn locations(
    State(broker): State<Arc<Broker>>,
    Query(query): Query<LocationsQuery>,
) -> Json<LocationsResponse> {
    let limit = query.limit.filter(|&n| n > 0).unwrap_or(DEFAULT_LOCATIONS_LIMIT);
    Json(LocationsResponse {
        count: broker.history_len(),
        locations: broker.recent(limit),
    })
}

async fn latest(State(broker): State<Arc<Broker>>) -> Response {
    match broker.latest().await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            error!("Latest record lookup failed: {}", e);
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

async fn get_reference(State(broker): State<Arc<Broker>>) -> Json<ReferencePoint> {
    Json(broker.reference())
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

async fn put_reference(
    State(broker): State<Arc<Broker>>,
    Json(body): Json<ReferencePoint>,
) -> Response {
    match ReferencePoint::new(body.latitude, body.longitude) {
        Ok(reference) => {
            broker.set_reference(reference);
            Json(reference).into_response()
        }
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody { error: e.to_string() }),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::tests::test_broker;
    use crate::record::sample_record;

    async fn serve(broker: Arc<Broker>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(broker)).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_status_and_locations() {
        let (broker, _) = test_broker(50);
        for seq in 1..=4 {
            broker.publish(sample_record(seq)).await;
        }
        let base = serve(broker).await;
        let client = reqwest::Client::new();

        let status: serde_json::Value = client.get(format!("{}/status", base)).send().await.unwrap().json().await.unwrap();
        assert_eq!(status["status"], "running");
        assert_eq!(status["stats"]["recordsPublished"], 4);
        assert_eq!(status["stats"]["currentConnections"], 0);

        let body: serde_json::Value = client
            .get(format!("{}/locations?limit=2", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["count"], 4);
        let seqs: Vec<u64> = body["locations"].as_array().unwrap().iter().map(|r| r["seq"].as_u64().unwrap()).collect();
        assert_eq!(seqs, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_latest_404_then_record() {
        let (broker, _) = test_broker(50);
        let base = serve(broker.clone()).await;
        let client = reqwest::Client::new();

        let resp = client.get(format!("{}/latest", base)).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

        broker.publish(sample_record(9)).await;
        let record: ProcessedRecord = client.get(format!("{}/latest", base)).send().await.unwrap().json().await.unwrap();
        assert_eq!(record.seq, 9);
    }

    #[tokio::test]
    async fn test_reference_update_validated() {
        let (broker, _) = test_broker(50);
        let base = serve(broker.clone()).await;
        let client = reqwest::Client::new();

        let resp = client
            .put(format!("{}/reference", base))
            .json(&serde_json::json!({"latitude": 137.0, "longitude": 0.0}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
        assert_eq!(broker.reference(), ReferencePoint::default());

        let resp = client
            .put(format!("{}/reference", base))
            .json(&serde_json::json!({"latitude": 37.5, "longitude": 127.0}))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());

        let current: ReferencePoint = client.get(format!("{}/reference", base)).send().await.unwrap().json().await.unwrap();
        assert_eq!(current, ReferencePoint::new(37.5, 127.0).unwrap());
    }

    #[tokio::test]
    async fn test_root_without_upgrade() {
        let (broker, _) = test_broker(50);
        let base = serve(broker).await;
        let text = reqwest::get(format!("{}/", base)).await.unwrap().text().await.unwrap();
        assert_eq!(text, "LOCUS relay");
    }
}
