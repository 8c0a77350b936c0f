use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::events::{EventGridEvent, InvocationRequest, InvocationResponse, EVENT_GRID_BINDING};
use crate::process::FailureMode;
use crate::twins::TwinUpdater;

pub const EVENT_GRID_WEBHOOK_PATH: &str = "/runtime/webhooks/EventGrid";

#[derive(Clone)]
pub struct AppState {
    pub twins: Arc<dyn TwinUpdater>,
    pub mode: FailureMode,
}

/// Routes served to the Functions host (`/{function_name}`) and to direct
/// Event Grid webhook deliveries.
pub fn router(function_name: &str, twins: Arc<dyn TwinUpdater>, mode: FailureMode) -> Router {
    Router::new()
        .route(&format!("/{}", function_name), post(invoke))
        .route(EVENT_GRID_WEBHOOK_PATH, post(webhook))
        .with_state(AppState { twins, mode })
        .layer(TraceLayer::new_for_http())
}

// custom handler invocation
async fn invoke(State(state): State<AppState>, body: Bytes) -> Json<InvocationResponse> {
    let event = serde_json::from_slice::<InvocationRequest>(&body)
        .and_then(|request| request.event(EVENT_GRID_BINDING));

    let event = match event {
        Ok(event) => event,
        Err(e) => {
            let line = format!("Error in ingest function: invalid invocation request - {}", e);
            error!("{}", line);
            return Json(InvocationResponse {
                logs: vec![line],
                ..Default::default()
            });
        }
    };

    let outcome = crate::function_handler(state.twins.as_ref(), state.mode, event.as_ref()).await;
    Json(InvocationResponse {
        return_value: outcome.return_value(),
        logs: outcome.logs,
        ..Default::default()
    })
}

// direct event grid delivery, used when running locally
async fn webhook(State(state): State<AppState>, body: Bytes) -> Response {
    let events: Vec<EventGridEvent> = match serde_json::from_slice(&body) {
        Ok(events) => events,
        Err(e) => {
            warn!("rejecting webhook delivery - {}", e);
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    if let Some(first) = events.first() {
        if first.is_subscription_validation() {
            let Some(code) = first.validation_code() else {
                return (StatusCode::BAD_REQUEST, "missing validationCode").into_response();
            };
            info!("answering event grid subscription validation");
            return Json(json!({ "validationResponse": code })).into_response();
        }
    }

    for event in &events {
        crate::function_handler(state.twins.as_ref(), state.mode, Some(event)).await;
    }
    StatusCode::OK.into_response()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::patch::JsonPatchDocument;
    use crate::twins::TwinsError;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use std::sync::Mutex;
    use tower::ServiceExt;

    #[derive(Default)]
    struct RecordingUpdater {
        twin_ids: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TwinUpdater for RecordingUpdater {
        async fn update_digital_twin(
            &self,
            twin_id: &str,
            _: &JsonPatchDocument,
        ) -> Result<(), TwinsError> {
            self.twin_ids.lock().unwrap().push(twin_id.to_string());
            Ok(())
        }
    }

    async fn post_json(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                Request::post(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_invoke_forwards_messages() {
        let twins = Arc::new(RecordingUpdater::default());
        let app = router("IoTHubtoDigitaleTwins", twins.clone(), FailureMode::default());

        let (status, body) = post_json(
            app,
            "/IoTHubtoDigitaleTwins",
            json!({
                "Data": {
                    "eventGridEvent": {
                        "id": "1",
                        "eventType": "Microsoft.Devices.DeviceTelemetry",
                        "data": [
                            {"deviceName": "d1", "readings": [{"resourceName": "CO2", "value": 412.5}]},
                            {"deviceName": "d2", "readings": [{"resourceName": "CH4", "value": "1.8"}]}
                        ]
                    }
                },
                "Metadata": {}
            }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(*twins.twin_ids.lock().unwrap(), vec!["d1", "d2"]);
        assert_eq!(body["ReturnValue"]["updated"], json!(["d1", "d2"]));
        assert_eq!(body["Logs"], json!(["Updated 2 of 2 twins"]));
    }

    #[tokio::test]
    async fn test_invoke_bad_envelope_still_succeeds() {
        let twins = Arc::new(RecordingUpdater::default());
        let app = router("IoTHubtoDigitaleTwins", twins.clone(), FailureMode::default());

        let (status, body) = post_json(
            app,
            "/IoTHubtoDigitaleTwins",
            json!({"Data": {"eventGridEvent": "{not json"}}),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert!(twins.twin_ids.lock().unwrap().is_empty());
        assert!(body["Logs"][0]
            .as_str()
            .unwrap()
            .starts_with("Error in ingest function:"));
        assert_eq!(body["ReturnValue"], Value::Null);
    }

    #[tokio::test]
    async fn test_webhook_subscription_validation() {
        let twins = Arc::new(RecordingUpdater::default());
        let app = router("IoTHubtoDigitaleTwins", twins.clone(), FailureMode::default());

        let (status, body) = post_json(
            app,
            EVENT_GRID_WEBHOOK_PATH,
            json!([{
                "id": "2d1781af-3a4c-4d7c-bd0c-e34b19da4e66",
                "topic": "/subscriptions/xx/resourceGroups/farm",
                "subject": "",
                "eventType": "Microsoft.EventGrid.SubscriptionValidationEvent",
                "eventTime": "2024-05-02T10:00:00Z",
                "data": {"validationCode": "512d38b6-c7b8-40c8-89fe-f46f9e9622b6"},
                "dataVersion": "1",
                "metadataVersion": "1"
            }]),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({"validationResponse": "512d38b6-c7b8-40c8-89fe-f46f9e9622b6"})
        );
        assert!(twins.twin_ids.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_webhook_delivers_each_event() {
        let twins = Arc::new(RecordingUpdater::default());
        let app = router("IoTHubtoDigitaleTwins", twins.clone(), FailureMode::default());

        let (status, _) = post_json(
            app,
            EVENT_GRID_WEBHOOK_PATH,
            json!([
                {"id": "1", "eventType": "t", "data": [{"deviceName": "d1", "readings": [{"resourceName": "NH3", "value": 4}]}]},
                {"id": "2", "eventType": "t", "data": null},
                {"id": "3", "eventType": "t", "data": [{"deviceName": "d3", "readings": [{"resourceName": "N2O", "value": 0.3}]}]}
            ]),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(*twins.twin_ids.lock().unwrap(), vec!["d1", "d3"]);
    }

    #[tokio::test]
    async fn test_webhook_rejects_non_events() {
        let twins = Arc::new(RecordingUpdater::default());
        let app = router("IoTHubtoDigitaleTwins", twins, FailureMode::default());

        let (status, _) = post_json(app, EVENT_GRID_WEBHOOK_PATH, json!({"hello": "world"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
