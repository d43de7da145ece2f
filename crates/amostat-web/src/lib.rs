//! Axum API for the settings widget, the CRM webhook and manual check triggers.

use std::sync::Arc;

use amostat_adapters::{lead_id_from_hook, parse_form_payload, ApiError};
use amostat_core::{validate_status_settings, OwnerKind, OwnerSetting, StatusSetting};
use amostat_sync::{maybe_build_scheduler, Engine, SettingsStore, SyncContext};
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "amostat-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub store: Arc<dyn SettingsStore>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        let store = engine.store();
        Self { engine, store }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/settings/handle-hook", post(handle_hook_handler))
        .route("/settings/status", get(get_status_handler).post(save_status_handler))
        .route("/settings/custom-status", get(custom_status_handler))
        .route("/settings/contact", get(get_contact_handler).post(save_contact_handler))
        .route("/settings/company", get(get_company_handler).post(save_company_handler))
        .route("/settings/get-custom-fields", get(custom_fields_handler))
        .route("/settings/run-contact-check", post(run_contact_check_handler))
        .route("/settings/run-company-check", post(run_company_check_handler))
        .route("/settings/check-status", get(check_status_handler))
        .route("/settings/stage-ids", get(stage_ids_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("AMOSTAT_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let ctx = SyncContext::from_env().await?;
    let scheduler = maybe_build_scheduler(&ctx.config, ctx.engine.clone()).await?;
    if let Some(scheduler) = &scheduler {
        scheduler.start().await?;
        info!("bulk check scheduler started");
    }

    let state = AppState::new(ctx.engine.clone());
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn server_error(err: anyhow::Error) -> Response {
    warn!(error = %format!("{err:#}"), "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}

fn upstream_error(err: ApiError) -> Response {
    warn!(error = %err, "crm request failed");
    (StatusCode::BAD_GATEWAY, Json(json!({ "error": err.to_string() }))).into_response()
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn decode_hook_body(headers: &HeaderMap, body: &str) -> Result<JsonValue, String> {
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"));
    if is_json {
        serde_json::from_str(body).map_err(|err| err.to_string())
    } else {
        parse_form_payload(body).map_err(|err| err.to_string())
    }
}

async fn handle_hook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let payload = match decode_hook_body(&headers, &body) {
        Ok(payload) => payload,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, message),
    };
    let lead_id = match lead_id_from_hook(&payload) {
        Ok(id) => id,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, err.to_string()),
    };

    let engine = state.engine.clone();
    tokio::spawn(async move {
        match engine.handle_event(&payload).await {
            Ok(result) => info!(
                run_id = %result.run_id,
                lead_id,
                owners = result.owners_evaluated,
                "hook processed"
            ),
            Err(err) => warn!(lead_id, error = %err, "hook processing failed"),
        }
    });

    (StatusCode::ACCEPTED, Json(json!({ "accepted": true, "lead_id": lead_id }))).into_response()
}

async fn get_status_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.status_settings().await {
        Ok(settings) => Json(settings).into_response(),
        Err(err) => server_error(err),
    }
}

async fn save_status_handler(
    State(state): State<Arc<AppState>>,
    Json(settings): Json<Vec<StatusSetting>>,
) -> Response {
    if let Err(err) = validate_status_settings(&settings) {
        return error_response(StatusCode::UNPROCESSABLE_ENTITY, err.to_string());
    }
    match state.store.replace_status_settings(settings).await {
        Ok(saved) => (StatusCode::CREATED, Json(saved)).into_response(),
        Err(err) => server_error(err),
    }
}

async fn custom_status_handler(State(state): State<Arc<AppState>>) -> Response {
    let company = state.store.status_settings_for(OwnerKind::Company).await;
    let contact = state.store.status_settings_for(OwnerKind::Contact).await;
    match (company, contact) {
        (Ok(company), Ok(contact)) => {
            Json(json!({ "company": company, "contact": contact })).into_response()
        }
        (Err(err), _) | (_, Err(err)) => server_error(err),
    }
}

async fn owner_setting_response(state: &AppState, kind: OwnerKind) -> Response {
    match state.store.owner_setting(kind).await {
        Ok(Some(setting)) => Json(setting.to_wire(kind)).into_response(),
        Ok(None) => Json(JsonValue::Null).into_response(),
        Err(err) => server_error(err),
    }
}

async fn save_owner_setting(state: &AppState, kind: OwnerKind, setting: OwnerSetting) -> Response {
    match state.store.save_owner_setting(kind, &setting).await {
        Ok(()) => (StatusCode::CREATED, Json(setting.to_wire(kind))).into_response(),
        Err(err) => server_error(err),
    }
}

async fn get_contact_handler(State(state): State<Arc<AppState>>) -> Response {
    owner_setting_response(&state, OwnerKind::Contact).await
}

async fn save_contact_handler(
    State(state): State<Arc<AppState>>,
    Json(setting): Json<OwnerSetting>,
) -> Response {
    save_owner_setting(&state, OwnerKind::Contact, setting).await
}

async fn get_company_handler(State(state): State<Arc<AppState>>) -> Response {
    owner_setting_response(&state, OwnerKind::Company).await
}

async fn save_company_handler(
    State(state): State<Arc<AppState>>,
    Json(setting): Json<OwnerSetting>,
) -> Response {
    save_owner_setting(&state, OwnerKind::Company, setting).await
}

async fn custom_fields_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.api().custom_field_catalog().await {
        Ok(catalog) => Json(catalog).into_response(),
        Err(err) => upstream_error(err),
    }
}

async fn start_bulk_check(state: &AppState, kind: OwnerKind) -> Response {
    match state.store.check_running(kind).await {
        Ok(true) => {
            return error_response(StatusCode::CONFLICT, format!("{kind} check is already running"))
        }
        Ok(false) => {}
        Err(err) => return server_error(err),
    }

    let engine = state.engine.clone();
    tokio::spawn(async move {
        if let Err(err) = engine.run_bulk_check(kind).await {
            warn!(kind = kind.as_str(), error = %err, "manual bulk check failed");
        }
    });
    (
        StatusCode::ACCEPTED,
        Json(json!({ "accepted": true, "kind": kind })),
    )
        .into_response()
}

async fn run_contact_check_handler(State(state): State<Arc<AppState>>) -> Response {
    start_bulk_check(&state, OwnerKind::Contact).await
}

async fn run_company_check_handler(State(state): State<Arc<AppState>>) -> Response {
    start_bulk_check(&state, OwnerKind::Company).await
}

async fn check_status_handler(State(state): State<Arc<AppState>>) -> Response {
    let contact = state.store.check_running(OwnerKind::Contact).await;
    let company = state.store.check_running(OwnerKind::Company).await;
    match (contact, company) {
        (Ok(contact), Ok(company)) => {
            Json(json!({ "contact": contact, "company": company })).into_response()
        }
        (Err(err), _) | (_, Err(err)) => server_error(err),
    }
}

async fn stage_ids_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.stage_ids().await {
        Ok(ids) => Json(ids).into_response(),
        Err(err) => server_error(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amostat_adapters::CrmApi;
    use amostat_storage::testing::MemoryTransport;
    use amostat_storage::Method;
    use amostat_sync::FileSettingsStore;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_app(dir: &tempfile::TempDir, transport: Arc<MemoryTransport>) -> Router {
        let store: Arc<dyn SettingsStore> =
            Arc::new(FileSettingsStore::new(dir.path().join("settings.yaml")));
        let api = CrmApi::new(transport).with_paging(50, Duration::ZERO);
        app(AppState::new(Arc::new(Engine::new(api, store))))
    }

    fn json_request(method: &str, uri: &str, body: JsonValue) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(resp: Response) -> JsonValue {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn status_settings_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir, Arc::new(MemoryTransport::new()));
        let rules = json!([
            {"status": "gold", "dependency_type": "sum", "entity_type": "company",
             "field_id": 77, "from_amount": 1000, "to_amount": 5000},
            {"status": "new", "dependency_type": "quantity", "entity_type": "contact",
             "field_id": 78, "from_amount": null, "to_amount": 0}
        ]);

        let saved = app
            .clone()
            .oneshot(json_request("POST", "/settings/status", rules))
            .await
            .unwrap();
        assert_eq!(saved.status(), StatusCode::CREATED);

        let listed = body_json(app.clone().oneshot(get_request("/settings/status")).await.unwrap()).await;
        assert_eq!(listed.as_array().unwrap().len(), 2);

        let split = body_json(app.oneshot(get_request("/settings/custom-status")).await.unwrap()).await;
        assert_eq!(split["company"][0]["status"], "gold");
        assert_eq!(split["contact"][0]["status"], "new");
    }

    #[tokio::test]
    async fn inverted_bounds_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir, Arc::new(MemoryTransport::new()));
        let resp = app
            .oneshot(json_request(
                "POST",
                "/settings/status",
                json!([{"status": "bad", "dependency_type": "sum", "entity_type": "company",
                        "field_id": 77, "from_amount": 10, "to_amount": 5}]),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body_json(resp).await["error"].as_str().unwrap().contains("bad"));
    }

    #[tokio::test]
    async fn owner_setting_uses_kind_specific_field_name() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir, Arc::new(MemoryTransport::new()));

        let empty = body_json(app.clone().oneshot(get_request("/settings/contact")).await.unwrap()).await;
        assert!(empty.is_null());

        let resp = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/settings/contact",
                json!({"months": 6, "lead_field_id": 11, "contact_field_id": 22}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let stored = body_json(app.oneshot(get_request("/settings/contact")).await.unwrap()).await;
        assert_eq!(stored["contact_field_id"], 22);
        assert_eq!(stored["months"], 6);
    }

    #[tokio::test]
    async fn hook_accepts_form_body_and_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir, Arc::new(MemoryTransport::new()));

        let accepted = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/settings/handle-hook")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from("leads%5Bstatus%5D%5B0%5D%5Bid%5D=42"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(accepted.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(accepted).await["lead_id"], 42);

        let rejected = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/settings/handle-hook")
                    .body(Body::from("account[id]=1"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn check_status_and_stage_ids_start_empty() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir, Arc::new(MemoryTransport::new()));

        let status = body_json(app.clone().oneshot(get_request("/settings/check-status")).await.unwrap()).await;
        assert_eq!(status, json!({"contact": false, "company": false}));

        let ids = body_json(app.oneshot(get_request("/settings/stage-ids")).await.unwrap()).await;
        assert!(ids["pipeline_id"].is_null());
    }

    #[tokio::test]
    async fn custom_fields_are_grouped_for_the_widget() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        for collection in ["contacts", "companies", "leads"] {
            transport.respond(
                Method::Get,
                &format!("api/v4/{collection}/custom_fields"),
                json!({"_embedded": {"custom_fields": [
                    {"id": 1, "name": "Amount", "type": "numeric"},
                    {"id": 2, "name": "Status", "type": "text"}
                ]}}),
            );
        }
        let app = test_app(&dir, transport);
        let resp = app.oneshot(get_request("/settings/get-custom-fields")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let catalog = body_json(resp).await;
        assert_eq!(catalog["companyNumericFields"][0]["value"], "1");
        assert_eq!(catalog["contactStringFields"][0]["label"], "Status");
        assert_eq!(catalog["leadFields"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn manual_check_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir, Arc::new(MemoryTransport::new()));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/settings/run-company-check")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(resp).await["kind"], "company");
    }

    #[tokio::test]
    async fn running_check_is_a_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir, Arc::new(MemoryTransport::new()));
        FileSettingsStore::new(dir.path().join("settings.yaml"))
            .set_check_running(OwnerKind::Contact, true)
            .await
            .unwrap();

        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/settings/run-contact-check")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert!(body_json(resp).await["error"].as_str().unwrap().contains("contact"));
    }
}
