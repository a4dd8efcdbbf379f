//! HTTP surface: the pixel, the click redirect, and the report pages.
//!
//! The pixel handler always answers with the image and the click handler
//! always redirects once the request is validated; storage problems are
//! logged and never reach the client.

use crate::aggregator::{EventAggregator, REPORT_PAGE_SIZE};
use crate::classifier::{append_label, OpenClassifier};
use crate::config::{ClickWriteMode, Config};
use crate::events::{parse_sent, parse_timestamp, ClickEvent, OpenEvent};
use crate::lookup::Lookups;
use crate::pixel;
use crate::report;
use crate::signals::{SignalExtractor, UNKNOWN};
use crate::store::{EventStore, LISTING_LIMIT};
use crate::suspicion::OpenAttempt;
use crate::token::token_matches;
use anyhow::{anyhow, Context, Result};
use axum::{
    extract::{ConnectInfo, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::Utc;
use chrono_tz::Tz;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;

pub struct AppState {
    pub store: EventStore,
    pub classifier: OpenClassifier,
    pub lookups: Lookups,
    pub secret: String,
    pub store_suspicious: bool,
    pub click_mode: ClickWriteMode,
    pub timezone: Tz,
}

impl AppState {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            store: EventStore::new(&config.storage.database_path),
            classifier: OpenClassifier::from_config(&config.heuristics)?,
            lookups: Lookups::new(&config.lookups),
            secret: config.token.secret.clone(),
            store_suspicious: config.storage.store_suspicious,
            click_mode: config.storage.click_mode,
            timezone: config.report_timezone()?,
        })
    }
}

pub enum ClickRejection {
    MissingParameters,
    InvalidToken,
    InvalidDestination,
}

impl IntoResponse for ClickRejection {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ClickRejection::MissingParameters => {
                (StatusCode::BAD_REQUEST, "Missing required parameters")
            }
            ClickRejection::InvalidToken => (StatusCode::FORBIDDEN, "Invalid token"),
            ClickRejection::InvalidDestination => {
                (StatusCode::BAD_REQUEST, "Destination cannot be redirected to")
            }
        };
        (status, Html(format!("<h3>{message}</h3>"))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct PixelParams {
    from: Option<String>,
    to: Option<String>,
    sent: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ClickParams {
    from: Option<String>,
    to: Option<String>,
    url: Option<String>,
    token: Option<String>,
    sent: Option<String>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/pixel", get(pixel_handler))
        .route("/pixel.png", get(pixel_handler))
        .route("/click", get(click_handler))
        .route("/opens", get(opens_report))
        .route("/opens/raw", get(raw_opens))
        .route("/clicks", get(clicks_listing))
        .route("/status", get(status))
        .with_state(state)
}

pub async fn serve(config: Config) -> Result<()> {
    let state = Arc::new(AppState::from_config(&config)?);
    let store = state.store.clone();
    run_blocking(move || store.init()).await?;

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(config.server.listen_addr.as_str())
        .await
        .with_context(|| format!("Failed to bind {}", config.server.listen_addr))?;
    log::info!("Listening on {}", config.server.listen_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Received shutdown signal, stopping server");
        }
    })
    .await?;
    Ok(())
}

/// Run a store call off the async runtime, flattening join failures.
async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| anyhow!("Store task failed: {e}"))?
}

/// First `X-Forwarded-For` entry, else the peer address.
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|xff| xff.split(',').next())
        .map(|first| first.trim().to_string())
        .filter(|ip| !ip.is_empty())
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "0.0.0.0".to_string())
}

fn user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::USER_AGENT)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn pixel_response() -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(pixel::CONTENT_TYPE));
    for (name, value) in pixel::NO_CACHE_HEADERS {
        headers.insert(name, HeaderValue::from_static(value));
    }
    (StatusCode::OK, headers, pixel::PIXEL_PNG).into_response()
}

async fn pixel_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PixelParams>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Response {
    let (Some(sender), Some(recipient)) = (non_empty(params.from), non_empty(params.to)) else {
        log::warn!("Pixel request without sender or recipient, not recorded");
        return pixel_response();
    };

    let opened_at = Utc::now();
    let sent_at = parse_sent(params.sent.as_deref(), opened_at);
    let ua = user_agent(&headers).unwrap_or_default();
    let ip = client_ip(&headers, peer.map(|ConnectInfo(addr)| addr));

    let mut event = OpenEvent::new(&sender, &recipient, sent_at, opened_at, &ip, &ua);
    let classification = state.classifier.classify(&OpenAttempt::new(
        &sender,
        &recipient,
        event.delay_seconds,
        Some(ua.as_str()),
    ));

    if !classification.is_genuine() && !state.store_suspicious {
        log::info!(
            "Open {sender} -> {recipient} not recorded: {}",
            classification.label
        );
        return pixel_response();
    }
    event.user_agent = append_label(&ua, &classification.label);

    let store = state.store.clone();
    match run_blocking(move || store.insert_open(&event)).await {
        Ok(()) => log::info!(
            "Open recorded: {sender} -> {recipient} ({})",
            classification.label
        ),
        Err(e) => log::error!("Failed to record open {sender} -> {recipient}: {e:#}"),
    }

    pixel_response()
}

async fn click_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ClickParams>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<Response, ClickRejection> {
    let (Some(sender), Some(recipient), Some(url), Some(token)) = (
        non_empty(params.from),
        non_empty(params.to),
        non_empty(params.url),
        non_empty(params.token),
    ) else {
        return Err(ClickRejection::MissingParameters);
    };

    if !token_matches(&token, &sender, &recipient, &url, &state.secret) {
        log::warn!("Rejected click {sender} -> {recipient}: token mismatch");
        return Err(ClickRejection::InvalidToken);
    }
    let location = HeaderValue::from_str(&url).map_err(|_| ClickRejection::InvalidDestination)?;

    let ua = user_agent(&headers).unwrap_or_else(|| UNKNOWN.to_string());
    let ip = client_ip(&headers, peer.map(|ConnectInfo(addr)| addr));
    let labels = SignalExtractor::labels(&ua);
    let (country, mail_server) = tokio::join!(
        state.lookups.country(&ip),
        state.lookups.mail_server(&recipient)
    );

    let event = ClickEvent {
        sender: sender.clone(),
        recipient: recipient.clone(),
        url,
        clicked_at: Utc::now(),
        sent_at: params.sent.as_deref().and_then(parse_timestamp),
        browser: labels.browser,
        os: labels.os,
        country,
        mail_server,
        client_ip: ip,
        token,
        user_agent: ua,
        click_count: 1,
    };

    let store = state.store.clone();
    let mode = state.click_mode;
    let clicked_at = event.clicked_at;
    match run_blocking(move || store.record_click(&event, mode)).await {
        Ok(()) => log::info!("Click recorded: {sender} -> {recipient} ({clicked_at})"),
        Err(e) => log::error!("Failed to record click {sender} -> {recipient}: {e:#}"),
    }

    Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response())
}

async fn opens_report(State(state): State<Arc<AppState>>) -> Html<String> {
    let store = state.store.clone();
    match run_blocking(move || store.grouped_opens(REPORT_PAGE_SIZE)).await {
        Ok(groups) => {
            let rows = EventAggregator::new(&state.classifier).report(&groups);
            Html(report::open_report_html(&rows, state.timezone))
        }
        Err(e) => {
            log::error!("Failed to build open report: {e:#}");
            Html(report::error_html("reading opens", &e))
        }
    }
}

async fn raw_opens(State(state): State<Arc<AppState>>) -> Html<String> {
    let store = state.store.clone();
    match run_blocking(move || store.recent_opens(LISTING_LIMIT)).await {
        Ok(events) => Html(report::raw_opens_html(&events, state.timezone)),
        Err(e) => {
            log::error!("Failed to list opens: {e:#}");
            Html(report::error_html("reading opens", &e))
        }
    }
}

async fn clicks_listing(State(state): State<Arc<AppState>>) -> Html<String> {
    let store = state.store.clone();
    match run_blocking(move || store.recent_clicks(LISTING_LIMIT)).await {
        Ok(events) => Html(report::clicks_html(&events, state.timezone)),
        Err(e) => {
            log::error!("Failed to list clicks: {e:#}");
            Html(report::error_html("reading clicks", &e))
        }
    }
}

async fn index() -> Html<&'static str> {
    Html(
        "<h2>Mail tracking active</h2>\
         <p>Reports: <a href=\"/opens\">/opens</a>, <a href=\"/opens/raw\">/opens/raw</a>, \
         <a href=\"/clicks\">/clicks</a></p>",
    )
}

async fn status(State(state): State<Arc<AppState>>) -> Response {
    let store = state.store.clone();
    match run_blocking(move || store.ping()).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ok",
                "timestamp": Utc::now().to_rfc3339(),
            })),
        )
            .into_response(),
        Err(e) => {
            log::warn!("Health check failed: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "status": "error" })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static(" 198.51.100.7 , 10.0.0.1"));
        let peer: SocketAddr = "10.0.0.2:443".parse().unwrap();
        assert_eq!(client_ip(&headers, Some(peer)), "198.51.100.7");
    }

    #[test]
    fn test_client_ip_falls_back_to_peer() {
        let peer: SocketAddr = "10.0.0.2:443".parse().unwrap();
        assert_eq!(client_ip(&HeaderMap::new(), Some(peer)), "10.0.0.2");
        assert_eq!(client_ip(&HeaderMap::new(), None), "0.0.0.0");
    }
}
