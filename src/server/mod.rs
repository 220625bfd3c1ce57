//! Streaming gateway
//!
//! Two long-lived SSE endpoints: the global `new-charity` feed and the
//! per-charity donation feed. Every connection subscribes to its bus
//! topic on accept and multiplexes domain events with an independent
//! fixed-interval `time-update` heartbeat. The bus subscription guard is
//! owned by the response stream, so a client disconnect unsubscribes as
//! the stream drops.

use std::convert::Infallible;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, Method};
use axum::response::sse::{Event, Sse};
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use futures_util::Stream;
use tokio_stream::wrappers::{IntervalStream, UnboundedReceiverStream};
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::bus::{EventBus, Subscription, Topic};

#[derive(Clone)]
pub struct AppState {
    pub bus: EventBus,
    pub heartbeat: Duration,
}

/// Build the gateway router with CORS locked to the configured origin,
/// GET only.
pub fn create_router(state: AppState, cors_origin: &str) -> Result<Router> {
    let origin: HeaderValue = cors_origin
        .parse()
        .with_context(|| format!("invalid CORS origin: {cors_origin}"))?;

    Ok(Router::new()
        .route("/sse/new-charities", get(new_charities))
        .route("/sse/charities/:charityId/donations", get(charity_donations))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(origin)
                .allow_methods([Method::GET])
                .allow_headers([header::CONTENT_TYPE])
                .max_age(Duration::from_secs(600)),
        ))
}

/// GET /sse/new-charities - global feed of newly created charities
async fn new_charities(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let topic = Topic::new_charity();
    let subscription = state.bus.subscribe(&topic);
    info!(
        topic = %topic,
        subscribers = state.bus.subscriber_count(&topic),
        "SSE client connected"
    );
    Sse::new(sse_stream(subscription, state.heartbeat))
}

/// GET /sse/charities/:charityId/donations - one charity's donation feed
async fn charity_donations(
    Path(charity_id): Path<String>,
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let topic = Topic::donations(&charity_id);
    let subscription = state.bus.subscribe(&topic);
    info!(
        topic = %topic,
        subscribers = state.bus.subscriber_count(&topic),
        "SSE client connected"
    );
    Sse::new(sse_stream(subscription, state.heartbeat))
}

/// Merge the bus feed with the heartbeat ticks. The subscription guard
/// moves into the event closure: when the client disconnects and axum
/// drops the stream, the guard drops and the bus entry is removed.
fn sse_stream(
    subscription: Subscription,
    heartbeat: Duration,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let (rx, guard) = subscription.into_parts();

    let events = UnboundedReceiverStream::new(rx).filter_map(move |event| {
        let _owned_until_disconnect = &guard;
        serde_json::to_string(&event)
            .ok()
            .map(|data| Ok(Event::default().event(event.name()).data(data)))
    });

    let heartbeats = IntervalStream::new(tokio::time::interval(heartbeat)).map(|_| {
        Ok(Event::default()
            .event("time-update")
            .data(format!("It is {}", Utc::now().to_rfc3339())))
    });

    events.merge(heartbeats)
}
