//! Telemetry Exporter
//!
//! Prometheus text exposition of engine instance state, served over HTTP
//! once every engine has started.

use crate::engine::EngineInstance;
use crate::error::{Error, Result};
use crate::events::PubSub;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use prometheus::{Encoder, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

// =============================================================================
// Engine Metrics
// =============================================================================

/// Gauges describing the engines of this node
pub struct EngineMetrics {
    registry: Registry,
    phase: IntGaugeVec,
    incarnations: IntGaugeVec,
    rank: IntGaugeVec,
    events_published: IntGauge,
    instances: Vec<Arc<EngineInstance>>,
    bus: Arc<PubSub>,
}

fn metric_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("telemetry: {}", e))
}

impl EngineMetrics {
    pub fn new(instances: Vec<Arc<EngineInstance>>, bus: Arc<PubSub>) -> Result<Self> {
        let registry = Registry::new_custom(Some("engine".to_string()), None).map_err(metric_err)?;

        let phase = IntGaugeVec::new(
            Opts::new("phase", "Lifecycle phase of the engine instance"),
            &["instance"],
        )
        .map_err(metric_err)?;
        let incarnations = IntGaugeVec::new(
            Opts::new("incarnations", "Engine processes started for the instance"),
            &["instance"],
        )
        .map_err(metric_err)?;
        let rank = IntGaugeVec::new(
            Opts::new("rank", "Rank held by the instance, -1 if none"),
            &["instance"],
        )
        .map_err(metric_err)?;
        let events_published =
            IntGauge::new("events_published", "Events published on the node bus").map_err(metric_err)?;

        registry.register(Box::new(phase.clone())).map_err(metric_err)?;
        registry.register(Box::new(incarnations.clone())).map_err(metric_err)?;
        registry.register(Box::new(rank.clone())).map_err(metric_err)?;
        registry
            .register(Box::new(events_published.clone()))
            .map_err(metric_err)?;

        Ok(Self {
            registry,
            phase,
            incarnations,
            rank,
            events_published,
            instances,
            bus,
        })
    }

    fn refresh(&self) {
        for inst in &self.instances {
            let label = inst.index().to_string();
            self.phase
                .with_label_values(&[&label])
                .set(inst.phase().as_gauge());
            self.incarnations
                .with_label_values(&[&label])
                .set(inst.incarnation() as i64);
            self.rank
                .with_label_values(&[&label])
                .set(inst.rank().map_or(-1, |r| i64::from(r.0)));
        }
        self.events_published.set(self.bus.published_count() as i64);
    }

    /// Current metrics in Prometheus text format
    pub fn gather_text(&self) -> Result<String> {
        self.refresh();
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metric_err)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("telemetry: {}", e)))
    }
}

// =============================================================================
// Exporter
// =============================================================================

fn respond(metrics: &EngineMetrics, req: &Request<Body>) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    if req.uri().path() != "/metrics" {
        *response.status_mut() = StatusCode::NOT_FOUND;
        *response.body_mut() = Body::from("not found");
        return response;
    }

    match metrics.gather_text() {
        Ok(text) => {
            if let Ok(content_type) = TextEncoder::new().format_type().parse() {
                response.headers_mut().insert(hyper::header::CONTENT_TYPE, content_type);
            }
            *response.body_mut() = Body::from(text);
        }
        Err(e) => {
            error!("{}", e);
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        }
    }
    response
}

/// Bind the exporter and serve until `shutdown` is cancelled
///
/// Returns the bound address and the serving task.
pub fn start_exporter(
    addr: SocketAddr,
    metrics: Arc<EngineMetrics>,
    shutdown: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move { Ok::<_, Infallible>(respond(&metrics, &req)) }
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("telemetry exporter bind {}: {}", addr, e)))?
        .serve(make_svc);
    let bound = server.local_addr();
    info!("telemetry exporter listening on {}", bound);

    let handle = tokio::spawn(async move {
        let graceful = server.with_graceful_shutdown(async move { shutdown.cancelled().await });
        if let Err(e) = graceful.await {
            error!("telemetry exporter error: {}", e);
        }
    });

    Ok((bound, handle))
}
