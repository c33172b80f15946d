use std::fmt::Write;

use http::HeaderValue;
use http::header::{CACHE_CONTROL, CONTENT_TYPE};
use serde::Serialize;

use crate::connection::Exchange;
use crate::handler::Handler;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::protocol::BoxError;

/// Request extension attached to every request of the status listener.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub connections: usize,
    pub worker_threads: usize,
    pub busy_workers: usize,
    pub queued_tasks: usize,
    pub metrics: MetricsSnapshot,
}

/// Default handler of the status listener: a plain-text dump of [`EngineStatus`].
#[derive(Debug, Default, Clone, Copy)]
pub struct StatusHandler;

impl Handler for StatusHandler {
    fn handle(&self, exchange: &mut Exchange) -> Result<(), BoxError> {
        let page = match exchange.request().extensions().get::<EngineStatus>() {
            Some(status) => render(status),
            None => render_metrics(&Metrics::global().snapshot()),
        };

        let response = exchange.response();
        response.insert_header(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"))?;
        response.insert_header(CACHE_CONTROL, HeaderValue::from_static("no-store"))?;
        response.set_content_length(page.len() as u64)?;
        response.write(page.as_bytes())?;
        Ok(())
    }
}

fn render(status: &EngineStatus) -> String {
    let mut page = String::with_capacity(512);
    // writing into a String can't fail
    let _ = writeln!(page, "connections: {}", status.connections);
    let _ = writeln!(page, "worker_threads: {}", status.worker_threads);
    let _ = writeln!(page, "busy_workers: {}", status.busy_workers);
    let _ = writeln!(page, "queued_tasks: {}", status.queued_tasks);
    page.push_str(&render_metrics(&status.metrics));
    page
}

fn render_metrics(metrics: &MetricsSnapshot) -> String {
    let rows = [
        ("connections_accepted", metrics.connections_accepted),
        ("connections_closed", metrics.connections_closed),
        ("connections_rejected", metrics.connections_rejected),
        ("timeouts", metrics.timeouts),
        ("requests_handled", metrics.requests_handled),
        ("bad_requests", metrics.bad_requests),
        ("chunked_requests_seen", metrics.chunked_requests_seen),
        ("chunked_requests_completed", metrics.chunked_requests_completed),
        ("gzipped_requests_seen", metrics.gzipped_requests_seen),
        ("gzipped_requests_completed", metrics.gzipped_requests_completed),
    ];

    let mut page = String::with_capacity(512);
    for (name, value) in rows {
        let _ = writeln!(page, "{name}: {value}");
    }
    page
}
