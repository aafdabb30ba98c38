//! # Health and Introspection Endpoints
//!
//! Read-only HTTP surface for operators:
//! - `GET /health` and `GET /api/v1/health`: liveness, load and backend names
//! - `GET /api/v1/metrics`: relay counters since start
//! - `GET /api/v1/sessions`: every live session
//! - `GET /api/v1/sessions/{id}`: one session's state, last activity and ingest counters

use crate::error::{AppError, AppResult};
use crate::relay::SessionId;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let active_sessions = state.registry.session_count().await;
    let max_sessions = state.registry.max_sessions();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": "interview-relay",
            "version": env!("CARGO_PKG_VERSION"),
            "host": state.config.server.host,
            "port": state.config.server.port
        },
        "backends": {
            "transcription": state.transcription.name(),
            "suggestion": state.suggestion.name()
        },
        "memory": get_memory_info(),
        "system": get_system_status(active_sessions, max_sessions)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let uptime_seconds = state.get_uptime_seconds();
    let relay = state.metrics.snapshot();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "http": {
            "total_requests": state.metrics.http_requests.get(),
            "total_errors": state.metrics.http_errors.get()
        },
        "relay": relay,
        "sessions": {
            "active": state.registry.session_count().await,
            "max": state.registry.max_sessions()
        },
        "memory": get_memory_info()
    }))
}

pub async fn list_sessions(state: web::Data<AppState>) -> HttpResponse {
    let sessions = state.registry.snapshot().await;
    HttpResponse::Ok().json(json!({
        "count": sessions.len(),
        "sessions": sessions
    }))
}

pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let id: SessionId = path
        .parse()
        .map_err(|_| AppError::BadRequest(format!("Invalid session id: {}", path.as_str())))?;

    let snapshot = state.registry.lookup(id).await?;
    Ok(HttpResponse::Ok().json(snapshot))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        let pid = process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let read_kb = |prefix: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(prefix))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .unwrap_or(0)
                    * 1024
            };

            return json!({
                "resident_memory_bytes": read_kb("VmRSS:"),
                "virtual_memory_bytes": read_kb("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": format!("Memory info not available for pid {}", process::id())
    })
}

fn get_system_status(active_sessions: usize, max_sessions: usize) -> serde_json::Value {
    let session_usage = if max_sessions > 0 {
        active_sessions as f64 / max_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage >= 1.0 {
        "at_capacity"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": max_sessions,
        "current_sessions": active_sessions,
        "load_warnings": if session_usage > 0.8 {
            vec!["High session usage - consider increasing relay.max_concurrent_sessions"]
        } else {
            vec![]
        }
    })
}
