use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;
use ulid::Ulid;

use slotguard::booking::{BookingError, BookingErrorKind, BookingService};
use slotguard::compactor;
use slotguard::config::Config;
use slotguard::model::{Ms, ReservationCandidate, TimeWindow};
use slotguard::notify::NotifyHub;
use slotguard::store::WalStore;

/// One request per stdin line.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Create {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        #[serde(default)]
        payload: Value,
    },
    Cancel {
        id: Ulid,
    },
    Get {
        id: Ulid,
    },
    List {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
    },
}

fn kind_label(kind: BookingErrorKind) -> &'static str {
    match kind {
        BookingErrorKind::Conflict => "conflict",
        BookingErrorKind::Unavailable => "unavailable",
        BookingErrorKind::Invalid => "invalid",
    }
}

fn error_response(e: &BookingError) -> Value {
    json!({ "ok": false, "kind": kind_label(e.kind()), "error": e.to_string() })
}

async fn handle(service: &BookingService, line: &str) -> Value {
    let request: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => return json!({ "ok": false, "kind": "invalid", "error": format!("bad request: {e}") }),
    };

    match request {
        Request::Create {
            resource_id,
            start,
            end,
            payload,
        } => {
            let payload = match payload {
                Value::Null => String::new(),
                other => other.to_string(),
            };
            let candidate = ReservationCandidate::new(resource_id, TimeWindow { start, end }, payload);
            match service.create_booking(candidate).await {
                Ok(r) => json!({ "ok": true, "reservation": r }),
                Err(e) => error_response(&e),
            }
        }
        Request::Cancel { id } => match service.cancel_booking(id).await {
            Ok(r) => json!({ "ok": true, "reservation": r }),
            Err(e) => error_response(&e),
        },
        Request::Get { id } => match service.get_booking(id).await {
            Ok(r) => json!({ "ok": true, "reservation": r }),
            Err(e) => error_response(&e),
        },
        Request::List {
            resource_id,
            start,
            end,
        } => {
            let reservations = service
                .active_reservations_or_empty(resource_id, TimeWindow { start, end })
                .await;
            json!({ "ok": true, "reservations": reservations })
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // stdout carries responses; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env();
    slotguard::observability::init(config.metrics_port);

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let notify = Arc::new(NotifyHub::new());
    let store = Arc::new(WalStore::open(config.wal_path(), notify)?);
    tokio::spawn(compactor::run_compactor(store.clone(), config.compact_threshold));

    let service = BookingService::from_config(store, &config);
    info!("slotguard ready");
    info!("  data_dir: {}", config.data_dir.display());
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let response = handle(&service, &line).await;
                stdout.write_all(format!("{response}\n").as_bytes()).await?;
                stdout.flush().await?;
            }
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    info!("slotguard stopped");
    Ok(())
}
