use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use tg_cache::InMemorySharedTier;
use tg_engine::{
    CacheWarmer, Collaborators, EngineConfig, FixedCapitalBase, InMemoryContractRepository, InMemoryPriceStore,
    RiskService,
};
use tg_types::group::{RiskLimits, StrategyType};
use tg_types::market::{InstrumentKey, PriceSeries};
use tg_types::position::{PaperSide, PhysicalSide, PositionRef};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = EngineConfig::load()?;
    let (sources, contracts) = demo_sources();
    let service = Arc::new(RiskService::new(
        config.clone(),
        sources,
        Some(Arc::new(InMemorySharedTier::new())),
    )?);
    seed_demo_group(&service, &contracts)?;

    let cancel = CancellationToken::new();
    let relay = service.spawn_relay(cancel.child_token());
    let warmer = config
        .warmer
        .enabled
        .then(|| CacheWarmer::spawn(service.clone(), config.warmer.clone()));

    let addr = std::env::var("TG_RISK_ADDR").unwrap_or_else(|_| "0.0.0.0:8082".to_string());
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "trade-group risk service listening");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            accepted = listener.accept() => {
                let (mut socket, _) = accepted?;
                let service = service.clone();
                tokio::spawn(async move {
                    let mut buffer = [0u8; 1024];
                    let n = socket.read(&mut buffer).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buffer[..n]);
                    let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();

                    let (status, body) = route(&service, &path).await;
                    let response = format!(
                        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        }
    }

    info!("shutting down");
    cancel.cancel();
    if let Some(warmer) = warmer {
        warmer.shutdown().await?;
    }
    if let Some(relay) = relay {
        if let Err(e) = relay.await {
            warn!(error = %e, "shared cache relay ended abnormally");
        }
    }
    Ok(())
}

async fn route(service: &RiskService, path: &str) -> (&'static str, String) {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match segments.as_slice() {
        ["health"] => (
            "200 OK",
            json!({
                "status": "ok",
                "service": "risk",
                "cache": service.cache_health(),
                "stats": service.cache_stats(),
            })
            .to_string(),
        ),
        ["groups"] => {
            let groups: Vec<_> = service
                .registry()
                .group_ids()
                .into_iter()
                .filter_map(|id| service.group(id).ok())
                .collect();
            ("200 OK", json!(groups).to_string())
        }
        ["groups", id, "risk"] => {
            let Ok(group_id) = Uuid::parse_str(id) else {
                return ("400 Bad Request", json!({ "error": "invalid group id" }).to_string());
            };
            match service.get_portfolio_risk(group_id, CancellationToken::new()).await {
                Ok(read) => (
                    "200 OK",
                    json!({ "freshness": read.freshness, "snapshot": read.snapshot.as_ref() }).to_string(),
                ),
                Err(e) => ("404 Not Found", json!({ "error": e.to_string() }).to_string()),
            }
        }
        _ => ("404 Not Found", json!({ "error": "not found" }).to_string()),
    }
}

/// In-memory collaborators with a year of synthetic Brent and WTI closes.
fn demo_sources() -> (Collaborators, Arc<InMemoryContractRepository>) {
    let start = Utc::now().date_naive() - chrono::Duration::days(365);
    let prices = Arc::new(InMemoryPriceStore::new());
    for (key, base) in [("BRENT", 82i64), ("WTI", 78i64)] {
        let closes: Vec<Decimal> = (0..250i64)
            .map(|day| Decimal::from(base) + Decimal::new((day * 37 % 23) - 11, 1))
            .collect();
        prices.insert(InstrumentKey::new(key), PriceSeries::from_daily_closes(start, &closes));
    }

    let contracts = Arc::new(InMemoryContractRepository::new());
    let sources = Collaborators {
        contracts: contracts.clone(),
        prices,
        capital: Arc::new(FixedCapitalBase::new(Some(Decimal::from(5_000_000)))),
    };
    (sources, contracts)
}

fn seed_demo_group(service: &RiskService, contracts: &InMemoryContractRepository) -> anyhow::Result<()> {
    let group = service.create_group(
        "Brent/WTI cargo hedge",
        StrategyType::Hedge,
        RiskLimits::default().with_max_allowed_loss(Decimal::from(250_000)),
    );
    let legs = [
        PositionRef::physical(PhysicalSide::Purchase, Decimal::from(50_000), Decimal::new(8150, 2), Decimal::new(8200, 2), "BRENT"),
        PositionRef::paper(PaperSide::Short, Decimal::from(50_000), Decimal::new(7820, 2), Decimal::new(7800, 2), "WTI"),
    ];

    let mut version = group.version;
    for leg in legs {
        contracts.upsert(leg.clone());
        version = service.assign_position(group.id, leg, version)?;
    }
    info!(group_id = %group.id, version, "demo trade group seeded");
    Ok(())
}
