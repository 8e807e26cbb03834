//! Terminbuchung background service.
//!
//! Runs migrations, then resets stale controls on an interval until Ctrl+C.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use terminbuchung_core::environment::{EligibilityEngine, SystemClock};
use terminbuchung_core::status::DossierEnvironment;
use terminbuchung_core::types::{Krankheit, Prioritaet};
use terminbuchung_postgres::PostgresStore;
use terminbuchung_service::config::Config;
use terminbuchung_service::metrics::install_exporter;
use terminbuchung_service::sweep::KontrolleSweep;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Priority groups unlocked through `FREIGEGEBENE_PRIORITAETEN` (e.g. `A,B,C`)
struct KonfigurierteFreigabe {
    prioritaeten: BTreeSet<char>,
}

impl KonfigurierteFreigabe {
    fn from_env() -> Self {
        let prioritaeten = std::env::var("FREIGEGEBENE_PRIORITAETEN")
            .unwrap_or_default()
            .split(',')
            .filter_map(|p| p.trim().chars().next())
            .collect();
        Self { prioritaeten }
    }
}

impl EligibilityEngine for KonfigurierteFreigabe {
    fn is_prioritaet_freigegeben(&self, _krankheit: Krankheit, prioritaet: Prioritaet) -> bool {
        self.prioritaeten.contains(&prioritaet.as_char())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let config = Config::from_env();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.server.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Terminbuchung service");
    info!(
        max_connections = config.postgres.max_connections,
        reservation_ttl_minutes = config.booking.reservation_ttl_minutes,
        kontrolle_ttl_hours = config.booking.kontrolle_ttl_hours,
        sweep_interval_seconds = config.sweep.interval_seconds,
        "Configuration loaded"
    );

    let metrics_addr: SocketAddr =
        format!("{}:{}", config.server.metrics_host, config.server.metrics_port).parse()?;
    install_exporter(metrics_addr)?;

    info!("Connecting to database...");
    let store = PostgresStore::connect(
        &config.postgres.url,
        config.postgres.max_connections,
        config.postgres.min_connections,
        Duration::from_secs(config.postgres.connect_timeout),
    )
    .await?;
    store.migrate().await?;
    info!("Database connected and migrated");

    let env = DossierEnvironment::new(Arc::new(SystemClock), Arc::new(KonfigurierteFreigabe::from_env()));
    let sweep = KontrolleSweep::new(
        Arc::new(store),
        env,
        config.booking.clone(),
        config.sweep.clone(),
    );

    let mut interval = tokio::time::interval(Duration::from_secs(config.sweep.interval_seconds));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = sweep.run().await {
                    error!(error = %e, "Control sweep failed");
                }
            }
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    info!("Terminbuchung service stopped");
    Ok(())
}
