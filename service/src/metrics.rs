//! Business metrics for appointment booking.
//!
//! # Exported Metrics
//!
//! ## Counters
//! - `terminbuchung_termine_gebucht_total{impffolge}` - Appointments booked
//! - `terminbuchung_termine_freigegeben_total{impffolge}` - Appointments released
//! - `terminbuchung_appointment_taken_total` - Bookings that lost a race or found no free appointment
//! - `terminbuchung_termine_ad_hoc_total{impffolge}` - Appointments created on demand
//! - `terminbuchung_kapazitaet_aenderungen_total{ergebnis}` - Capacity changes (ok, blocked)
//! - `terminbuchung_kontrollen_abgelaufen_total` - Stale controls reset by the sweep
//! - `terminbuchung_sweep_fehler_total` - Dossiers the sweep failed to reset
//! - `terminbuchung_benachrichtigungen_total{art,ergebnis}` - Notification deliveries

use metrics::describe_counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use thiserror::Error;

/// Appointments booked
pub const TERMINE_GEBUCHT: &str = "terminbuchung_termine_gebucht_total";
/// Appointments released
pub const TERMINE_FREIGEGEBEN: &str = "terminbuchung_termine_freigegeben_total";
/// Bookings that lost a race
pub const APPOINTMENT_TAKEN: &str = "terminbuchung_appointment_taken_total";
/// Appointments created on demand
pub const TERMINE_AD_HOC: &str = "terminbuchung_termine_ad_hoc_total";
/// Capacity changes
pub const KAPAZITAET_AENDERUNGEN: &str = "terminbuchung_kapazitaet_aenderungen_total";
/// Stale controls reset
pub const KONTROLLEN_ABGELAUFEN: &str = "terminbuchung_kontrollen_abgelaufen_total";
/// Sweep failures
pub const SWEEP_FEHLER: &str = "terminbuchung_sweep_fehler_total";
/// Notification deliveries
pub const BENACHRICHTIGUNGEN: &str = "terminbuchung_benachrichtigungen_total";

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Initialize and register all business metrics descriptions.
///
/// This should be called once at application startup, before any metrics are recorded.
pub fn register_business_metrics() {
    describe_counter!(TERMINE_GEBUCHT, "Total number of appointments booked by dose type");
    describe_counter!(
        TERMINE_FREIGEGEBEN,
        "Total number of booked appointments released by dose type"
    );
    describe_counter!(
        APPOINTMENT_TAKEN,
        "Total number of bookings rejected because the appointment was taken"
    );
    describe_counter!(
        TERMINE_AD_HOC,
        "Total number of appointments created on demand for walk-ins"
    );
    describe_counter!(
        KAPAZITAET_AENDERUNGEN,
        "Total number of slot capacity changes by result (ok, blocked)"
    );
    describe_counter!(
        KONTROLLEN_ABGELAUFEN,
        "Total number of stale controls reset by the sweep"
    );
    describe_counter!(SWEEP_FEHLER, "Total number of dossiers the sweep failed to reset");
    describe_counter!(
        BENACHRICHTIGUNGEN,
        "Total number of notification deliveries by kind and result"
    );
}

/// Install the Prometheus exporter with an HTTP listener on `addr`.
///
/// # Errors
///
/// Returns [`MetricsError::Install`] if a recorder is already installed or the
/// listener cannot be started.
pub fn install_exporter(addr: SocketAddr) -> Result<(), MetricsError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| MetricsError::Install(e.to_string()))?;
    register_business_metrics();
    tracing::info!(
        addr = %addr,
        "Metrics server started - available at http://{}/metrics",
        addr
    );
    Ok(())
}
