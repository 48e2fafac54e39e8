use crate::Result;
use prometheus::{
    register_counter_with_registry, register_gauge_with_registry,
    register_histogram_with_registry, Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

/// Metrics collector for the box office engine
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Business metrics
    pub events_published: Counter,
    pub reservations_created: Counter,
    pub reservations_sold_out: Counter,
    pub payments_succeeded: Counter,
    pub payments_declined: Counter,
    pub cancellations: Counter,
    pub late_cancellations: Counter,
    pub refunds_issued: Counter,
    pub refunds_pending: Counter,
    pub holds_expired: Counter,
    pub seats_held: Gauge,
    pub seats_confirmed: Gauge,

    // Gateway metrics
    pub gateway_errors: Counter,
    pub gateway_duration: Histogram,

    // Storage metrics
    pub storage_errors: Counter,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let events_published = register_counter_with_registry!(
            Opts::new("events_published_total", "Total number of events published"),
            registry
        )?;

        let reservations_created = register_counter_with_registry!(
            Opts::new("reservations_created_total", "Total number of reservations created"),
            registry
        )?;

        let reservations_sold_out = register_counter_with_registry!(
            Opts::new(
                "reservations_sold_out_total",
                "Reservations refused for lack of capacity"
            ),
            registry
        )?;

        let payments_succeeded = register_counter_with_registry!(
            Opts::new("payments_succeeded_total", "Total number of successful payments"),
            registry
        )?;

        let payments_declined = register_counter_with_registry!(
            Opts::new("payments_declined_total", "Total number of declined payments"),
            registry
        )?;

        let cancellations = register_counter_with_registry!(
            Opts::new("cancellations_total", "Total number of cancelled reservations"),
            registry
        )?;

        let late_cancellations = register_counter_with_registry!(
            Opts::new(
                "late_cancellations_total",
                "Cancellations refused inside the cutoff window"
            ),
            registry
        )?;

        let refunds_issued = register_counter_with_registry!(
            Opts::new("refunds_issued_total", "Total number of refunds issued"),
            registry
        )?;

        let refunds_pending = register_counter_with_registry!(
            Opts::new(
                "refunds_pending_total",
                "Refunds left pending after a gateway failure"
            ),
            registry
        )?;

        let holds_expired = register_counter_with_registry!(
            Opts::new("holds_expired_total", "Holds released after their lifetime"),
            registry
        )?;

        let seats_held = register_gauge_with_registry!(
            Opts::new("seats_held", "Seats currently held by pending reservations"),
            registry
        )?;

        let seats_confirmed = register_gauge_with_registry!(
            Opts::new("seats_confirmed", "Seats currently confirmed"),
            registry
        )?;

        let gateway_errors = register_counter_with_registry!(
            Opts::new("gateway_errors_total", "Gateway calls with an unknown outcome"),
            registry
        )?;

        let gateway_duration = register_histogram_with_registry!(
            HistogramOpts::new("gateway_duration_seconds", "Time spent in payment gateway calls")
                .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            registry
        )?;

        let storage_errors = register_counter_with_registry!(
            Opts::new("storage_errors_total", "Failed unit-of-work commits"),
            registry
        )?;

        Ok(Self {
            registry,
            events_published,
            reservations_created,
            reservations_sold_out,
            payments_succeeded,
            payments_declined,
            cancellations,
            late_cancellations,
            refunds_issued,
            refunds_pending,
            holds_expired,
            seats_held,
            seats_confirmed,
            gateway_errors,
            gateway_duration,
            storage_errors,
        })
    }

    /// Export metrics in Prometheus format
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    pub fn record_gateway_call(&self, duration: Duration, reached: bool) {
        self.gateway_duration.observe(duration.as_secs_f64());
        if !reached {
            self.gateway_errors.inc();
        }
    }

    pub fn record_hold(&self, quantity: u32) {
        self.reservations_created.inc();
        self.seats_held.add(quantity as f64);
    }

    pub fn record_confirmation(&self, quantity: u32) {
        self.payments_succeeded.inc();
        self.seats_held.sub(quantity as f64);
        self.seats_confirmed.add(quantity as f64);
    }

    /// Seats returned to the pool; `was_confirmed` tells which count they leave
    pub fn record_release(&self, quantity: u32, was_confirmed: bool) {
        if was_confirmed {
            self.seats_confirmed.sub(quantity as f64);
        } else {
            self.seats_held.sub(quantity as f64);
        }
    }

    pub fn set_seat_totals(&self, held: u64, confirmed: u64) {
        self.seats_held.set(held as f64);
        self.seats_confirmed.set(confirmed as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_business_metrics() {
        let metrics = Metrics::new().unwrap();
        metrics.record_hold(3);
        metrics.record_confirmation(3);
        metrics.record_gateway_call(Duration::from_millis(40), true);

        let exported = metrics.export().unwrap();
        assert!(exported.contains("reservations_created_total 1"));
        assert!(exported.contains("seats_confirmed 3"));
        assert!(exported.contains("seats_held 0"));
        assert!(exported.contains("gateway_duration_seconds_count 1"));
    }
}
