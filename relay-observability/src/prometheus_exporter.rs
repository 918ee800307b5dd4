use crate::metrics::Aggregator;

/// Prometheus exposition endpoint handler.
///
/// Returns metrics in Prometheus text format for scraping.
pub fn render_metrics(aggregator: &Aggregator) -> String {
    aggregator.gather_text()
}
