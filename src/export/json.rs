use std::collections::BTreeMap;
use std::io::Write;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::monitor::Metrics;

/// A timestamped snapshot of per-target metrics, ready for serialization.
#[derive(Debug, Serialize)]
pub struct MetricsReport {
    pub generated_at: DateTime<Utc>,
    pub targets: BTreeMap<String, Metrics>,
}

impl MetricsReport {
    pub fn new(targets: impl IntoIterator<Item = (String, Metrics)>) -> MetricsReport {
        MetricsReport {
            generated_at: Utc::now(),
            targets: targets.into_iter().collect(),
        }
    }
}

/// Export a report to JSON
pub fn export_json<W: Write>(report: &MetricsReport, writer: W) -> Result<()> {
    serde_json::to_writer_pretty(writer, report)?;
    Ok(())
}

/// Export a report to a JSON string
pub fn export_json_string(report: &MetricsReport) -> Result<String> {
    Ok(serde_json::to_string_pretty(report)?)
}

/// Export a report to a file with an auto-generated name
pub fn export_json_file(report: &MetricsReport) -> Result<String> {
    let timestamp = report.generated_at.format("%Y%m%d-%H%M%S");
    let filename = format!("echowatch-{timestamp}.json");

    let file = std::fs::File::create(&filename)?;
    export_json(report, file)?;

    Ok(filename)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn report_serializes_per_target() {
        let metrics = Metrics {
            packets_sent: 3,
            packets_lost: 1,
            best: Duration::from_millis(1),
            worst: Duration::from_millis(9),
            median: Duration::from_millis(4),
            mean: Duration::from_millis(5),
            std_dev: Duration::from_millis(2),
        };
        let report = MetricsReport::new([("example".to_string(), metrics)]);

        let json = export_json_string(&report).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["targets"]["example"]["packets_sent"], 3);
        assert_eq!(value["targets"]["example"]["worst"], 9000);
    }
}
