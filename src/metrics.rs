//! Conversion of probe samples into the records handed to the metrics
//! sink. Aggregation and export live outside this crate; the sink here
//! drains the channel so the receive loops always have a consumer.

use std::net::IpAddr;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::ping::Sample;

/// What the external sink receives for every probe.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    /// The target's stable name.
    pub name: String,
    pub dest: IpAddr,
    /// Round-trip milliseconds; negative means the probe was lost.
    pub elapsed_ms: f64,
}

impl From<&Sample> for MetricRecord {
    fn from(sample: &Sample) -> Self {
        Self {
            name: sample.target.metric_name().to_string(),
            dest: sample.dest,
            elapsed_ms: sample.elapsed_millis(),
        }
    }
}

/// Drain samples until cancellation or the channel closing.
pub async fn run_sink(mut samples: mpsc::Receiver<Sample>, cancel: CancellationToken) {
    loop {
        let sample = tokio::select! {
            _ = cancel.cancelled() => return,
            maybe = samples.recv() => match maybe {
                Some(sample) => sample,
                None => return,
            },
        };
        let record = MetricRecord::from(&sample);
        debug!(
            name = %record.name,
            dest = %record.dest,
            elapsed_ms = record.elapsed_ms,
            "latency sample"
        );
    }
}
