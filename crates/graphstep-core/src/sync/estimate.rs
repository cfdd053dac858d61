//! Advisory transfer-time estimates.

use crate::config::EstimateConfig;
use crate::graph::GraphCounts;

/// Seconds to upload a file of `bytes`.
pub fn upload_seconds(bytes: u64, config: &EstimateConfig) -> f64 {
    seconds(bytes as f64, config.upload_bytes_per_sec)
}

/// Seconds to download a dataset of the given size.
pub fn download_seconds(counts: GraphCounts, config: &EstimateConfig) -> f64 {
    let bytes = counts.nodes as f64 * config.avg_node_bytes + counts.edges as f64 * config.avg_edge_bytes;
    seconds(bytes, config.download_bytes_per_sec)
}

/// Human-readable form of an estimate, e.g. `2m 05s` or `0.50s`.
pub fn format_duration(seconds: f64) -> String {
    if !seconds.is_finite() {
        return "unknown".to_string();
    }
    if seconds < 60.0 {
        return format!("{seconds:.2}s");
    }
    let total = seconds.round() as u64;
    let (hours, minutes, secs) = (total / 3600, total % 3600 / 60, total % 60);
    if hours > 0 {
        format!("{hours}h {minutes:02}m {secs:02}s")
    } else {
        format!("{minutes}m {secs:02}s")
    }
}

fn seconds(bytes: f64, throughput: f64) -> f64 {
    if throughput > 0.0 {
        bytes / throughput
    } else {
        f64::INFINITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload() {
        let config = EstimateConfig::default();
        assert_eq!(upload_seconds(2_000_000, &config), 2.0);
        assert_eq!(upload_seconds(0, &config), 0.0);
    }

    #[test]
    fn test_download() {
        let config = EstimateConfig {
            download_bytes_per_sec: 1000.0,
            avg_node_bytes: 100.0,
            avg_edge_bytes: 10.0,
            ..EstimateConfig::default()
        };
        let counts = GraphCounts { nodes: 5, edges: 20 };
        assert_eq!(download_seconds(counts, &config), 0.7);
    }

    #[test]
    fn test_zero_throughput() {
        let config = EstimateConfig {
            upload_bytes_per_sec: 0.0,
            ..EstimateConfig::default()
        };
        assert!(upload_seconds(1, &config).is_infinite());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0.5), "0.50s");
        assert_eq!(format_duration(125.2), "2m 05s");
        assert_eq!(format_duration(3725.0), "1h 02m 05s");
        assert_eq!(format_duration(f64::INFINITY), "unknown");
    }
}
