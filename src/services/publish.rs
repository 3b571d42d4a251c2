use log::{debug, info};
use std::fs;
use std::path::Path;

use crate::aggregate::Metric;
use crate::services::sync::Snapshot;

/// Log every reading of the snapshot, one line each.
pub fn log_readings(snapshot: &Snapshot) {
    info!("Gateway {}: status {:?}", snapshot.gateway_id, snapshot.status);
    for reading in Metric::ALL.iter().filter_map(|m| snapshot.readings.get(m)) {
        let value = reading
            .value
            .map(|v| format!("{:.3}", v))
            .unwrap_or_else(|| "unknown".to_string());
        info!("  {} [{}] = {}", reading.metric, reading.bucket_label, value);
    }
}

/// Write the snapshot as JSON, replacing `path` atomically.
pub fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<(), String> {
    let json = serde_json::to_string_pretty(snapshot).map_err(|e| format!("serialize readings failed: {}", e))?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, json).map_err(|e| format!("failed to write {}: {}", tmp.display(), e))?;
    fs::rename(&tmp, path).map_err(|e| format!("failed to replace {}: {}", path.display(), e))?;
    debug!("Readings written to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::aggregate;
    use crate::models::energy::{Quantity, Recording, Resolution};
    use crate::models::pointt::GatewayId;
    use crate::services::sync::CycleStatus;
    use chrono::NaiveDate;

    #[test]
    fn snapshot_file_keeps_unknown_as_null() {
        let hour = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap().and_hms_opt(13, 0, 0).unwrap();
        let recs = vec![Recording {
            timestamp: hour,
            quantity: Quantity::CompressorElectricity,
            value_wh: 1250.0,
            resolution: Resolution::Hourly,
        }];
        let now = hour + chrono::TimeDelta::minutes(75);
        let snapshot = Snapshot {
            gateway_id: GatewayId("101".into()),
            status: CycleStatus::Published,
            readings: aggregate(&recs, now),
            last_published_at: Some(now),
            last_error: None,
        };

        let dir = std::env::temp_dir().join(format!("publish-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("readings.json");
        write_snapshot(&path, &snapshot).unwrap();

        let written: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["gateway_id"], "101");
        assert_eq!(written["status"], "published");
        assert_eq!(written["readings"]["compressor_last_hour"]["value"], 1.25);
        assert_eq!(written["readings"]["compressor_last_hour"]["unit"], "kWh");
        assert_eq!(written["readings"]["compressor_last_hour"]["bucket_label"], "2024-03-09 13:00");
        assert!(written["readings"]["cop_last_hour"]["value"].is_null());
        assert_eq!(written["readings"]["cop_month"]["unit"], "dimensionless");
        assert!(!path.with_extension("tmp").exists());

        fs::remove_dir_all(&dir).unwrap();
    }
}
