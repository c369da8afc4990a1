//! Replay result summary

use serde::Serialize;
use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use crate::clock::{ClockSnapshot, ns_to_secs};
use crate::trace::{TraceHeader, tracer_version_string};

/// Measured outcome of a replay
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplayResult {
    pub fps: f64,
    pub seconds: f64,
    pub start_frame: u64,
    pub end_frame: u64,
    /// Frames replayed across every loop
    pub frames: u64,
    pub loops: u64,
    pub frame_range: String,
    pub start_time: f64,
    pub end_time: f64,
    pub start_timestamp: i64,
    pub end_timestamp: i64,
    pub start_time_monotonic: f64,
    pub start_time_monotonic_raw: f64,
    pub start_time_boot: f64,
    pub start_time_process: f64,
    pub end_time_monotonic: f64,
    pub end_time_monotonic_raw: f64,
    pub end_time_boot: f64,
    pub end_time_process: f64,
    /// Seconds from replayer start to the start of the measured range
    pub init_time: f64,
    pub init_time_monotonic: f64,
    pub init_time_boot: f64,
    pub init_time_process: f64,
}

impl ReplayResult {
    /// Build the summary from the clock snapshots of a finished run.
    ///
    /// Returns `None` if the end time does not follow the start time.
    pub fn measure(
        launch: &ClockSnapshot,
        start: &ClockSnapshot,
        end: &ClockSnapshot,
        start_frame: u64,
        end_frame: u64,
        frames: u64,
        loops: u64,
    ) -> Option<Self> {
        if end.time_ns <= start.time_ns {
            return None;
        }
        let seconds = ns_to_secs(end.time_ns - start.time_ns);
        let since = |later: u64, earlier: u64| ns_to_secs(later.saturating_sub(earlier));
        Some(Self {
            fps: frames as f64 / seconds,
            seconds,
            start_frame,
            end_frame,
            frames,
            loops,
            frame_range: format!("{start_frame}-{end_frame}"),
            start_time: ns_to_secs(start.time_ns),
            end_time: ns_to_secs(end.time_ns),
            start_timestamp: start.timestamp,
            end_timestamp: end.timestamp,
            start_time_monotonic: ns_to_secs(start.monotonic_ns),
            start_time_monotonic_raw: ns_to_secs(start.monotonic_raw_ns),
            start_time_boot: ns_to_secs(start.boot_ns),
            start_time_process: ns_to_secs(start.process_ns),
            end_time_monotonic: ns_to_secs(end.monotonic_ns),
            end_time_monotonic_raw: ns_to_secs(end.monotonic_raw_ns),
            end_time_boot: ns_to_secs(end.boot_ns),
            end_time_process: ns_to_secs(end.process_ns),
            init_time: since(start.time_ns, launch.time_ns),
            init_time_monotonic: since(start.monotonic_ns, launch.monotonic_ns),
            init_time_boot: since(start.boot_ns, launch.boot_ns),
            init_time_process: since(start.process_ns, launch.process_ns),
        })
    }
}

/// What the trace says about the traced application
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceApplicationInfo {
    pub file_version: u16,
    pub tracer_version: String,
    /// `"64 bit"` or `"32 bit"`
    pub file_type: String,
    pub endianess: String,
    pub gpus: Vec<GpuSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuSummary {
    pub vendor_id: String,
    pub device_id: String,
    pub driver_version: String,
}

impl From<&TraceHeader> for TraceApplicationInfo {
    fn from(header: &TraceHeader) -> Self {
        Self {
            file_version: header.trace_file_version,
            tracer_version: tracer_version_string(header.tracer_version),
            file_type: format!("{} bit", header.ptr_size as u32 * 8),
            endianess: header.endianness.to_string(),
            gpus: header
                .gpu_info
                .iter()
                .map(|info| GpuSummary {
                    vendor_id: format!("{:#x}", info.vendor_id()),
                    device_id: format!("{:#x}", info.device_id()),
                    driver_version: format!("{:#x}", info.gpu_drv_vers),
                })
                .collect(),
        }
    }
}

/// Replayer build and the options it ran with
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayerInfo {
    pub version: String,
    pub replay_options: BTreeMap<String, String>,
}

/// Document written to the result file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultDocument {
    pub application: TraceApplicationInfo,
    pub replayer: ReplayerInfo,
    /// Absent when the run produced no measurement
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ReplayResult>,
}

impl ResultDocument {
    pub fn new(
        header: &TraceHeader,
        replay_options: BTreeMap<String, String>,
        result: Option<ReplayResult>,
    ) -> Self {
        Self {
            application: TraceApplicationInfo::from(header),
            replayer: ReplayerInfo {
                version: env!("CARGO_PKG_VERSION").to_string(),
                replay_options,
            },
            result,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn write(&self, path: &Path) -> io::Result<()> {
        let json = self.to_json().map_err(io::Error::other)?;
        std::fs::write(path, json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::GpuInfo;

    fn snapshot(secs: u64) -> ClockSnapshot {
        let ns = secs * 1_000_000_000;
        ClockSnapshot {
            time_ns: ns,
            monotonic_ns: ns,
            monotonic_raw_ns: ns,
            boot_ns: ns + 100_000_000_000,
            process_ns: ns / 2,
            timestamp: 1_700_000_000 + secs as i64,
        }
    }

    #[test]
    fn test_measure() {
        let result =
            ReplayResult::measure(&snapshot(1), &snapshot(3), &snapshot(5), 2, 12, 40, 4).unwrap();
        assert_eq!(result.seconds, 2.0);
        assert_eq!(result.fps, 20.0);
        assert_eq!(result.frame_range, "2-12");
        assert_eq!(result.init_time, 2.0);
        assert_eq!(result.start_timestamp, 1_700_000_003);
        assert_eq!(result.end_time_process, 2.5);
    }

    #[test]
    fn test_measure_rejects_non_increasing_time() {
        assert!(ReplayResult::measure(&snapshot(0), &snapshot(5), &snapshot(5), 0, 1, 1, 1).is_none());
    }

    #[test]
    fn test_application_info() {
        let header = TraceHeader {
            tracer_version: (1 << 22) | 3,
            ptr_size: 8,
            gpu_info: vec![GpuInfo {
                gpu_id: 0x1002_0000_73bf,
                gpu_drv_vers: 0x8000_0001,
            }],
            ..Default::default()
        };
        let info = TraceApplicationInfo::from(&header);
        assert_eq!(info.tracer_version, "1.0.3");
        assert_eq!(info.file_type, "64 bit");
        assert_eq!(info.gpus[0].vendor_id, "0x1002");
        assert_eq!(info.gpus[0].device_id, "0x73bf");
    }

    #[test]
    fn test_document_written_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("result.json");
        let options: BTreeMap<String, String> =
            [("l".to_string(), "2".to_string())].into_iter().collect();
        let result =
            ReplayResult::measure(&snapshot(0), &snapshot(1), &snapshot(2), 0, 10, 10, 1);
        ResultDocument::new(&TraceHeader::default(), options, result)
            .write(&path)
            .unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["replayer"]["replay_options"]["l"], "2");
        assert_eq!(json["result"]["fps"], 10.0);
        assert_eq!(json["result"]["frame_range"], "0-10");
    }

    #[test]
    fn test_document_without_result() {
        let json = ResultDocument::new(&TraceHeader::default(), BTreeMap::new(), None)
            .to_json()
            .unwrap();
        assert!(!json.contains("\"result\""));
    }
}
