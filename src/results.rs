//! Run records and their JSON output.

use crate::{benchmark::BenchmarkParameters, cli::Role, metrics::RateReport, utils};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Everything written for one completed run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub metadata: RunMetadata,
    pub parameters: BenchmarkParameters,
    /// One report per role that ran; a loopback run carries both.
    pub reports: Vec<RoleReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub version: String,
    pub run_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub role: Role,
    pub transport: String,
    pub system_info: SystemInfo,
}

/// Throughput measured by one role
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleReport {
    pub role: Role,
    pub report: RateReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub benchmark_version: String,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            benchmark_version: crate::VERSION.to_string(),
        }
    }
}

impl RunRecord {
    pub fn new(role: Role, transport: &str, parameters: BenchmarkParameters) -> Self {
        Self {
            metadata: RunMetadata {
                version: crate::VERSION.to_string(),
                run_id: utils::generate_run_id(),
                timestamp: chrono::Utc::now(),
                role,
                transport: transport.to_string(),
                system_info: SystemInfo::default(),
            },
            parameters,
            reports: Vec::new(),
        }
    }

    pub fn add_report(&mut self, role: Role, report: RateReport) {
        self.reports.push(RoleReport { role, report });
    }
}

/// Writes run records to the configured output file, if any
pub struct ResultsManager {
    output_file: Option<PathBuf>,
}

impl ResultsManager {
    pub fn new(output_file: Option<&Path>) -> Self {
        Self {
            output_file: output_file.map(Path::to_path_buf),
        }
    }

    /// Print a human readable summary and write the JSON record.
    /// Returns the path written, if an output file is configured.
    pub fn finalize(&self, record: &RunRecord) -> Result<Option<PathBuf>> {
        for entry in &record.reports {
            info!(
                "{} summary: {} in {}, {}",
                entry.role,
                utils::format_message_rate(entry.report.messages_per_second),
                utils::format_elapsed(entry.report.elapsed),
                utils::format_rate(entry.report.bytes_per_second)
            );
        }

        let Some(path) = &self.output_file else {
            return Ok(None);
        };
        let json = serde_json::to_string_pretty(record)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write results to {:?}", path))?;
        info!("Results written to: {:?}", path);
        Ok(Some(path.clone()))
    }
}
