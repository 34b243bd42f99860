//! YAML configuration: storage roots, radii, CPU budget, and external tool paths.
//!
//! A template can be generated with `airq --config path.yml new`.
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::FacId;

/// Which machine the process is running on. Chunked artifacts are produced on
/// the cluster's scratch area and mirrored locally for combining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Host {
    Cluster,
    Workstation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub primary: PathBuf,
    pub cluster_chunks: PathBuf,
    pub local_chunks: PathBuf,
    /// Appended to a root's directory name for the alternate-radius mirror.
    pub alt_radius_suffix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AermodConfig {
    pub binary: PathBuf,
    pub met_path: PathBuf,
    pub scratch_path: PathBuf,
    pub output_file: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub user: String,
    pub partition: String,
    pub job_output: PathBuf,
    pub mail: Vec<String>,
    pub script_copy: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub data_path: PathBuf,
    pub storage: StorageConfig,
    pub host: Host,
    pub radius_km: f64,
    pub alt_radius_km: f64,
    pub alt_radius_facilities: Vec<FacId>,
    pub block_radius_pad_km: f64,
    pub cpu_seconds_per_unit: f64,
    pub job_time_limit_minutes: f64,
    pub first_year: i32,
    pub last_year: i32,
    pub kernel_calibration: f64,
    pub aermod: AermodConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("/path/to/some/data/"),
            storage: StorageConfig {
                primary: PathBuf::from("/path/to/some/data/airq"),
                cluster_chunks: PathBuf::from("/path/to/some/scratch/airq"),
                local_chunks: PathBuf::from("/path/to/some/data/airq/from_cluster"),
                alt_radius_suffix: String::from("30"),
            },
            host: Host::Workstation,
            radius_km: 20.0,
            alt_radius_km: 30.0,
            alt_radius_facilities: vec![800089, 800144],
            block_radius_pad_km: 5.0,
            cpu_seconds_per_unit: 0.065,
            job_time_limit_minutes: 210.0,
            first_year: 1994,
            last_year: 2006,
            kernel_calibration: 1e7,
            aermod: AermodConfig {
                binary: PathBuf::from("/path/to/some/aermod/aermod"),
                met_path: PathBuf::from("/path/to/some/aermod/met/"),
                scratch_path: PathBuf::from("/scratch"),
                output_file: String::from("this_aermod_out.txt"),
                timeout_secs: 4 * 60 * 60,
            },
            scheduler: SchedulerConfig {
                user: String::from("user"),
                partition: String::from("serial_requeue"),
                job_output: PathBuf::from("/path/to/some/jobout/"),
                mail: vec![String::from("fail")],
                script_copy: PathBuf::from("temp.sbatch"),
            },
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        serde_yaml::to_writer(file, self)?;
        Ok(())
    }

    /// Years covered by the emissions panel, inclusive.
    pub fn get_years(&self) -> Vec<i32> {
        (self.first_year..=self.last_year).collect()
    }

    /// Chunk storage for the host this process runs on.
    pub fn get_chunk_root(&self) -> &Path {
        match self.host {
            Host::Cluster => &self.storage.cluster_chunks,
            Host::Workstation => &self.storage.local_chunks,
        }
    }

    pub fn get_aermod_timeout(&self) -> Duration {
        Duration::from_secs(self.aermod.timeout_secs)
    }

    pub fn uses_alt_radius(&self, facid: FacId) -> bool {
        self.alt_radius_facilities.contains(&facid)
    }
}
