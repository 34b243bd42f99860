//! Works out which facility-chunk jobs still need to run.
use std::process::Command;

use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use crate::codec::{self, ChunkInfo};
use crate::config::Host;
use crate::env::Environment;
use crate::error::Result;
use crate::model::{ExposureModel, FacId, Geounit};
use crate::resources::{count_units, estimate_resources, FacilityResources, FirmIndex};
use crate::store::{ArtifactKey, Radius};

/// One schedulable unit of dispersion work.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Scheduler job name, built from the short `firm_id` token.
    pub name: String,
    pub key: ArtifactKey,
    pub firm_id: usize,
    pub cpu_per_stack: f64,
}

impl Job {
    pub fn facid(&self) -> FacId {
        self.key.facid
    }

    pub fn chunk(&self) -> Option<ChunkInfo> {
        self.key.chunk
    }
}

/// Names of jobs currently queued or running on the cluster.
pub trait JobQueue {
    fn queued_names(&self) -> Result<FxHashSet<String>>;
}

/// Slurm's `squeue` for one user.
#[derive(Debug, Clone)]
pub struct SlurmQueue {
    user: String,
}

impl SlurmQueue {
    pub fn new(user: &str) -> Self {
        Self {
            user: user.to_string(),
        }
    }
}

impl JobQueue for SlurmQueue {
    fn queued_names(&self) -> Result<FxHashSet<String>> {
        let output = Command::new("squeue")
            .args(["-h", "-u", &self.user, "-o", "%j"])
            .output()?;
        if !output.status.success() {
            return Err(std::io::Error::other(format!("squeue exited with {}", output.status)).into());
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .map(str::to_string)
            .collect())
    }
}

/// Every job implied by `resources`. Facilities needing one chunk are not chunked.
pub fn plan_jobs(
    geounit: Geounit,
    model: ExposureModel,
    resources: &[FacilityResources],
) -> Result<Vec<Job>> {
    let mut jobs = Vec::new();
    for res in resources {
        let chunks: Vec<Option<ChunkInfo>> = if res.num_chunks > 1 {
            ChunkInfo::all(res.num_chunks)?.into_iter().map(Some).collect()
        } else {
            vec![None]
        };
        for chunk in chunks {
            jobs.push(Job {
                name: codec::encode(geounit, model, res.firm_id as FacId, chunk)?,
                key: ArtifactKey::new(geounit, model, res.facid, chunk),
                firm_id: res.firm_id,
                cpu_per_stack: res.cpu_per_stack,
            });
        }
    }
    Ok(jobs)
}

/// Jobs whose artifact is not on disk. A facility whose combined artifact
/// exists needs none of its chunks.
pub fn check_storage(env: &Environment, jobs: Vec<Job>, radius: Radius) -> Result<Vec<Job>> {
    let groups = env.inputs.firm_groups()?;
    let mut needed = Vec::new();
    for job in jobs {
        let stored = job.key.grouped(&groups);
        let whole = ArtifactKey {
            chunk: None,
            ..stored
        };
        if env.store.exists(&env.store.path_for(&whole, radius)?) {
            continue;
        }
        if !env.store.exists(&env.store.path_for(&stored, radius)?) {
            needed.push(job);
        }
    }
    Ok(needed)
}

/// Drops jobs already in the queue. If the queue cannot be read, nothing is dropped.
pub fn filter_queued(jobs: Vec<Job>, queue: &dyn JobQueue) -> Vec<Job> {
    match queue.queued_names() {
        Ok(in_queue) => jobs
            .into_iter()
            .filter(|job| !in_queue.contains(&job.name))
            .collect(),
        Err(e) => {
            warn!("Could not read the job queue, assuming nothing is queued: {e}");
            jobs
        }
    }
}

pub fn firm_index(env: &Environment) -> Result<FirmIndex> {
    let emissions = env.inputs.emissions(&Default::default())?;
    Ok(FirmIndex::new(emissions.into_iter().map(|r| r.facid)))
}

/// Facility resources for a planning request.
pub fn plan_resources(
    env: &Environment,
    geounit: Geounit,
    model: ExposureModel,
    facility_list: Option<&[FacId]>,
    radius: Radius,
) -> Result<Vec<FacilityResources>> {
    let units = count_units(env, geounit, facility_list, radius)?;
    let stacks = env.inputs.stacks()?;
    estimate_resources(&env.config, &units, &stacks, &firm_index(env)?, facility_list)
}

/// The actionable jobs: planned, not on disk, and (on the cluster) not queued.
pub fn jobs_to_run(
    env: &Environment,
    queue: &dyn JobQueue,
    geounit: Geounit,
    model: ExposureModel,
    facility_list: Option<&[FacId]>,
    radius: Radius,
) -> Result<Vec<Job>> {
    let resources = plan_resources(env, geounit, model, facility_list, radius)?;
    let planned = plan_jobs(geounit, model, &resources)?;
    let total = planned.len();
    let not_on_disk = check_storage(env, planned, radius)?;
    let jobs = match env.config.host {
        Host::Cluster => filter_queued(not_on_disk, queue),
        Host::Workstation => not_on_disk,
    };
    debug!("{} of {total} planned jobs still need to run", jobs.len());
    Ok(jobs)
}

/// Job names padded to 8 characters, 7 to a line.
pub fn pretty_job_list(jobs: &[Job]) -> String {
    jobs.chunks(7)
        .map(|line| {
            line.iter()
                .map(|job| format!("{:<8}", job.name))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}
