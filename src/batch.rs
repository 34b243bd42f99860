//! Slurm batch submission of planned dispersion jobs.
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{info, warn};

use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::model::{ExposureModel, Geounit};
use crate::planner::Job;
use crate::progress_bar;
use crate::store::Radius;

/// What goes into every script of a submission.
#[derive(Debug, Clone)]
pub struct SbatchOptions {
    /// Executable the job runs, usually this binary.
    pub program: PathBuf,
    pub config_path: PathBuf,
    /// Multiplier on the requested wall time.
    pub timescale: f64,
    pub radius: Radius,
    pub overwrite: bool,
    /// Skip the interactive confirmation.
    pub yes: bool,
}

/// Wall time in minutes: half again the estimated CPU per stack, at least ten,
/// doubled for coarse geounits.
pub fn request_time(cpu_per_stack: f64, geounit: Geounit, timescale: f64) -> u64 {
    let mut minutes = (cpu_per_stack.ceil() * 1.5).max(10.0) * timescale;
    if geounit.is_coarse() {
        minutes *= 2.0;
    }
    minutes.ceil() as u64
}

/// Memory in MB.
pub fn request_ram(geounit: Geounit) -> u32 {
    match geounit {
        Geounit::House => 1200,
        Geounit::Grid => 3000,
        _ => 1000,
    }
}

pub fn mail_param(mail: &[String]) -> Option<String> {
    if mail.is_empty() {
        return None;
    }
    let types: Vec<String> = mail.iter().map(|m| m.to_uppercase()).collect();
    Some(format!("#SBATCH --mail-type={}", types.join(",")))
}

pub fn sbatch_script(
    scheduler: &SchedulerConfig,
    geounit: Geounit,
    model: ExposureModel,
    job: &Job,
    opts: &SbatchOptions,
) -> String {
    let out = scheduler.job_output.join(&job.name);
    let mut lines = vec![
        "#!/bin/bash".to_string(),
        format!("#SBATCH -J {}", job.name),
        format!("#SBATCH -o {}.out", out.display()),
        format!("#SBATCH -e {}.err", out.display()),
        format!("#SBATCH -p {}", scheduler.partition),
        "#SBATCH -n 1".to_string(),
        format!(
            "#SBATCH -t {}",
            request_time(job.cpu_per_stack, geounit, opts.timescale)
        ),
        format!("#SBATCH --mem={}", request_ram(geounit)),
    ];
    lines.extend(mail_param(&scheduler.mail));

    let mut command = format!(
        "{} --config {} run {geounit} {model} {}",
        opts.program.display(),
        opts.config_path.display(),
        job.facid()
    );
    if let Some(chunk) = job.chunk() {
        command.push_str(&format!(" --chunk {chunk}"));
    }
    if opts.radius.is_alternate() {
        command.push_str(" --alt-radius");
    }
    if opts.overwrite {
        command.push_str(" --overwrite");
    }
    lines.push(String::new());
    lines.push(command);
    lines.join("\n") + "\n"
}

/// Hands a script to the scheduler.
pub trait Submitter {
    fn submit(&self, script: &str) -> Result<()>;
}

/// `sbatch`, reading the script from stdin.
pub struct Sbatch;

impl Submitter for Sbatch {
    fn submit(&self, script: &str) -> Result<()> {
        let mut child = Command::new("sbatch")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes())?;
        }
        let status = child.wait()?;
        if !status.success() {
            return Err(io::Error::other(format!("sbatch exited with {status}")).into());
        }
        Ok(())
    }
}

/// Asks a yes/no question on the terminal. Anything but `y`/`yes` is a no.
pub fn confirm_stdin(prompt: &str) -> bool {
    print!("{prompt} [y/N] ");
    if io::stdout().flush().is_err() {
        return false;
    }
    let mut answer = String::new();
    if io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

/// Writes a script for every job, shows the first, and submits them all once
/// confirmed. Returns the number submitted.
pub fn job_master(
    scheduler: &SchedulerConfig,
    geounit: Geounit,
    model: ExposureModel,
    jobs: &[Job],
    opts: &SbatchOptions,
    submitter: &dyn Submitter,
    confirm: &mut dyn FnMut(&str) -> bool,
) -> Result<usize> {
    if jobs.is_empty() {
        println!("No jobs to run!");
        return Ok(0);
    }
    let scripts: Vec<String> = jobs
        .iter()
        .map(|job| sbatch_script(scheduler, geounit, model, job, opts))
        .collect();

    println!("{}", scripts[0]);
    if !opts.yes && !confirm(&format!("Submit {} jobs?", scripts.len())) {
        println!("Nothing submitted.");
        return Ok(0);
    }
    save_script(&scheduler.script_copy, &scripts[0]);

    let progress = progress_bar(scripts.len(), "Submitting");
    for script in &scripts {
        submitter.submit(script)?;
        progress.inc(1);
    }
    progress.finish();
    info!("Submitted {} {geounit} {model} jobs", scripts.len());
    Ok(scripts.len())
}

fn save_script(path: &Path, script: &str) {
    if let Err(e) = fs::write(path, script) {
        warn!("Could not save a copy of the script to {}: {e}", path.display());
    }
}
