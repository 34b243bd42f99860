//! Input rendering, execution, and output parsing for the AERMOD binary.
//!
//! AERMOD is treated as a pure function over a scratch directory: `aermod.inp`
//! goes in, a whitespace-delimited monthly post file comes out.
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{AirqError, Result};
use crate::model::FacId;
use crate::table::{Receptor, SiteMeta, Stack};

/// `emit_share` is multiplied by this before it is written into the fixed-width
/// input and divided back out of the parsed concentrations.
pub const PRECISION_SCALE: f64 = 1000.0;

pub const INPUT_FILE: &str = "aermod.inp";

/// Everything written into one `aermod.inp`.
#[derive(Debug, Clone)]
pub struct AermodInput {
    pub facid: FacId,
    pub meta: SiteMeta,
    /// Stacks with `emit_share` already scaled by [`PRECISION_SCALE`].
    pub sources: Vec<Stack>,
    pub receptors: Vec<Receptor>,
    pub met_path: PathBuf,
    pub output_file: String,
}

impl AermodInput {
    pub fn new(
        config: &Config,
        facid: FacId,
        meta: &SiteMeta,
        stacks: &[Stack],
        receptors: Vec<Receptor>,
    ) -> Self {
        let sources = stacks
            .iter()
            .map(|s| Stack {
                emit_share: s.emit_share * PRECISION_SCALE,
                ..s.clone()
            })
            .collect();
        Self {
            facid,
            meta: meta.clone(),
            sources,
            receptors,
            met_path: config.aermod.met_path.clone(),
            output_file: config.aermod.output_file.clone(),
        }
    }

    /// Source-receptor pairs, the unit the CPU estimate is calibrated on.
    pub fn unit_count(&self) -> usize {
        self.sources.len() * self.receptors.len()
    }

    pub fn render(&self) -> String {
        let mut sources = String::new();
        for (idx, s) in self.sources.iter().enumerate() {
            let id = idx + 1;
            let _ = write!(
                sources,
                "\n   LOCATION STACK{id} POINT {} {}\n   SRCPARAM STACK{id} {} {} {} {} {}",
                s.utm_east, s.utm_north, s.emit_share, s.height, s.exit_temp, s.exit_velocity, s.diameter
            );
        }
        let mut receptors = String::new();
        for r in &self.receptors {
            let _ = write!(receptors, "\n   DISCCART {} {}", r.utm_east, r.utm_north);
        }
        let met = self.met_path.to_string_lossy();
        let code = &self.meta.metsite_code;
        let year = self.meta.metsite_year;

        format!(
            "CO STARTING\n\
             \x20  TITLEONE 'Processing firm {facid}'\n\
             \x20  MODELOPT CONC FLAT\n\
             \x20  AVERTIME MONTH\n\
             \x20  POLLUTID NOX\n\
             \x20  URBANOPT {pop}\n\
             \x20  RUNORNOT RUN\n\
             \x20  ERRORFIL aermod_errors.txt\n\
             CO FINISHED\n\
             SO STARTING\n\
             \x20  ELEVUNIT METERS\
             {sources}\n\
             \x20  URBANSRC ALL\n\
             \x20  SRCGROUP ALL\n\
             SO FINISHED\n\
             RE STARTING\n\
             \x20  ELEVUNIT METERS\
             {receptors}\n\
             RE FINISHED\n\
             ME STARTING\n\
             \x20  SURFFILE {met}{code}7.sfc\n\
             \x20  PROFFILE {met}{code}7.pfl\n\
             \x20  SURFDATA 99999 20{year:02}\n\
             \x20  UAIRDATA 99999 20{year:02}\n\
             \x20  PROFBASE {z} METERS\n\
             \x20  STARTEND {year:02} 01 01 {year:02} 12 31\n\
             ME FINISHED\n\
             OU STARTING\n\
             \x20  POSTFILE MONTH ALL PLOT {out}\n\
             \x20  NOHEADER ALL\n\
             OU FINISHED",
            facid = self.facid,
            pop = self.meta.pop1990,
            z = self.meta.metsite_z,
            out = self.output_file,
        )
    }
}

/// Something that turns a prepared scratch directory into a model output file.
pub trait ModelExecutable: Sync {
    fn execute(&self, input: &AermodInput, workdir: &Path) -> Result<()>;
}

/// The real binary, copied into the scratch directory and run there.
#[derive(Debug, Clone)]
pub struct AermodBinary {
    binary: PathBuf,
    timeout: Duration,
    quiet: bool,
}

impl AermodBinary {
    pub fn new(binary: &Path, timeout: Duration, quiet: bool) -> Self {
        Self {
            binary: binary.to_path_buf(),
            timeout,
            quiet,
        }
    }

    pub fn from_config(config: &Config, quiet: bool) -> Self {
        Self::new(&config.aermod.binary, config.get_aermod_timeout(), quiet)
    }
}

impl ModelExecutable for AermodBinary {
    fn execute(&self, _input: &AermodInput, workdir: &Path) -> Result<()> {
        let name = self
            .binary
            .file_name()
            .ok_or_else(|| AirqError::ModelFailed(format!("bad binary path {}", self.binary.display())))?;
        let local = workdir.join(name);
        fs::copy(&self.binary, &local)?;

        let stdout = if self.quiet {
            Stdio::null()
        } else {
            Stdio::inherit()
        };
        let mut child = Command::new(&local)
            .current_dir(workdir)
            .stdout(stdout)
            .spawn()
            .map_err(|e| AirqError::ModelFailed(format!("could not start {}: {e}", local.display())))?;

        let start = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                if !status.success() {
                    return Err(AirqError::ModelFailed(format!("aermod exited with {status}")));
                }
                return Ok(());
            }
            if start.elapsed() > self.timeout {
                child.kill()?;
                child.wait()?;
                return Err(AirqError::ModelTimeout(self.timeout));
            }
            thread::sleep(Duration::from_millis(250));
        }
    }
}

/// The fields of one post-file line used downstream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputRecord {
    pub utm_east: f64,
    pub utm_north: f64,
    pub concentration: f64,
    pub month: u8,
}

/// Month from the post file's encoded date (`YYMMDDHH`, leading zero optional).
pub fn month_from_rawdate(raw: &str) -> Option<u8> {
    if raw.len() < 6 || !raw.is_ascii() {
        return None;
    }
    let month: u8 = raw[raw.len() - 6..raw.len() - 4].parse().ok()?;
    (1..=12).contains(&month).then_some(month)
}

/// `east north conc _ _ _ period group date`
pub fn parse_line(line: &str) -> Option<OutputRecord> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 9 {
        return None;
    }
    Some(OutputRecord {
        utm_east: fields[0].parse().ok()?,
        utm_north: fields[1].parse().ok()?,
        concentration: fields[2].parse().ok()?,
        month: month_from_rawdate(fields[fields.len() - 1])?,
    })
}

pub fn parse_output(path: &Path) -> Result<Vec<OutputRecord>> {
    if !path.is_file() || fs::metadata(path)?.len() == 0 {
        return Err(AirqError::ModelOutputEmpty(path.to_path_buf()));
    }
    let text = fs::read_to_string(path)?;
    let mut records = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('*') {
            continue;
        }
        let record = parse_line(trimmed).ok_or_else(|| {
            AirqError::ModelFailed(format!(
                "malformed output line {} in {}",
                lineno + 1,
                path.display()
            ))
        })?;
        records.push(record);
    }
    if records.is_empty() {
        return Err(AirqError::ModelOutputEmpty(path.to_path_buf()));
    }
    Ok(records)
}

/// Runs the model in a fresh scratch directory under `scratch_root` and returns
/// concentrations with the precision scale divided back out.
pub fn run_model(
    exe: &dyn ModelExecutable,
    input: &AermodInput,
    scratch_root: &Path,
    keep_scratch: bool,
) -> Result<Vec<OutputRecord>> {
    fs::create_dir_all(scratch_root)?;
    let scratch = tempfile::Builder::new()
        .prefix("aermod_")
        .tempdir_in(scratch_root)?;
    fs::write(scratch.path().join(INPUT_FILE), input.render())?;

    let start = Instant::now();
    exe.execute(input, scratch.path())?;
    let elapsed = start.elapsed().as_secs_f64();
    let units = input.unit_count();
    if units > 0 {
        info!(
            "{units} units, {:.4} sec per unit",
            elapsed / units as f64
        );
    }

    let mut records = parse_output(&scratch.path().join(&input.output_file))?;
    for r in &mut records {
        r.concentration /= PRECISION_SCALE;
    }

    if keep_scratch {
        let kept = scratch.into_path();
        info!("Instance at {}", kept.display());
    } else if let Err(e) = scratch.close() {
        warn!("Err deleting tmp folder: {e}");
    }
    debug!("Parsed {} output records for facility {}", records.len(), input.facid);
    Ok(records)
}
