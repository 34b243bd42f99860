//! # airq
//!
//! Facility air pollution exposure, one facility at a time.
//!
//! airq runs the AERMOD dispersion model (or a closed-form polar kernel) for
//! every emitting facility, caches each facility's raw normalized exposure on
//! disk, and sums them into emission-weighted exposure panels for a choice of
//! receptor geography: houses, census blocks, monitors, patient zip codes, or a
//! regular grid.
//!
//! ## Use
//!
//! ```txt
//! airq --config/-c /path/to/some/config.yml <command>
//! ```
//!
//! A template configuration can be written with the `new` command.
//!
//! ```txt
//! airq --config/-c /path/to/some/config.yml new
//! ```
//!
//! ### Workflow
//!
//! 1. `units house` counts receptors within range of every facility.
//! 2. `plan house aermod` lists the jobs that still need to run. Facilities
//!    whose estimated CPU time exceeds the job limit are split into chunks of
//!    stacks.
//! 3. `submit house aermod` writes a Slurm script for each job and submits them
//!    after confirmation. Each script calls `run` for one facility chunk.
//! 4. `combine house aermod` sums the chunks of every chunked facility.
//! 5. `aggregate house aermod nox` builds the emission-weighted panel.
//!    `--electric 1` (or `0`) restricts it to electric utilities (or
//!    everything else), and `--from-grids` cuts it out of the grid panel.
//!
//! Kernel models (`unif5`, `tria2`, `epan10`, `triw5`, ...) need no cluster and
//! are computed locally with `kernel house unif5`.
//!
//! ### Output
//!
//! Per-facility artifacts are parquet files named
//!
//! ```txt
//! hA20.parquet        house, aermod, facility 20
//! hU5f37c39.parquet   house, uniform kernel 5 km, facility 37, chunk 3 of 9
//! ```
//!
//! Aggregate panels are written next to them as `{geounit}s_{model}_{pollutant}.parquet`,
//! one column per year.
//!
//! Log verbosity is controlled with `RUST_LOG` (default `info`).
use std::path::PathBuf;

use airq::aermod::AermodBinary;
use airq::aggregate::{load_full_exposure, sum_all_firms, AggregateTarget};
use airq::batch::{confirm_stdin, job_master, Sbatch, SbatchOptions};
use airq::codec::ChunkInfo;
use airq::combiner::{combine_all, CombineOptions};
use airq::config::Config;
use airq::driver::{run_and_write, run_kernel_batch, DriverOptions, JobOutcome};
use airq::env::Environment;
use airq::model::{ExposureModel, FacId, Geounit, Pollutant};
use airq::panels::{load_electric_exposure, load_exposure_from_grids, ElectricSplit};
use airq::planner::{jobs_to_run, pretty_job_list, SlurmQueue};
use airq::resources::count_units;
use airq::store::Radius;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use color_eyre::eyre::{eyre, Result};
use tracing_subscriber::EnvFilter;

const BANNER: &str = "-------------------------- airq --------------------------";
const RULE: &str = "----------------------------------------------------------";

fn geounit_arg() -> Arg {
    Arg::new("geounit")
        .required(true)
        .help("Receptor geography: house, block, patzip, monitor, grid")
}

fn model_arg() -> Arg {
    Arg::new("model")
        .required(true)
        .help("Exposure model: aermod, or a kernel such as unif5, tria2, epan10, triw5")
}

fn facids_arg() -> Arg {
    Arg::new("facids")
        .long("facids")
        .num_args(1..)
        .value_parser(value_parser!(FacId))
        .help("Restrict to these facility ids")
}

fn flag(name: &'static str, help: &'static str) -> Arg {
    Arg::new(name).long(name).action(ArgAction::SetTrue).help(help)
}

fn alt_radius_arg() -> Arg {
    flag("alt-radius", "Use the alternate receptor radius")
}

fn cli() -> Command {
    Command::new("airq")
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .required(true)
                .help("Path to a configuration file (YAML)"),
        )
        .subcommand(Command::new("new").about("Create a new template config file"))
        .subcommand(
            Command::new("units")
                .about("Count receptors within range of each facility")
                .arg(geounit_arg())
                .arg(alt_radius_arg()),
        )
        .subcommand(
            Command::new("plan")
                .about("List the jobs that still need to run")
                .arg(geounit_arg())
                .arg(model_arg())
                .arg(facids_arg())
                .arg(alt_radius_arg()),
        )
        .subcommand(
            Command::new("submit")
                .about("Submit the outstanding jobs to Slurm")
                .arg(geounit_arg())
                .arg(model_arg())
                .arg(facids_arg())
                .arg(alt_radius_arg())
                .arg(flag("overwrite", "Recompute artifacts that already exist"))
                .arg(flag("yes", "Submit without asking for confirmation"))
                .arg(
                    Arg::new("timescale")
                        .long("timescale")
                        .default_value("1.0")
                        .value_parser(value_parser!(f64))
                        .help("Multiplier on requested wall time"),
                ),
        )
        .subcommand(
            Command::new("run")
                .about("Run the dispersion model for one facility (chunk)")
                .arg(geounit_arg())
                .arg(model_arg())
                .arg(
                    Arg::new("facid")
                        .required(true)
                        .value_parser(value_parser!(FacId)),
                )
                .arg(
                    Arg::new("chunk")
                        .long("chunk")
                        .help("Chunk of the facility's stacks, as id/n"),
                )
                .arg(alt_radius_arg())
                .arg(flag("overwrite", "Recompute if the artifact already exists"))
                .arg(flag("keep-scratch", "Keep the model's scratch directory"))
                .arg(flag("quiet", "Silence the model's console output")),
        )
        .subcommand(
            Command::new("kernel")
                .about("Compute a kernel model locally for many facilities")
                .arg(geounit_arg())
                .arg(model_arg())
                .arg(facids_arg())
                .arg(flag("overwrite", "Recompute artifacts that already exist")),
        )
        .subcommand(
            Command::new("combine")
                .about("Sum chunk artifacts into one artifact per facility")
                .arg(geounit_arg())
                .arg(model_arg())
                .arg(alt_radius_arg())
                .arg(flag("overwrite", "Recombine facilities already combined"))
                .arg(flag("clean", "Offer to delete the chunk files afterwards")),
        )
        .subcommand(
            Command::new("aggregate")
                .about("Build the emission-weighted exposure panel")
                .arg(geounit_arg())
                .arg(model_arg())
                .arg(
                    Arg::new("pollutant")
                        .default_value("nox")
                        .help("nox, co, rog, sox, tsp, or a toxic's name"),
                )
                .arg(facids_arg())
                .arg(flag("parallel", "Sum facilities on a pool of workers"))
                .arg(
                    Arg::new("electric")
                        .long("electric")
                        .value_parser(value_parser!(u8).range(0..=1))
                        .help("Only electric utilities (1) or everything else (0); --facids overrides the utility list"),
                )
                .arg(flag(
                    "from-grids",
                    "Cut the panel out of the grid panel instead of summing facilities",
                ))
                .arg(
                    Arg::new("output")
                        .long("output")
                        .short('o')
                        .help("Where to write a panel for a facility subset (parquet)"),
                ),
        )
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("Tracing subscriber already set; skipping re-initialization.");
    }
}

fn parse_required<T>(args: &ArgMatches, name: &str) -> Result<T>
where
    T: std::str::FromStr<Err = airq::error::AirqError>,
{
    let raw = args
        .get_one::<String>(name)
        .ok_or_else(|| eyre!("Missing argument {name}"))?;
    Ok(raw.parse()?)
}

fn facility_list(args: &ArgMatches) -> Option<Vec<FacId>> {
    args.get_many::<FacId>("facids")
        .map(|ids| ids.copied().collect())
}

fn radius(args: &ArgMatches) -> Radius {
    Radius::from_flag(args.get_flag("alt-radius"))
}

fn units(env: &Environment, args: &ArgMatches) -> Result<()> {
    let geounit: Geounit = parse_required(args, "geounit")?;
    let counts = count_units(env, geounit, None, radius(args))?;
    let in_range = counts.values().filter(|&&u| u > 0).count();
    println!(
        "{} facilities, {in_range} with {geounit} receptors in range, {} units total",
        counts.len(),
        counts.values().sum::<u64>()
    );
    Ok(())
}

fn plan(env: &Environment, args: &ArgMatches) -> Result<()> {
    let geounit: Geounit = parse_required(args, "geounit")?;
    let model: ExposureModel = parse_required(args, "model")?;
    let list = facility_list(args);
    let queue = SlurmQueue::new(&env.config.scheduler.user);
    let jobs = jobs_to_run(env, &queue, geounit, model, list.as_deref(), radius(args))?;
    println!("{}", pretty_job_list(&jobs));
    println!("{} jobs to run", jobs.len());
    Ok(())
}

fn submit(env: &Environment, config_path: &std::path::Path, args: &ArgMatches) -> Result<()> {
    let geounit: Geounit = parse_required(args, "geounit")?;
    let model: ExposureModel = parse_required(args, "model")?;
    let list = facility_list(args);
    let radius = radius(args);
    let queue = SlurmQueue::new(&env.config.scheduler.user);
    let jobs = jobs_to_run(env, &queue, geounit, model, list.as_deref(), radius)?;

    let opts = SbatchOptions {
        program: std::env::current_exe()?,
        config_path: config_path.canonicalize()?,
        timescale: args.get_one::<f64>("timescale").copied().unwrap_or(1.0),
        radius,
        overwrite: args.get_flag("overwrite"),
        yes: args.get_flag("yes"),
    };
    let sent = job_master(
        &env.config.scheduler,
        geounit,
        model,
        &jobs,
        &opts,
        &Sbatch,
        &mut confirm_stdin,
    )?;
    println!("Submitted {sent} jobs.");
    Ok(())
}

fn run(env: &Environment, args: &ArgMatches) -> Result<()> {
    let geounit: Geounit = parse_required(args, "geounit")?;
    let model: ExposureModel = parse_required(args, "model")?;
    let facid = *args
        .get_one::<FacId>("facid")
        .ok_or_else(|| eyre!("Missing argument facid"))?;
    let chunk = args
        .get_one::<String>("chunk")
        .map(|c| c.parse::<ChunkInfo>())
        .transpose()?;
    let opts = DriverOptions {
        overwrite: args.get_flag("overwrite"),
        radius: radius(args),
        keep_scratch: args.get_flag("keep-scratch"),
    };
    let exe = AermodBinary::from_config(&env.config, args.get_flag("quiet"));
    match run_and_write(env, &exe, geounit, model, facid, chunk, opts)? {
        JobOutcome::Done(path) => println!("Wrote {}", path.display()),
        JobOutcome::Skipped(path) => println!("{} already exists, skipped", path.display()),
    }
    Ok(())
}

fn kernel(env: &Environment, args: &ArgMatches) -> Result<()> {
    let geounit: Geounit = parse_required(args, "geounit")?;
    let model: ExposureModel = parse_required(args, "model")?;
    let facids = match facility_list(args) {
        Some(list) => list,
        None => env.inputs.stacks()?.facids(),
    };
    let opts = DriverOptions {
        overwrite: args.get_flag("overwrite"),
        ..Default::default()
    };
    let written = run_kernel_batch(env, geounit, model, &facids, opts)?;
    println!("Wrote {written} artifacts.");
    Ok(())
}

fn combine(env: &Environment, args: &ArgMatches) -> Result<()> {
    let geounit: Geounit = parse_required(args, "geounit")?;
    let model: ExposureModel = parse_required(args, "model")?;
    let opts = CombineOptions {
        overwrite: args.get_flag("overwrite"),
        clean: args.get_flag("clean"),
        radius: radius(args),
    };
    let report = combine_all(env, geounit, model, opts, &mut confirm_stdin)?;
    println!(
        "Combined {} facilities, {} already combined.",
        report.combined, report.skipped
    );
    Ok(())
}

fn aggregate(env: &Environment, args: &ArgMatches) -> Result<()> {
    let geounit: Geounit = parse_required(args, "geounit")?;
    let model: ExposureModel = parse_required(args, "model")?;
    let pollutant: Pollutant = parse_required(args, "pollutant")?;
    let target = AggregateTarget::new(model, pollutant);
    let parallel = args.get_flag("parallel");

    if let Some(&flag) = args.get_one::<u8>("electric") {
        let electrics = match facility_list(args) {
            Some(list) => list,
            None => env.inputs.electric_facids()?,
        };
        let split = ElectricSplit::from_flag(flag)?;
        let frame = load_electric_exposure(env, geounit, &target, split, &electrics, parallel)?;
        println!("{frame}");
        return Ok(());
    }

    let frame = match facility_list(args) {
        None if args.get_flag("from-grids") => load_exposure_from_grids(env, geounit, &target, parallel)?,
        None => load_full_exposure(env, geounit, &target, parallel)?,
        Some(list) => {
            let mut frame = sum_all_firms(env, geounit, &target, Some(&list), parallel)?.to_frame();
            if let Some(output) = args.get_one::<String>("output") {
                env.store.write(&PathBuf::from(output), &mut frame)?;
                println!("Wrote {output}");
            }
            frame
        }
    };
    println!("{frame}");
    Ok(())
}

/// Program entry point. Handles the CLI.
fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli().get_matches();

    println!("{BANNER}");
    let config_path = PathBuf::from(
        cli.get_one::<String>("config")
            .ok_or_else(|| eyre!("A configuration path is required"))?,
    );

    if let Some(("new", _)) = cli.subcommand() {
        println!(
            "Making a template configuration file at {}...",
            config_path.display()
        );
        Config::default().save(&config_path)?;
        println!("Done.");
        println!("{RULE}");
        return Ok(());
    }

    let config = Config::load(&config_path)?;
    println!(
        "Successfully loaded configuration from {}",
        config_path.display()
    );
    if !config.data_path.exists() {
        println!(
            "Data path {} does not exist! Quitting.",
            config.data_path.display()
        );
        println!("{RULE}");
        return Ok(());
    }
    let env = Environment::new(config);

    match cli.subcommand() {
        Some(("units", args)) => units(&env, args)?,
        Some(("plan", args)) => plan(&env, args)?,
        Some(("submit", args)) => submit(&env, &config_path, args)?,
        Some(("run", args)) => run(&env, args)?,
        Some(("kernel", args)) => kernel(&env, args)?,
        Some(("combine", args)) => combine(&env, args)?,
        Some(("aggregate", args)) => aggregate(&env, args)?,
        _ => println!("No command given. Try --help."),
    }

    println!("{RULE}");
    Ok(())
}
