mod cmd;

use clap::{Parser, Subcommand};
use clap_verbosity_flag::Verbosity;
use eyre::Result;
use human_panic::setup_panic;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
/// Quantitative DCE-MRI, T1 and DWI model fitting.
struct Args {
    /// -v raises the log level, -q / --quiet silences the console
    #[clap(flatten)]
    verbose: Verbosity,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fit a tracer-kinetic model to a dynamic volume series
    Dce(cmd::dce::DceCmd),

    /// Fit a tracer-kinetic model to per-voxel rows of delimited text
    DceLite(cmd::dce_lite::DceLiteCmd),

    /// Map T1 and M0 from variable flip-angle or inversion-recovery volumes
    T1(cmd::t1::T1Cmd),

    /// Map ADC or IVIM parameters from diffusion-weighted volumes
    Dwi(cmd::dwi::DwiCmd),

    /// Detect an arterial input function from the dynamic data
    Aif(cmd::aif::AifCmd),
}

fn main() -> Result<()> {
    setup_panic!();
    jane_eyre::install()?;

    let argv = cmd::config::expand_config_args(std::env::args().collect())?;
    let args = Args::parse_from(argv);

    env_logger::Builder::new()
        .filter_level(args.verbose.log_level_filter())
        .init();

    match args.command {
        Commands::Dce(cmd) => cmd.run()?,
        Commands::DceLite(cmd) => cmd.run()?,
        Commands::T1(cmd) => cmd.run()?,
        Commands::Dwi(cmd) => cmd.run()?,
        Commands::Aif(cmd) => cmd.run()?,
    }
    Ok(())
}
