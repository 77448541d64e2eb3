use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{debug, info};
use parking_lot::Mutex;

use klippy_stable_z_home::configfile::Configfile;
use klippy_stable_z_home::extras::stable_z_home::{RuntimeHandles, StableZHome, CONFIG_SECTION};
use klippy_stable_z_home::gcode::GCode;
use klippy_stable_z_home::toolhead::Toolhead;

/// Run G-code against a simulated printer with a stable Z home extra
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file
    #[arg()]
    config_file: String,

    /// G-code line to run; may be repeated. Defaults to "G28 X Y" then "STABLE_Z_HOME"
    #[arg(short, long = "command")]
    commands: Vec<String>,

    /// write log to file instead of stderr
    #[arg(short, long)]
    logfile: Option<String>,

    /// enable debug messages
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(args: &Args) -> Result<()> {
    let mut builder = env_logger::Builder::from_default_env();
    if args.verbose {
        builder.filter(None, log::LevelFilter::Debug);
    } else {
        builder.filter(None, log::LevelFilter::Info);
    }
    if let Some(ref logfile) = args.logfile {
        let target = Box::new(
            std::fs::File::create(logfile).with_context(|| format!("Can't create logfile {}", logfile))?,
        );
        builder.target(env_logger::Target::Pipe(target));
    }
    builder.init();
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let config = Configfile::read(&args.config_file)
        .with_context(|| format!("Unable to load config {}", args.config_file))?;
    let filename = config.filename().unwrap_or(&args.config_file);
    if !config.has_section(CONFIG_SECTION) {
        bail!("No [{}] section in {}", CONFIG_SECTION, filename);
    }
    debug!("Loaded config {}", filename);

    let gcode = Arc::new(GCode::new());
    let toolhead = Arc::new(Toolhead::from_config(&config).context("Invalid kinematics config")?);
    Toolhead::register_commands(&toolhead, &gcode);

    let stable_z_home = Arc::new(Mutex::new(
        StableZHome::load_config(&config).with_context(|| format!("Invalid [{}] config", CONFIG_SECTION))?,
    ));
    StableZHome::register_commands(&stable_z_home, &gcode);

    // Host is up: bind runtime handles.
    stable_z_home
        .lock()
        .handle_connect(RuntimeHandles { gcode: Arc::clone(&gcode), kinematics: toolhead.clone() })
        .with_context(|| format!("Invalid [{}] config", CONFIG_SECTION))?;
    info!("Printer is ready");

    let commands = if args.commands.is_empty() {
        vec!["G28 X Y".to_string(), "STABLE_Z_HOME".to_string()]
    } else {
        args.commands.clone()
    };

    let mut failures = 0;
    for line in &commands {
        println!("> {}", line);
        let result = gcode.run_script(line);
        for response in gcode.take_responses() {
            println!("// {}", response);
        }
        if let Err(e) = result {
            failures += 1;
            println!("!! {}", e);
        }
    }

    let status = serde_json::json!({
        "toolhead": toolhead.get_status(0.0),
        "stable_z_home": stable_z_home.lock().get_status(0.0),
    });
    println!("{}", serde_json::to_string_pretty(&status)?);

    if failures > 0 {
        bail!("{} of {} commands failed", failures, commands.len());
    }
    Ok(())
}
