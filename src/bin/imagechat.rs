use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser};
use imagechat::Relay;
use imagechat::config::{RelaySettings, default_config_path};
use imagechat::telemetry::ServiceTelemetry;

#[derive(Parser, Debug)]
#[command(name = "imagechat", version, about = "Image chat relay for the Gemini API", long_about = None)]
struct Args {
    /// Override path to config.json
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override listen address (host:port)
    #[arg(long, value_name = "ADDR:PORT")]
    listen: Option<String>,

    /// Override listen port
    #[arg(long)]
    port: Option<u16>,

    /// Directory uploaded images are stored in
    #[arg(long, value_name = "DIR")]
    upload_dir: Option<PathBuf>,

    /// Serve static client files from this directory
    #[arg(long, value_name = "DIR")]
    static_dir: Option<PathBuf>,

    /// Gemini model name
    #[arg(long)]
    model: Option<String>,

    /// Print the effective settings as JSON and exit
    #[arg(long, action = ArgAction::SetTrue)]
    print_config: bool,

    /// Enable verbose logging
    #[arg(short, long, action = ArgAction::SetTrue)]
    verbose: bool,
}

fn resolve_config(override_path: Option<&PathBuf>) -> Result<PathBuf> {
    match override_path {
        Some(path) => Ok(path.clone()),
        None => default_config_path(),
    }
}

fn apply_overrides(settings: &mut RelaySettings, args: &Args) -> Result<()> {
    if let Some(listen) = &args.listen {
        settings.set_listen_addr(listen)?;
    }
    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(dir) = &args.upload_dir {
        settings.upload.dir = dir.clone();
    }
    if let Some(dir) = &args.static_dir {
        settings.static_dir = Some(dir.clone());
    }
    if let Some(model) = &args.model {
        settings.model.model = model.clone();
    }
    Ok(())
}

fn load_settings(args: &Args) -> Result<RelaySettings> {
    let config_path = resolve_config(args.config.as_ref())?;
    let mut settings = RelaySettings::load_or_default(&config_path)?;
    settings.apply_env()?;
    apply_overrides(&mut settings, args)?;
    settings.validate()?;
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = load_settings(&args)?;

    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&settings)?);
        return Ok(());
    }

    if let Err(err) = imagechat::telemetry::init_tracing("imagechat", args.verbose, &settings.telemetry)
    {
        eprintln!("warning: failed to initialise imagechat tracing: {err}");
    }

    let telemetry = ServiceTelemetry::new("imagechat", &settings.telemetry);
    telemetry.record_startup();

    let relay = Relay::from_settings(settings, Some(telemetry.clone()));
    let result = relay.run().await;

    match &result {
        Ok(_) => telemetry.record_shutdown(),
        Err(err) => telemetry.record_error(err),
    }

    result
}
