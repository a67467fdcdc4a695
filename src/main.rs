use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Result};
use clap::Parser;
use tracing::{error, info};

use scramdl::base_system::interrupt::{self, CancelToken};
use scramdl::base_system::logging::{LogError, LogOptions, LogSystem};
use scramdl::download::DownloadManager;
use scramdl::plugin::manager::{plugin_label, PluginManager};
use scramdl::sites;

#[derive(Debug, Parser)]
#[command(name = "scramdl")]
#[command(about = "Downloader for HTML5 e-book readers that scramble their page images")]
#[command(version)]
struct Cli {
    /// URLs to download
    #[arg(value_name = "URL")]
    urls: Vec<String>,

    /// Options in a key=value format passed to plugins
    #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
    options: Vec<String>,

    /// The number of workers to use
    #[arg(short, long, default_value_t = 10)]
    workers: usize,

    /// Set to display debug messages
    #[arg(short, long)]
    verbose: bool,

    /// Use default values for options whenever possible. No effect if
    /// --no-prompt is on
    #[arg(short, long)]
    defaults: bool,

    /// Turn off prompts for options and error out if a required option is
    /// left unset
    #[arg(short = 'n', long = "no-prompt")]
    no_prompt: bool,

    /// The directory in which to save the downloaded files
    #[arg(short = 'D', long, default_value = "downloads/")]
    directory: PathBuf,

    /// Zip the title directories after the download finishes
    #[arg(short = 'z', long)]
    zip: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_system = match init_logging(cli.verbose) {
        Ok(system) => system,
        Err(err) => {
            eprintln!("failed to initialize logging: {err}");
            return ExitCode::FAILURE;
        }
    };

    let code = match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    };
    if let Some(system) = log_system {
        system.safe_exit();
    }
    code
}

fn run(cli: &Cli) -> Result<()> {
    if cli.urls.is_empty() {
        return Err(anyhow!("no URLs given; see --help"));
    }

    let user_options = parse_user_options(&cli.options)?;
    let cancel = interrupt::install().unwrap_or_else(|err| {
        error!("could not install the interrupt handler: {err}");
        CancelToken::never()
    });

    let pm = PluginManager::new(sites::registry());
    let handlers = pm.find_handlers(&cli.urls);
    for (url, found) in cli.urls.iter().zip(&handlers) {
        if found.is_empty() {
            return Err(anyhow!("found no handler for: {url}"));
        }
        pm.set_options(found, &user_options, cli.defaults, cli.no_prompt)?;
    }

    for (url, found) in cli.urls.iter().zip(&handlers) {
        if cancel.is_cancelled() {
            return Err(anyhow!("interrupted"));
        }
        let plugin = PluginManager::select_plugin(found)?;
        if cli.urls.len() > 1 {
            info!("processing URL: {url}");
        }
        info!("starting download using \"{}\"...", plugin_label(plugin.as_ref()));

        let manager = DownloadManager::new(plugin, cli.directory.clone());
        let paths = manager.download(url, cli.workers, cli.zip, &cancel)?;
        info!("done! got a total of {} downloads", paths.len());
    }

    Ok(())
}

fn parse_user_options(pairs: &[String]) -> Result<HashMap<String, String>> {
    let mut options = HashMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid option format, should be key=value: {pair}"))?;
        options.insert(key.to_string(), value.to_string());
    }
    Ok(options)
}

fn init_logging(verbose: bool) -> Result<Option<LogSystem>, LogError> {
    let options = LogOptions {
        debug: verbose,
        ..LogOptions::default()
    };
    match LogSystem::init(options) {
        Ok(system) => Ok(Some(system)),
        Err(LogError::AlreadyInitialized) => Ok(None),
        Err(err) => Err(err),
    }
}
