//! Application composition root.
//!
//! Owns the configuration, thread manager, module manager and the optional
//! remote server, wires the startup sequence and performs orderly shutdown
//! on Ctrl-C: modules top-down, then servers, then workers.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use clap::Parser;
use crossbeam_channel::bounded;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::manager::{ManagerEvent, ModuleManager};
use crate::module::ModuleKind;
use crate::registry::ModuleRegistry;
use crate::remote::server::RemoteModuleServer;
use crate::threads::ThreadManager;
use crate::{logging, paths};

/// Command line of the host binary.
#[derive(Debug, Parser)]
#[command(name = "labhost", version, about = "Modular measurement application host")]
pub struct Cli {
    /// Run without activating any gui modules.
    #[arg(short = 'g', long = "no-gui")]
    pub no_gui: bool,

    /// Lower the log level to debug.
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,

    /// Configuration file (defaults to the platform location).
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Directory for session log files.
    #[arg(short = 'l', long = "logdir")]
    pub logdir: Option<PathBuf>,
}

pub struct Application {
    config: Config,
    threads: Arc<ThreadManager>,
    manager: ModuleManager,
    server: Option<RemoteModuleServer>,
    no_gui: bool,
}

impl Application {
    /// Builds the whole runtime from the command line: configuration,
    /// logging, thread manager, the eagerly constructed module table and
    /// the remote server if configured. Errors here are fatal (exit code 1).
    pub fn bootstrap(cli: &Cli, registry: Arc<ModuleRegistry>) -> anyhow::Result<Self> {
        let config_path = cli
            .config
            .clone()
            .or_else(paths::default_config_path)
            .context(
                "no configuration file given (-c/--config) and none found at the default locations",
            )?;

        let log_dir = paths::log_dir(cli.logdir.as_deref())?;
        logging::init(cli.debug, &log_dir)?;
        info!(config = %config_path.display(), "loading configuration");

        let config = Config::load(&config_path)?;
        if !config.global.force_remote_calls_by_value {
            warn!(
                "force_remote_calls_by_value=false has no effect: the remote channel always \
                 serializes arguments and results"
            );
        }

        let state_dir = paths::app_state_dir()?;
        let data_dir = paths::data_dir(
            config.global.default_data_dir.as_deref(),
            config.global.daily_data_dirs,
        )?;

        let threads = Arc::new(ThreadManager::new());
        let manager = ModuleManager::from_config(
            &config,
            registry,
            threads.clone(),
            state_dir,
            data_dir,
        )?;

        let server = match &config.global.remote_modules_server {
            Some(server_config) => {
                let server = RemoteModuleServer::new(manager.clone(), server_config)?;
                server.start()?;
                Some(server)
            }
            None => None,
        };

        Ok(Self {
            config,
            threads,
            manager,
            server,
            no_gui: cli.no_gui,
        })
    }

    pub fn manager(&self) -> &ModuleManager {
        &self.manager
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Activates the startup modules, then parks until Ctrl-C and shuts
    /// down in order. Errors escaping this loop map to exit code 2.
    pub fn run(&self) -> anyhow::Result<()> {
        self.mirror_error_events();
        self.activate_startup_modules();

        let (stop_tx, stop_rx) = bounded::<()>(1);
        ctrlc::set_handler(move || {
            let _ = stop_tx.try_send(());
        })
        .context("cannot install signal handler")?;

        info!("startup complete, waiting for shutdown signal");
        let _ = stop_rx.recv();
        info!("shutdown signal received");
        self.shutdown();
        Ok(())
    }

    /// Activation failures of individual startup modules are reported but
    /// never take the host down.
    fn activate_startup_modules(&self) {
        for name in &self.config.global.startup_modules {
            if self.no_gui {
                if let Some((ModuleKind::Gui, _)) = self.config.module(name) {
                    info!(module = name.as_str(), "skipping gui startup module (--no-gui)");
                    continue;
                }
            }
            match self.manager.activate(name) {
                Ok(()) => info!(module = name.as_str(), "startup module active"),
                Err(err) => error!(module = name.as_str(), %err, "startup module failed"),
            }
        }
    }

    /// Error events degrade to structured console records when no dialog
    /// surface is attached.
    fn mirror_error_events(&self) {
        let events = self.manager.subscribe();
        thread::Builder::new()
            .name("event-mirror".to_string())
            .spawn(move || {
                for event in events {
                    if let ManagerEvent::ModuleError { module, message } = event {
                        eprintln!("[labhost:error] module '{module}': {message}");
                    }
                }
            })
            .map(drop)
            .unwrap_or_else(|err| warn!(%err, "event mirror thread failed to start"));
    }

    /// Orderly teardown: modules top-down, remote server, workers.
    pub fn shutdown(&self) {
        self.manager.deactivate_all();
        if let Some(server) = &self.server {
            server.stop();
        }
        self.threads.shutdown();
        info!("shutdown complete");
    }
}
