//! Command handlers

mod list;
mod relay;
mod settings;
mod start;
mod stop;

pub use list::{collapse_records, list, render_table};
pub use relay::{receive, transmit};
pub use settings::show_settings;
pub use start::{build_relay, start};
pub use stop::{select_records, stop};

use crate::args::{Commands, ConfigCommands, TunnelCommands};
use crate::config::{ConfigManager, Settings};
use crate::metadata::{MetadataProvider, RestMetadataProvider};
use crate::ports::{PortProbe, SystemPortProbe};
use crate::registry::{SystemRegistry, TunnelRegistry};
use crate::ssh::SshStateStore;
use std::path::PathBuf;
use std::sync::Arc;

/// Logging flags handed down to background tunnels
#[derive(Debug, Clone)]
pub struct Logging {
    pub level: String,
    pub file: Option<PathBuf>,
}

/// Everything a command needs from the outside world
pub struct Context {
    pub settings: Settings,
    pub registry: Arc<dyn TunnelRegistry>,
    pub probe: Arc<dyn PortProbe>,
    pub ssh_state: SshStateStore,
    metadata: Option<Arc<dyn MetadataProvider>>,
}

impl Context {
    /// Context backed by the OS and the platform API
    pub fn system(settings: Settings) -> anyhow::Result<Self> {
        Ok(Self {
            settings,
            registry: Arc::new(SystemRegistry::new()),
            probe: Arc::new(SystemPortProbe),
            ssh_state: SshStateStore::default_location()?,
            metadata: None,
        })
    }

    pub fn new(
        settings: Settings,
        registry: Arc<dyn TunnelRegistry>,
        probe: Arc<dyn PortProbe>,
        ssh_state: SshStateStore,
    ) -> Self {
        Self {
            settings,
            registry,
            probe,
            ssh_state,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Arc<dyn MetadataProvider>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// The metadata provider; the REST one needs API settings
    pub fn metadata(&self) -> anyhow::Result<Arc<dyn MetadataProvider>> {
        match &self.metadata {
            Some(metadata) => Ok(metadata.clone()),
            None => Ok(Arc::new(RestMetadataProvider::new(&self.settings)?)),
        }
    }
}

pub async fn dispatch(
    command: Commands,
    ctx: &Context,
    config: &ConfigManager,
    logging: &Logging,
) -> anyhow::Result<()> {
    match command {
        Commands::Tunnel { command } => match command {
            TunnelCommands::Start(args) => start(ctx, &args, logging).await,
            TunnelCommands::Stop(args) => stop(ctx, &args).await,
            TunnelCommands::List => list(ctx),
            TunnelCommands::Transmit(args) => transmit(ctx, &args).await,
            TunnelCommands::Receive(args) => receive(ctx, &args).await,
        },
        Commands::Config { command } => match command {
            ConfigCommands::Show => show_settings(&ctx.settings, config),
            ConfigCommands::SetApi { url } => {
                config.set_api(url)?;
                println!("API URL saved to {}", config.path().display());
                Ok(())
            }
            ConfigCommands::SetToken { token } => {
                config.set_token(token)?;
                println!("Access token saved to {}", config.path().display());
                Ok(())
            }
        },
    }
}
