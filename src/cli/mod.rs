use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::clipboard::{create_bridge, text_from_formats, ClipboardFormat};
use crate::config::{ClipboardBackend, Config, ConfigError};
use crate::endpoint::EndpointClient;
use crate::monitor::create_monitor;
use crate::node::{local_identity, ClipboardNode};
use crate::sync::{ClipboardSnapshot, NodeInfo};

#[derive(Parser)]
#[command(name = "clipmesh")]
#[command(about = "Multi-node clipboard synchronization")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Run a ClipMesh node in the foreground")]
    Start {
        /// Use an in-process clipboard instead of the OS clipboard
        #[arg(long)]
        memory: bool,
    },

    #[command(about = "List the nodes a node knows about")]
    Peers {
        /// Node to ask (host:port); defaults to the local node
        #[arg(short, long)]
        node: Option<String>,
    },

    #[command(about = "Register this node with another node")]
    Register {
        /// Node to register with (host:port)
        target: String,
    },

    #[command(about = "Print clipboard updates broadcast by a node")]
    Watch {
        #[arg(short, long)]
        node: Option<String>,
    },

    #[command(about = "Send text to a node as a clipboard snapshot")]
    Push {
        text: String,

        #[arg(short, long)]
        node: Option<String>,
    },

    #[command(about = "Configuration management")]
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    #[command(about = "Show current configuration")]
    Show,

    #[command(about = "Generate example configuration")]
    Init {
        #[arg(long)]
        force: bool,
    },

    #[command(about = "Validate configuration")]
    Validate,
}

pub struct CliHandler {
    config: Config,
    config_path: Option<PathBuf>,
}

impl CliHandler {
    pub fn new(config: Config, config_path: Option<PathBuf>) -> Self {
        Self {
            config,
            config_path,
        }
    }

    /// Build a handler from the result of loading the config file
    ///
    /// `config init` still runs when the existing file does not load, so a
    /// broken file can be regenerated. Every other command needs a valid
    /// config.
    pub fn from_loaded(
        loaded: std::result::Result<Config, ConfigError>,
        config_path: Option<PathBuf>,
        command: &Commands,
    ) -> Result<Self> {
        match loaded {
            Ok(config) => Ok(Self::new(config, config_path)),
            Err(e)
                if matches!(
                    command,
                    Commands::Config {
                        action: ConfigAction::Init { .. }
                    }
                ) =>
            {
                warn!("Ignoring unreadable configuration: {}", e);
                Ok(Self::new(Config::default(), config_path))
            }
            Err(e) => Err(e).context("Failed to load configuration"),
        }
    }

    pub async fn handle_command(self, command: Commands) -> Result<()> {
        match command {
            Commands::Start { memory } => self.start_node(memory).await,
            Commands::Peers { node } => self.show_peers(node).await,
            Commands::Register { target } => self.register(target).await,
            Commands::Watch { node } => self.watch(node).await,
            Commands::Push { text, node } => self.push(text, node).await,
            Commands::Config { action } => self.handle_config_action(action),
        }
    }

    fn timeout(&self) -> Duration {
        self.config.sync.request_timeout()
    }

    /// Address of the node a client command talks to
    fn target(&self, node: Option<String>) -> String {
        node.unwrap_or_else(|| {
            let port = self.config.listen_port().unwrap_or(crate::config::DEFAULT_PORT);
            format!("127.0.0.1:{}", port)
        })
    }

    async fn connect(&self, address: &str) -> Result<EndpointClient> {
        EndpointClient::connect(address, self.timeout())
            .await
            .with_context(|| format!("Could not reach ClipMesh node at {}", address))
    }

    async fn start_node(self, memory: bool) -> Result<()> {
        let mut config = self.config;
        if memory {
            config.monitor.backend = ClipboardBackend::Memory;
        }

        let bridge = create_bridge(&config.monitor)?;
        let monitor = create_monitor(bridge.clone(), &config.monitor);
        info!(
            "Starting node {} with {} clipboard",
            config.hostname,
            bridge.name()
        );

        let node = ClipboardNode::new(config, bridge, monitor);
        node.run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
            }
        })
        .await?;
        Ok(())
    }

    async fn show_peers(&self, node: Option<String>) -> Result<()> {
        let address = self.target(node);
        let mut client = self.connect(&address).await?;
        let nodes = client.get_active_nodes().await?;
        client.close().await;

        if nodes.is_empty() {
            println!("No registered nodes");
            return Ok(());
        }

        println!("Active nodes on {} ({}):", address, nodes.len());
        for node in nodes {
            println!("  {:<24} {}", node.hostname, node.address());
        }
        Ok(())
    }

    async fn register(&self, target: String) -> Result<()> {
        let identity = local_identity(&self.config);
        let mut client = self.connect(&target).await?;
        let reply = client.register_node(identity.clone()).await?;
        client.close().await;

        if !reply.success {
            anyhow::bail!("{} refused registration: {}", target, reply.message);
        }
        println!("Registered {} with {}", identity, target);
        print_nodes(&reply.active_nodes);
        Ok(())
    }

    async fn watch(&self, node: Option<String>) -> Result<()> {
        let address = self.target(node);
        let client = self.connect(&address).await?;
        let mut updates = client.stream_clipboard_updates().await?;
        println!("Watching clipboard updates on {} (Ctrl-C to stop)", address);

        loop {
            tokio::select! {
                update = updates.next() => match update {
                    Some(Ok(snapshot)) => print_snapshot(&snapshot),
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        println!("Stream closed by {}", address);
                        return Ok(());
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    updates.close().await;
                    return Ok(());
                }
            }
        }
    }

    async fn push(&self, text: String, node: Option<String>) -> Result<()> {
        let address = self.target(node);
        // A distinct source name so the target does not treat it as its own echo.
        let source = format!("{}/cli", self.config.hostname);
        let snapshot = ClipboardSnapshot::new(source, vec![ClipboardFormat::text(text)]);

        let mut client = self.connect(&address).await?;
        let ack = client.sync_clipboard(snapshot).await?;
        client.close().await;

        if ack.success {
            println!("{}", ack.message);
            Ok(())
        } else {
            anyhow::bail!("{} rejected the snapshot: {}", address, ack.message)
        }
    }

    fn handle_config_action(&self, action: ConfigAction) -> Result<()> {
        match action {
            ConfigAction::Show => {
                println!("Current Configuration:");
                println!("{}", toml::to_string_pretty(&self.config)?);
            }
            ConfigAction::Init { force } => {
                let path = self
                    .config_path
                    .clone()
                    .or_else(Config::default_path)
                    .context("Could not determine config directory")?;
                Config::write_example(&path, force)?;
                println!("Example configuration written to {}", path.display());
            }
            ConfigAction::Validate => {
                // Loading already validated it.
                println!("Configuration is valid");
            }
        }
        Ok(())
    }
}

fn print_nodes(nodes: &[NodeInfo]) {
    println!("Known nodes ({}):", nodes.len());
    for node in nodes {
        println!("  {:<24} {}", node.hostname, node.address());
    }
}

fn print_snapshot(snapshot: &ClipboardSnapshot) {
    let time = Utc
        .timestamp_opt(snapshot.timestamp, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| snapshot.timestamp.to_string());
    println!(
        "[{}] {} ({} formats, {} bytes)",
        time,
        snapshot.source_host,
        snapshot.formats.len(),
        snapshot.payload_size()
    );

    if let Some(text) = text_from_formats(&snapshot.formats) {
        let preview: String = text.chars().take(60).collect();
        if preview.len() < text.len() {
            println!("  {}...", preview);
        } else {
            println!("  {}", preview);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_push() {
        let cli = Cli::try_parse_from(["clipmesh", "push", "hello", "--node", "10.0.0.2:50051"]).unwrap();
        match cli.command {
            Commands::Push { text, node } => {
                assert_eq!(text, "hello");
                assert_eq!(node.as_deref(), Some("10.0.0.2:50051"));
            }
            _ => panic!("expected push"),
        }
    }

    #[test]
    fn test_parse_config_init() {
        let cli = Cli::try_parse_from(["clipmesh", "-v", "config", "init", "--force"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Commands::Config {
                action: ConfigAction::Init { force: true }
            }
        ));
    }

    #[test]
    fn test_default_target_uses_listen_port() {
        let mut config = Config::default();
        config.listen_addr = "0.0.0.0:6000".to_string();
        let handler = CliHandler::new(config, None);

        assert_eq!(handler.target(None), "127.0.0.1:6000");
        assert_eq!(handler.target(Some("h:1".into())), "h:1");
    }
}
