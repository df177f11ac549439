use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tempfile::TempDir;

use clipmesh::{
    cli::{Cli, CliHandler, Commands, ConfigAction},
    clipboard::{memory::MemoryClipboard, text_from_formats},
    config::Config,
    endpoint::{EndpointServer, SyncService, WebSocketPeerClient},
    sync::SyncManager,
    MAX_PAYLOAD_SIZE,
};

/// Serve a memory-backed node on loopback and return its address
async fn serve(hostname: &str) -> Result<(String, Arc<SyncManager>, Arc<MemoryClipboard>)> {
    let clipboard = Arc::new(MemoryClipboard::new());
    let manager = Arc::new(SyncManager::new(
        hostname,
        clipboard.clone(),
        Arc::new(WebSocketPeerClient::new(Duration::from_secs(2))),
    ));
    let service = Arc::new(SyncService::new(Arc::clone(&manager), MAX_PAYLOAD_SIZE));
    let server = EndpointServer::bind("127.0.0.1:0", service, 8).await?;
    let address = server.local_addr()?.to_string();
    tokio::spawn(server.run());
    Ok((address, manager, clipboard))
}

fn handler(hostname: &str) -> CliHandler {
    let mut config = Config::default();
    config.hostname = hostname.to_string();
    config.advertise_ip = Some("127.0.0.1".to_string());
    config.sync.request_timeout_secs = 2;
    CliHandler::new(config, None)
}

#[test]
fn test_cli_parsing() -> Result<()> {
    let cli = Cli::try_parse_from(["clipmesh", "start", "--memory"])?;
    assert!(matches!(cli.command, Commands::Start { memory: true }));

    let cli = Cli::try_parse_from(["clipmesh", "peers"])?;
    assert!(matches!(cli.command, Commands::Peers { node: None }));

    let cli = Cli::try_parse_from(["clipmesh", "register", "10.0.0.2:50051"])?;
    assert!(matches!(cli.command, Commands::Register { ref target } if target == "10.0.0.2:50051"));

    let cli = Cli::try_parse_from(["clipmesh", "--config", "/tmp/c.toml", "config", "validate"])?;
    assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("/tmp/c.toml")));
    assert!(matches!(
        cli.command,
        Commands::Config {
            action: ConfigAction::Validate
        }
    ));

    assert!(Cli::try_parse_from(["clipmesh", "push"]).is_err());
    Ok(())
}

#[tokio::test]
async fn test_config_init_writes_loadable_file() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config_path = temp_dir.path().join("clipmesh").join("config.toml");

    let handler = CliHandler::new(Config::default(), Some(config_path.clone()));
    handler
        .handle_command(Commands::Config {
            action: ConfigAction::Init { force: false },
        })
        .await?;

    let loaded = Config::load_from_path(&config_path)?;
    assert!(loaded.validate_config().is_ok());

    // A second init without --force refuses to overwrite.
    let handler = CliHandler::new(loaded, Some(config_path));
    let result = handler
        .handle_command(Commands::Config {
            action: ConfigAction::Init { force: false },
        })
        .await;
    assert!(result.is_err());
    Ok(())
}

#[tokio::test]
async fn test_config_init_force_repairs_broken_file() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config_path = temp_dir.path().join("config.toml");
    std::fs::write(&config_path, "listen_addr = [not toml")?;

    let peers = Commands::Peers { node: None };
    let loaded = Config::load_config(Some(config_path.clone()));
    assert!(CliHandler::from_loaded(loaded, Some(config_path.clone()), &peers).is_err());

    let init = Commands::Config {
        action: ConfigAction::Init { force: true },
    };
    let loaded = Config::load_config(Some(config_path.clone()));
    CliHandler::from_loaded(loaded, Some(config_path.clone()), &init)?
        .handle_command(init)
        .await?;

    let repaired = Config::load_config(Some(config_path))?;
    assert!(repaired.validate_config().is_ok());
    Ok(())
}

#[tokio::test]
async fn test_push_sets_remote_clipboard() -> Result<()> {
    let (address, _manager, clipboard) = serve("desk").await?;

    handler("desk")
        .handle_command(Commands::Push {
            text: "pushed from cli".to_string(),
            node: Some(address),
        })
        .await?;

    assert_eq!(
        text_from_formats(&clipboard.formats()).as_deref(),
        Some("pushed from cli")
    );
    Ok(())
}

#[tokio::test]
async fn test_register_and_peers() -> Result<()> {
    let (address, manager, _clipboard) = serve("desk").await?;

    handler("laptop")
        .handle_command(Commands::Register {
            target: address.clone(),
        })
        .await?;
    let hosts: Vec<String> = manager
        .active_nodes()
        .into_iter()
        .map(|node| node.hostname)
        .collect();
    assert_eq!(hosts, vec!["laptop".to_string()]);

    handler("laptop")
        .handle_command(Commands::Peers {
            node: Some(address),
        })
        .await?;
    Ok(())
}

#[tokio::test]
async fn test_client_commands_fail_without_node() -> Result<()> {
    let result = handler("desk")
        .handle_command(Commands::Peers {
            node: Some("127.0.0.1:1".to_string()),
        })
        .await;
    assert!(result.is_err());
    Ok(())
}
