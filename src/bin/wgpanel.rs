//! wgpanel - WireGuard Panel CLI Tool
//!
//! Offline management of the panel state: servers, clients and port
//! forwards. Changes are applied to the host immediately. Mutating commands
//! refuse to run while wgpaneld owns the state.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use libwgpanel::config::{PanelConfig, DEFAULT_CONFIG_PATH};
use libwgpanel::{
    Client, Host, JsonFileStore, NewServer, PanelManager, PidFile, Protocol, Server, ServerUpdate,
};
use serde::Serialize;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "wgpanel")]
#[command(version)]
#[command(
    about = "WireGuard panel tool - manage servers, clients and port forwards",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the state file from the configuration
    #[arg(long)]
    state: Option<PathBuf>,

    /// Output format: text, json
    #[arg(short = 'o', long, default_value = "text")]
    output: String,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Server management
    #[command(subcommand)]
    Server(ServerCommands),

    /// Client management
    #[command(subcommand)]
    Client(ClientCommands),

    /// Port forward management
    #[command(subcommand)]
    Forward(ForwardCommands),

    /// Run a full convergence pass
    Sync,
}

#[derive(Subcommand)]
enum ServerCommands {
    /// List servers
    List,
    /// Create a server; address and port are allocated when omitted
    Add {
        #[arg(short, long)]
        name: String,
        /// Server address, e.g. 10.0.0.1/24
        #[arg(short, long)]
        address: Option<String>,
        #[arg(short, long)]
        port: Option<u32>,
        #[arg(long)]
        dns: Option<String>,
        #[arg(long)]
        post_up: Option<String>,
        #[arg(long)]
        post_down: Option<String>,
        /// Create the server without bringing it up
        #[arg(long)]
        disabled: bool,
    },
    /// Change a server
    Update {
        server: String,
        #[arg(short, long)]
        name: Option<String>,
        #[arg(long)]
        dns: Option<String>,
        #[arg(short, long)]
        port: Option<u32>,
        #[arg(long)]
        post_up: Option<String>,
        #[arg(long)]
        post_down: Option<String>,
    },
    /// Enable or disable a server
    Toggle { server: String },
    /// Delete a server and all of its clients
    Delete { server: String },
}

#[derive(Subcommand)]
enum ClientCommands {
    /// List clients
    List {
        #[arg(short, long)]
        server: Option<String>,
    },
    /// Create a client on a server
    Add {
        server: String,
        #[arg(short, long)]
        name: String,
        #[arg(long, default_value = "")]
        comment: String,
    },
    /// Change a client
    Update {
        client: String,
        #[arg(short, long)]
        name: Option<String>,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Enable or disable a client
    Toggle { client: String },
    /// Delete a client
    Delete { client: String },
    /// Print or save a client profile
    Config {
        client: String,
        /// Public host clients connect to
        #[arg(short, long)]
        endpoint: Option<String>,
        /// Directory to write the profile into
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ForwardCommands {
    /// Forward a port to a client
    Add {
        client: String,
        port: u32,
        #[arg(short, long, default_value = "tcp")]
        protocol: Protocol,
        #[arg(short, long, default_value = "")]
        description: String,
    },
    /// Change the description of a forward
    Update {
        client: String,
        port: u16,
        #[arg(short, long, default_value = "tcp")]
        protocol: Protocol,
        #[arg(short, long)]
        description: String,
    },
    /// Remove a forward
    Remove {
        client: String,
        port: u16,
        #[arg(short, long, default_value = "tcp")]
        protocol: Protocol,
    },
}

/// Server as shown to users; keys other than the public one stay hidden
#[derive(Serialize)]
struct ServerView<'a> {
    id: &'a str,
    name: &'a str,
    interface: &'a str,
    address: String,
    listen_port: u16,
    dns: &'a str,
    enabled: bool,
    public_key: &'a str,
    clients: usize,
}

#[derive(Serialize)]
struct ClientView<'a> {
    id: &'a str,
    server_id: &'a str,
    name: &'a str,
    address: String,
    enabled: bool,
    comment: &'a str,
    public_key: &'a str,
    rx_bytes: u64,
    tx_bytes: u64,
    last_handshake: Option<String>,
    endpoint: &'a str,
    port_forwards: &'a [libwgpanel::PortForward],
}

impl<'a> ClientView<'a> {
    fn new(client: &'a Client) -> Self {
        Self {
            id: &client.id,
            server_id: &client.server_id,
            name: &client.name,
            address: client.address.to_string(),
            enabled: client.enabled,
            comment: &client.comment,
            public_key: &client.public_key,
            rx_bytes: client.rx_bytes,
            tx_bytes: client.tx_bytes,
            last_handshake: client.last_handshake.map(|t| t.to_rfc3339()),
            endpoint: &client.endpoint,
            port_forwards: &client.port_forwards,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(&cli).await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("wgpanel={},libwgpanel={}", level, level)));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();
}

async fn run(cli: &Cli) -> Result<()> {
    let mut config = PanelConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(state) = &cli.state {
        config.paths.state_file = state.clone();
    }

    // Held for the duration of a mutating command
    let _lock = if is_mutating(&cli.command) {
        Some(PidFile::acquire(&config.paths.pid_file).map_err(|e| {
            anyhow!("{} (stop wgpaneld first, or send it SIGHUP after editing the state)", e)
        })?)
    } else {
        None
    };

    let host = Host::system(&config);
    let store = Arc::new(JsonFileStore::new(config.paths.state_file.clone()));
    let manager = PanelManager::open(store, host, config)
        .await
        .context("opening panel state")?;

    match &cli.command {
        Commands::Server(cmd) => handle_server(cmd, &manager, cli).await,
        Commands::Client(cmd) => handle_client(cmd, &manager, cli).await,
        Commands::Forward(cmd) => handle_forward(cmd, &manager, cli).await,
        Commands::Sync => {
            let report = manager.converge().await;
            if cli.output == "json" {
                print_json(&serde_json::json!({
                    "started": report.started,
                    "stopped": report.stopped,
                    "demoted": report.demoted,
                    "orphan_interfaces": report.orphan_interfaces,
                    "orphan_artifacts": report.orphan_artifacts,
                    "failures": report.failures(),
                }))
            } else {
                println!(
                    "Converged: {} up, {} down, {} demoted, {} orphans removed, {} failures",
                    report.started.len(),
                    report.stopped.len(),
                    report.demoted.len(),
                    report.orphan_interfaces.len() + report.orphan_artifacts.len(),
                    report.failures()
                );
                Ok(())
            }
        }
    }
}

fn is_mutating(command: &Commands) -> bool {
    !matches!(
        command,
        Commands::Server(ServerCommands::List)
            | Commands::Client(ClientCommands::List { .. })
            | Commands::Client(ClientCommands::Config { .. })
    )
}

async fn handle_server(cmd: &ServerCommands, manager: &PanelManager, cli: &Cli) -> Result<()> {
    match cmd {
        ServerCommands::List => {
            let snapshot = manager.snapshot().await;
            let views: Vec<ServerView> = snapshot
                .servers
                .iter()
                .map(|s| {
                    let clients = snapshot.clients.iter().filter(|c| c.server_id == s.id);
                    server_view(s, clients.count())
                })
                .collect();

            if cli.output == "json" {
                return print_json(&views);
            }
            println!(
                "{:<36}  {:<16}  {:<8}  {:<18}  {:<6}  {:<8}  {}",
                "ID", "NAME", "IFACE", "ADDRESS", "PORT", "STATE", "CLIENTS"
            );
            for v in views {
                println!(
                    "{:<36}  {:<16}  {:<8}  {:<18}  {:<6}  {:<8}  {}",
                    v.id,
                    v.name,
                    v.interface,
                    v.address,
                    v.listen_port,
                    state_label(v.enabled),
                    v.clients
                );
            }
        }
        ServerCommands::Add { name, address, port, dns, post_up, post_down, disabled } => {
            let server = manager
                .create_server(NewServer {
                    name: name.clone(),
                    address: address.clone(),
                    listen_port: *port,
                    dns: dns.clone(),
                    post_up: post_up.clone(),
                    post_down: post_down.clone(),
                    disabled: *disabled,
                })
                .await?;
            print_server(&server, cli)?;
        }
        ServerCommands::Update { server, name, dns, port, post_up, post_down } => {
            let id = resolve_server(manager, server).await?;
            let server = manager
                .update_server(
                    &id,
                    ServerUpdate {
                        name: name.clone(),
                        dns: dns.clone(),
                        listen_port: *port,
                        post_up: post_up.clone(),
                        post_down: post_down.clone(),
                    },
                )
                .await?;
            print_server(&server, cli)?;
        }
        ServerCommands::Toggle { server } => {
            let id = resolve_server(manager, server).await?;
            let server = manager.toggle_server(&id).await?;
            print_server(&server, cli)?;
        }
        ServerCommands::Delete { server } => {
            let id = resolve_server(manager, server).await?;
            let removed = manager.delete_server(&id).await?;
            if cli.output == "json" {
                return print_json(&serde_json::json!({
                    "deleted": id,
                    "clients_removed": removed,
                }));
            }
            println!("Deleted server {} ({} clients removed)", id, removed);
        }
    }
    Ok(())
}

async fn handle_client(cmd: &ClientCommands, manager: &PanelManager, cli: &Cli) -> Result<()> {
    match cmd {
        ClientCommands::List { server } => {
            let server_id = match server {
                Some(key) => Some(resolve_server(manager, key).await?),
                None => None,
            };
            let clients = manager.list_clients(server_id.as_deref()).await;
            let views: Vec<ClientView> = clients.iter().map(ClientView::new).collect();

            if cli.output == "json" {
                return print_json(&views);
            }
            println!(
                "{:<36}  {:<16}  {:<15}  {:<8}  {:>12}  {:>12}  {}",
                "ID", "NAME", "ADDRESS", "STATE", "RX", "TX", "FORWARDS"
            );
            for v in views {
                let forwards: Vec<String> = v
                    .port_forwards
                    .iter()
                    .map(|pf| format!("{}/{}", pf.port, pf.protocol))
                    .collect();
                println!(
                    "{:<36}  {:<16}  {:<15}  {:<8}  {:>12}  {:>12}  {}",
                    v.id,
                    v.name,
                    v.address,
                    state_label(v.enabled),
                    v.rx_bytes,
                    v.tx_bytes,
                    forwards.join(",")
                );
            }
        }
        ClientCommands::Add { server, name, comment } => {
            let server_id = resolve_server(manager, server).await?;
            let client = manager.create_client(&server_id, name, comment).await?;
            print_client(&client, cli)?;
        }
        ClientCommands::Update { client, name, comment } => {
            let id = resolve_client(manager, client).await?;
            let client = manager
                .update_client(&id, name.as_deref(), comment.as_deref())
                .await?;
            print_client(&client, cli)?;
        }
        ClientCommands::Toggle { client } => {
            let id = resolve_client(manager, client).await?;
            let client = manager.toggle_client(&id).await?;
            print_client(&client, cli)?;
        }
        ClientCommands::Delete { client } => {
            let id = resolve_client(manager, client).await?;
            manager.delete_client(&id).await?;
            if cli.output == "json" {
                return print_json(&serde_json::json!({ "deleted": id }));
            }
            println!("Deleted client {}", id);
        }
        ClientCommands::Config { client, endpoint, out_dir } => {
            let id = resolve_client(manager, client).await?;
            let profile = manager.client_config(&id, endpoint.as_deref()).await?;

            match out_dir {
                Some(dir) => {
                    let path = dir.join(&profile.file_name);
                    write_profile(&path, &profile.content)
                        .with_context(|| format!("writing {}", path.display()))?;
                    if cli.output == "json" {
                        return print_json(&serde_json::json!({ "path": path }));
                    }
                    println!("Wrote {}", path.display());
                }
                None if cli.output == "json" => return print_json(&profile),
                None => print!("{}", profile.content),
            }
        }
    }
    Ok(())
}

async fn handle_forward(cmd: &ForwardCommands, manager: &PanelManager, cli: &Cli) -> Result<()> {
    match cmd {
        ForwardCommands::Add { client, port, protocol, description } => {
            let id = resolve_client(manager, client).await?;
            let forward = manager
                .add_port_forward(&id, *port, *protocol, description)
                .await?;
            if cli.output == "json" {
                return print_json(&forward);
            }
            println!("Forwarding {}/{} to client {}", forward.port, forward.protocol, id);
        }
        ForwardCommands::Update { client, port, protocol, description } => {
            let id = resolve_client(manager, client).await?;
            let forward = manager
                .update_port_forward(&id, *port, *protocol, description)
                .await?;
            if cli.output == "json" {
                return print_json(&forward);
            }
            println!("Updated forward {}/{}", forward.port, forward.protocol);
        }
        ForwardCommands::Remove { client, port, protocol } => {
            let id = resolve_client(manager, client).await?;
            manager.remove_port_forward(&id, *port, *protocol).await?;
            if cli.output == "json" {
                let removed = format!("{}/{}", port, protocol);
                return print_json(&serde_json::json!({ "removed": removed }));
            }
            println!("Removed forward {}/{}", port, protocol);
        }
    }
    Ok(())
}

/// Accept a server id, interface name or unique server name
async fn resolve_server(manager: &PanelManager, key: &str) -> Result<String> {
    let servers = manager.list_servers().await;
    if let Some(s) = servers.iter().find(|s| s.id == key || s.interface == key) {
        return Ok(s.id.clone());
    }

    let named: Vec<&Server> = servers.iter().filter(|s| s.name == key).collect();
    match named.as_slice() {
        [one] => Ok(one.id.clone()),
        [] => bail!("No server matches '{}'", key),
        _ => bail!("Server name '{}' is ambiguous, use the id", key),
    }
}

/// Accept a client id or unique client name
async fn resolve_client(manager: &PanelManager, key: &str) -> Result<String> {
    let clients = manager.list_clients(None).await;
    if let Some(c) = clients.iter().find(|c| c.id == key) {
        return Ok(c.id.clone());
    }

    let named: Vec<&Client> = clients.iter().filter(|c| c.name == key).collect();
    match named.as_slice() {
        [one] => Ok(one.id.clone()),
        [] => bail!("No client matches '{}'", key),
        _ => bail!("Client name '{}' is ambiguous, use the id", key),
    }
}

fn server_view(server: &Server, clients: usize) -> ServerView<'_> {
    ServerView {
        id: &server.id,
        name: &server.name,
        interface: &server.interface,
        address: server.address.to_string(),
        listen_port: server.listen_port,
        dns: &server.dns,
        enabled: server.enabled,
        public_key: &server.public_key,
        clients,
    }
}

fn print_server(server: &Server, cli: &Cli) -> Result<()> {
    if cli.output == "json" {
        return print_json(&server_view(server, 0));
    }
    println!("Server: {}", server.name);
    println!("  ID: {}", server.id);
    println!("  Interface: {}", server.interface);
    println!("  Address: {}", server.address);
    println!("  Listen port: {}", server.listen_port);
    println!("  State: {}", state_label(server.enabled));
    println!("  Public key: {}", server.public_key);
    Ok(())
}

fn print_client(client: &Client, cli: &Cli) -> Result<()> {
    if cli.output == "json" {
        return print_json(&ClientView::new(client));
    }
    println!("Client: {}", client.name);
    println!("  ID: {}", client.id);
    println!("  Address: {}", client.address);
    println!("  State: {}", state_label(client.enabled));
    println!("  Public key: {}", client.public_key);
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn state_label(enabled: bool) -> &'static str {
    if enabled {
        "enabled"
    } else {
        "disabled"
    }
}

fn write_profile(path: &std::path::Path, content: &str) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::write(path, content)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}
