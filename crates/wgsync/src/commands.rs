use clap::{Args, Subcommand};
use serde::Serialize;
use tracing::info;
use wgsync_core::{ClientUpdate, Config, InterfaceUpdate, Manager, NewClient, SettingsUpdate};

type CmdResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create the record store and, if missing, the server config file
    Init,
    /// Regenerate the server config file and mark the records as applied
    Apply,
    /// Report whether the records changed since the last apply
    Status,
    /// Print free addresses for a new client
    Suggest {
        /// Subnet range to pick from; the server networks when omitted
        #[arg(short, long, default_value = "")]
        range: String,
    },
    /// Print the subnet ranges that survived validation
    Ranges,
    /// Manage clients
    #[command(subcommand)]
    Client(ClientCommand),
    /// Manage the server interface
    #[command(subcommand)]
    Server(ServerCommand),
    /// Manage global settings
    #[command(subcommand)]
    Settings(SettingsCommand),
}

#[derive(Debug, Subcommand)]
pub enum ClientCommand {
    List,
    Add(AddClient),
    Update(UpdateClient),
    Remove { id: String },
    Enable { id: String },
    Disable { id: String },
    /// Print the client's wg-quick configuration
    Config { id: String },
}

#[derive(Debug, Args)]
pub struct AddClient {
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "")]
    email: String,
    /// Addresses to allocate; picked automatically when omitted
    #[arg(long = "ip", value_delimiter = ',')]
    ips: Vec<String>,
    /// Subnet range used for automatic allocation
    #[arg(long)]
    range: Option<String>,
    #[arg(long = "allowed-ip", value_delimiter = ',')]
    allowed_ips: Option<Vec<String>>,
    #[arg(long = "extra-allowed-ip", value_delimiter = ',')]
    extra_allowed_ips: Option<Vec<String>>,
    #[arg(long)]
    use_server_dns: Option<bool>,
    #[arg(long)]
    enabled: Option<bool>,
    /// Peer's own public key; a keypair is generated when omitted
    #[arg(long, default_value = "")]
    public_key: String,
    /// Preshared key; generated when omitted, "-" for none
    #[arg(long, default_value = "")]
    preshared_key: String,
    #[arg(long, default_value = "")]
    notes: String,
}

#[derive(Debug, Args)]
pub struct UpdateClient {
    id: String,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    email: Option<String>,
    #[arg(long = "ip", value_delimiter = ',')]
    ips: Option<Vec<String>>,
    #[arg(long = "allowed-ip", value_delimiter = ',')]
    allowed_ips: Option<Vec<String>>,
    #[arg(long = "extra-allowed-ip", value_delimiter = ',')]
    extra_allowed_ips: Option<Vec<String>>,
    #[arg(long)]
    use_server_dns: Option<bool>,
    #[arg(long)]
    enabled: Option<bool>,
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum ServerCommand {
    Set {
        #[arg(long = "address", value_delimiter = ',')]
        addresses: Option<Vec<String>>,
        #[arg(long)]
        listen_port: Option<u16>,
        #[arg(long)]
        post_up: Option<String>,
        #[arg(long)]
        post_down: Option<String>,
    },
    /// Generate a new server keypair
    Keygen,
}

#[derive(Debug, Subcommand)]
pub enum SettingsCommand {
    Set {
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long, value_delimiter = ',')]
        dns: Option<Vec<String>>,
        #[arg(long)]
        mtu: Option<u32>,
        #[arg(long)]
        keepalive: Option<u32>,
        #[arg(long)]
        fwmark: Option<String>,
        #[arg(long)]
        table: Option<String>,
        #[arg(long)]
        config_file_path: Option<String>,
    },
}

#[derive(Debug, Serialize)]
struct ClientRow<'a> {
    #[serde(flatten)]
    client: &'a wgsync_types::Client,
    subnet_ranges: Vec<String>,
}

fn print_json<T: Serialize>(value: &T) -> CmdResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn run(command: Command, config: &Config) -> CmdResult {
    let manager = Manager::bootstrap(config).await?;

    match command {
        Command::Init => {
            let written = manager.ensure_server_config().await?;
            info!(written, "store initialized");
        }
        Command::Apply => {
            let hashes = manager.apply().await?;
            print_json(&hashes)?;
        }
        Command::Status => {
            let changed = manager.has_changes().await?;
            let clients = manager.clients().await?;
            print_json(&serde_json::json!({
                "changed": changed,
                "clients": clients.len(),
                "enabled_clients": clients.iter().filter(|c| c.enabled).count(),
            }))?;
        }
        Command::Suggest { range } => {
            for cidr in manager.suggest_addresses(&range).await? {
                println!("{cidr}");
            }
        }
        Command::Ranges => {
            let ranges = manager.subnet_ranges();
            for name in ranges.names() {
                let cidrs: Vec<String> = ranges
                    .get(name)
                    .unwrap_or_default()
                    .iter()
                    .map(ToString::to_string)
                    .collect();
                println!("{name}: {}", cidrs.join(", "));
            }
        }
        Command::Client(cmd) => run_client(&manager, cmd).await?,
        Command::Server(cmd) => run_server(&manager, cmd).await?,
        Command::Settings(SettingsCommand::Set {
            endpoint,
            dns,
            mtu,
            keepalive,
            fwmark,
            table,
            config_file_path,
        }) => {
            let settings = manager
                .update_global_settings(SettingsUpdate {
                    endpoint_address: endpoint,
                    dns_servers: dns,
                    mtu,
                    persistent_keepalive: keepalive,
                    firewall_mark: fwmark,
                    table,
                    config_file_path,
                })
                .await?;
            print_json(&settings)?;
        }
    }

    Ok(())
}

async fn run_client(manager: &Manager, cmd: ClientCommand) -> CmdResult {
    match cmd {
        ClientCommand::List => {
            let clients = manager.clients().await?;
            let rows: Vec<ClientRow> = clients
                .iter()
                .map(|client| ClientRow {
                    client,
                    subnet_ranges: manager.client_subnet_ranges(client),
                })
                .collect();
            print_json(&rows)?;
        }
        ClientCommand::Add(add) => {
            let client = manager
                .create_client(NewClient {
                    name: add.name,
                    email: add.email,
                    allocated_ips: add.ips,
                    subnet_range: add.range,
                    allowed_ips: add.allowed_ips,
                    extra_allowed_ips: add.extra_allowed_ips,
                    use_server_dns: add.use_server_dns,
                    enabled: add.enabled,
                    public_key: add.public_key,
                    preshared_key: add.preshared_key,
                    additional_notes: add.notes,
                })
                .await?;
            print_json(&client)?;
        }
        ClientCommand::Update(update) => {
            let client = manager
                .update_client(
                    &update.id,
                    ClientUpdate {
                        name: update.name,
                        email: update.email,
                        allocated_ips: update.ips,
                        allowed_ips: update.allowed_ips,
                        extra_allowed_ips: update.extra_allowed_ips,
                        use_server_dns: update.use_server_dns,
                        enabled: update.enabled,
                        additional_notes: update.notes,
                    },
                )
                .await?;
            print_json(&client)?;
        }
        ClientCommand::Remove { id } => {
            manager.remove_client(&id).await?;
            info!(client_id = %id, "removed client");
        }
        ClientCommand::Enable { id } => {
            manager.set_client_status(&id, true).await?;
        }
        ClientCommand::Disable { id } => {
            manager.set_client_status(&id, false).await?;
        }
        ClientCommand::Config { id } => {
            print!("{}", manager.client_config(&id).await?);
        }
    }
    Ok(())
}

async fn run_server(manager: &Manager, cmd: ServerCommand) -> CmdResult {
    match cmd {
        ServerCommand::Set {
            addresses,
            listen_port,
            post_up,
            post_down,
        } => {
            let interface = manager
                .update_server_interface(InterfaceUpdate {
                    addresses,
                    listen_port,
                    post_up,
                    post_down,
                })
                .await?;
            print_json(&interface)?;
        }
        ServerCommand::Keygen => {
            let keypair = manager.regenerate_server_keypair().await?;
            println!("{}", keypair.public_key);
        }
    }
    Ok(())
}
