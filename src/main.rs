use anyhow::{bail, Context};
use clap::{value_parser, Arg, ArgMatches, Command};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use stockmesh::config::MEMORY_DATABASE;
use stockmesh::network::{Message, NodeId, RedistributeRequest, SaleRequest, Transport};
use stockmesh::storage::{InventoryStore, MemoryStore, NewClient, NewItem, SqliteStore};
use stockmesh::{Config, Node};

fn cli() -> Command {
    let target = Arg::new("node")
        .long("node")
        .short('n')
        .help("Node to send the request to")
        .value_parser(value_parser!(u32))
        .required(true);

    Command::new("stockmesh")
        .version("0.1.0")
        .about("Distributed branch inventory with bully leader election")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .help("Cluster file (JSON)")
                .global(true)
                .default_value("cluster.json"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("serve")
                .about("Run a branch node")
                .arg(
                    Arg::new("node")
                        .long("node")
                        .short('n')
                        .help("This node's id (overrides the cluster file)")
                        .value_parser(value_parser!(u32)),
                )
                .arg(
                    Arg::new("database")
                        .long("database")
                        .help("SQLite file, or :memory: (overrides the cluster file)"),
                ),
        )
        .subcommand(
            Command::new("sell")
                .about("Sell stock held by a branch")
                .arg(target.clone())
                .arg(Arg::new("item").long("item").value_parser(value_parser!(i64)).required(true))
                .arg(Arg::new("client").long("client").value_parser(value_parser!(i64)).required(true))
                .arg(Arg::new("qty").long("qty").value_parser(value_parser!(u64)).required(true)),
        )
        .subcommand(
            Command::new("add-article")
                .about("Admit a new article (forwarded to the leader)")
                .arg(target.clone())
                .arg(Arg::new("name").long("name").required(true))
                .arg(Arg::new("description").long("description").default_value(""))
                .arg(Arg::new("qty").long("qty").value_parser(value_parser!(u64)).required(true)),
        )
        .subcommand(
            Command::new("register-client")
                .about("Register a customer at a branch")
                .arg(target.clone())
                .arg(Arg::new("name").long("name").required(true))
                .arg(Arg::new("address").long("address").required(true))
                .arg(Arg::new("phone").long("phone"))
                .arg(Arg::new("email").long("email")),
        )
        .subcommand(Command::new("inventory").about("Show a branch's stock").arg(target.clone()))
        .subcommand(Command::new("clients").about("List a branch's customers").arg(target.clone()))
        .subcommand(Command::new("status").about("Show a node's view of the cluster").arg(target.clone()))
        .subcommand(
            Command::new("redistribute")
                .about("Move an item's stock off a branch (forwarded to the leader)")
                .arg(target)
                .arg(Arg::new("item").long("item").value_parser(value_parser!(i64)).required(true))
                .arg(Arg::new("from").long("from").value_parser(value_parser!(u32)).required(true)),
        )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = cli().get_matches();
    let config_path = matches
        .get_one::<String>("config")
        .context("missing --config")?;
    let mut config = Config::load(config_path).with_context(|| format!("loading {}", config_path))?;

    match matches.subcommand() {
        Some(("serve", args)) => {
            if let Some(id) = args.get_one::<u32>("node") {
                config.node_id = NodeId(*id);
            }
            if let Some(database) = args.get_one::<String>("database") {
                config.database = database.clone();
            }
            serve(config).await
        }
        Some((command, args)) => request(config, command, args).await,
        None => bail!("no command given"),
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    info!("Node configuration: {:?}", config);

    if config.database == MEMORY_DATABASE {
        let store = MemoryStore::with_default_capacity(config.default_branch_capacity);
        run_node(config, store).await
    } else {
        let store = SqliteStore::open_with_capacity(&config.database, config.default_branch_capacity)?;
        run_node(config, store).await
    }
}

async fn run_node<S: InventoryStore>(config: Config, store: S) -> anyhow::Result<()> {
    let node = Node::new(config, store)?;
    let server = node.bind().await?;

    let running = tokio::spawn(node.clone().run(server));
    tokio::select! {
        result = running => result??,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Interrupted, shutting down node {}", node.id());
            node.shutdown();
        }
    }
    Ok(())
}

/// Sends one envelope from the operator id and prints the reply.
async fn request(config: Config, command: &str, args: &ArgMatches) -> anyhow::Result<()> {
    let target = NodeId(*args.get_one::<u32>("node").context("missing --node")?);
    let message = match command {
        "sell" => Message::Sell(SaleRequest {
            item_id: *args.get_one::<i64>("item").context("missing --item")?,
            client_id: *args.get_one::<i64>("client").context("missing --client")?,
            qty: *args.get_one::<u64>("qty").context("missing --qty")?,
        }),
        "add-article" => Message::AddArticle(NewItem {
            name: args.get_one::<String>("name").cloned().unwrap_or_default(),
            description: args.get_one::<String>("description").cloned().unwrap_or_default(),
            quantity: *args.get_one::<u64>("qty").context("missing --qty")?,
        }),
        "register-client" => Message::RegisterClient(NewClient {
            name: args.get_one::<String>("name").cloned().unwrap_or_default(),
            address: args.get_one::<String>("address").cloned().unwrap_or_default(),
            phone: args.get_one::<String>("phone").cloned(),
            email: args.get_one::<String>("email").cloned(),
            home_branch: target,
        }),
        "inventory" => Message::QueryInventory,
        "clients" => Message::QueryClients,
        "status" => Message::Status,
        "redistribute" => Message::Redistribute(RedistributeRequest {
            item_id: *args.get_one::<i64>("item").context("missing --item")?,
            from_branch: NodeId(*args.get_one::<u32>("from").context("missing --from")?),
        }),
        other => bail!("unknown command '{}'", other),
    };

    let transport = Transport::new(
        NodeId::OPERATOR,
        Arc::new(config.directory()?),
        std::time::Duration::from_millis(config.rpc_timeout_ms),
    );

    let reply = transport
        .call(target, message)
        .await
        .with_context(|| format!("node {} did not answer", target))?;

    println!("{}", serde_json::to_string_pretty(&reply)?);
    if let Message::Error(e) = reply {
        bail!("{}", e);
    }
    Ok(())
}
