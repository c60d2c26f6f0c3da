//! HVFS AMC - command line access to tables and KV rows
//!
//! Each invocation registers with the root service, runs one command and
//! unregisters again. The `branch` command runs a local branch processor
//! over a file of lines and needs no cluster.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use hvfs_branch::{
    BranchLine, BranchProcessor, BranchPush, FsBackend, OperatorKind, OperatorSpec, PushOutcome,
};
use hvfs_client::{ClientContext, KvClient};
use hvfs_common::{Config, SiteId};
use hvfs_proto::ListOp;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "hvfs-amc")]
#[command(about = "HVFS table and KV client")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "HVFS_CONFIG")]
    config: Option<PathBuf>,

    /// Root service address (overrides the config file)
    #[arg(long)]
    root: Option<SocketAddr>,

    /// Site index of this client (overrides the config file)
    #[arg(long)]
    site: Option<u64>,

    /// File system id (overrides the config file)
    #[arg(long)]
    fsid: Option<u64>,

    /// Address for inbound ring updates (overrides the config file)
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Table operations
    Table {
        #[command(subcommand)]
        action: TableCommands,
    },
    /// Store a new value
    Put(WriteArgs),
    /// Replace an existing value
    Update(WriteArgs),
    /// Read a value
    Get(KeyArgs),
    /// Delete a value
    Del(KeyArgs),
    /// Ask an MDS to commit its state
    Commit {
        /// MDS index
        mds: u64,
    },
    /// Run a branch processor over the lines of a file
    Branch(BranchArgs),
}

#[derive(Subcommand, Debug)]
enum TableCommands {
    /// Create a table
    Create { name: String },
    /// Show a table's identity
    Show { name: String },
    /// Drop an empty table
    Drop { name: String },
    /// List or count rows
    List {
        name: String,
        #[arg(long, value_enum, default_value = "scan")]
        op: ListMode,
        /// Substring for grep modes
        #[arg(long, default_value = "")]
        pattern: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ListMode {
    Scan,
    Count,
    Grep,
    GrepCount,
}

impl From<ListMode> for ListOp {
    fn from(mode: ListMode) -> Self {
        match mode {
            ListMode::Scan => Self::Scan,
            ListMode::Count => Self::Count,
            ListMode::Grep => Self::Grep,
            ListMode::GrepCount => Self::GrepCount,
        }
    }
}

#[derive(clap::Args, Debug)]
struct KeyArgs {
    table: String,
    key: String,
    /// Column number; 0 is the inline value
    #[arg(long, default_value_t = 0)]
    column: u32,
    /// Treat the key as a string instead of a number
    #[arg(long)]
    string: bool,
}

#[derive(clap::Args, Debug)]
struct WriteArgs {
    #[command(flatten)]
    key: KeyArgs,
    value: String,
}

#[derive(clap::Args, Debug)]
struct BranchArgs {
    /// Branch name
    name: String,
    /// File with one line per record
    input: PathBuf,
    /// Directory for output files and ack tables
    #[arg(long, default_value = ".")]
    base: PathBuf,
    /// Filter config, e.g. `rule:^ERR;output_filename:errors.log;`
    #[arg(long)]
    filter: Option<String>,
    /// Sender site index recorded in the ack table
    #[arg(long, default_value_t = 0)]
    sender: u64,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(root) = args.root {
        config.client.root_address = root;
    }
    if let Some(site) = args.site {
        config.client.site_index = site;
    }
    if let Some(fsid) = args.fsid {
        config.client.fsid = fsid;
    }
    if let Some(listen) = args.listen {
        config.client.listen = listen;
    }
    Ok(config)
}

async fn write(kv: &KvClient, args: WriteArgs, update: bool) -> Result<()> {
    let WriteArgs { key, value } = args;
    match (key.string, update) {
        (true, false) => kv.sput(&key.table, &key.key, key.column, value).await?,
        (true, true) => kv.supdate(&key.table, &key.key, key.column, value).await?,
        (false, update) => {
            let numeric = parse_key(&key.key)?;
            if update {
                kv.update(&key.table, numeric, key.column, value).await?;
            } else {
                kv.put(&key.table, numeric, key.column, value).await?;
            }
        }
    }
    Ok(())
}

fn parse_key(key: &str) -> Result<u64> {
    key.parse()
        .with_context(|| format!("key {key:?} is not a number; use --string"))
}

async fn run_cluster(ctx: &Arc<ClientContext>, command: Commands) -> Result<()> {
    let kv = KvClient::new(Arc::clone(ctx));
    match command {
        Commands::Table { action } => match action {
            TableCommands::Create { name } => {
                let table = ctx.create_table(&name).await?;
                println!("created {name}: uuid {:#x} salt {:#x}", table.uuid, table.salt);
            }
            TableCommands::Show { name } => {
                let table = ctx.find_table(&name).await?;
                println!("Table: {name}");
                println!("  uuid:   {:#x}", table.uuid);
                println!("  salt:   {:#x}", table.salt);
                println!("  parent: {:#x}", table.puuid);
            }
            TableCommands::Drop { name } => {
                ctx.drop_table(&name).await?;
                println!("dropped {name}");
            }
            TableCommands::List { name, op, pattern } => {
                let op = ListOp::from(op);
                let result = ctx.list(&name, op, &pattern).await?;
                if op.counts() {
                    println!("{}", result.count);
                } else {
                    for entry in &result.names {
                        println!("{entry}");
                    }
                }
            }
        },
        Commands::Put(args) => write(&kv, args, false).await?,
        Commands::Update(args) => write(&kv, args, true).await?,
        Commands::Get(key) => {
            let value = if key.string {
                kv.sget(&key.table, &key.key, key.column).await?
            } else {
                kv.get(&key.table, parse_key(&key.key)?, key.column).await?
            };
            println!("{}", String::from_utf8_lossy(&value));
        }
        Commands::Del(key) => {
            if key.string {
                kv.sdel(&key.table, &key.key, key.column).await?;
            } else {
                kv.del(&key.table, parse_key(&key.key)?, key.column).await?;
            }
        }
        Commands::Commit { mds } => ctx.commit(mds).await?,
        Commands::Branch(_) => bail!("branch runs locally"),
    }
    Ok(())
}

fn run_branch(config: &Config, args: BranchArgs) -> Result<()> {
    let mut ops = Vec::new();
    if let Some(filter) = args.filter {
        ops.push(OperatorSpec::new(1, OperatorKind::Filter, filter));
    }
    let backend = Arc::new(FsBackend::new(&args.base));
    let mut processor =
        BranchProcessor::from_descriptor(&args.name, &ops, backend, &config.branch)?;

    let text = std::fs::read_to_string(&args.input)
        .with_context(|| format!("reading {}", args.input.display()))?;
    let sender = SiteId::client(args.sender);
    let mut ack = processor.acks().get(sender).unwrap_or(0);
    let mut outcomes: HashMap<&'static str, usize> = HashMap::new();
    for line in text.lines() {
        let id = ack + 1;
        let push = BranchPush::new(sender, ack, BranchLine::primary(id, format!("{line}\n")));
        let outcome = processor.handle_push(&push)?;
        let label = match outcome {
            PushOutcome::Delivered | PushOutcome::Filtered => {
                ack = id;
                processor.acks().update(sender, ack);
                if outcome == PushOutcome::Delivered { "delivered" } else { "filtered" }
            }
            PushOutcome::Ignored => "ignored",
            PushOutcome::NeedsAdjust | PushOutcome::NeedsWait => {
                warn!("line {} refused: {:?}", id, outcome);
                "refused"
            }
        };
        *outcomes.entry(label).or_default() += 1;
    }
    processor.flush()?;
    let closed = processor.teardown();
    info!("branch {} closed operators {:?}", args.name, closed);

    let mut labels: Vec<_> = outcomes.into_iter().collect();
    labels.sort_unstable();
    for (label, count) in labels {
        println!("{label}: {count}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&args)?;
    let command = match args.command {
        Commands::Branch(branch) => return run_branch(&config, branch),
        command => command,
    };

    info!(
        "site {} registering with {}",
        config.client.site_index, config.client.root_address
    );
    let ctx = hvfs_client::connect(config)
        .await
        .context("registering with the root service")?;
    let result = run_cluster(&ctx, command).await;
    if let Err(e) = ctx.unregister().await {
        warn!("unregister failed: {}", e);
    }
    result
}
