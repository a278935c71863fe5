use bson::{doc, Document};
use clap::Parser;
use repl_sync::executor::ThreadPoolExecutor;
use repl_sync::net::{MongoDatabaseClonerFactory, MongoNetwork, MongoStorage};
use repl_sync::{
    ApplierFn, ReplConfig, ReplError, Replicator, ReplicatorOptions, ADMIN_DB_NAME,
    TIMESTAMP_KEY,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(version, author)]
struct Opts {
    /// source host to replicate from, host:port of a replica set member.
    #[arg(short, long)]
    source: String,
    /// target database uri that receives the replicated data.
    #[arg(short, long)]
    target_uri: String,
    /// configuration file path.
    #[arg(short, long)]
    conf: Option<String>,
    /// log file path, if not specified, all log information will be output to stdout.
    #[arg(long)]
    log_path: Option<String>,
    /// drop user databases on the target and sync from scratch.
    #[arg(long)]
    resync: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opts: Opts = Opts::parse();
    let collector = tracing_subscriber::fmt();
    let (non_blocking, _guard) = match &opts.log_path {
        Some(path) => {
            let path = Path::new(path);
            let dir_name = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_else(|| "repl_sync.log".to_string());
            let file_appender = tracing_appender::rolling::daily(dir_name, file_name);
            tracing_appender::non_blocking(file_appender)
        }
        None => tracing_appender::non_blocking(std::io::stdout()),
    };
    collector.with_writer(non_blocking).init();

    let mut conf: ReplConfig = match &opts.conf {
        Some(path) => toml::from_str(&std::fs::read_to_string(path)?)?,
        None => ReplConfig::default(),
    };
    conf.sync_source = Some(opts.source.clone());

    // the batch applier replays ops transactionally through applyOps on the
    // target server.
    let apply_client = mongodb::sync::Client::with_uri_str(&opts.target_uri)?;
    let applier_fn: ApplierFn = Arc::new(move |_txn, ops: &[Document]| {
        apply_client
            .database(ADMIN_DB_NAME)
            .run_command(doc! {"applyOps": ops.to_vec()}, None)
            .map_err(|e| ReplError::Network(e.to_string()))?;
        ops.iter()
            .rev()
            .find_map(|op| op.get_timestamp(TIMESTAMP_KEY).ok())
            .ok_or_else(|| ReplError::BadValue("applied batch has no ts field".to_string()))
    });

    let network = Arc::new(MongoNetwork::new());
    let exec = Arc::new(ThreadPoolExecutor::new(network.clone()));
    let storage = Arc::new(MongoStorage::new(&opts.target_uri)?);
    let factory = Arc::new(MongoDatabaseClonerFactory::new(network));
    let options = ReplicatorOptions::from_config(&conf, applier_fn);
    let replicator = Replicator::new(options, exec.clone(), None, storage, factory);

    let last_applied = if opts.resync {
        replicator.resync()?
    } else {
        replicator.initial_sync()?
    };
    info!(?last_applied, "initial data copy complete, entering steady replication");
    replicator.start()?;

    loop {
        std::thread::sleep(Duration::from_secs(60));
        info!(status = %replicator.diagnostic_string(), "replicator status");
    }
}
