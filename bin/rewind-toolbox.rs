use anyhow::{ensure, format_err, Context};
use clap::Parser;
use rewind::{
    binutil::RewindDataDir,
    kv::{new_database, tables, traits::*, RedbKv},
    models::*,
    stagedsync::{
        stage::StageId,
        stages::{StageRegistry, DEFAULT_STAGES},
        unwind::{PersistentUnwindStack, UnwindState},
    },
};
use tracing::*;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Parser)]
#[clap(
    name = "Rewind Toolbox",
    about = "Inspect and adjust staged sync progress and pending unwinds"
)]
struct Opt {
    #[clap(long = "datadir", help = "Database directory path", default_value_t)]
    pub data_dir: RewindDataDir,

    #[clap(subcommand)]
    pub command: OptCommand,
}

#[derive(Parser)]
pub enum OptCommand {
    /// Print progress of every known stage
    StageProgress,

    /// Print unwinds that are recorded but not yet executed
    UnwindStatus,

    /// Record an unwind request that the next sync run will execute
    RequestUnwind {
        /// Height to unwind to
        #[clap(long)]
        to: BlockNumber,
        /// Hash of the block at the target height, defaults to the canonical one
        #[clap(long, parse(try_from_str = parse_hash))]
        hash: Option<H256>,
        /// Only unwind this stage instead of the whole pipeline
        #[clap(long, parse(try_from_str = parse_stage))]
        stage: Option<StageId>,
    },

    /// Overwrite the recorded progress of a stage
    SetProgress {
        #[clap(long, parse(try_from_str = parse_stage))]
        stage: StageId,
        #[clap(long)]
        block: BlockNumber,
    },
}

fn parse_hash(s: &str) -> anyhow::Result<H256> {
    let b = hex::decode(s.strip_prefix("0x").unwrap_or(s))?;
    ensure!(
        b.len() == KECCAK_LENGTH,
        "hash must be {} bytes, got {}",
        KECCAK_LENGTH,
        b.len()
    );
    Ok(H256::from_slice(&b))
}

fn parse_stage(s: &str) -> anyhow::Result<StageId> {
    DEFAULT_STAGES
        .iter()
        .copied()
        .find(|stage| stage.0.eq_ignore_ascii_case(s))
        .ok_or_else(|| format_err!("unknown stage {}", s))
}

fn open_db(data_dir: &RewindDataDir) -> anyhow::Result<RedbKv> {
    std::fs::create_dir_all(&data_dir.0)
        .with_context(|| format!("failed to create data dir {}", data_dir))?;
    new_database(&data_dir.chain_data_dir())
}

fn stage_progress(data_dir: RewindDataDir) -> anyhow::Result<()> {
    let env = open_db(&data_dir)?;
    let tx = env.begin()?;

    for stage in DEFAULT_STAGES {
        match stage.get_progress(&tx)? {
            Some(progress) => println!("{:<24}{}", stage, progress),
            None => println!("{:<24}-", stage),
        }
    }

    Ok(())
}

fn unwind_status(data_dir: RewindDataDir) -> anyhow::Result<()> {
    let env = open_db(&data_dir)?;
    let tx = env.begin()?;

    let mut pending = PersistentUnwindStack::load(&tx, &StageRegistry::default())?;
    if pending.is_empty() {
        println!("No pending unwinds");
        return Ok(());
    }

    while let Some(u) = pending.pop() {
        println!("{:<24}{} {:?}", u.stage.id, u.unwind_point, u.unwind_hash);
    }

    Ok(())
}

fn request_unwind(
    data_dir: RewindDataDir,
    to: BlockNumber,
    hash: Option<H256>,
    stage: Option<StageId>,
) -> anyhow::Result<()> {
    let env = open_db(&data_dir)?;
    let tx = env.begin_mutable()?;

    let registry = StageRegistry::default();
    let mut stack = PersistentUnwindStack::load(&tx, &registry)?;

    let unwind_hash = match hash {
        Some(hash) => hash,
        None => tx.get(tables::CanonicalHeader, to)?.unwrap_or_default(),
    };

    let targets = match stage {
        Some(id) => vec![registry
            .get(id)
            .ok_or_else(|| format_err!("stage {} is not registered", id))?],
        None => registry.iter().collect(),
    };

    for stage in targets {
        stack.add(UnwindState::new(stage, to, unwind_hash), &tx)?;
    }

    tx.commit()?;

    info!(to = %to, pending = stack.len(), "Unwind recorded");

    Ok(())
}

fn set_progress(data_dir: RewindDataDir, stage: StageId, block: BlockNumber) -> anyhow::Result<()> {
    let env = open_db(&data_dir)?;
    let tx = env.begin_mutable()?;

    let previous = stage.get_progress(&tx)?;
    stage.save_progress(&tx, block)?;
    tx.commit()?;

    info!(stage = %stage, ?previous, block = %block, "Progress overwritten");

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt: Opt = Opt::parse();

    let filter = if std::env::var(EnvFilter::DEFAULT_ENV)
        .unwrap_or_default()
        .is_empty()
    {
        EnvFilter::new("rewind=info,rewind_toolbox=info")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(filter)
        .init();

    match opt.command {
        OptCommand::StageProgress => stage_progress(opt.data_dir)?,
        OptCommand::UnwindStatus => unwind_status(opt.data_dir)?,
        OptCommand::RequestUnwind { to, hash, stage } => {
            request_unwind(opt.data_dir, to, hash, stage)?
        }
        OptCommand::SetProgress { stage, block } => set_progress(opt.data_dir, stage, block)?,
    }

    Ok(())
}
