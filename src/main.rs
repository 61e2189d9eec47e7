use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use kb_control::config::Settings;
use kb_control::core::IndexKind;
use kb_control::error::MigrationError;
use kb_control::meta;
use kb_control::migrator::{builtin_registry, MigrationContext, Migrator};
use kb_control::stats::RolloverReport;
use kb_control::storage::{open_driver, Driver};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kb-control")]
#[command(about = "Shard topology control plane for knowledge boxes", long_about = None)]
struct Args {
    /// 配置文件路径（缺省依次查找 KB_CONTROL_CONFIG 与用户配置目录）
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run pending metadata migrations.
    Migrate {
        /// Stop at this version instead of the latest.
        #[arg(long)]
        target: Option<u32>,
    },
    /// Show the global migration version, or one KB's.
    MigrationStatus {
        #[arg(long)]
        kbid: Option<String>,
    },
    /// Show persisted rollover progress for a KB.
    RolloverStatus {
        #[arg(long)]
        kbid: String,
        /// Only this index kind (paragraphs, vectors, texts, relations).
        #[arg(long)]
        kind: Option<IndexKind>,
    },
    /// Show the stored sequence offsets of a worker, or of one partition.
    Sequence {
        #[arg(long)]
        worker: String,
        #[arg(long)]
        partition: Option<String>,
    },
    /// List knowledge boxes.
    Kbs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref())?;
    let driver = open_driver(&settings.driver).await?;

    let res = run(args.command, &settings, driver.clone()).await;
    driver.finalize().await?;
    res
}

async fn run(command: Command, settings: &Settings, driver: Arc<dyn Driver>) -> anyhow::Result<()> {
    match command {
        Command::Migrate { target } => {
            // 独立运行时没有索引节点连接，只执行元数据迁移
            let ctx = MigrationContext {
                driver,
                rollover: None,
            };
            let migrator = Migrator::new(ctx, builtin_registry(false)?, settings.migrator.clone());
            info!(
                "Starting migration run: {} migrations registered",
                migrator.registry().len()
            );
            let interrupted = async {
                if tokio::signal::ctrl_c().await.is_err() {
                    std::future::pending::<()>().await;
                }
            };
            match migrator.run_until(target, interrupted).await {
                Ok(report) => print!("{}", report),
                Err(MigrationError::Interrupted) => {
                    info!("Interrupted, progress up to the last applied migration is kept");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Command::MigrationStatus { kbid } => {
            let mut txn = driver.begin(true).await?;
            match kbid {
                Some(kbid) => {
                    let info = meta::migrations::get_kb(&mut txn, &kbid).await?;
                    println!("kb {}: version {}", kbid, info.current_version);
                }
                None => {
                    let info = meta::migrations::get_global(&mut txn).await?;
                    println!(
                        "global: version {} (target {:?})",
                        info.current_version, info.target_version
                    );
                }
            }
            txn.commit().await?;
        }
        Command::RolloverStatus { kbid, kind } => {
            let mut txn = driver.begin(true).await?;
            let statuses = match kind {
                Some(kind) => meta::rollover::get(&mut txn, &kbid, kind)
                    .await?
                    .into_iter()
                    .collect(),
                None => meta::rollover::list(&mut txn, &kbid).await?,
            };
            txn.commit().await?;
            if statuses.is_empty() {
                println!("no rollover recorded for kb {}", kbid);
            }
            for status in statuses {
                print!("{}", RolloverReport::new(status));
            }
        }
        Command::Sequence { worker, partition } => {
            let mut txn = driver.begin(true).await?;
            match partition {
                Some(partition) => {
                    match meta::workers::get_offset(&mut txn, &worker, &partition).await? {
                        Some(seq) => println!("{}/{}: {}", worker, partition, seq),
                        None => println!("{}/{}: no offset stored", worker, partition),
                    }
                }
                None => {
                    let offsets = meta::workers::list_offsets(&mut txn, &worker).await?;
                    if offsets.is_empty() {
                        println!("{}: no offsets stored", worker);
                    }
                    for (partition, seq) in offsets {
                        println!("{}/{}: {}", worker, partition, seq);
                    }
                }
            }
            txn.commit().await?;
        }
        Command::Kbs => {
            let mut txn = driver.begin(true).await?;
            for kbid in meta::kb::list(&mut txn).await? {
                let slug = meta::kb::get(&mut txn, &kbid)
                    .await?
                    .map(|r| r.slug)
                    .unwrap_or_default();
                println!("{}\t{}", kbid, slug);
            }
            txn.commit().await?;
        }
    }
    Ok(())
}
