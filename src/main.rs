use anyhow::Context;
use clap::Parser;
use daemonize::Daemonize;
use fuser::MountOption;
use log::{info, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;

use bucketfs::app::AppContext;
use bucketfs::config::Config;
use bucketfs::fs::S3Filesystem;

#[derive(Parser, Debug)]
#[command(
    name = "bucketfs",
    version,
    about = "Mount an S3-compatible bucket as a local filesystem"
)]
struct Cli {
    /// Object store endpoint, e.g. https://s3.amazonaws.com
    endpoint_url: String,
    /// Bucket to mount
    bucket: String,
    /// Local mount point
    mountpoint: PathBuf,

    /// Path to the configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Do not daemonize the process
    #[arg(short = 'f', long)]
    foreground: bool,

    /// Override the cache directory
    #[arg(long)]
    cache_dir: Option<String>,

    /// FUSE options, comma separated
    #[arg(short = 'o', long = "fuse-options", value_name = "opt[,opt...]")]
    fuse_options: Option<String>,

    /// Use legacy path-style bucket addressing
    #[arg(short = 'p', long)]
    path_style: bool,

    /// Disable the statistics counters
    #[arg(long)]
    disable_stats: bool,

    /// Override the upload part size, in bytes
    #[arg(long)]
    part_size: Option<u64>,

    /// Write log output to this file instead of stderr
    #[arg(short = 'l', long)]
    log_file: Option<PathBuf>,

    /// Verbose (debug) logging
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let (path, explicit) = match &cli.config {
        Some(path) => (path.clone(), true),
        None => (PathBuf::from("config.toml"), false),
    };
    let mut config = Config::load(&path, explicit)?;

    let url = url::Url::parse(&cli.endpoint_url)
        .with_context(|| format!("invalid endpoint URL '{}'", cli.endpoint_url))?;
    config.s3.ssl = url.scheme() == "https";
    config.s3.host = url
        .host_str()
        .context("endpoint URL has no host")?
        .to_string();
    config.s3.port = url
        .port()
        .unwrap_or(if config.s3.ssl { 443 } else { 80 });
    config.s3.bucket_name = cli.bucket.clone();

    if cli.foreground {
        config.app.foreground = true;
    }
    if cli.path_style {
        config.s3.path_style = true;
    }
    if let Some(dir) = &cli.cache_dir {
        config.filesystem.cache_dir = dir.clone();
    }
    if let Some(part_size) = cli.part_size {
        config.s3.part_size = part_size;
    }
    if cli.disable_stats {
        config.statistics.enabled = false;
    }

    config.apply_env_credentials();
    if config.s3.access_key_id.is_empty() || config.s3.secret_access_key.is_empty() {
        anyhow::bail!(
            "no credentials: set s3.access_key_id / s3.secret_access_key or \
             AWSACCESSKEYID / AWSSECRETACCESSKEY"
        );
    }
    Ok(config)
}

fn init_logging(cli: &Cli, config: &Config) -> anyhow::Result<()> {
    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        config.log.level.parse().unwrap_or(LevelFilter::Info)
    };
    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(level);
    if !config.log.use_color {
        builder.write_style(env_logger::WriteStyle::Never);
    }
    if let Some(path) = &cli.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

fn mount_options(cli: &Cli) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName("bucketfs".to_string()),
        MountOption::AutoUnmount,
    ];
    if let Some(opts) = &cli.fuse_options {
        for opt in opts.split(',').filter(|o| !o.is_empty()) {
            options.push(match opt {
                "allow_other" => MountOption::AllowOther,
                "allow_root" => MountOption::AllowRoot,
                "ro" => MountOption::RO,
                "rw" => MountOption::RW,
                "default_permissions" => MountOption::DefaultPermissions,
                other => MountOption::CUSTOM(other.to_string()),
            });
        }
    }
    options
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_logging(&cli, &config)?;

    if !cli.mountpoint.is_dir() {
        anyhow::bail!("mount point {} is not a directory", cli.mountpoint.display());
    }

    // fork before any runtime or socket exists
    if !config.app.foreground {
        Daemonize::new()
            .working_directory(std::env::current_dir()?)
            .start()
            .context("failed to daemonize")?;
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build the runtime")?;

    let app = AppContext::new(config)?;

    // prove the endpoint and credentials before mounting; a transport
    // failure here aborts the process
    runtime
        .block_on(app.check_bucket())
        .context("startup bucket probe failed")?;

    info!(
        "mounting bucket '{}' at {}",
        app.config.s3.bucket_name,
        cli.mountpoint.display()
    );

    let filesystem = S3Filesystem::new(Arc::clone(&app), runtime);
    fuser::mount2(filesystem, &cli.mountpoint, &mount_options(&cli))
        .context("mount failed")?;

    if app.config.statistics.enabled {
        let cache_stats = app.cache.lock().unwrap().stats();
        info!("session stats: {}", app.stats.snapshot(&cache_stats));
    }
    for pool in [&app.read_pool, &app.write_pool, &app.ops_pool] {
        log::debug!(
            "pool '{}': {} idle, {} waiting",
            pool.name(),
            pool.idle_count(),
            pool.waiting_count()
        );
    }
    info!("unmounted, shutting down");
    Ok(())
}
