use std::path::PathBuf;
use std::process::ExitCode;

use tracing_subscriber::EnvFilter;
use unicontact_rs::config::{ConfigOverrides, StorageOverrides};
use unicontact_rs::{reconciler_from_config, ServiceConfig, StorageBackend};

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

fn overrides() -> ConfigOverrides {
    let data_dir = parse_arg("--data-dir").map(PathBuf::from);
    let repair = has_flag("--repair").then_some(true);
    if data_dir.is_none() && repair.is_none() {
        return ConfigOverrides::default();
    }
    ConfigOverrides {
        storage: Some(StorageOverrides {
            // A data directory on the command line means a persistent store.
            backend: data_dir.as_ref().map(|_| StorageBackend::Rocksdb),
            data_dir,
            repair,
        }),
    }
}

async fn run() -> anyhow::Result<()> {
    let config_path = parse_arg("--config");
    let config = ServiceConfig::load(config_path.as_deref(), overrides())?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log.filter))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let email = parse_arg("--email");
    let phone = parse_arg("--phone");

    let reconciler = reconciler_from_config(&config)?;
    let response = reconciler
        .identify(email.as_deref(), phone.as_deref())
        .await?;

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("unicontact_identify: {err:#}");
            ExitCode::FAILURE
        }
    }
}
