use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cloud_storage::config::{self, ConfigTokenStore};
use cloud_storage::{BackupAccount, ClientOptions, ProviderTag, StorageError, StorageManager, TokenStore};

/// Operator CLI over the configured backup accounts / 备份账户命令行工具
#[derive(Parser, Debug)]
#[clap(name = "cloud-storage", version, long_version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("BUILD_TARGET"), ", built ", env!("BUILD_TIME"), ")"))]
struct Cli {
    /// Path of config.json (default: ./config.json)
    #[clap(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List supported provider tags
    Providers,

    /// List buckets visible to an account
    Buckets {
        account: String,
    },

    /// List names directly under a prefix
    Ls {
        account: String,
        #[clap(default_value = "/")]
        prefix: String,
    },

    /// Check whether an object exists
    Exist {
        account: String,
        path: String,
    },

    /// Print the size of an object in bytes
    Size {
        account: String,
        path: String,
    },

    /// Upload a local file
    Upload {
        account: String,
        #[clap(help = "Local file path")]
        src: PathBuf,
        #[clap(help = "Remote destination path")]
        dst: String,
    },

    /// Download an object to a local path
    Download {
        account: String,
        #[clap(help = "Remote source path")]
        src: String,
        #[clap(help = "Local destination path")]
        dst: PathBuf,
    },

    /// Delete an object (succeeds when already absent)
    Rm {
        account: String,
        path: String,
    },

    /// Exchange the account's refresh token and save the rotated one
    RefreshToken {
        account: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(config::get_config_path);

    let shared = match config::init_config(&config_path) {
        Ok(shared) => shared,
        Err(e) => {
            eprintln!("error [InvalidConfig]: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let log_filter = shared.read().log_filter.clone();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| log_filter.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(cli.command, config_path).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<StorageError>() {
                Some(e) => eprintln!("error [{}]: {}", e.kind(), e.message()),
                None => eprintln!("error: {:#}", err),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, config_path: PathBuf) -> anyhow::Result<()> {
    let shared = config::get_config();
    let store: Arc<dyn TokenStore> = Arc::new(ConfigTokenStore::new(&config_path, shared.clone()));
    let options = ClientOptions {
        token_store: Some(store.clone()),
        ..shared.read().client_options()
    };
    let manager = StorageManager::new(options);
    let account = |name: &str| -> anyhow::Result<BackupAccount> {
        shared
            .read()
            .account(name)
            .cloned()
            .ok_or_else(|| anyhow!("account {} not found in {}", name, config_path.display()))
    };

    match command {
        Command::Providers => {
            for tag in ProviderTag::ALL {
                let kind = if tag.is_oauth() { "oauth" } else { "credentials" };
                println!("{:<10} {}", tag.as_str(), kind);
            }
        }
        Command::Buckets { account: name } => {
            let client = manager.get_or_connect(&account(&name)?).await?;
            for bucket in client.list_buckets().await? {
                println!("{}", bucket);
            }
        }
        Command::Ls { account: name, prefix } => {
            let client = manager.get_or_connect(&account(&name)?).await?;
            for entry in client.list_objects(&prefix).await? {
                println!("{}", entry);
            }
        }
        Command::Exist { account: name, path } => {
            let client = manager.get_or_connect(&account(&name)?).await?;
            println!("{}", client.exist(&path).await?);
        }
        Command::Size { account: name, path } => {
            let client = manager.get_or_connect(&account(&name)?).await?;
            println!("{}", client.size(&path).await?);
        }
        Command::Upload { account: name, src, dst } => {
            let client = manager.get_or_connect(&account(&name)?).await?;
            client.upload(&src, &dst).await?;
            println!("uploaded {} -> {}:{}", src.display(), name, dst);
        }
        Command::Download { account: name, src, dst } => {
            let client = manager.get_or_connect(&account(&name)?).await?;
            client.download(&src, &dst).await?;
            println!("downloaded {}:{} -> {}", name, src, dst.display());
        }
        Command::Rm { account: name, path } => {
            let client = manager.get_or_connect(&account(&name)?).await?;
            client.delete(&path).await?;
            println!("deleted {}:{}", name, path);
        }
        Command::RefreshToken { account: name } => {
            let row = account(&name)?;
            let token = cloud_storage::refresh_token(&row.provider, &row.client_vars()).await?;
            store
                .persist(&row.name, &token)
                .await
                .context("saving the refreshed token")?;
            println!("refresh token updated for {}", name);
        }
    }
    Ok(())
}
