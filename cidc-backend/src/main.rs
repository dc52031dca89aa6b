use clap::Parser;
use cidc_backend::{
    config::{Cli, Command, CommonArgs},
    disable_inactive_users, refresh_download_permissions, serve, sync_blobs,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().unwrap_or_default();
    let Cli { command } = Cli::parse();

    match command {
        Command::Serve(CommonArgs { config, log_dir }) => serve(config, log_dir).await?,
        Command::SyncBlobs {
            common: CommonArgs { config, log_dir },
            dry_run,
        } => {
            let errors = sync_blobs(config, log_dir, dry_run).await?;
            if !errors.is_empty() {
                anyhow::bail!("{} trials failed to sync:\n{}", errors.len(), errors.join("\n"));
            }
        }
        Command::DisableInactiveUsers(CommonArgs { config, log_dir }) => {
            for email in disable_inactive_users(config, log_dir).await? {
                println!("{email}");
            }
        }
        Command::RefreshDownloadPermissions(CommonArgs { config, log_dir }) => {
            let n_refreshed = refresh_download_permissions(config, log_dir).await?;
            println!("refreshed {n_refreshed} permissions");
        }
    }

    Ok(())
}
