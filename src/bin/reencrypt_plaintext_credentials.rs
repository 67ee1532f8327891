use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use credential_vault::{
    config::ConfigLoader,
    credential_store::CredentialStore,
    crypto::{Cipher, CipherConfig},
    db,
    models::Integration,
    repositories::IntegrationRepository,
    telemetry,
};
use sea_orm::EntityTrait;

/// Seal plaintext secrets still stored under integration `settings`.
///
/// Legacy top-level columns are left untouched.
#[derive(Debug, Parser)]
#[command(name = "reencrypt-plaintext-credentials")]
struct Args {
    /// Report what would change without writing
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = ConfigLoader::new()
        .load()
        .context("loading configuration")?;
    telemetry::init_tracing(&config).context("initializing tracing")?;

    let cipher_config = CipherConfig::from_app_config(&config).context("configuring cipher")?;
    if !cipher_config.is_encryption_enabled() {
        bail!("master key not configured; refusing to re-encrypt credentials");
    }

    let db = Arc::new(
        db::init_pool(&config)
            .await
            .context("initializing database connection pool")?,
    );
    let repo = IntegrationRepository::new(Arc::clone(&db));
    let store = CredentialStore::new(Arc::new(Cipher::new(cipher_config)), repo.clone());

    let integrations = Integration::find()
        .all(&*db)
        .await
        .context("querying integrations")?;

    let mut updated_rows = 0usize;
    let mut sealed_leaves = 0usize;

    for model in integrations {
        let (settings, changed) = store
            .reseal_settings(&model)
            .with_context(|| format!("resealing settings for integration {}", model.id))?;
        if changed == 0 {
            continue;
        }

        tracing::info!(
            integration_id = %model.id,
            tenant_id = %model.tenant_id,
            changed,
            dry_run = args.dry_run,
            "Sealing plaintext credentials"
        );

        if !args.dry_run {
            repo.update_settings(model.id, settings)
                .await
                .with_context(|| format!("updating integration {}", model.id))?;
        }
        updated_rows += 1;
        sealed_leaves += changed;
    }

    let verb = if args.dry_run { "Would re-encrypt" } else { "Re-encrypted" };
    println!(
        "{} {} value(s) across {} integration(s).",
        verb, sealed_leaves, updated_rows
    );

    Ok(())
}
