//! Initialize command.

use console::style;

use crate::config::{Settings, StorageBackend};

/// Create the data directory and bring the database schema up to date.
pub async fn cmd_init(settings: &Settings) -> anyhow::Result<()> {
    settings.ensure_directories()?;

    let ctx = settings.create_db_context();
    let applied = ctx.migrate().await?;

    for name in &applied {
        println!("  {} Applied migration {}", style("✓").green(), name);
    }
    if applied.is_empty() {
        println!("  {} Database already up to date", style("✓").green());
    }

    match &settings.storage {
        StorageBackend::Local(root) => {
            println!("  Storage: {}", root.display());
        }
        StorageBackend::S3 { bucket, region, .. } => {
            println!("  Storage: s3://{} ({})", bucket, region);
        }
    }

    println!(
        "{} Initialized drawmeta in {}",
        style("✓").green(),
        settings.data_dir.display()
    );

    Ok(())
}
