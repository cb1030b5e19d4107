use std::path::Path;

use anyhow::{Context, Result};
use console::style;

use crate::config::{AppConfig, DbBackend, DbConfig};
use crate::core::store::{self, SCHEMA_VERSION};
use crate::core::terminal::{GuideSection, print_info, print_success};
use crate::logging;

/// Where the schema will be written, with any password masked.
pub(crate) fn describe_target(cfg: &DbConfig) -> Result<String> {
    Ok(match cfg.backend()? {
        DbBackend::Embedded => cfg.embedded_path().display().to_string(),
        DbBackend::Server => redact_password(&cfg.server.connection_url()),
    })
}

fn redact_password(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((userinfo, host)) = rest.rsplit_once('@') else {
        return url.to_string();
    };
    match userinfo.split_once(':') {
        Some((user, _)) => format!("{}://{}:***@{}", scheme, user, host),
        None => url.to_string(),
    }
}

/// Open the configured database, which creates or upgrades the schema, and
/// report what was done.
pub async fn run_migrate(config_path: Option<&Path>) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    logging::init_tracing(&config.logging, true);

    let target = describe_target(&config.db)?;
    print_info(&format!("Preparing schema v{} at {}", SCHEMA_VERSION, target));

    let db = store::connect(&config.db)
        .await
        .with_context(|| format!("could not open the database at {}", target))?;
    db.health_check().await.context("database health check failed")?;

    let profiles = db.list_profiles(Default::default()).await?.len();
    let policies = db.list_policies(Default::default()).await?.len();
    db.close().await;

    print_success("Schema is up to date.");
    GuideSection::new("Database")
        .status("Dialect", db.dialect().as_str())
        .status("Target", &target)
        .status(
            "Schema",
            &format!("{}", style(format!("v{}", SCHEMA_VERSION)).cyan()),
        )
        .status("Profiles", &profiles.to_string())
        .status("Policies", &policies.to_string())
        .print();
    println!();
    print_info("Run 'agent-core serve' to start the service.");
    Ok(())
}
