//! ProjectGate server binary.

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use projectgate_web::auth::RateKeyMode;
use projectgate_web::AuthSettings;

#[derive(Parser)]
#[command(name = "projectgate")]
#[command(about = "ProjectGate authentication and access-control service")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "PROJECTGATE_CONFIG", default_value = "projectgate.toml")]
    config: PathBuf,

    /// HTTP listen address
    #[arg(short, long, env = "PROJECTGATE_LISTEN")]
    listen: Option<String>,

    /// SQLite database path (`:memory:` for an ephemeral store)
    #[arg(long, env = "PROJECTGATE_DB_PATH")]
    db_path: Option<String>,

    #[arg(long, env = "PROJECTGATE_ACCESS_TOKEN_SECRET", hide_env_values = true)]
    access_token_secret: Option<String>,

    /// Comma-separated retired access secrets, most recent first
    #[arg(long, env = "PROJECTGATE_ACCESS_TOKEN_FALLBACK_SECRETS", hide_env_values = true)]
    access_token_fallback_secrets: Option<String>,

    #[arg(long, env = "PROJECTGATE_REFRESH_TOKEN_SECRET", hide_env_values = true)]
    refresh_token_secret: Option<String>,

    /// Comma-separated retired refresh secrets, most recent first
    #[arg(long, env = "PROJECTGATE_REFRESH_TOKEN_FALLBACK_SECRETS", hide_env_values = true)]
    refresh_token_fallback_secrets: Option<String>,

    #[arg(long, env = "PROJECTGATE_ACCESS_TOKEN_TTL_SECS")]
    access_token_ttl_secs: Option<i64>,

    #[arg(long, env = "PROJECTGATE_REFRESH_TOKEN_TTL_SECS")]
    refresh_token_ttl_secs: Option<i64>,

    #[arg(long, env = "PROJECTGATE_RATE_LIMIT_MAX_ATTEMPTS")]
    rate_limit_max_attempts: Option<u32>,

    #[arg(long, env = "PROJECTGATE_RATE_LIMIT_WINDOW_MS")]
    rate_limit_window_ms: Option<i64>,

    /// What a login rate window is keyed on
    #[arg(long, env = "PROJECTGATE_RATE_LIMIT_KEY", value_enum)]
    rate_limit_key: Option<RateKeyMode>,

    #[arg(long, env = "PROJECTGATE_PASSWORD_MIN_LENGTH")]
    password_min_length: Option<usize>,

    /// Sysadmin account created at startup when absent
    #[arg(long, env = "PROJECTGATE_BOOTSTRAP_ADMIN_EMAIL")]
    bootstrap_admin_email: Option<String>,

    #[arg(long, env = "PROJECTGATE_BOOTSTRAP_ADMIN_PASSWORD", hide_env_values = true)]
    bootstrap_admin_password: Option<String>,

    /// Emit logs as JSON
    #[arg(long, env = "PROJECTGATE_LOG_JSON")]
    log_json: bool,
}

impl Cli {
    fn apply(self, settings: &mut AuthSettings) {
        if let Some(v) = self.listen {
            settings.listen = v;
        }
        if let Some(v) = self.db_path {
            settings.db_path = v;
        }
        if self.access_token_secret.is_some() {
            settings.access_token_secret = self.access_token_secret;
        }
        if self.access_token_fallback_secrets.is_some() {
            settings.access_token_fallback_secrets = self.access_token_fallback_secrets;
        }
        if self.refresh_token_secret.is_some() {
            settings.refresh_token_secret = self.refresh_token_secret;
        }
        if self.refresh_token_fallback_secrets.is_some() {
            settings.refresh_token_fallback_secrets = self.refresh_token_fallback_secrets;
        }
        if let Some(v) = self.access_token_ttl_secs {
            settings.access_token_ttl_secs = v;
        }
        if let Some(v) = self.refresh_token_ttl_secs {
            settings.refresh_token_ttl_secs = v;
        }
        if let Some(v) = self.rate_limit_max_attempts {
            settings.rate_limit_max_attempts = v;
        }
        if let Some(v) = self.rate_limit_window_ms {
            settings.rate_limit_window_ms = v;
        }
        if let Some(v) = self.rate_limit_key {
            settings.rate_limit_key = v;
        }
        if let Some(v) = self.password_min_length {
            settings.password_min_length = v;
        }
        if self.bootstrap_admin_email.is_some() {
            settings.bootstrap_admin_email = self.bootstrap_admin_email;
        }
        if self.bootstrap_admin_password.is_some() {
            settings.bootstrap_admin_password = self.bootstrap_admin_password;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    info!("ProjectGate v{}", env!("CARGO_PKG_VERSION"));

    let mut settings = AuthSettings::load(&cli.config)?;
    cli.apply(&mut settings);

    let config = match settings.validate() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Refusing to start with invalid configuration");
            return Err(e.into());
        }
    };

    projectgate_web::serve(config).await
}
