use clap::Parser;

/// Fleet controller: accepts agent registrations, queues session requests,
/// and places them onto agents with free GPU capacity.
#[derive(Parser, Debug)]
#[command(name = "fleet-controller", version, about)]
pub struct Cli {
    /// Address to bind the HTTP API on.
    #[arg(long, env = "FLEET_CONTROLLER_ADDRESS", default_value = "0.0.0.0:43210")]
    pub address: String,

    /// Postgres connection URL. Falls back to the PG_* environment variables.
    #[arg(long, env = "PG_URL")]
    pub database_url: Option<String>,

    /// Static bearer token required on API calls. Auth is disabled when unset.
    #[arg(long, env = "FLEET_ACCESS_TOKEN")]
    pub access_token: Option<String>,
}

impl Cli {
    /// Resolve the database URL from the flag or the PG_* environment.
    pub fn resolved_database_url(&self) -> String {
        match &self.database_url {
            Some(url) => url.clone(),
            None => fleet_core::config::PostgresConfig::from_env().database_url(),
        }
    }
}
