use std::path::PathBuf;

use clap::Parser;
use uuid::Uuid;

/// Fleet agent: advertises this host's GPUs and runs sessions placed on it.
#[derive(Parser, Debug)]
#[command(name = "fleet-agent", version, about)]
pub struct Cli {
    /// Address to bind the local HTTP API on.
    #[arg(long, env = "FLEET_AGENT_ADDRESS", default_value = "0.0.0.0:43220")]
    pub address: String,

    /// Controller base URL, e.g. http://controller:43210.
    /// The agent runs standalone when unset.
    #[arg(long, env = "FLEET_CONTROLLER")]
    pub controller: Option<String>,

    /// Bearer token for controller calls.
    #[arg(long, env = "AUTH0_AGENT_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,

    /// Address clients can reach this agent on. Required with --controller.
    #[arg(long, env = "FLEET_EXPOSE")]
    pub expose: Option<String>,

    /// Rejoin the controller under a previously assigned agent id.
    #[arg(long, env = "FLEET_AGENT_ID")]
    pub agent_id: Option<Uuid>,

    /// Pool to join.
    #[arg(long, env = "FLEET_POOL")]
    pub pool: Option<Uuid>,

    /// key=value[,key=value] labels advertised for session matching.
    #[arg(long, env = "FLEET_LABELS", default_value = "")]
    pub labels: String,

    /// key=value[,key=value] taints sessions must tolerate.
    #[arg(long, env = "FLEET_TAINTS", default_value = "")]
    pub taints: String,

    /// GPU enumeration helper; prints a JSON device list on stdout.
    #[arg(long, env = "FLEET_RENDERER_PATH")]
    pub renderer_path: Option<PathBuf>,

    /// Advertise N synthetic 24 GB devices instead of probing hardware.
    #[arg(long, env = "FLEET_SYNTHETIC_GPUS", default_value_t = 0)]
    pub synthetic_gpus: u32,
}

impl Cli {
    /// Configuration mistakes that must stop startup (exit code 1).
    pub fn validate(&self) -> Result<(), String> {
        if self.controller.is_some() && self.expose.is_none() {
            return Err("--expose is required when --controller is set".to_string());
        }
        if self.renderer_path.is_none() && self.synthetic_gpus == 0 {
            return Err(
                "either --renderer-path or --synthetic-gpus must be provided".to_string(),
            );
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("fleet-agent").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_controller_requires_expose() {
        let cli = parse(&["--controller", "http://c:43210", "--synthetic-gpus", "1"]);
        assert!(cli.validate().is_err());

        let cli = parse(&[
            "--controller",
            "http://c:43210",
            "--expose",
            "10.0.0.5:43220",
            "--synthetic-gpus",
            "1",
        ]);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_gpu_source_required() {
        let cli = parse(&[]);
        assert!(cli.validate().is_err());

        let cli = parse(&["--synthetic-gpus", "2"]);
        assert!(cli.validate().is_ok());
    }
}
