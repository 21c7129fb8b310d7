use clap::Parser;

/// Command-line surface for the broker binary.
#[derive(Debug, Parser)]
#[command(name = "copilot-bridge", about = "Remote-control bridge for an interactive coding-agent CLI")]
pub struct Cli {
    /// Listen on this port (0 = random).
    #[arg(long, default_value_t = 0)]
    pub port: u16,

    /// Start the tunnel supervisor.
    #[arg(long, default_value_t = false)]
    pub tunnel: bool,

    /// Use a persistent tunnel with this name.
    #[arg(long)]
    pub tunnel_id: Option<String>,

    /// Disable the tunnel even if --tunnel-id was given.
    #[arg(long, default_value_t = false)]
    pub no_tunnel: bool,

    /// Pass --allow-anonymous through to the tunnel CLI.
    #[arg(long, default_value_t = false)]
    pub allow_anonymous: bool,

    /// Default working directory for agent subprocesses.
    #[arg(long)]
    pub cwd: Option<String>,
}

/// Resolved broker configuration: CLI flags merged with environment overrides.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub tunnel_enabled: bool,
    pub tunnel_id: Option<String>,
    pub allow_anonymous: bool,
    pub default_cwd: String,
    pub agent_command: String,
    pub agent_args: Vec<String>,
    pub skills_dirs: Option<String>,
}

impl Config {
    pub fn from_env_and_cli(cli: &Cli) -> Self {
        Self::from_raw_values(
            cli.port,
            cli.tunnel,
            cli.no_tunnel,
            cli.tunnel_id.clone(),
            cli.allow_anonymous,
            cli.cwd.clone(),
            std::env::var("COPILOT_COMMAND").ok().as_deref(),
            std::env::var("COPILOT_SKILLS_DIRS").ok().as_deref(),
        )
    }

    /// Build a Config from raw values, mirroring the CLI/env inputs directly.
    /// Kept separate from `from_env_and_cli` so tests can exercise the merge
    /// logic without mutating process-global environment or parsing argv.
    #[allow(clippy::too_many_arguments)]
    pub fn from_raw_values(
        port: u16,
        tunnel_flag: bool,
        no_tunnel: bool,
        tunnel_id: Option<String>,
        allow_anonymous: bool,
        cwd: Option<String>,
        agent_command_override: Option<&str>,
        skills_dirs: Option<&str>,
    ) -> Self {
        let tunnel_enabled = !no_tunnel && (tunnel_flag || tunnel_id.is_some());

        let default_cwd = cwd.unwrap_or_else(|| {
            std::env::current_dir()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|_| ".".to_string())
        });

        let (agent_command, agent_args) = match agent_command_override.filter(|s| !s.is_empty()) {
            Some(raw) => {
                let mut parts = raw.split_whitespace();
                let command = parts.next().unwrap_or("copilot").to_string();
                let args = parts.map(String::from).collect();
                (command, args)
            }
            None => ("copilot".to_string(), Vec::new()),
        };

        let skills_dirs = skills_dirs.filter(|s| !s.is_empty()).map(String::from);

        Config {
            port,
            tunnel_enabled,
            tunnel_id,
            allow_anonymous,
            default_cwd,
            agent_command,
            agent_args,
            skills_dirs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_agent_command_is_copilot_with_no_args() {
        let cfg = Config::from_raw_values(0, false, false, None, false, Some("/tmp".into()), None, None);
        assert_eq!(cfg.agent_command, "copilot");
        assert!(cfg.agent_args.is_empty());
    }

    #[test]
    fn agent_command_override_splits_on_whitespace() {
        let cfg = Config::from_raw_values(
            0,
            false,
            false,
            None,
            false,
            Some("/tmp".into()),
            Some("my-agent --flag value"),
            None,
        );
        assert_eq!(cfg.agent_command, "my-agent");
        assert_eq!(cfg.agent_args, vec!["--flag", "value"]);
    }

    #[test]
    fn empty_skills_dirs_is_none() {
        let cfg = Config::from_raw_values(0, false, false, None, false, Some("/tmp".into()), None, Some(""));
        assert!(cfg.skills_dirs.is_none());
    }

    #[test]
    fn tunnel_enabled_by_flag() {
        let cfg = Config::from_raw_values(0, true, false, None, false, Some("/tmp".into()), None, None);
        assert!(cfg.tunnel_enabled);
    }

    #[test]
    fn tunnel_enabled_by_tunnel_id_alone() {
        let cfg = Config::from_raw_values(0, false, false, Some("prod".into()), false, Some("/tmp".into()), None, None);
        assert!(cfg.tunnel_enabled);
    }

    #[test]
    fn no_tunnel_overrides_tunnel_id() {
        let cfg = Config::from_raw_values(0, false, true, Some("prod".into()), false, Some("/tmp".into()), None, None);
        assert!(!cfg.tunnel_enabled);
    }
}
