mod client;
mod migrate;
mod serve;

use std::path::PathBuf;

use anyhow::{Context, Result};
use console::style;

use crate::config::AppConfig;
use crate::core::terminal::{self, GuideSection, print_error};
use crate::core::tools::ToolRegistry;

const DEFAULT_API_URL: &str = "http://127.0.0.1:17890";

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Service")
        .command("serve", "Start the scheduler and the HTTP API")
        .command("migrate", "Create or upgrade the database schema")
        .print();

    GuideSection::new("Tools")
        .command("manifest", "Print the tool manifest as JSON")
        .command("call <tool>", "Call a tool on a running service")
        .command("runs", "List runs on a running service")
        .print();

    GuideSection::new("Options")
        .text("--config <path>      Configuration file (serve, migrate)")
        .text("--api-host <host>    Bind address override (serve)")
        .text("--api-port <port>    Port override (serve)")
        .text("--json <args>        Tool arguments as a JSON object (call)")
        .text("--status <list>      Comma-separated status filter (runs)")
        .text("--api-url <url>      Service address (call, runs)")
        .blank()
        .hint("agent-core serve --api-port 18000", "")
        .hint(
            "agent-core call spawn_coding_agent --json '{\"task\":\"fix the build\"}'",
            "",
        )
        .hint("agent-core runs --status running,pending", "")
        .print();

    println!(
        "\n {} {} <command> [options]\n",
        style("Usage:").bold(),
        style("agent-core").green()
    );
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ServeFlags {
    pub config: Option<PathBuf>,
    pub api_host: Option<String>,
    pub api_port: Option<u16>,
}

pub(crate) fn parse_serve_flags(args: &[String], start: usize) -> Result<ServeFlags> {
    let mut flags = ServeFlags::default();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    flags.config = Some(PathBuf::from(&args[i + 1]));
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--api-host" => {
                if i + 1 < args.len() {
                    flags.api_host = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--api-port" => {
                if i + 1 < args.len() {
                    let port = args[i + 1]
                        .parse()
                        .with_context(|| format!("invalid --api-port '{}'", args[i + 1]))?;
                    flags.api_port = Some(port);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    Ok(flags)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ClientFlags {
    pub api_url: String,
    pub json: Option<String>,
    pub status: Option<String>,
}

pub(crate) fn parse_client_flags(args: &[String], start: usize) -> ClientFlags {
    let mut flags = ClientFlags {
        api_url: DEFAULT_API_URL.to_string(),
        json: None,
        status: None,
    };
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--api-url" => {
                if i + 1 < args.len() {
                    flags.api_url = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--json" => {
                if i + 1 < args.len() {
                    flags.json = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--status" => {
                if i + 1 < args.len() {
                    flags.status = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    flags
}

/// Merge command-line overrides into the loaded configuration.
pub(crate) fn apply_serve_flags(config: &mut AppConfig, flags: &ServeFlags) {
    if let Some(host) = &flags.api_host {
        config.server.host = host.clone();
    }
    if let Some(port) = flags.api_port {
        config.server.port = port;
    }
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let Some(cmd) = args.get(1).map(String::as_str) else {
        print_help();
        return Ok(());
    };

    match cmd {
        "serve" => {
            let flags = parse_serve_flags(&args, 2)?;
            serve::run_serve(&flags).await
        }
        "migrate" => {
            let flags = parse_serve_flags(&args, 2)?;
            migrate::run_migrate(flags.config.as_deref()).await
        }
        "manifest" => {
            let manifest = ToolRegistry::with_builtin()
                .combined_manifest(crate::core::tools::definitions::scenario());
            println!("{}", serde_json::to_string_pretty(&manifest)?);
            Ok(())
        }
        "call" => {
            let Some(tool) = args.get(2).filter(|t| !t.starts_with("--")) else {
                print_error("Usage: agent-core call <tool> [--json ARGS] [--api-url URL]");
                return Ok(());
            };
            let flags = parse_client_flags(&args, 3);
            client::call_tool(&flags, tool).await
        }
        "runs" => {
            let flags = parse_client_flags(&args, 2);
            client::list_runs(&flags).await
        }
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        _ => {
            print_error(&format!("Unknown command: {}", cmd));
            print_help();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ServeFlags, apply_serve_flags, parse_client_flags, parse_serve_flags};
    use crate::config::AppConfig;
    use std::path::PathBuf;

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_serve_flags_reads_config_host_and_port() {
        let args = argv(&[
            "agent-core",
            "serve",
            "--config",
            "/etc/agent-core.toml",
            "--api-host",
            "0.0.0.0",
            "--api-port",
            "19000",
        ]);
        let flags = parse_serve_flags(&args, 2).unwrap();
        assert_eq!(flags.config, Some(PathBuf::from("/etc/agent-core.toml")));
        assert_eq!(flags.api_host.as_deref(), Some("0.0.0.0"));
        assert_eq!(flags.api_port, Some(19000));
    }

    #[test]
    fn parse_serve_flags_rejects_bad_port() {
        let args = argv(&["agent-core", "serve", "--api-port", "lots"]);
        let err = parse_serve_flags(&args, 2).unwrap_err();
        assert!(err.to_string().contains("--api-port"));
    }

    #[test]
    fn parse_serve_flags_ignores_dangling_flag() {
        let args = argv(&["agent-core", "serve", "--config"]);
        assert_eq!(parse_serve_flags(&args, 2).unwrap(), ServeFlags::default());
    }

    #[test]
    fn parse_client_flags_reads_url_json_and_status() {
        let args = argv(&[
            "agent-core",
            "call",
            "check_agent_status",
            "--json",
            "{\"run_id\":\"x\"}",
            "--api-url",
            "http://127.0.0.1:19090",
        ]);
        let flags = parse_client_flags(&args, 3);
        assert_eq!(flags.api_url, "http://127.0.0.1:19090");
        assert_eq!(flags.json.as_deref(), Some("{\"run_id\":\"x\"}"));
        assert_eq!(flags.status, None);

        let args = argv(&["agent-core", "runs", "--status", "running,pending"]);
        let flags = parse_client_flags(&args, 2);
        assert_eq!(flags.api_url, super::DEFAULT_API_URL);
        assert_eq!(flags.status.as_deref(), Some("running,pending"));
    }

    #[test]
    fn serve_flags_override_config() {
        let mut config = AppConfig::default();
        let before = config.server.host.clone();
        apply_serve_flags(
            &mut config,
            &ServeFlags {
                api_port: Some(18000),
                ..ServeFlags::default()
            },
        );
        assert_eq!(config.server.port, 18000);
        assert_eq!(config.server.host, before);
    }
}
