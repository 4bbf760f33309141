use anyhow::Result;
use clap::{Parser, Subcommand};
use powerpack_local::{env_nonempty, Capabilities};
use tracing_subscriber::EnvFilter;

#[cfg(feature = "stdio")]
mod mcp;

#[derive(Parser, Debug)]
#[command(name = "research-powerpack")]
#[command(about = "Research tools for agents (MCP stdio server)", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as an MCP stdio server.
    #[cfg(feature = "stdio")]
    McpStdio,
    /// Diagnose configuration/launch issues (no secrets).
    Doctor(DoctorCmd),
    /// Print version information.
    Version(VersionCmd),
}

#[derive(clap::Args, Debug)]
struct DoctorCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
    /// Spawn `research-powerpack mcp-stdio` and call `list_tools` to prove the server starts.
    ///
    /// No network calls are made and no secret values are printed.
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    check_stdio: bool,
    /// Timeout for the stdio handshake (ms).
    #[arg(long, env = "POWERPACK_DOCTOR_TIMEOUT_MS", default_value_t = 3000)]
    timeout_ms: u64,
}

#[derive(clap::Args, Debug)]
struct VersionCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

/// Logs go to stderr: stdout belongs to the MCP transport.
fn init_tracing() {
    let spec = env_nonempty("POWERPACK_LOG")
        .or_else(|| env_nonempty("RUST_LOG"))
        .unwrap_or_else(|| "warn".to_string());
    let filter = EnvFilter::try_new(&spec).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}

struct HandshakeCheck {
    ok: Option<bool>,
    tool_count: Option<usize>,
    elapsed_ms: Option<u128>,
    error: Option<serde_json::Value>,
}

#[cfg(feature = "stdio")]
async fn stdio_handshake(timeout_ms: u64) -> Result<HandshakeCheck> {
    use rmcp::service::ServiceExt;
    use rmcp::transport::{ConfigureCommandExt, TokioChildProcess};
    use tokio::process::Command;

    let exe = std::env::current_exe()
        .unwrap_or_else(|_| std::path::PathBuf::from("research-powerpack"));
    let child = TokioChildProcess::new(Command::new(exe).configure(|cmd| {
        cmd.args(["mcp-stdio"]);
        cmd.env("POWERPACK_LOG", "error");
    }))?;

    let service = ().serve(child).await?;
    let t0 = std::time::Instant::now();
    let res = tokio::time::timeout(
        std::time::Duration::from_millis(timeout_ms),
        service.list_tools(Default::default()),
    )
    .await;
    let mut check = HandshakeCheck {
        ok: None,
        tool_count: None,
        elapsed_ms: Some(t0.elapsed().as_millis()),
        error: None,
    };
    match res {
        Ok(Ok(tools)) => {
            check.ok = Some(true);
            check.tool_count = Some(tools.tools.len());
        }
        Ok(Err(e)) => {
            check.ok = Some(false);
            check.error = Some(serde_json::json!({
                "code": "handshake_failed",
                "message": e.to_string(),
                "hint": "The child closed the stdio transport early. Check that nothing prints to stdout in mcp-stdio mode and that the binary path is correct."
            }));
        }
        Err(_elapsed) => {
            check.ok = Some(false);
            check.error = Some(serde_json::json!({
                "code": "timeout",
                "message": format!("stdio handshake timed out after {timeout_ms}ms"),
                "hint": "The child did not answer list_tools in time; check for a stuck startup."
            }));
        }
    }
    let _ = service.cancel().await;
    Ok(check)
}

async fn doctor(args: DoctorCmd) -> Result<()> {
    let t0 = std::time::Instant::now();
    let caps = Capabilities::from_env();
    let mut checks: Vec<serde_json::Value> = Vec::new();

    if let Some(p) = env_nonempty("POWERPACK_ENV_FILE") {
        let readable = std::fs::metadata(&p).is_ok_and(|m| m.is_file());
        checks.push(serde_json::json!({
            "name": "env_file_readable",
            "ok": readable,
            "skipped": false,
            "message": if readable { "POWERPACK_ENV_FILE is readable" } else { "POWERPACK_ENV_FILE is not readable" },
            "hint": if readable { "" } else { "Point POWERPACK_ENV_FILE at an existing KEY=VALUE file." },
        }));
    }

    let mut hs = HandshakeCheck {
        ok: None,
        tool_count: None,
        elapsed_ms: None,
        error: None,
    };
    #[cfg(feature = "stdio")]
    if args.check_stdio {
        hs = stdio_handshake(args.timeout_ms).await?;
    }
    #[cfg(not(feature = "stdio"))]
    if args.check_stdio {
        hs.ok = Some(false);
    }
    let hs_ok = hs.ok.unwrap_or(false);
    checks.push(serde_json::json!({
        "name": "mcp_stdio_handshake",
        "ok": if args.check_stdio { hs_ok } else { true },
        "skipped": !args.check_stdio,
        "message": if !args.check_stdio {
            "stdio MCP handshake skipped"
        } else if hs_ok {
            "stdio MCP handshake succeeded"
        } else {
            "stdio MCP handshake failed"
        },
        "hint": if !args.check_stdio || hs_ok {
            ""
        } else if cfg!(feature = "stdio") {
            "Check that the MCP client launches this binary with args [\"mcp-stdio\"]."
        } else {
            "`mcp-stdio` requires building with feature `stdio`."
        },
        "tool_count": hs.tool_count,
        "elapsed_ms": hs.elapsed_ms,
        "error": hs.error,
    }));

    let ok = checks.iter().all(|c| c["ok"].as_bool().unwrap_or(false));
    let missing = Capabilities::missing_env();
    let payload = serde_json::json!({
        "schema_version": 1,
        "kind": "doctor",
        "ok": ok,
        "name": "research-powerpack",
        "version": env!("CARGO_PKG_VERSION"),
        "platform": {
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
        },
        "features": {
            "stdio": cfg!(feature = "stdio"),
        },
        "elapsed_ms": t0.elapsed().as_millis(),
        "configured": caps,
        "enabled_tools": caps.enabled_tools(),
        "missing_env": missing,
        "checks": checks,
    });

    match args.output.to_ascii_lowercase().as_str() {
        "text" => {
            println!("research-powerpack {} (ok={})", env!("CARGO_PKG_VERSION"), ok);
            println!(
                "configured: search={} reddit={} scraping={} llm={}",
                caps.search, caps.reddit, caps.scraping, caps.llm
            );
            let enabled = caps.enabled_tools();
            println!(
                "tools: {}",
                if enabled.is_empty() { "none".to_string() } else { enabled.join(", ") }
            );
            if !missing.is_empty() {
                println!("missing env: {}", missing.join(", "));
            }
            println!("checks:");
            for c in &checks {
                let name = c["name"].as_str().unwrap_or("?");
                if c["skipped"].as_bool().unwrap_or(false) {
                    println!("- {name}: skipped");
                } else {
                    let ok = c["ok"].as_bool().unwrap_or(false);
                    println!("- {name}: {}", if ok { "ok" } else { "fail" });
                }
            }
        }
        _ => println!("{payload}"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    // Optional KEY=VALUE file for MCP hosts that do not pass a shell environment.
    let loaded = powerpack_local::load_env_file_from_env();
    if loaded > 0 {
        tracing::debug!(target: "powerpack::config", vars = loaded, "loaded POWERPACK_ENV_FILE");
    }

    let cli = Cli::parse();
    match cli.command {
        #[cfg(feature = "stdio")]
        Commands::McpStdio => {
            mcp::serve_stdio()
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        }
        Commands::Doctor(args) => doctor(args).await?,
        Commands::Version(args) => {
            let v = serde_json::json!({
                "schema_version": 1,
                "kind": "version",
                "ok": true,
                "name": "research-powerpack",
                "version": env!("CARGO_PKG_VERSION"),
            });
            match args.output.to_ascii_lowercase().as_str() {
                "text" => println!("research-powerpack {}", env!("CARGO_PKG_VERSION")),
                _ => println!("{v}"),
            }
        }
    }
    Ok(())
}
