//! Hook Deployer
//!
//! Usage:
//! - Normal mode: `hook-deployer`
//! - With custom port: `hook-deployer --port 9876`
//! - Custom manifest: `hook-deployer --manifest /etc/hook-deployer/modules.json`
//! - Deploy pending changes on start: `hook-deployer --deploy-on-start`
//! - Confirm a restart: `hook-deployer confirm api --url http://deploy.internal:9876`

use std::path::PathBuf;

use hook_deployer::RuntimeConfig;

/// 解析命令行参数
fn parse_args() -> RuntimeConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = RuntimeConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" if i + 1 < args.len() => {
                config.port_override = args[i + 1].parse().ok();
                i += 2;
            }
            "--manifest" if i + 1 < args.len() => {
                config.manifest_override = Some(PathBuf::from(&args[i + 1]));
                i += 2;
            }
            "--deploy-on-start" => {
                config.deploy_on_start = true;
                i += 1;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                eprintln!("Ignoring unknown argument: {}", other);
                i += 1;
            }
        }
    }

    config
}

/// `confirm <ENTITY> [--url URL]`
fn run_confirm(args: &[String]) -> anyhow::Result<()> {
    let mut entity = None;
    let mut url = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--url" if i + 1 < args.len() => {
                url = Some(args[i + 1].clone());
                i += 2;
            }
            other if entity.is_none() && !other.starts_with('-') => {
                entity = Some(other.to_string());
                i += 1;
            }
            other => anyhow::bail!("unexpected argument: {}", other),
        }
    }

    let entity = entity.ok_or_else(|| anyhow::anyhow!("usage: hook-deployer confirm <ENTITY> [--url URL]"))?;
    let rt = tokio::runtime::Runtime::new()?;
    let accepted = rt.block_on(hook_deployer::send_confirmation(&entity, url))?;
    println!("{}", if accepted { "accepted" } else { "not pending" });
    Ok(())
}

fn print_help() {
    println!("Hook Deployer - webhook 驱动的部署编排器");
    println!();
    println!("USAGE:");
    println!("    hook-deployer [OPTIONS]");
    println!("    hook-deployer confirm <ENTITY> [--url URL]");
    println!();
    println!("OPTIONS:");
    println!("    --port <PORT>        Override the listening port (env: PORT)");
    println!("    --manifest <PATH>    Module manifest path (env: DEPLOY_MANIFEST)");
    println!("    --deploy-on-start    Deploy changes since the last deployed revision on startup");
    println!("    -h, --help           Print help information");
    println!();
    println!("CONFIRM:");
    println!("    --url <URL>          Deployment server (env: DEPLOY_SERVER_URL, default http://127.0.0.1:$PORT)");
    println!("                         API key is read from DEPLOY_CONFIRM_API_KEY");
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(String::as_str) == Some("confirm") {
        if let Err(e) = run_confirm(&args[2..]) {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
        return;
    }

    let config = parse_args();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(hook_deployer::init_and_run_with_config(config)) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
