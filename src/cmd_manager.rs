use crate::args::ManagerCommands;
use anyhow::Result;
use relkv::client::ManagerClient;
use relkv::config::ManagerConfig;
use relkv::manager::ManagerServer;
use relkv::pidfile::PidFile;

pub async fn cmd_manager(command: ManagerCommands) -> Result<()> {
    match command {
        ManagerCommands::Run => cmd_manager_run().await,
        ManagerCommands::Start => cmd_manager_start().await,
        ManagerCommands::Stop { force } => cmd_manager_stop(force).await,
        ManagerCommands::Status => cmd_manager_status().await,
    }
}

async fn cmd_manager_run() -> Result<()> {
    let config = ManagerConfig::load()?;
    println!("Running manager in foreground (Ctrl+C to stop)");
    println!("  Socket: {}", config.socket_path().display());
    println!("  PID:    {}", config.pid_path().display());
    println!();

    let server = ManagerServer::new(config);
    server.run().await
}

async fn cmd_manager_start() -> Result<()> {
    let client = ManagerClient::new();

    if client.is_running().await {
        let (uptime, version) = client.ping().await?;
        println!(
            "Manager already running (v{}, uptime: {})",
            version,
            format_duration(uptime)
        );
        return Ok(());
    }

    println!("Starting manager...");
    client.ensure_running().await?;

    let (_uptime, version) = client.ping().await?;
    println!(
        "Manager started (v{}, PID written to {})",
        version,
        relkv::env::manager_pid_path().display()
    );
    Ok(())
}

async fn cmd_manager_stop(force: bool) -> Result<()> {
    let client = ManagerClient::new();

    if !client.is_running().await {
        println!("Manager is not running");
        return Ok(());
    }

    if force {
        println!("Force stopping manager...");
        let pid_file = PidFile::new(relkv::env::manager_pid_path());
        if let Some(pid) = pid_file.is_running()? {
            unsafe {
                libc::kill(pid as i32, libc::SIGKILL);
            }
            println!("Manager killed (PID {pid})");
        }
        return Ok(());
    }

    println!("Stopping manager gracefully...");
    client.shutdown().await?;

    // Wait for the socket to actually die.
    for _ in 0..50 {
        if !client.is_running().await {
            println!("Manager stopped");
            return Ok(());
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    println!("Manager may still be stopping (check with `relkv manager status`)");
    Ok(())
}

async fn cmd_manager_status() -> Result<()> {
    let client = ManagerClient::new();

    if !client.is_running().await {
        println!("Manager: not running");
        return Ok(());
    }

    let (uptime, version) = client.ping().await?;
    println!("Manager: running (v{}, uptime: {})", version, format_duration(uptime));

    let workers = client.list_workers().await?;
    if workers.is_empty() {
        println!("Workers: none");
        return Ok(());
    }

    println!("Workers ({}):", workers.len());
    for worker in workers {
        println!(
            "  {:<16} pid {:<8} up {}",
            worker.identity.to_string(),
            worker.pid,
            format_duration(worker.uptime_secs)
        );
    }
    Ok(())
}

fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m", secs / 3600, (secs % 3600) / 60)
    }
}
