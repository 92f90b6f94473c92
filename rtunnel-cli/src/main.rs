#[macro_use]
extern crate log;
#[macro_use]
extern crate anyhow;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rtunnel::api::cluster::{load_config, EngineConfig};
use rtunnel::api::config::JobConfig;
use rtunnel::api::runtime::JobId;
use rtunnel::functions::default_registry;
use rtunnel::metrics::metric::set_engine_id;
use rtunnel::runtime::client::JobClient;
use rtunnel::runtime::coordinator::job_master::JobResult;
use rtunnel::runtime::logger::{init_log, LogMode};
use rtunnel::runtime::server::EngineServer;
use rtunnel::utils::thread::async_runtime;
use rtunnel::utils::{parse_arg, parse_arg_with, VERSION};

/// `key=value` arguments:
///
/// ```text
/// command=submit    config=job.yaml
/// command=restore   config=job.yaml job_id=<prior job>
/// command=savepoint config=job.yaml after_ms=5000
/// command=cancel    config=job.yaml after_ms=5000
///
/// engine_config=engine.yaml  engine_id=local  log_level=INFO  log_dir=/var/log/rtunnel
/// ```
///
/// A savepoint only outlives the process with `LocalFile` checkpoint storage.
fn main() {
    let r = async_runtime("cli").and_then(|runtime| runtime.block_on(run()));
    if let Err(e) = r {
        error!("{:#}", e);
        eprintln!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let log_mode = match parse_arg("log_dir") {
        Ok(dir) => LogMode::RollingFile(PathBuf::from(dir)),
        Err(_) => LogMode::Console,
    };
    init_log(&log_mode, parse_arg_with("log_level", "INFO").as_str())?;
    info!("rtunnel-cli {}", VERSION);
    set_engine_id(parse_arg_with("engine_id", "local").as_str());

    let command = parse_arg("command")?;
    let job_config = JobConfig::load(PathBuf::from(parse_arg("config")?).as_path())?;
    let engine_config = match parse_arg("engine_config") {
        Ok(path) => load_config(PathBuf::from(path).as_path())?,
        Err(_) => EngineConfig::default(),
    };

    let server = Arc::new(EngineServer::new(engine_config, Arc::new(default_registry()))?);
    let client = JobClient::new(server.clone());
    let result = execute(&client, command.as_str(), &job_config).await;
    server.shutdown();

    let result = result?;
    println!("{} {}", result.job_id, result.status);
    match result.error {
        Some(e) => Err(anyhow!("{} failed. {}", result.job_id, e)),
        None => Ok(()),
    }
}

async fn execute(
    client: &JobClient,
    command: &str,
    job_config: &JobConfig,
) -> anyhow::Result<JobResult> {
    let result = match command {
        "submit" => {
            let job_id = client.submit(job_config).await?;
            client.wait(job_id).await?
        }
        "restore" => {
            let prior = parse_arg("job_id")?
                .parse::<u64>()
                .map_err(|e| anyhow!("`job_id` argument: {}", e))?;
            let job_id = client.restore(job_config, JobId(prior)).await?;
            client.wait(job_id).await?
        }
        "savepoint" | "cancel" => {
            let after = parse_arg_with("after_ms", "0")
                .parse::<u64>()
                .map_err(|e| anyhow!("`after_ms` argument: {}", e))?;
            let job_id = client.submit(job_config).await?;
            tokio::time::sleep(Duration::from_millis(after)).await;
            if command == "savepoint" {
                client.savepoint(job_id).await?
            } else {
                client.cancel(job_id).await?
            }
        }
        _ => {
            return Err(anyhow!(
                "unknown command `{}`, expect submit|restore|savepoint|cancel",
                command
            ))
        }
    };
    Ok(result)
}
