use anyhow::Result;
use clap::{Arg, ArgMatches, Command};

use plant_analysis_worker::common::{start_application, StartupConfig};

fn cli() -> Command {
    Command::new("analysis-worker")
        .version(env!("CARGO_PKG_VERSION"))
        .about("植物图像分析任务分发Worker")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径（默认按 config/analysis-worker.toml 等路径查找）"),
        )
        .arg(
            Arg::new("worker-id")
                .long("worker-id")
                .value_name("ID")
                .help("覆盖配置中的Worker ID"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"]),
        )
}

fn startup_config(matches: &ArgMatches) -> Result<StartupConfig> {
    let log_format = matches
        .get_one::<String>("log-format")
        .map(|format| format.parse())
        .transpose()?;

    Ok(StartupConfig {
        config_path: matches.get_one::<String>("config").cloned(),
        log_level: matches.get_one::<String>("log-level").cloned(),
        log_format,
        worker_id: matches.get_one::<String>("worker-id").cloned(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    start_application(startup_config(&matches)?).await
}
