use {
    clap::Parser,
    heddle::{cli::Cli, config::Config, exit_code, run, setup_logger, term::clear_status},
    std::{fmt::Debug, process::ExitCode},
    tracing::error,
};

#[expect(clippy::print_stderr, reason = "the logger is not available")]
fn fail_early(context: &str, err: impl Debug) -> ExitCode {
    eprintln!("{context}: {err:?}");
    ExitCode::from(1)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => return fail_early("Failed to load config", err),
    };
    let log_file = cli.log_file.clone().or_else(|| config.log_file.clone());
    if let Err(err) = setup_logger(log_file, &config.log_filter) {
        return fail_early("Failed to initialize logger", err);
    }

    let result = run(cli, config).await;
    clear_status();
    if let Err(err) = &result {
        error!("{err:?}");
    }
    ExitCode::from(exit_code(&result))
}
