use clap::Parser;

use prodj_link::config::Config;

#[tokio::main]
async fn main() {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(config.log_level.clone()))
        .init();

    // The CLI has no command-issuing surface of its own yet; the sender is
    // kept alive by the binding below so the receiver doesn't see a closed
    // channel immediately.
    let (_commands_tx, commands_rx) = prodj_link::command_channel();
    let outcome = prodj_link::run(config, commands_rx).await;
    std::process::exit(outcome.exit_code());
}
