#[macro_use]
extern crate log;

mod broker_config;
mod channel_registry;
mod cli;
mod config_watcher;
mod constants;
mod consumer_groups;
mod dispatcher;
mod http;
mod internals;
mod kafka_types;
mod logging;
mod prometheus_metrics;

#[cfg(test)]
mod testing;

use std::error::Error;
use std::sync::Arc;

use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use cli::Cli;
use consumer_groups::KafkaSessionFactory;
use internals::Awaitable;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = parse_cli_and_init_logging();

    let shutdown_token = build_shutdown_token();

    let metrics = Arc::new(prometheus_metrics::init(cli.client_id.clone()));

    // Watch the mounted broker settings
    let (active_config, cw_join) = config_watcher::init(
        cli.settings_dir.clone(),
        cli.settings_poll_interval,
        shutdown_token.clone(),
        metrics.clone(),
    );

    // Watch the desired channels and their subscriptions
    let (registry, cr_join) = channel_registry::init(
        cli.subscriptions_file.clone(),
        cli.subscriptions_poll_interval,
        shutdown_token.clone(),
        metrics.clone(),
    );

    let dispatcher = match dispatcher::init(active_config.subscribe(), metrics.clone()) {
        Ok(d) => d,
        Err(e) => {
            error!("Failed to create the HTTP client used for deliveries: {e}");
            shutdown_token.cancel();
            std::process::exit(exit_code::SOFTWARE_ERROR);
        },
    };

    let (manager, cg_join) = consumer_groups::init(
        Arc::new(KafkaSessionFactory::new(cli.kafka_config.clone())),
        dispatcher,
        registry,
        &active_config,
        cli.topic_prefix.clone(),
        shutdown_token.clone(),
        metrics.clone(),
    );

    let http_join = tokio::spawn(http::init(
        cli.listen_on(),
        manager,
        active_config.clone(),
        shutdown_token.clone(),
        metrics,
    ));

    // Consumer groups start only once a valid configuration has been mounted
    if active_config.await_ready(shutdown_token.clone()).await.is_err() {
        error!("Shut down before a valid broker configuration was found in {:?}", cli.settings_dir);
        let (cw_res, cr_res, cg_res, http_res) = tokio::join!(cw_join, cr_join, cg_join, http_join);
        log_task_failures([
            ("config watcher", cw_res),
            ("channel registry", cr_res),
            ("consumer groups", cg_res),
            ("http", http_res),
        ]);
        std::process::exit(exit_code::CONFIG_ERROR);
    }

    let (cw_res, cr_res, cg_res, http_res) = tokio::join!(cw_join, cr_join, cg_join, http_join);
    cw_res?;
    cr_res?;
    cg_res?;
    http_res?;

    info!("Shutdown complete");
    Ok(())
}

/// Log the tasks that panicked (or were cancelled), returning how many did.
fn log_task_failures<const N: usize>(results: [(&str, Result<(), JoinError>); N]) -> usize {
    let mut failures = 0;
    for (task, res) in results {
        if let Err(e) = res {
            error!("Task '{task}' failed: {e}");
            failures += 1;
        }
    }
    failures
}

fn parse_cli_and_init_logging() -> Cli {
    // Parse command line input and initialize logging
    let cli = Cli::parse_and_validate();
    logging::init(cli.verbosity_level());

    trace!("Created:\n{:#?}", cli);

    cli
}

fn build_shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();

    // Setup shutdown signal handler:
    // when it's time to shutdown, cancel the token shared by all the parts of the system.
    //
    // NOTE: This handler will be listening on its own dedicated thread.
    let handler_token = token.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Shutting down...");
        handler_token.cancel();
    }) {
        error!("Failed to register signal handler: {e}");
    }

    token
}
