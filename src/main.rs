//! warehouse-mcp - Main CLI Entry Point

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use warehouse_mcp::{
    cli::{Args, Commands, Config},
    context::RequestContext,
    pool::ConnectionPool,
    query::{QueryExecutor, QueryRequest},
    server::McpServer,
    telemetry::Telemetry,
    tools::{Dispatcher, SqlGuard},
    warehouse::PgConnector,
};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // stdout carries the protocol; logs go to stderr
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(args.verbosity().filter_directive()))
        .context("Invalid log filter")?;
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_ansi(false))
        .with(filter)
        .init();

    let mut config = Config::load(args.config.clone()).context("Failed to load configuration")?;
    args.apply(&mut config);

    match args.command() {
        Commands::Config => show_config(&config),
        Commands::Check => {
            config.validate().context("Invalid configuration")?;
            run_check(&config).await
        }
        Commands::Serve => {
            config.validate().context("Invalid configuration")?;
            run_server(&config).await
        }
    }
}

fn show_config(config: &Config) -> Result<()> {
    print!("{}", config.redacted_toml()?);
    Ok(())
}

fn build_pool(config: &Config, telemetry: &Telemetry) -> Result<Arc<ConnectionPool>> {
    let connector = PgConnector::new(&config.warehouse)
        .context("Failed to build warehouse connector")?
        .with_read_only(config.query.read_only);
    Ok(ConnectionPool::new(
        Arc::new(connector),
        config.pool_config(),
        telemetry.clone(),
    ))
}

async fn run_check(config: &Config) -> Result<()> {
    let telemetry = Telemetry::new();
    let pool = build_pool(config, &telemetry)?;
    let executor = QueryExecutor::new(config.executor_config());
    let ctx = RequestContext::new();

    let mut conn = pool.acquire(&ctx).await.context("Failed to connect to warehouse")?;
    let outcome = match executor.execute(&mut conn, &QueryRequest::new("SELECT 1"), &ctx).await {
        Ok(result) => result.collect().await,
        Err(err) => Err(err),
    };
    conn.release(outcome.is_ok());
    pool.close_all();

    let output = outcome.context("SELECT 1 failed")?;
    println!(
        "ok: {}@{}:{}/{} answered SELECT 1 ({} row)",
        config.warehouse.user,
        config.warehouse.host,
        config.warehouse.port,
        config.warehouse.database,
        output.row_count
    );
    Ok(())
}

async fn run_server(config: &Config) -> Result<()> {
    let telemetry = Telemetry::new();
    let pool = build_pool(config, &telemetry)?;

    tracing::info!(
        host = %config.warehouse.host,
        database = %config.warehouse.database,
        max_connections = config.pool.max_connections,
        read_only = config.query.read_only,
        "starting warehouse MCP server"
    );

    // A cold warehouse should not keep the server from answering initialize
    if let Err(err) = pool.warm_up().await {
        tracing::warn!(error = %err, "could not pre-open connections; will connect on demand");
    }
    let reaper = pool.spawn_reaper(config.reaper_interval());

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&pool),
        QueryExecutor::new(config.executor_config()),
        SqlGuard::new(config.query.read_only),
        telemetry.clone(),
    ));
    let server = McpServer::new(dispatcher, config.server_options());

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    let signal = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    let summary = server
        .serve_until(stdin, stdout, signal)
        .await
        .context("Transport failed")?;
    reaper.abort();

    tracing::info!(
        messages = summary.messages,
        tool_calls = summary.tool_calls,
        drained = summary.drained,
        "server stopped"
    );
    telemetry.log_summary();
    Ok(())
}
