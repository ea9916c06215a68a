use tradesync::cli;
use tradesync::setup_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv_override().ok();
    let (env, command) = cli::CliEnv::parse_and_convert()?;
    let _telemetry = setup_tracing(&env.log_level, env.hyperdx_api_key.as_deref());

    cli::run_command(env, command).await
}
