use clap::Parser;
use tradesync::{Env, launch, setup_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv_override().ok();
    let env = Env::try_parse()?;
    let _telemetry = setup_tracing(&env.log_level, env.hyperdx_api_key.as_deref());

    launch(env).await
}
