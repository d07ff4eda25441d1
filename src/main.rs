use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("relay_server=info,tower_http=warn")),
        )
        .init();

    if let Err(err) = relay_server::app::run().await {
        tracing::error!(error = %err, "server exited");
        std::process::exit(1);
    }
}
