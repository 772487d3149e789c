#[tokio::main]
async fn main() {
    vidfill_core::runtime::setup_runtime_libs();
    if let Err(error) = vidfill_app::run_from_env().await {
        tracing::error!("{error:#}");
        std::process::exit(1);
    }
}
