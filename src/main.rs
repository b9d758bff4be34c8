mod app;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::builder()
        .parse_env(env_logger::Env::new().filter_or("AUTOPIN_LOG", "info"))
        .format_timestamp(None)
        .init();

    if let Err(err) = app::run().await {
        log::error!("{err:#}");
        std::process::exit(1);
    }
}
