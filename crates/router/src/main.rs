use clap::Parser;

#[tokio::main]
async fn main() {
    let args = router::arguments::Arguments::parse();
    observe::tracing::initialize("info,router=debug");
    observe::metrics::setup_registry(Some("rtb".to_owned()), None);

    if let Err(err) = router::main(args).await {
        tracing::error!(?err, "router terminated");
        std::process::exit(1);
    }
}
