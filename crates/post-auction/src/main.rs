use clap::Parser;

#[tokio::main]
async fn main() {
    let args = post_auction::arguments::Arguments::parse();
    observe::tracing::initialize("info,post_auction=debug");
    observe::metrics::setup_registry(Some("rtb".to_owned()), None);

    if let Err(err) = post_auction::main(args).await {
        tracing::error!(?err, "post-auction service terminated");
        std::process::exit(1);
    }
}
