use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = loopstreamctl::Cli::parse();
    loopstreamctl::init_tracing(cli.verbose);
    if let Err(err) = loopstreamctl::run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(err.exit_code());
    }
}
