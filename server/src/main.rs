use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tensor_serving_server::observation;
use tensor_serving_server::server::{shutdown_signal, Server};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// App Configuration
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(default_value = "8998", long, env)]
    http_port: u16,
    #[clap(long, env)]
    prometheus_port: Option<u16>,
    #[clap(long, env)]
    json_output: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.json_output {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .init();
    }

    observation::describe();
    if let Some(port) = args.prometheus_port {
        if let Err(err) = PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], port))
            .install()
        {
            error!(%err, "failed to install the prometheus exporter");
            std::process::exit(1);
        }
    }

    let server = Server::new();
    if let Err(err) = server.start_http(args.http_port) {
        error!(%err, "failed to start the http server");
        std::process::exit(1);
    }

    shutdown_signal().await;
    server.shutdown().await;
}
