//! Drives an in-process server with windows of ordered requests and
//! reports latency and throughput statistics.
use std::time::Instant;

use average::{Estimate, Max, Mean, Min};
use clap::Parser;
use float_ord::FloatOrd;
use tensor_serving_server::{
    wait_until_model_ready, Client, DataType, InferenceRequest, InferenceRequestInput,
    NativeClient, ParameterMap, Server, Tensor,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// App Configuration
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(default_value = "echo", long, env)]
    worker: String,
    #[clap(default_value = "4096", long, env)]
    requests: usize,
    #[clap(default_value = "64", long, env)]
    window: usize,
    #[clap(default_value = "4", long, env)]
    batch_size: i32,
    #[clap(default_value = "1", long, env)]
    batchers: i32,
    #[clap(default_value = "1", long, env)]
    workers: i32,
}

fn sample_request() -> InferenceRequest {
    let mut request = InferenceRequest::new();
    request.add_input_tensor(InferenceRequestInput::from_owned(
        Tensor::new("input0", vec![1], DataType::Uint32),
        3u32.to_le_bytes().to_vec(),
    ));
    request
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .compact()
        .init();

    let batch_size = args.batch_size.max(1) as usize;
    if args.window == 0 || args.window % batch_size != 0 {
        eprintln!(
            "window ({}) must be a positive multiple of batch_size ({})",
            args.window, batch_size
        );
        std::process::exit(1);
    }
    // a fixed-size batcher only drains whole batches
    let total = args.requests - args.requests % args.window;
    if total == 0 {
        eprintln!("requests ({}) must cover at least one window", args.requests);
        std::process::exit(1);
    }

    let server = Server::new();
    let client = NativeClient::new(&server);

    let mut parameters = ParameterMap::new();
    parameters.put("batch_size", args.batch_size);
    parameters.put("batchers", args.batchers);
    parameters.put("workers", args.workers);
    let endpoint = client
        .worker_load(&args.worker, &parameters)
        .await
        .expect("failed to load the worker");
    wait_until_model_ready(&client, &endpoint)
        .await
        .expect("the worker never became ready");
    info!(endpoint = %endpoint, total, window = args.window, "starting benchmark");

    let mut window_latency = (Mean::new(), Min::new(), Max::new());
    let mut latencies = Vec::new();
    let started = Instant::now();
    let mut completed = 0;
    while completed < total {
        let window_started = Instant::now();
        let mut futures = Vec::with_capacity(args.window);
        for _ in 0..args.window {
            let future = client
                .model_infer_async(&endpoint, sample_request())
                .await
                .expect("failed to submit a request");
            futures.push(future);
        }
        for future in futures {
            let response = future.await.expect("a request failed");
            assert!(!response.is_error(), "error response: {:?}", response.error());
        }
        let elapsed = window_started.elapsed().as_secs_f64() * 1e3;
        window_latency.0.add(elapsed);
        window_latency.1.add(elapsed);
        window_latency.2.add(elapsed);
        latencies.push(FloatOrd(elapsed));
        completed += args.window;
    }
    let wall = started.elapsed().as_secs_f64();

    client
        .worker_unload(&endpoint)
        .await
        .expect("failed to unload the worker");

    println!("requests:        {total}");
    println!("window size:     {}", args.window);
    println!("wall time:       {wall:.3} s");
    println!("throughput:      {:.1} req/s", total as f64 / wall);
    println!(
        "window latency:  mean {:.2} ms, min {:.2} ms, max {:.2} ms",
        window_latency.0.mean(),
        window_latency.1.min(),
        window_latency.2.max()
    );
    latencies.sort();
    let quantile = |q: f64| latencies[((latencies.len() - 1) as f64 * q) as usize].0;
    println!(
        "                 p50 {:.2} ms, p90 {:.2} ms, p99 {:.2} ms",
        quantile(0.5),
        quantile(0.9),
        quantile(0.99)
    );
}
