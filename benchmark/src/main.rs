use clap::Parser;
use hdrhistogram::Histogram;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

use replica::rpc::pb::raft_service_client::RaftServiceClient;
use replica::rpc::pb::SubmitRequest;
use replica::{Command, StateMachineOperation, StateMachineResponse};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of concurrent clients
    #[arg(short, long, default_value = "1")]
    concurrency: usize,

    /// INTERVAL ms
    #[arg(short, long, default_value = "100")]
    interval: u64,

    /// Duration of the benchmark in seconds
    #[arg(short, long, default_value = "30")]
    duration: u64,

    /// Server address
    #[arg(short, long, default_value = "http://127.0.0.1:4001")]
    server: String,

    /// Number of distinct keys written
    #[arg(short, long, default_value = "1000")]
    keys: u64,
}

fn put_request(keys: u64) -> Result<SubmitRequest, replica::Error> {
    let key = rand::random::<u64>() % keys.max(1);
    // the serving node replaces the origin with its own host
    let op = StateMachineOperation::new(
        "",
        Command::Put {
            key: format!("key-{}", key),
            value: rand::random::<u64>().to_string(),
        },
    );
    Ok(SubmitRequest {
        operation: op.encode()?,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let server_addr = args.server.clone();
    let histogram = Arc::new(Mutex::new(Histogram::<u64>::new(3)?));
    let total_requests = Arc::new(Mutex::new(0u64));
    let failed_requests = Arc::new(Mutex::new(0u64));

    println!(
        "Starting benchmark with {} concurrent clients, target INTERVAL: {}",
        args.concurrency, args.interval
    );

    // Spawn client tasks
    let mut handles = vec![];
    for _ in 0..args.concurrency {
        let server_addr = server_addr.clone();
        let histogram = histogram.clone();
        let total_requests = total_requests.clone();
        let failed_requests = failed_requests.clone();
        let interval = args.interval;
        let keys = args.keys;

        let handle = tokio::spawn(async move {
            let mut client = match RaftServiceClient::connect(server_addr).await {
                Ok(client) => client,
                Err(e) => {
                    eprintln!("Failed to connect to server: {}", e);
                    return;
                }
            };

            loop {
                let request = match put_request(keys) {
                    Ok(r) => r,
                    Err(e) => {
                        eprintln!("Failed to build request: {}", e);
                        return;
                    }
                };
                let start = Instant::now();
                match client.submit(tonic::Request::new(request)).await {
                    Ok(resp) => {
                        let duration = start.elapsed();
                        let ok = StateMachineResponse::decode(
                            &resp.into_inner().state_machine_response,
                        )
                        .map(|r| r.success)
                        .unwrap_or(false);
                        if ok {
                            let mut hist = histogram.lock().await;
                            let _ = hist.record(duration.as_micros() as u64);
                            *total_requests.lock().await += 1;
                        } else {
                            *failed_requests.lock().await += 1;
                        }
                    }
                    Err(e) => {
                        eprintln!("Request failed: {}", e);
                        *failed_requests.lock().await += 1;
                    }
                }

                tokio::time::sleep(Duration::from_millis(interval)).await;
            }
        });

        handles.push(handle);
    }

    // Run for specified duration
    sleep(Duration::from_secs(args.duration)).await;

    // Cancel all tasks
    for handle in handles {
        handle.abort();
    }

    // Print statistics
    let total = *total_requests.lock().await;
    let failed = *failed_requests.lock().await;
    let hist = histogram.lock().await;

    println!("\nBenchmark Results:");
    println!("Total Requests: {}", total);
    println!("Failed Requests: {}", failed);
    println!("Average TPS: {:.2}", total as f64 / args.duration as f64);
    println!("\nLatency Distribution (microseconds):");
    println!("p50: {}", hist.value_at_percentile(50.0));
    println!("p90: {}", hist.value_at_percentile(90.0));
    println!("p95: {}", hist.value_at_percentile(95.0));
    println!("p99: {}", hist.value_at_percentile(99.0));
    println!("p99.9: {}", hist.value_at_percentile(99.9));

    Ok(())
}
