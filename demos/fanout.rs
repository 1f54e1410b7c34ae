//! Fan-out demo: five workers, fifteen requests, one dispatcher.
//!
//! Each worker answers with its own index after a short pause, so the
//! printed replies show the requests spreading over the pool.
//!
//! ```text
//! RUST_LOG=request_dispatcher=debug cargo run --example fanout
//! ```

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use request_dispatcher::{Dispatcher, Worker, WorkerProxy};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const FRONTEND: &str = "inproc://fanout";
const WORKERS: usize = 5;
const REQUESTS: usize = 15;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let mut proxy = WorkerProxy::bind(FRONTEND).context("binding proxy")?;
    for index in 0..WORKERS {
        proxy.add(Worker::new(move |request: String| {
            thread::sleep(Duration::from_millis(50));
            Ok(format!("worker {index} handled '{request}'"))
        }))?;
    }
    proxy.start_workers()?;

    let dispatcher = Dispatcher::new(proxy.context())?;
    dispatcher.register_service::<String>(FRONTEND);

    let (tx, rx) = mpsc::channel();
    for i in 0..REQUESTS {
        let tx = tx.clone();
        dispatcher.execute(
            &format!("request {i}"),
            move |reply: request_dispatcher::Result<String>| {
                let _ = tx.send(reply);
            },
        )?;
    }
    drop(tx);

    dispatcher
        .gather_results(Some(Duration::from_secs(10)))
        .context("waiting for replies")?;

    for reply in rx.try_iter() {
        match reply {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("request failed: {e}"),
        }
    }

    dispatcher.close()?;
    proxy.shutdown()?;
    Ok(())
}
