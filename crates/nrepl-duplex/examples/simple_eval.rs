// Copyright (C) 2025 Tom Waddington
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

//! Simple example demonstrating nREPL client usage
//!
//! Start an nREPL server first:
//! ```bash
//! clj -Sdeps '{:deps {nrepl/nrepl {:mvn/version "1.1.0"}}}' -M -m nrepl.cmdline --port 7888
//! ```
//!
//! Then run this example:
//! ```bash
//! RUST_LOG=nrepl_duplex=debug cargo run -p nrepl-duplex --example simple_eval
//! ```

use nrepl_duplex::{NReplClient, ReactionBundle, Result};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("Connecting to nREPL server at localhost:7888...");
    let client = NReplClient::connect("localhost:7888").await?;
    println!("✓ Connected");

    println!("\nCloning session...");
    let session = client.clone_session().await?;
    println!("✓ Session created: {}", session.id());

    let described = client.describe(&session).await?;
    println!("✓ Server supports {} ops", described.ops.len());

    println!("\nEvaluating: (+ 1 2)");
    let result = client.eval(&session, "(+ 1 2)").await?;
    println!("✓ Result: {:?}", result.value);

    println!("\nEvaluating with output: (do (println \"Hello from nREPL!\") (+ 10 20))");
    let result = client
        .eval(&session, r#"(do (println "Hello from nREPL!") (+ 10 20))"#)
        .await?;
    println!("✓ Output: {:?}", result.output);
    println!("✓ Result: {:?}", result.value);

    // Streaming: watch each line of output as it arrives instead of waiting
    // for the whole evaluation to finish
    println!("\nStreaming output from a slow loop");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let done_tx = tx.clone();
    session.eval(
        "(doseq [i (range 3)] (println \"tick\" i) (Thread/sleep 200))",
        ReactionBundle::new()
            .on_out(move |_, _, out| {
                let _ = tx.send(Some(out.to_string()));
            })
            .on_done(move |_, _| {
                let _ = done_tx.send(None);
            }),
    )?;
    while let Ok(Some(Some(line))) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
        print!("  {}", line);
    }

    println!("\nInterrupting an idle session");
    let status = client.interrupt(&session, None).await?;
    println!("✓ Interrupt status: {:?}", status);

    client.close_session(&session).await?;
    println!("✓ Session closed");

    client.shutdown().await?;
    println!("\n✓ All examples completed successfully!");

    Ok(())
}
