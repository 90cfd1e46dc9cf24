//! Example: subscribe to EndpointSlices and print each membership event.
//!
//! Usage: cargo run -p servewatch --example watch_slices -- [--kubeconfig PATH] --namespace NS --selector SELECTOR

use futures_util::StreamExt;
use servewatch::{Credentials, EndpointSliceSource, EventSource, MembershipEvent};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let args: Vec<String> = std::env::args().collect();
    let mut kubeconfig: Option<PathBuf> = None;
    let mut namespace = String::from("default");
    let mut selector = String::new();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--kubeconfig" => {
                i += 1;
                kubeconfig = args.get(i).map(PathBuf::from);
            }
            "--namespace" => {
                i += 1;
                namespace = args.get(i).cloned().unwrap_or_default();
            }
            "--selector" => {
                i += 1;
                selector = args.get(i).cloned().unwrap_or_default();
            }
            _ => {}
        }
        i += 1;
    }
    if selector.is_empty() {
        eprintln!("Usage: watch_slices [--kubeconfig PATH] --namespace NS --selector kubernetes.io/service-name=NAME");
        std::process::exit(1);
    }

    let credentials = Credentials::load(kubeconfig.as_deref())?;
    let mut source = EndpointSliceSource::new(credentials, namespace, selector);
    loop {
        let mut events = source.subscribe().await?;
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => {
                    let kind = match &event {
                        MembershipEvent::Added(_) => "added",
                        MembershipEvent::Updated(_) => "updated",
                        MembershipEvent::Removed(_) => "removed",
                    };
                    let record = event.record();
                    let ready: Vec<&str> = record
                        .endpoints
                        .iter()
                        .filter(|e| e.is_ready())
                        .filter_map(|e| e.target_ref.as_ref().map(|t| t.name.as_str()))
                        .collect();
                    println!(
                        "{kind} slice={}/{} service={} ready={:?}",
                        record.namespace,
                        record.name,
                        record.service_name.as_deref().unwrap_or("-"),
                        ready
                    );
                }
                Err(e) => {
                    eprintln!("subscription failed: {e}; resubscribing");
                    break;
                }
            }
        }
    }
}
