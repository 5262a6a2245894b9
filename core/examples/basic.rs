//! Basic breaker usage example

use brakes::{BoxError, BreakerEvent, CircuitBreaker, GlobalRegistry, HealthCheck, Operation};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("brakes=info")),
        )
        .init();

    println!("=== Circuit Breaker Basic Example ===\n");

    let healthy = Arc::new(AtomicBool::new(true));
    let registry = GlobalRegistry::global();
    let mut frames = registry.hystrix_stream();

    let service = healthy.clone();
    let probe = healthy.clone();
    let breaker = CircuitBreaker::builder("payment_api")
        .group("payments")
        .wait_threshold(3)
        .threshold(0.5)
        .timeout(Duration::from_millis(200))
        .stat_interval(Duration::from_millis(500))
        .health_check_interval(Duration::from_millis(250))
        .operation(Operation::new(move |amount: u32| {
            let up = service.load(Ordering::SeqCst);
            async move {
                if up {
                    Ok::<_, BoxError>(format!("Payment {} accepted", amount))
                } else {
                    Err("payment gateway unavailable".into())
                }
            }
        }))
        .health_check(HealthCheck::new(move || {
            let up = probe.load(Ordering::SeqCst);
            async move {
                if up {
                    Ok(())
                } else {
                    Err("gateway still down".into())
                }
            }
        }))
        .on_open(|name| println!("🔴 Circuit '{}' opened!", name))
        .on_close(|name| println!("🟢 Circuit '{}' closed!", name))
        .on_event(|event| {
            if let BreakerEvent::HealthCheckFailed { error } = event {
                println!("🟡 Health check failed: {}", error);
            }
        })
        .build()?;

    println!("Initial state: {}\n", breaker.state_name());

    // Simulate successful calls
    println!("--- Successful calls ---");
    for amount in 1..=2 {
        match breaker.exec(amount).await {
            Ok(receipt) => println!("✓ {}", receipt),
            Err(e) => println!("✗ Error: {}", e),
        }
    }
    println!("State: {}\n", breaker.state_name());

    // Simulate failures
    println!("--- Triggering failures ---");
    healthy.store(false, Ordering::SeqCst);
    for amount in 3..=8 {
        match breaker.exec(amount).await {
            Ok(_) => println!("✓ Success"),
            Err(e) => println!("✗ {}", e),
        }
    }
    println!("State: {} (circuit opened)\n", breaker.state_name());

    // Degrade gracefully while open
    println!("--- Fallback while open ---");
    breaker.fallback(Operation::new(|amount| async move {
        Ok(format!("Payment {} queued for later", amount))
    }));
    println!("✓ {}\n", breaker.exec(9).await?);

    // Let the health check close the circuit
    println!("--- Waiting for recovery ---");
    tokio::time::sleep(Duration::from_millis(300)).await;
    healthy.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;
    println!("State after recovery: {}\n", breaker.state_name());

    match breaker.exec(10).await {
        Ok(receipt) => println!("✓ {}", receipt),
        Err(e) => println!("✗ {}", e),
    }

    println!("\n--- Latest dashboard frame ---");
    if let Ok(Ok(frame)) = tokio::time::timeout(Duration::from_secs(1), frames.recv()).await {
        print!("{}", frame);
    }

    breaker.dispose();
    Ok(())
}
