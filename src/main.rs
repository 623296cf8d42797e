use std::process::ExitCode;

/// Grace period after shutdown signal before force-exiting (seconds).
const SHUTDOWN_GRACE_SECS: u64 = 10;

#[tokio::main]
async fn main() -> ExitCode {
    // The service and action runs poll `stagehand::is_shutdown_requested()`
    // and wind down on their own; the grace period covers stuck processes.
    tokio::spawn(async {
        shutdown_signal().await;
        stagehand::request_shutdown();
        eprintln!("\nReceived shutdown signal, exiting gracefully...");

        tokio::time::sleep(std::time::Duration::from_secs(SHUTDOWN_GRACE_SECS)).await;
        eprintln!("Shutdown grace period expired, forcing exit.");
        std::process::exit(1);
    });

    match stagehand::cli::run().await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:?}", e);
            ExitCode::from(stagehand::errors::get_exit_code(&e))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
