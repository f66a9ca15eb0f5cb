//! Stop-signal handling.
//!
//! The first SIGINT / SIGTERM / SIGHUP cancels a shared
//! [`CancellationToken`]; the coordinator stops submitting work and lets
//! in-flight fetches reach a safe state. A second signal exits immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

pub fn install() -> CancellationToken {
    let token = CancellationToken::new();
    let seen_one = Arc::new(AtomicBool::new(false));

    let signal_token = token.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        let (mut sigterm, mut sighup) = {
            use tokio::signal::unix::{signal, SignalKind};
            (
                signal(SignalKind::terminate()).expect("register SIGTERM handler"),
                signal(SignalKind::hangup()).expect("register SIGHUP handler"),
            )
        };

        loop {
            #[cfg(unix)]
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
                _ = sighup.recv() => {}
            }

            #[cfg(not(unix))]
            tokio::signal::ctrl_c().await.expect("listen for Ctrl+C");

            if seen_one.swap(true, Ordering::SeqCst) {
                tracing::warn!("second signal, exiting now");
                std::process::exit(130);
            }
            tracing::info!("stop requested; letting in-flight transfers settle (signal again to force exit)");
            signal_token.cancel();
        }
    });

    token
}
