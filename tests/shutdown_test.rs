//! Kept in its own test binary: it signals the current process.

#![cfg(unix)]

use image_converter::shutdown::shutdown_signal;
use std::time::Duration;

#[tokio::test]
async fn test_sigterm_triggers_shutdown() {
    let waiter = tokio::spawn(shutdown_signal());

    // Let the task install its handlers before the signal is sent.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!waiter.is_finished());

    let status = std::process::Command::new("kill")
        .args(["-TERM", &std::process::id().to_string()])
        .status()
        .expect("kill should be available");
    assert!(status.success());

    tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("shutdown should resolve on SIGTERM")
        .unwrap();
}
