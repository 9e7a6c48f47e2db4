//! Dedicated I/O thread with a persistent reactor.
//!
//! On Linux the BLE stack delivers GATT notifications over D-Bus signals,
//! and those signals are only pumped while a reactor is alive. A reactor
//! that dies between operations orphans the notification subscription, so
//! the session gets exactly one long-lived current-thread runtime on its
//! own OS thread. Callers on any other thread submit work onto it.

use std::thread::JoinHandle as ThreadHandle;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::core::error::{GatewayError, Result};

/// Handle to the I/O thread's runtime.
///
/// All transport operations must run on this runtime: use [`IoThread::run`]
/// from synchronous code, [`IoThread::spawn`] for background tasks, or
/// clone [`IoThread::handle`] into async contexts.
pub struct IoThread {
    handle: Handle,
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread: Option<ThreadHandle<()>>,
}

impl IoThread {
    /// Spawn the I/O thread and block until its reactor is running.
    pub fn start() -> Result<Self> {
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("ble-io".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e));
                        return;
                    }
                };
                if handle_tx.send(Ok(rt.handle().clone())).is_err() {
                    return;
                }
                // Park on the shutdown signal; spawned tasks keep running
                // on this reactor in the meantime.
                rt.block_on(async {
                    let _ = shutdown_rx.await;
                });
            })?;

        let handle = handle_rx
            .recv()
            .map_err(|_| GatewayError::internal("I/O thread died during startup"))??;

        Ok(Self {
            handle,
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    /// The runtime handle, for spawning from async contexts.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Spawn a background task onto the I/O runtime.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(fut)
    }

    /// Run a future to completion on the I/O runtime, blocking the calling
    /// thread. Must not be called from within the I/O thread itself.
    pub fn run<F>(&self, fut: F) -> Result<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.handle.spawn(async move {
            let _ = tx.send(fut.await);
        });
        rx.blocking_recv()
            .map_err(|_| GatewayError::ChannelClosed)
    }

    /// Stop the reactor and join the thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for IoThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_round_trip() {
        let io = IoThread::start().unwrap();
        let result = io.run(async { 40 + 2 }).unwrap();
        assert_eq!(result, 42);
        io.stop();
    }

    #[test]
    fn test_spawned_tasks_survive_between_runs() {
        let io = IoThread::start().unwrap();
        let (tx, rx) = oneshot::channel();
        io.spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            let _ = tx.send(7u32);
        });
        let got = io.run(async move { rx.await.unwrap() }).unwrap();
        assert_eq!(got, 7);
    }
}
