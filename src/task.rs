use std::future::Future;
use tokio::task::JoinHandle;

/// Spawn a task that shows up under `name` in tokio-console and task dumps.
pub fn spawn_named<T, F>(name: &str, future: F) -> std::io::Result<JoinHandle<T>>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::Builder::new().name(name).spawn(future)
}
