//! Fixed-invocation entry point: the environment is read once at
//! startup, then the server runs until killed.

use std::net::SocketAddr;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use hearth::Server;

const DEFAULT_ADDR: &str = "0.0.0.0:12345";
const DEFAULT_ROOT: &str = "./root";

/// Log to `HEARTH_LOG_FILE` through the non-blocking appender when set,
/// otherwise to stderr. The guard must stay alive so the writer thread
/// flushes on shutdown.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_env("HEARTH_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    match std::env::var("HEARTH_LOG_FILE") {
        Ok(path) => {
            let path = Path::new(&path);
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let file = path.file_name().map(Path::new).unwrap_or_else(|| Path::new("hearth.log"));
            let appender = tracing_appender::rolling::never(dir, file);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _guard = init_tracing();

    let root = std::env::var("HEARTH_ROOT").unwrap_or_else(|_| DEFAULT_ROOT.to_owned());
    let addr: SocketAddr = std::env::var("HEARTH_ADDR")
        .unwrap_or_else(|_| DEFAULT_ADDR.to_owned())
        .parse()?;

    Server::builder()
        .root(root)
        .bind_with_acceptors(addr, 3)
        .worker_threads(3)
        .worker_pool_size(4)
        .build()?
        .run()?;
    Ok(())
}
