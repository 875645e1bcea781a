//! Multi-session PTY server.
//!
//! Shells are spawned on demand and their I/O is multiplexed over WebSocket
//! connections using the message protocol in `webterm-protocol`.

pub mod http;
pub mod liveness;
pub mod pty;
pub mod registry;
pub mod router;

use eyre::WrapErr as _;

pub use router::{Connection, ConnectionId, Server, ServerClosed, ServerHandle, ServerOptions};

/// Bind the configured address and serve until Ctrl-C or SIGTERM.
pub async fn run(config: webterm_config::Config) -> eyre::Result<()> {
    let addr = (config.server.host.as_str(), config.server.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| {
            format!(
                "failed to bind {}:{}",
                config.server.host, config.server.port
            )
        })?;

    serve(
        listener,
        ServerOptions::from_config(&config),
        config.server.index.clone(),
        shutdown_signal(),
    )
    .await
}

/// Serve on an already bound listener until `shutdown` completes.
///
/// Every session still alive at shutdown is destroyed.
pub async fn serve(
    listener: tokio::net::TcpListener,
    options: ServerOptions,
    index: Option<std::path::PathBuf>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> eyre::Result<()> {
    let (server, handle) = Server::new(options);
    let server_task = tokio::spawn(server.run());

    let local_addr = listener
        .local_addr()
        .wrap_err("failed to read listener address")?;
    tracing::info!("listening on http://{local_addr}");

    let result = axum::serve(listener, http::router(handle, index))
        .with_graceful_shutdown(shutdown)
        .await
        .wrap_err("http server failed");

    // Upgraded connections may still hold handles; stopping the loop drops the
    // registry, which destroys every remaining session.
    server_task.abort();
    let _ = server_task.await;
    tracing::info!("server stopped");

    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    tracing::info!("shutdown requested");
}
