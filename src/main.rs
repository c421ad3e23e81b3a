use sipnet::config;
use sipnet::logging;
use sipnet::{Listener, ListenerError};

/// Binds the SIP listener and logs inbound requests until Ctrl-C.
///
/// Bind address and listener tunables come from the environment
/// (`SIP_BIND_IP`, `SIP_PORT`, `SIP_BRANCH_RETENTION_MS`, ...).
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let cfg = config::Config::from_env()?;
    let listener = Listener::bind_with(&cfg.bind_addr(), cfg.listener.clone()).await?;
    log::info!("[main] sipnet ready on {}", listener.local_addr());

    loop {
        let accepted = tokio::select! {
            res = listener.accept_request() => res,
            _ = tokio::signal::ctrl_c() => {
                log::info!("[main] shutdown signal received");
                break;
            }
        };

        match accepted {
            Ok(incoming) => {
                let conn = &incoming.conn;
                log::info!(
                    "[main] {} {} via {} from {} (conn_id={})",
                    incoming.request.method,
                    incoming.request.uri,
                    conn.transport(),
                    conn.peer_addr(),
                    conn.id()
                );
            }
            Err(ListenerError::InvalidBranch { request, conn }) => {
                log::warn!(
                    "[main] rejected {} from {}: missing RFC 3261 branch",
                    request.method,
                    conn.peer_addr()
                );
            }
            Err(err) if err.is_fatal() => {
                log::error!("[main] listener stopped: {}", err);
                break;
            }
            Err(err) => {
                log::warn!("[main] {}", err);
            }
        }
    }

    listener.close().await?;
    Ok(())
}
