//! Line echo server run under moult.
//!
//! Every connection is greeted with `worker <id> <binary id> <listener index>` and then has its
//! lines echoed back. The listener index is the position of the address in `ECHO_ADDRS`.
//!
//! * `ECHO_ADDRS`: comma separated listen addresses, default `127.0.0.1:9001`
//! * `ECHO_TERMINATE_TIMEOUT_MS`: drain deadline for restarts
//! * `ECHO_UPGRADE_FROM`: file to watch for new binaries
//!
//! Send `SIGUSR2` to the supervisor to restart the worker, `SIGTERM` to stop.

use std::{env, sync::Arc, time::Duration};

use moult::{Config, FileFetcher, State, TcpGracefulListener};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[tokio::main]
async fn main() {
    env_logger::init();
    if moult::sanity_check() {
        return;
    }

    let addresses = env::var("ECHO_ADDRS").unwrap_or_else(|_| "127.0.0.1:9001".to_owned());
    let mut config = Config::new()
        .program(serve)
        .addresses(addresses.split(',').map(str::trim))
        .debug(true);

    if let Some(ms) = env::var("ECHO_TERMINATE_TIMEOUT_MS")
        .ok()
        .and_then(|ms| ms.parse().ok())
    {
        config = config.terminate_timeout(Duration::from_millis(ms));
    }
    if let Ok(path) = env::var("ECHO_UPGRADE_FROM") {
        config = config
            .fetcher(FileFetcher::new(path))
            .min_fetch_interval(Duration::from_millis(200));
    }

    moult::run(config).await;
}

async fn serve(state: State) {
    let who = match (state.worker_id(), state.bin_id()) {
        (Some(worker), Some(bin)) => format!("worker {worker} {bin}"),
        _ => "worker - in-process".to_owned(),
    };

    let accept_loops: Vec<_> = state
        .listeners()
        .iter()
        .cloned()
        .enumerate()
        .map(|(index, listener)| {
            let greeting: Arc<str> = format!("{who} {index}\n").into();
            tokio::spawn(accept_loop(listener, greeting))
        })
        .collect();
    for accept_loop in accept_loops {
        let _ = accept_loop.await;
    }
}

async fn accept_loop(listener: Arc<TcpGracefulListener>, greeting: Arc<str>) {
    loop {
        match listener.accept().await {
            Ok(conn) => {
                let greeting = greeting.clone();
                tokio::spawn(async move {
                    let mut conn = BufReader::new(conn);
                    if let Err(e) = echo(&mut conn, &greeting).await {
                        log::debug!("Connection ended: {e}");
                    }
                });
            }
            Err(_) if listener.is_released() => return,
            Err(e) => log::warn!("Accept failed: {e}"),
        }
    }
}

async fn echo<S>(conn: &mut BufReader<S>, greeting: &str) -> std::io::Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    conn.write_all(greeting.as_bytes()).await?;
    let mut line = String::new();
    loop {
        line.clear();
        if conn.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        conn.write_all(line.as_bytes()).await?;
    }
}
