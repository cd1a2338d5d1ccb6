//! 本地回显演示：启动一个环回回显服务，再通过 `TcpConnection` 收发定长帧。
//!
//! 运行：`RUST_LOG=spark_connection_tcp=debug cargo run -p spark-connection-tcp --example echo`

use spark_connection_tcp::{TcpConnection, TcpConnectionConfig};
use std::{sync::Arc, time::Duration};
use tokio::{io::AsyncWriteExt, net::TcpListener};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });

    let config = TcpConnectionConfig::new().with_connect_timeout(Some(Duration::from_secs(3)));
    let connection = Arc::new(TcpConnection::with_config("127.0.0.1", port, config));
    connection.set_state_change_handler(Some(Arc::new(|connected| {
        tracing::info!(connected, "state changed");
    })));
    connection.open().await?;

    for size in [1usize, 16, 1024, 64 * 1024] {
        let frame: Vec<u8> = (0..size).map(|i| i as u8).collect();
        connection.write(&frame).await?;
        let mut echoed = vec![0u8; size];
        connection.read(&mut echoed).await?;
        anyhow::ensure!(echoed == frame, "echo mismatch for {size} bytes");
        tracing::info!(size, "frame echoed");
    }

    connection.close()?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    Ok(())
}
