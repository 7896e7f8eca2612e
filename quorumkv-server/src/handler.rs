use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use crate::cluster_node::ClusterNode;
use crate::protocol::{parse, Command};

/// Serve one text client until it disconnects. Writes go through the
/// cluster; reads come from this node's store.
pub async fn handle_client(socket: TcpStream, node: Arc<ClusterNode>) {
    let (reader, mut writer) = socket.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();

        match reader.read_line(&mut line).await {
            Ok(0) => return, // client closed connection
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "error reading from client");
                return;
            }
        }

        let response = match parse(&line) {
            Ok(cmd) => execute(cmd, &node).await,
            Err(err) => format!("ERROR: {}\n", err),
        };

        if writer.write_all(response.as_bytes()).await.is_err() {
            return;
        }
    }
}

async fn execute(cmd: Command, node: &ClusterNode) -> String {
    match cmd {
        Command::Get { key } => match node.get(&key) {
            Ok(Some(val)) => format!("{}\n", val),
            Ok(None) => "NOT_FOUND\n".to_string(),
            Err(e) => format!("ERROR: {}\n", e),
        },
        Command::Set { key, value } => match node.set(&key, &value).await {
            Ok(()) => "OK\n".to_string(),
            Err(e) => format!("ERROR: {}\n", e),
        },
        Command::Delete { key } => match node.delete(&key).await {
            Ok(()) => "OK\n".to_string(),
            Err(e) => format!("ERROR: {}\n", e),
        },
        Command::Join { addr } => match node.join(&addr).await {
            Ok(()) => "OK\n".to_string(),
            Err(e) => format!("ERROR: {}\n", e),
        },
        Command::Status => format!("{}\n", node.status().await),
    }
}
