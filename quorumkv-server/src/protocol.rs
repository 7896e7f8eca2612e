//! Line protocol spoken by text clients.

/// One client request line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Set { key: String, value: String },
    Get { key: String },
    Delete { key: String },
    /// Add the node at this consensus address to the cluster.
    Join { addr: String },
    Status,
}

pub fn parse(line: &str) -> Result<Command, String> {
    let parts: Vec<&str> = line.split_whitespace().collect();

    if parts.is_empty() {
        return Err("Empty command".into());
    }

    match parts[0].to_uppercase().as_str() {
        "SET" if parts.len() == 3 => Ok(Command::Set {
            key: parts[1].to_string(),
            value: parts[2].to_string(),
        }),
        "GET" if parts.len() == 2 => Ok(Command::Get {
            key: parts[1].to_string(),
        }),
        "DELETE" if parts.len() == 2 => Ok(Command::Delete {
            key: parts[1].to_string(),
        }),
        "JOIN" if parts.len() == 2 => Ok(Command::Join {
            addr: parts[1].to_string(),
        }),
        "STATUS" if parts.len() == 1 => Ok(Command::Status),
        _ => Err(
            "Invalid command. Use: SET <key> <value>, GET <key>, DELETE <key>, JOIN <addr> or STATUS"
                .to_string(),
        ),
    }
}
