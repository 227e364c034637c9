//! SNMP inform ingestion
//!
//! The inform daemon pipes one line per received notification:
//! `<source> , <oid> = <value>, <oid> = <value>, ...`. Lines are parsed
//! into an attribute map and handed to [`handle_line`]; daemon startup
//! chatter is dropped.

use std::collections::HashMap;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Daemon output that is not an inform line.
fn is_ignorable(line: &str) -> bool {
    line.starts_with("Created directory:") || line.starts_with("NET-SNMP")
}

/// Splits an inform line into the reporting host and the payload text.
pub fn split_line(line: &str) -> Option<(&str, &str)> {
    line.split_once(" , ")
}

/// Parses the payload text into an OID-to-value map. Values keep their
/// raw form, quotes included.
pub fn split_to_values(data: &str) -> HashMap<String, String> {
    let mut ret = HashMap::new();
    for segment in data.split(',') {
        let Some((key, value)) = segment.split_once(" = ") else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() || !key.chars().all(|c| c == '.' || c.is_ascii_digit()) {
            continue;
        }
        ret.insert(key.to_string(), value.to_string());
    }
    ret
}

/// Handles one line of inform input.
pub fn handle_line(line: &str) {
    if is_ignorable(line) {
        debug!("Ignoring inform daemon output: {line}");
        return;
    }

    let Some((source, data)) = split_line(line) else {
        warn!("Malformed inform line: {line}");
        return;
    };

    let attrs = split_to_values(data);
    // Learned-table lag after link-up makes the periodic scan the
    // authoritative path; informs are recorded for operators only.
    info!("Got INFORM from {source}: {} attributes", attrs.len());
}

/// Reads inform lines from stdin until EOF or cancellation.
pub async fn listen_stdin(token: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("Inform listener shutting down");
                return;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_line(&line),
                Ok(None) => {
                    debug!("Inform input closed");
                    return;
                }
                Err(e) => {
                    warn!("Error reading inform input: {e}");
                    return;
                }
            },
        }
    }
}
