use log::{log, Level};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::events::{EventBus, EventKind, LogStream};

/// Split a `LEVEL: message` line; unprefixed lines take the stream's default level
pub fn parse_level(line: &str, stream: LogStream) -> (Level, &str) {
    let default = match stream {
        LogStream::Stdout => Level::Info,
        LogStream::Stderr => Level::Error,
    };

    let Some((prefix, rest)) = line.split_once(':') else {
        return (default, line.trim());
    };
    let level = match prefix {
        "DEBUG" => Level::Debug,
        "INFO" => Level::Info,
        "WARNING" | "WARN" => Level::Warn,
        "ERROR" | "CRITICAL" => Level::Error,
        _ => return (default, line.trim()),
    };
    (level, rest.trim())
}

/// Forward each line of a child stream to the log (targeted at the service) and the event bus
pub async fn capture_lines<R>(service: String, reader: R, stream: LogStream, events: EventBus)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(raw)) => {
                let (level, message) = parse_level(&raw, stream);
                if message.is_empty() {
                    continue;
                }
                log!(target: service.as_str(), level, "{}", message);
                events.publish(EventKind::LogLine {
                    service: service.clone(),
                    stream,
                    line: message.to_string(),
                });
            }
            Ok(None) => break,
            Err(e) => {
                log::debug!("Stopped reading {:?} of '{}': {}", stream, service, e);
                break;
            }
        }
    }
}
