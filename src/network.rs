use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Bytes requested per socket read
const READ_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub enum ServerMessage {
    Text(String),
    Connected,
    Disconnected,
}

/// Turns raw socket bytes into text chunks, carrying an incomplete UTF-8
/// sequence over to the next read
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    carry: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.carry.extend_from_slice(bytes);
        let mut out = String::new();
        let input = std::mem::take(&mut self.carry);
        let mut rest: &[u8] = &input;

        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        None => {
                            // Truncated sequence at the end: wait for more bytes
                            self.carry = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// Bytes still waiting for the rest of their character
    pub fn pending(&self) -> usize {
        self.carry.len()
    }
}

/// Split text into chunks of at most `size` bytes without cutting a
/// character. Used to replay captured sessions the way the socket delivers
/// them.
pub fn split_into_chunks(text: &str, size: usize) -> Vec<&str> {
    let size = size.max(4);
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < text.len() {
        let mut end = (start + size).min(text.len());
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        chunks.push(&text[start..end]);
        start = end;
    }
    chunks
}

pub struct LichConnection;

impl LichConnection {
    pub async fn start(
        host: &str,
        port: u16,
        server_tx: mpsc::UnboundedSender<ServerMessage>,
        mut command_rx: mpsc::UnboundedReceiver<String>,
    ) -> Result<()> {
        info!("Connecting to Lich at {}:{}...", host, port);

        let stream = TcpStream::connect(format!("{}:{}", host, port))
            .await
            .context("Failed to connect to Lich")?;

        info!("Connected successfully");

        let (mut reader, mut writer) = tokio::io::split(stream);

        // Send frontend PID
        let pid = std::process::id();
        let msg = format!("SET_FRONTEND_PID:{}\n", pid);
        writer.write_all(msg.as_bytes()).await?;
        writer.flush().await?;
        debug!("Sent frontend PID: {}", pid);

        let _ = server_tx.send(ServerMessage::Connected);

        // Reader task: forward chunks exactly as they arrive
        let server_tx_clone = server_tx.clone();
        let mut read_handle = tokio::spawn(async move {
            let mut decoder = Utf8Decoder::new();
            let mut buf = vec![0u8; READ_SIZE];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        info!("Connection closed by server");
                        break;
                    }
                    Ok(n) => {
                        let text = decoder.decode(&buf[..n]);
                        if text.is_empty() {
                            continue;
                        }
                        if server_tx_clone.send(ServerMessage::Text(text)).is_err() {
                            debug!("Ingestion side closed, stopping reader");
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error reading from server: {}", e);
                        break;
                    }
                }
            }
            let _ = server_tx_clone.send(ServerMessage::Disconnected);
        });

        // Writer loop runs here until the server hangs up or commands stop
        loop {
            tokio::select! {
                _ = &mut read_handle => break,
                cmd = command_rx.recv() => {
                    let Some(cmd) = cmd else {
                        debug!("Command channel closed");
                        break;
                    };
                    debug!("Sending command: {}", cmd);
                    if let Err(e) = Self::send_command(&mut writer, &cmd).await {
                        error!("Failed to write command: {}", e);
                        break;
                    }
                }
            }
        }

        if !read_handle.is_finished() {
            read_handle.abort();
            let _ = server_tx.send(ServerMessage::Disconnected);
        }

        Ok(())
    }

    async fn send_command<W>(writer: &mut W, cmd: &str) -> Result<()>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        writer.write_all(cmd.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_carries_split_characters() {
        let text = "You say, \"Café ☕.\"";
        let bytes = text.as_bytes();
        let split = text.find('é').unwrap() + 1; // inside the two-byte é

        let mut decoder = Utf8Decoder::new();
        let first = decoder.decode(&bytes[..split]);
        assert_eq!(first, "You say, \"Caf");
        assert_eq!(decoder.pending(), 1);

        let second = decoder.decode(&bytes[split..]);
        assert_eq!(format!("{}{}", first, second), text);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{FFFD}b");
    }

    #[test]
    fn test_split_into_chunks_respects_boundaries() {
        let text = "héllo wörld";
        let chunks = split_into_chunks(text, 4);
        assert_eq!(chunks.concat(), text);
        assert!(chunks.iter().all(|c| c.len() <= 4 && !c.is_empty()));
        assert!(split_into_chunks("", 8).is_empty());
    }

    #[tokio::test]
    async fn test_start_forwards_chunks_and_commands() {
        use tokio::io::AsyncBufReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = socket.into_split();
            let mut lines = tokio::io::BufReader::new(reader).lines();
            let handshake = lines.next_line().await.unwrap().unwrap();
            writer.write_all(b"<prompt time='1'>&gt;</prompt>").await.unwrap();
            let command = lines.next_line().await.unwrap().unwrap();
            (handshake, command)
        });

        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let client = tokio::spawn(async move {
            LichConnection::start("127.0.0.1", port, server_tx, command_rx).await
        });

        assert!(matches!(server_rx.recv().await, Some(ServerMessage::Connected)));
        let mut received = String::new();
        while received.len() < "<prompt time='1'>&gt;</prompt>".len() {
            match server_rx.recv().await {
                Some(ServerMessage::Text(chunk)) => received.push_str(&chunk),
                other => panic!("unexpected message {:?}", other),
            }
        }
        assert_eq!(received, "<prompt time='1'>&gt;</prompt>");

        command_tx.send("look".to_string()).unwrap();
        let (handshake, command) = server.await.unwrap();
        assert!(handshake.starts_with("SET_FRONTEND_PID:"));
        assert_eq!(command, "look");

        // Server dropped its socket
        assert!(matches!(server_rx.recv().await, Some(ServerMessage::Disconnected)));
        client.await.unwrap().unwrap();
    }
}
