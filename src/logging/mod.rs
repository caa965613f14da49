use std::{
    io::{self, Write},
    path::Path,
    str::FromStr,
    time::Duration,
};

use async_trait::async_trait;
use env_logger::Builder;
use log::LevelFilter;
use pingora::{
    server::{ListenFds, ShutdownWatch},
    services::Service,
};
use tokio::{
    fs::{create_dir_all, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    time::interval,
};

use crate::config;

const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// `Write` end handed to env_logger; lines are drained by [`Logger`].
pub struct ChannelWriter {
    sender: UnboundedSender<Vec<u8>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sender
            .send(buf.to_vec())
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Background service appending log lines to `log.path`.
///
/// Lines are buffered and flushed every second and on shutdown.
pub struct Logger {
    sender: UnboundedSender<Vec<u8>>,
    receiver: UnboundedReceiver<Vec<u8>>,
    config: config::Log,
}

impl Logger {
    pub fn new(config: config::Log) -> Self {
        let (sender, receiver) = unbounded_channel::<Vec<u8>>();
        Self {
            sender,
            receiver,
            config,
        }
    }

    fn writer(&self) -> ChannelWriter {
        ChannelWriter {
            sender: self.sender.clone(),
        }
    }

    /// Configured level, `info` when unset or not a level name.
    pub fn level(&self) -> LevelFilter {
        self.config
            .level
            .as_deref()
            .and_then(|level| LevelFilter::from_str(level).ok())
            .unwrap_or(LevelFilter::Info)
    }

    /// Install env_logger writing into this service. `RUST_LOG` still applies
    /// on top of the configured level.
    pub fn init_env_logger(&self) {
        let result = Builder::new()
            .filter_level(self.level())
            .parse_env(env_logger::Env::default())
            .target(env_logger::Target::Pipe(Box::new(self.writer())))
            .try_init();
        if let Err(e) = result {
            eprintln!("Logger already initialized: {e}");
        }
    }

    async fn open_log_file(&self) -> io::Result<BufWriter<tokio::fs::File>> {
        let path = Path::new(&self.config.path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .await?;
        Ok(BufWriter::new(file))
    }
}

#[async_trait]
impl Service for Logger {
    async fn start_service(&mut self, _fds: Option<ListenFds>, mut shutdown: ShutdownWatch) {
        let mut file = match self.open_log_file().await {
            Ok(file) => file,
            Err(e) => {
                eprintln!("Failed to open log file {}: {e}", self.config.path);
                return;
            }
        };
        let mut ticker = interval(FLUSH_INTERVAL);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                },

                data = self.receiver.recv() => {
                    let Some(data) = data else {
                        break;
                    };
                    if let Err(e) = file.write_all(&data).await {
                        eprintln!("Failed to write to log file: {e}");
                    }
                }

                _ = ticker.tick() => {
                    if let Err(e) = file.flush().await {
                        eprintln!("Failed to flush log file: {e}");
                    }
                }
            }
        }

        // Drain what was logged before shutdown.
        while let Ok(data) = self.receiver.try_recv() {
            if let Err(e) = file.write_all(&data).await {
                eprintln!("Failed to write to log file: {e}");
                break;
            }
        }
        if let Err(e) = file.flush().await {
            eprintln!("Failed to flush log file: {e}");
        }
    }

    fn name(&self) -> &'static str {
        "cache log sync"
    }

    fn threads(&self) -> Option<usize> {
        Some(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_config(path: &str, level: Option<&str>) -> config::Log {
        config::Log {
            path: path.to_string(),
            level: level.map(str::to_string),
        }
    }

    #[test]
    fn test_level() {
        assert_eq!(
            Logger::new(log_config("gateway.log", None)).level(),
            LevelFilter::Info
        );
        assert_eq!(
            Logger::new(log_config("gateway.log", Some("debug"))).level(),
            LevelFilter::Debug
        );
        assert_eq!(
            Logger::new(log_config("gateway.log", Some("chatty"))).level(),
            LevelFilter::Info
        );
    }

    #[tokio::test]
    async fn test_writer_feeds_channel() {
        let mut logger = Logger::new(log_config("gateway.log", None));
        let mut writer = logger.writer();
        writer.write_all(b"cache hit\n").unwrap();
        assert_eq!(logger.receiver.recv().await.unwrap(), b"cache hit\n");
    }

    #[tokio::test]
    async fn test_open_log_file_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("gateway.log");
        let logger = Logger::new(log_config(&path.to_string_lossy(), None));

        let mut file = logger.open_log_file().await.unwrap();
        file.write_all(b"line\n").await.unwrap();
        file.flush().await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line\n");
    }
}
