use std::{num::NonZeroU64, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

use tarserve::{
    config::{parse_int_flag, Credentials, ModeOverride, ServeConfig},
    lifecycle::Lifecycle,
    server::Server,
};

/// Serve a directory as a tar archive over HTTP
#[derive(Debug, Parser)]
#[clap(name = "tarserve", version)]
struct App {
    /// URL path to serve the archive on
    #[clap(long, default_value = "/")]
    url: String,
    /// Address to listen on
    #[clap(long, default_value = "0.0.0.0")]
    listen: String,
    /// Port to listen on
    #[clap(long, default_value_t = 8080)]
    port: u16,
    /// Force the mode of directories (octal with a leading 0, negative to keep)
    #[clap(long, default_value = "-1", value_parser = parse_int_flag, allow_hyphen_values = true)]
    dir_mode: i64,
    /// Force the mode of files (octal with a leading 0, negative to keep)
    #[clap(long, default_value = "-1", value_parser = parse_int_flag, allow_hyphen_values = true)]
    file_mode: i64,
    /// Basic auth credentials in the format `user:password`
    #[clap(long, default_value = "")]
    basic_auth: String,
    /// Name the served directory this inside the archive, to avoid exposing local paths
    #[clap(long, default_value = "")]
    rewrite_base_dir: String,
    /// Exclude files with this extension (repeatable)
    #[clap(long = "exclude-extension")]
    exclude_extensions: Vec<String>,
    /// Quit after this many downloads (0 means never)
    #[clap(long, default_value_t = 0)]
    quit_after: u64,
    /// Directory to serve
    dir: PathBuf,
}

impl App {
    fn into_config(self) -> Result<ServeConfig> {
        let mut config = ServeConfig::new(self.dir);
        config.url_path = self.url;
        config.listen = self.listen;
        config.port = self.port;
        config.dir_mode = ModeOverride::from_raw(self.dir_mode).context("--dir-mode")?;
        config.file_mode = ModeOverride::from_raw(self.file_mode).context("--file-mode")?;
        config.credentials =
            Credentials::parse_optional(&self.basic_auth).context("--basic-auth")?;
        config.rewrite_base_dir = Some(self.rewrite_base_dir).filter(|r| !r.is_empty());
        config.exclude_extensions = self.exclude_extensions;
        config.quit_after = NonZeroU64::new(self.quit_after);
        Ok(config.validate()?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .init();

    let config = App::parse().into_config()?;
    if config.credentials.is_none() {
        warn!("basic auth is disabled, anyone who can reach the server can download the archive");
    }
    info!("serving {} on {}", config.root.display(), config.url_path);

    let server = Server::bind(&config)
        .await
        .with_context(|| format!("binding {}:{}", config.listen, config.port))?;

    let lifecycle = server.lifecycle();
    tokio::spawn(shutdown_on_ctrl_c(lifecycle));

    server.run().await?;
    Ok(())
}

async fn shutdown_on_ctrl_c(lifecycle: Arc<Lifecycle>) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!("cannot listen for Ctrl-C: {err}");
                return;
            }
            info!("interrupted, shutting down");
            lifecycle.request_shutdown();
        }
        _ = lifecycle.shutdown_requested() => {}
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(args: &[&str]) -> App {
        App::try_parse_from(std::iter::once("tarserve").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = parse(&[dir.path().to_str().unwrap()]).into_config().unwrap();
        assert_eq!(config.url_path, "/");
        assert_eq!(config.port, 8080);
        assert_eq!(config.dir_mode, ModeOverride::Keep);
        assert_eq!(config.file_mode, ModeOverride::Keep);
        assert!(config.credentials.is_none());
        assert!(config.rewrite_base_dir.is_none());
        assert!(config.exclude_extensions.is_empty());
        assert!(config.quit_after.is_none());
    }

    #[test]
    fn test_all_flags() {
        let dir = tempfile::tempdir().unwrap();
        let config = parse(&[
            "--url",
            "/download",
            "--listen",
            "127.0.0.1",
            "--port",
            "9000",
            "--dir-mode",
            "0755",
            "--file-mode",
            "0644",
            "--basic-auth",
            "alice:s3cret",
            "--rewrite-base-dir",
            "shared",
            "--exclude-extension",
            ".tmp",
            "--exclude-extension",
            "log",
            "--quit-after",
            "3",
            dir.path().to_str().unwrap(),
        ])
        .into_config()
        .unwrap();

        assert_eq!(config.url_path, "/download");
        assert_eq!(config.listen, "127.0.0.1");
        assert_eq!(config.port, 9000);
        assert_eq!(config.dir_mode, ModeOverride::Force(0o755));
        assert_eq!(config.file_mode, ModeOverride::Force(0o644));
        assert_eq!(
            config.credentials,
            Some(Credentials::new("alice", "s3cret"))
        );
        assert_eq!(config.rewrite_base_dir.as_deref(), Some("shared"));
        assert_eq!(config.exclude_extensions, [".tmp", ".log"]);
        assert_eq!(config.quit_after, NonZeroU64::new(3));
    }

    #[test]
    fn test_negative_mode_keeps_filesystem_mode() {
        let dir = tempfile::tempdir().unwrap();
        let config = parse(&["--file-mode", "-1", dir.path().to_str().unwrap()])
            .into_config()
            .unwrap();
        assert_eq!(config.file_mode, ModeOverride::Keep);
    }

    #[test]
    fn test_malformed_credentials_fail_at_startup() {
        let dir = tempfile::tempdir().unwrap();
        assert!(parse(&["--basic-auth", "nocolon", dir.path().to_str().unwrap()])
            .into_config()
            .is_err());
    }

    #[test]
    fn test_missing_dir_argument() {
        assert!(App::try_parse_from(["tarserve"]).is_err());
    }
}
