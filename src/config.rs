use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "fileshelf", version, about = "Browse, upload and share a directory over HTTP")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve a directory tree
    Serve(ServeArgs),
    /// Upload files or a folder to a running server
    Upload(UploadArgs),
    /// Delete items on a running server
    Delete(DeleteArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[arg(long, env = "PUBLIC_DIR", default_value = "./public")]
    pub root: PathBuf,
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,
    #[arg(short, long, env = "PORT", default_value_t = 8000)]
    pub port: u16,
    /// Global write key for uploads, folder creation and protection changes
    #[arg(long, env = "KEY", hide_env_values = true)]
    pub upload_key: Option<String>,
    #[arg(long, env = "DELETE_KEY", hide_env_values = true)]
    pub delete_key: Option<String>,
    /// Key for hiding folders and revealing hidden ones
    #[arg(long, env = "HIDDEN_KEY", hide_env_values = true)]
    pub hidden_key: Option<String>,
    #[arg(long, env = "FOLDER_KEYS_CONFIG", default_value = "folder_keys.json")]
    pub folder_keys_config: PathBuf,
    #[arg(long, env = "FOLDER_VISIBILITY_CONFIG", default_value = "folder_visibility.json")]
    pub visibility_config: PathBuf,
    #[arg(long, env = "MAX_UPLOAD_SIZE_GB", default_value_t = 10.0)]
    pub max_upload_size_gb: f64,
    /// Comma separated list of allowed CORS origins
    #[arg(long, env = "CORS_ORIGINS")]
    pub cors_origin: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    #[arg(long, env = "FILESHELF_SERVER", default_value = "http://127.0.0.1:8000")]
    pub server: String,
    #[arg(long, env = "FILESHELF_KEY", hide_env_values = true)]
    pub key: String,
}

#[derive(Args, Debug, Clone)]
pub struct UploadArgs {
    #[command(flatten)]
    pub client: ClientArgs,
    /// Destination folder on the server
    #[arg(long, default_value = "")]
    pub dest: String,
    /// Upload a whole local folder, keeping its structure
    #[arg(long, conflicts_with = "files")]
    pub folder: Option<PathBuf>,
    /// Protect the uploaded folder with this password once the upload finishes
    #[arg(long)]
    pub protect_password: Option<String>,
    /// Server folder you are browsing; an upload into it prints the new listing
    #[arg(long)]
    pub viewing: Option<String>,
    /// Per-file transfer timeout
    #[arg(long, default_value_t = 3600)]
    pub timeout_secs: u64,
    #[arg(required_unless_present = "folder")]
    pub files: Vec<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct DeleteArgs {
    #[command(flatten)]
    pub client: ClientArgs,
    #[arg(required = true)]
    pub items: Vec<String>,
}

/// Settings resolved once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub public_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub upload_key: Option<String>,
    pub delete_key: Option<String>,
    pub hidden_key: Option<String>,
    pub folder_keys_config: PathBuf,
    pub visibility_config: PathBuf,
    pub max_upload_bytes: usize,
    pub cors_origins: Vec<String>,
}

impl ServerConfig {
    pub fn from_args(args: ServeArgs) -> Self {
        let max_upload_bytes = (args.max_upload_size_gb.max(0.0) * 1024.0 * 1024.0 * 1024.0) as usize;
        Self {
            public_dir: args.root,
            host: args.host,
            port: args.port,
            upload_key: non_empty(args.upload_key),
            delete_key: non_empty(args.delete_key),
            hidden_key: non_empty(args.hidden_key),
            folder_keys_config: args.folder_keys_config,
            visibility_config: args.visibility_config,
            max_upload_bytes,
            cors_origins: args
                .cors_origin
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn delete_configured(&self) -> bool {
        self.delete_key.is_some()
    }

    pub fn hidden_configured(&self) -> bool {
        self.hidden_key.is_some()
    }
}

impl UploadArgs {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    /// Flag combinations clap cannot express on its own.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.protect_password.is_some() && self.folder.is_none() {
            return Err("--protect-password only applies to --folder uploads");
        }
        Ok(())
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
