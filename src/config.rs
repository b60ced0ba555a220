use clap::Args;
use std::path::{Path, PathBuf};

use crate::agent::ANTHROPIC_BASE_URL;
use crate::tools::DisplaySettings;

/// Options for `cua-bridge serve`.
#[derive(Debug, Clone, Args)]
pub struct ServerConfig {
    /// Interface to bind
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    /// Directory holding the built frontend (defaults to ./frontend/dist or ~/frontend/dist)
    #[arg(long, env = "FRONTEND_DIR")]
    pub frontend_dir: Option<PathBuf>,

    /// Script that restarts the desktop environment
    #[arg(long, env = "RESET_SCRIPT", default_value = "./start_all.sh")]
    pub reset_script: PathBuf,

    /// Display width in pixels
    #[arg(long, env = "WIDTH", default_value_t = 1024)]
    pub width: u32,

    /// Display height in pixels
    #[arg(long, env = "HEIGHT", default_value_t = 768)]
    pub height: u32,

    /// X display number used by the computer tool
    #[arg(long, env = "DISPLAY_NUM", default_value_t = 1)]
    pub display_num: u32,

    /// Base URL of the Anthropic API
    #[arg(long, env = "ANTHROPIC_BASE_URL", default_value = ANTHROPIC_BASE_URL)]
    pub anthropic_base_url: String,
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn display(&self) -> DisplaySettings {
        DisplaySettings {
            width: self.width,
            height: self.height,
            display_num: Some(self.display_num),
        }
    }

    /// The frontend build to serve, if one can be found.
    pub fn frontend_root(&self) -> Option<PathBuf> {
        if let Some(dir) = &self.frontend_dir {
            return Some(dir.clone());
        }
        let home = std::env::var_os("HOME").map(PathBuf::from);
        find_frontend(Path::new("."), home.as_deref())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            frontend_dir: None,
            reset_script: PathBuf::from("./start_all.sh"),
            width: 1024,
            height: 768,
            display_num: 1,
            anthropic_base_url: ANTHROPIC_BASE_URL.to_string(),
        }
    }
}

fn find_frontend(cwd: &Path, home: Option<&Path>) -> Option<PathBuf> {
    std::iter::once(cwd)
        .chain(home)
        .map(|base| base.join("frontend").join("dist"))
        .find(|dist| dist.join("index.html").is_file())
}
