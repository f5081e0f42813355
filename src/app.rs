use crate::core::config::MeshConfig;
use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG: &str = "meshdrop.toml";

#[derive(Parser, Deserialize, Clone, Debug, Default)]
#[command(author, version, about = "Meshdrop - serverless peer mesh file sharing")]
#[command(propagate_version = true)]
#[serde(default)]
pub struct Args {
    /// Path to a config file (TOML)
    #[clap(long)]
    pub config: Option<PathBuf>,

    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Identity announced to other peers. Random when unset.
    #[clap(long)]
    pub peer_id: Option<String>,

    /// STUN/TURN server URL. Repeatable.
    #[clap(long = "ice-server")]
    pub ice_servers: Vec<String>,

    /// Directory downloaded files are written to.
    #[clap(long)]
    pub download_dir: Option<PathBuf>,

    /// Protocol tunables, only settable from the `[mesh]` table of the file.
    #[clap(skip)]
    pub mesh: MeshConfig,
}

impl Args {
    /// Load Args from CLI + TOML file (if it exists).
    /// CLI values override those from the file.
    pub fn load() -> Result<Self> {
        let cli_args = Args::parse();
        let path = cli_args
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));

        match Self::from_file(&path)? {
            Some(file_args) => Ok(Self::merge(file_args, cli_args)),
            None if cli_args.config.is_some() => {
                anyhow::bail!("config file {} does not exist", path.display())
            }
            None => Ok(cli_args),
        }
    }

    fn from_file(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("parsing {}", path.display()))
            .map(Some)
    }

    fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str::<Args>(content)?)
    }

    fn merge(mut file: Args, cli: Args) -> Args {
        if cli.config.is_some() {
            file.config = cli.config;
        }
        if cli.verbose > 0 {
            file.verbose = cli.verbose;
        }
        if cli.peer_id.is_some() {
            file.peer_id = cli.peer_id;
        }
        if !cli.ice_servers.is_empty() {
            file.ice_servers = cli.ice_servers;
        }
        if cli.download_dir.is_some() {
            file.download_dir = cli.download_dir;
        }
        file
    }
}
