use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "slgen",
    author,
    version,
    about = "Generate StarLight shader bindings with a local compiler or the remote service"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Compile a shader folder, a `.sl.json` config, or a single shader file.
    Generate(GenerateArgs),
    /// Scaffold `<DIR>/<NAME>/` with a config and default shaders.
    New(NewArgs),
    /// Print the settings file location and effective settings.
    Where(BackendArgs),
}

#[derive(Args, Debug)]
pub struct GenerateArgs {
    /// Folder, config file, or shader file to generate from.
    #[arg(value_name = "PATH")]
    pub path: PathBuf,

    /// Output language for the remote service (e.g. `lua`, `cpp`, `ts`).
    #[arg(long = "type", value_name = "LANG")]
    pub output_type: Option<String>,

    #[command(flatten)]
    pub backend: BackendArgs,
}

#[derive(Args, Debug, Default)]
pub struct BackendArgs {
    /// Local compiler binary; when set, jobs run locally instead of remotely.
    #[arg(long, value_name = "PATH", env = "STARLIGHT_BINARY_PATH")]
    pub binary_path: Option<String>,

    /// Remote generation service URL.
    #[arg(long, value_name = "URL", env = "STARLIGHT_API_URL")]
    pub api_url: Option<String>,
}

#[derive(Args, Debug)]
pub struct NewArgs {
    /// Directory the template folder is created in.
    #[arg(value_name = "DIR")]
    pub dir: PathBuf,

    /// Shader name; also names the folder and files.
    #[arg(value_name = "NAME")]
    pub name: String,
}

pub fn parse() -> Cli {
    Cli::parse()
}
