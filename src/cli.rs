use std::path::PathBuf;

#[derive(clap::Parser)]
#[command(name = "svnbridge", about = "Converts Subversion history into Git and pushes Git commits back")]
pub(crate) struct Cli {
    #[arg(
        long = "stderr-log-level",
        value_name = "LEVEL",
        value_enum,
        global = true,
        help = "Maximum stderr log level (warn by default)"
    )]
    pub(crate) stderr_log_level: Option<LogLevel>,
    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        help = "File to write logs (besides stderr)"
    )]
    pub(crate) log_file: Option<PathBuf>,
    #[arg(
        long = "file-log-level",
        value_name = "LEVEL",
        value_enum,
        global = true,
        help = "Maximum file log level (debug by default)"
    )]
    pub(crate) file_log_level: Option<LogLevel>,
    #[arg(long = "no-progress", global = true, help = "Do not print progress")]
    pub(crate) no_progress: bool,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(clap::Subcommand)]
pub(crate) enum Command {
    /// Converts the revisions not converted yet
    Fetch(SyncArgs),
    /// Replays new commits of the converted branches into the source
    Pushback(SyncArgs),
    /// Prints the source provenance of a branch history
    Log(LogArgs),
}

#[derive(clap::Args)]
pub(crate) struct SyncArgs {
    #[arg(
        long = "src",
        short = 's',
        value_name = "PATH",
        help = "Source Subversion repository or dump file"
    )]
    pub(crate) src: PathBuf,
    #[arg(
        long = "dest",
        short = 'd',
        value_name = "PATH",
        help = "Git repository, created if it does not exist"
    )]
    pub(crate) dest: PathBuf,
    #[arg(
        long = "conv-params",
        short = 'P',
        value_name = "FILE",
        help = "Conversion parameters"
    )]
    pub(crate) conv_params: PathBuf,
    #[arg(
        long = "obj-cache-size",
        value_name = "SIZE",
        help = "size (in MiB) of in-memory git object cache",
        default_value_t = 384
    )]
    pub(crate) git_obj_cache_size: usize,
}

#[derive(clap::Args)]
pub(crate) struct LogArgs {
    #[arg(long = "repo", value_name = "PATH", help = "Converted git repository")]
    pub(crate) repo: PathBuf,
    #[arg(
        long = "branch",
        value_name = "NAME",
        help = "Branch or tag to walk (HEAD by default)"
    )]
    pub(crate) branch: Option<String>,
    #[arg(
        long = "template",
        value_name = "TEMPLATE",
        default_value = "{{ commit }} {{ svnrev }} {{ svnpath }}\n",
        help = "Template rendered for each commit"
    )]
    pub(crate) template: String,
}

#[derive(Copy, Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogLevel {
    #[value(name = "error")]
    Error,
    #[value(name = "warn")]
    Warn,
    #[value(name = "info")]
    Info,
    #[value(name = "debug")]
    Debug,
    #[value(name = "trace")]
    Trace,
}

impl LogLevel {
    pub(crate) fn to_log_level_filter(self) -> tracing::Level {
        match self {
            Self::Error => tracing::Level::ERROR,
            Self::Warn => tracing::Level::WARN,
            Self::Info => tracing::Level::INFO,
            Self::Debug => tracing::Level::DEBUG,
            Self::Trace => tracing::Level::TRACE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Cli, Command};

    #[test]
    fn test_parse() {
        let cli = <Cli as clap::Parser>::try_parse_from([
            "svnbridge",
            "fetch",
            "--src",
            "repo.dump",
            "-d",
            "out.git",
            "-P",
            "params.toml",
            "--no-progress",
        ])
        .unwrap();
        assert!(cli.no_progress);
        let Command::Fetch(args) = cli.command else {
            panic!("expected fetch");
        };
        assert_eq!(args.git_obj_cache_size, 384);

        let cli = <Cli as clap::Parser>::try_parse_from([
            "svnbridge", "log", "--repo", "out.git", "--branch", "v1",
        ])
        .unwrap();
        let Command::Log(args) = cli.command else {
            panic!("expected log");
        };
        assert_eq!(args.branch.as_deref(), Some("v1"));

        assert!(<Cli as clap::Parser>::try_parse_from(["svnbridge", "fetch"]).is_err());
    }
}
