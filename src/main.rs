#![warn(
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unused_qualifications
)]
#![allow(clippy::enum_variant_names, clippy::type_complexity)]

use std::process::ExitCode;

mod cli;
mod convert;
mod errors;
mod git;
mod lock;
mod make_meta;
mod params_file;
mod svn;
mod term_out;
mod user_map;

use term_out::ProgressPrint;

pub(crate) type FHashMap<K, V> = std::collections::HashMap<K, V, foldhash::fast::RandomState>;

enum RunError {
    Generic,
    Usage,
}

fn main() -> ExitCode {
    match main_inner() {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Generic) => ExitCode::from(1),
        Err(RunError::Usage) => ExitCode::from(2),
    }
}

fn main_inner() -> Result<(), RunError> {
    let start = std::time::Instant::now();

    let args = match <cli::Cli as clap::Parser>::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            // --help and --version also end here
            return if e.use_stderr() {
                Err(RunError::Usage)
            } else {
                Ok(())
            };
        }
    };

    let enable_progress = !args.no_progress && !matches!(args.command, cli::Command::Log(_));
    let term_out = term_out::init(start, enable_progress).map_err(|e| {
        eprintln!("failed to start terminal output: {e}");
        RunError::Generic
    })?;
    let progress_print = term_out.get_progress_print();

    let stderr_log_level = args
        .stderr_log_level
        .unwrap_or(cli::LogLevel::Warn)
        .to_log_level_filter();
    let file_log_level = args.file_log_level.map(cli::LogLevel::to_log_level_filter);

    if let Err(e) = init_logger(
        Some(stderr_log_level),
        args.log_file.as_deref(),
        file_log_level,
        progress_print.clone(),
    ) {
        eprintln!("failed to initialize logging: {e}");
        return Err(RunError::Generic);
    }

    let r = match args.command {
        cli::Command::Fetch(ref sync_args) => run_sync(&progress_print, sync_args, convert::fetch),
        cli::Command::Pushback(ref sync_args) => {
            run_sync(&progress_print, sync_args, convert::pushback)
        }
        cli::Command::Log(ref log_args) => run_log(log_args),
    };

    term_out.finish();
    r
}

type SyncFn = fn(
    &ProgressPrint,
    &convert::Options,
    &dyn convert::MetaMaker,
    &std::path::Path,
    &std::path::Path,
) -> Result<errors::Report, errors::ConvertError>;

fn run_sync(
    progress_print: &ProgressPrint,
    args: &cli::SyncArgs,
    sync: SyncFn,
) -> Result<(), RunError> {
    let params_raw = std::fs::read_to_string(&args.conv_params).map_err(|e| {
        tracing::error!("failed to read {:?}: {e}", args.conv_params);
        RunError::Usage
    })?;
    let params: params_file::ConvParams = toml::from_str(&params_raw).map_err(|e| {
        tracing::error!("failed to parse {:?}: {e}", args.conv_params);
        RunError::Usage
    })?;

    let mut options = make_options(&params)?;
    options.obj_cache_size = args.git_obj_cache_size.saturating_mul(1024 * 1024);

    let user_map = match params.authors {
        None => user_map::UserMap::new(),
        Some(ref user_map_path) => {
            let user_map_path = if user_map_path.is_relative() {
                let conv_params_path_parent = args.conv_params.parent().ok_or_else(|| {
                    tracing::error!("invalid parameters file path: {:?}", args.conv_params);
                    RunError::Usage
                })?;
                conv_params_path_parent.join(user_map_path)
            } else {
                user_map_path.clone()
            };

            let user_map_file = std::fs::File::open(&user_map_path).map_err(|e| {
                tracing::error!("failed to open user map {user_map_path:?}: {e}");
                RunError::Generic
            })?;

            user_map::UserMap::parse(&mut std::io::BufReader::new(user_map_file)).map_err(|e| {
                tracing::error!("failed to read user map {user_map_path:?}: {e}");
                RunError::Generic
            })?
        }
    };

    let meta_maker = make_meta::GitMetaMaker::new(
        &user_map,
        params
            .user_fallback_template
            .as_deref()
            .unwrap_or(make_meta::DEFAULT_USER_FALLBACK_TEMPLATE),
        params
            .commit_msg_template
            .as_deref()
            .unwrap_or(make_meta::DEFAULT_COMMIT_MSG_TEMPLATE),
        params
            .tag_msg_template
            .as_deref()
            .unwrap_or(make_meta::DEFAULT_TAG_MSG_TEMPLATE),
    )
    .map_err(|e| {
        tracing::error!("{e}");
        RunError::Usage
    })?;

    sync(progress_print, &options, &meta_maker, &args.src, &args.dest)
        .map(drop)
        .map_err(|_| RunError::Generic)
}

fn make_options(params: &params_file::ConvParams) -> Result<convert::Options, RunError> {
    let layout_params = &params.layout;
    let layout = match layout_params.mode {
        params_file::LayoutMode::Standard => convert::Layout::standard(
            &layout_params.trunk,
            &layout_params.branches,
            &layout_params.tags,
            &layout_params.trunk_name,
        ),
        params_file::LayoutMode::Single => {
            convert::Layout::single(&layout_params.subdir, &layout_params.trunk_name)
        }
    }
    .map_err(|e| {
        tracing::error!("invalid layout: {e}");
        RunError::Usage
    })?;

    let mut options = convert::Options::new(layout);
    options.filemap = convert::FileMap::new(
        params.filemap.include.iter().map(String::as_str),
        params.filemap.exclude.iter().map(String::as_str),
    );
    options.keep_deleted_branches = params.keep_deleted_branches;
    options.keep_deleted_tags = params.keep_deleted_tags;
    options.stupid = params.stupid;
    options.warn_unmapped = params.warn_unmapped;
    Ok(options)
}

fn run_log(args: &cli::LogArgs) -> Result<(), RunError> {
    let out = convert::log(&args.repo, args.branch.as_deref(), &args.template)
        .map_err(|_| RunError::Generic)?;
    let mut stdout = std::io::stdout().lock();
    std::io::Write::write_all(&mut stdout, out.as_bytes())
        .and_then(|()| std::io::Write::flush(&mut stdout))
        .map_err(|e| {
            tracing::error!("failed to write output: {e}");
            RunError::Generic
        })
}

fn init_logger(
    stderr_level: Option<tracing::Level>,
    file_path: Option<&std::path::Path>,
    file_level: Option<tracing::Level>,
    progress_print: ProgressPrint,
) -> Result<(), std::io::Error> {
    use tracing_subscriber::layer::{Layer as _, SubscriberExt as _};
    use tracing_subscriber::util::SubscriberInitExt as _;

    let stderr_sub = if let Some(stderr_level) = stderr_level {
        let filter = tracing_subscriber::filter::LevelFilter::from_level(stderr_level);
        Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(MakeLogPrinter::new(progress_print))
                .with_filter(filter),
        )
    } else {
        None
    };

    let file_sub = if let Some(file_path) = file_path {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;

        let filter = tracing_subscriber::filter::LevelFilter::from_level(
            file_level.unwrap_or(tracing::Level::DEBUG),
        );
        Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file)
                .with_filter(filter),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(stderr_sub)
        .with(file_sub)
        .init();

    Ok(())
}

struct MakeLogPrinter {
    progress_print: ProgressPrint,
}

impl MakeLogPrinter {
    fn new(progress_print: ProgressPrint) -> Self {
        Self { progress_print }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for MakeLogPrinter {
    type Writer = LogPrinter<'a>;

    fn make_writer(&'a self) -> LogPrinter<'a> {
        LogPrinter {
            progress_print: &self.progress_print,
            buf: Vec::new(),
        }
    }
}

struct LogPrinter<'a> {
    progress_print: &'a ProgressPrint,
    buf: Vec<u8>,
}

impl Drop for LogPrinter<'_> {
    fn drop(&mut self) {
        self.progress_print.print_raw_line(self.buf.clone());
    }
}

impl std::io::Write for LogPrinter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend(buf);
        Ok(buf.len())
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.buf.extend(buf);
        Ok(())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
