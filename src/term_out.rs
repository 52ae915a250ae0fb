use std::io::Write as _;
use std::sync::mpsc;
use std::time::{Duration, Instant};

const UPDATE_PERIOD: Duration = Duration::from_millis(50);

pub(crate) fn init(start: Instant, enable_progress: bool) -> Result<Handle, std::io::Error> {
    let (sender, receiver) = mpsc::channel();

    let join_handle = std::thread::Builder::new()
        .name("term out".into())
        .spawn(move || {
            let mut screen = Screen {
                start,
                stderr: std::io::stderr(),
                progress: None,
                last_update: start,
                needs_update: false,
            };
            screen.run(enable_progress, &receiver);
        })?;

    Ok(Handle {
        join_handle,
        sender,
    })
}

/// Progress line at the bottom of stderr, redrawn at most every
/// `UPDATE_PERIOD` and once per second for the clock.
struct Screen {
    start: Instant,
    stderr: std::io::Stderr,
    progress: Option<String>,
    last_update: Instant,
    needs_update: bool,
}

impl Screen {
    fn run(&mut self, enable_progress: bool, receiver: &mpsc::Receiver<Command>) {
        loop {
            let timeout = self.progress.as_ref().map(|_| {
                if self.needs_update {
                    UPDATE_PERIOD.saturating_sub(self.last_update.elapsed())
                } else {
                    duration_to_next_second(self.start.elapsed())
                }
            });

            let cmd = match timeout {
                Some(timeout) if timeout.is_zero() => Err(mpsc::RecvTimeoutError::Timeout),
                Some(timeout) => receiver.recv_timeout(timeout),
                None => receiver.recv().map_err(Into::into),
            };

            // stderr failures have nowhere to be reported
            let _ = match cmd {
                Ok(Command::Finish) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                    let _ = self.end_line();
                    break;
                }
                Ok(Command::PrintRawLine(line)) => self.print_line(&line),
                Ok(Command::SetProgress(progress)) if enable_progress => {
                    self.progress = Some(progress);
                    if self.last_update.elapsed() >= UPDATE_PERIOD {
                        self.redraw()
                    } else {
                        self.needs_update = true;
                        Ok(())
                    }
                }
                Ok(Command::SetProgress(_)) => Ok(()),
                Ok(Command::FreezeProgress) => {
                    let r = self.end_line();
                    self.progress = None;
                    r
                }
                Err(mpsc::RecvTimeoutError::Timeout) => self.redraw(),
            };
        }
    }

    fn progress_line(&self) -> Option<String> {
        let line = self.progress.as_deref()?;
        let elapsed = self.start.elapsed().as_secs();
        let secs = elapsed % 60;
        let mins = (elapsed / 60) % 60;
        let hours = elapsed / 3600;
        Some(format!("[{hours:02}:{mins:02}:{secs:02}] {line}"))
    }

    fn redraw(&mut self) -> std::io::Result<()> {
        self.last_update = Instant::now();
        self.needs_update = false;
        let Some(progress_line) = self.progress_line() else {
            return Ok(());
        };
        crossterm::queue!(
            self.stderr,
            crossterm::cursor::MoveToColumn(0),
            crossterm::style::Print(progress_line),
            crossterm::terminal::Clear(crossterm::terminal::ClearType::UntilNewLine),
        )?;
        self.stderr.flush()
    }

    /// Leaves the current progress on its own line.
    fn end_line(&mut self) -> std::io::Result<()> {
        if self.progress.is_none() {
            return Ok(());
        }
        if self.needs_update {
            self.redraw()?;
        }
        crossterm::queue!(
            self.stderr,
            crossterm::style::Print('\n'),
            crossterm::cursor::MoveToColumn(0),
        )?;
        self.stderr.flush()
    }

    fn print_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        match self.progress_line() {
            Some(progress_line) => {
                crossterm::queue!(
                    self.stderr,
                    crossterm::terminal::Clear(crossterm::terminal::ClearType::CurrentLine),
                    crossterm::cursor::MoveToColumn(0),
                )?;
                self.stderr.write_all(line)?;
                crossterm::queue!(self.stderr, crossterm::style::Print(progress_line))?;
            }
            None => self.stderr.write_all(line)?,
        }
        self.stderr.flush()
    }
}

fn duration_to_next_second(duration: Duration) -> Duration {
    let subsec_nanos = duration.subsec_nanos();
    if subsec_nanos == 0 {
        Duration::ZERO
    } else {
        Duration::from_nanos((1_000_000_000 - subsec_nanos).into())
    }
}

enum Command {
    Finish,
    PrintRawLine(Vec<u8>),
    SetProgress(String),
    FreezeProgress,
}

pub(crate) struct Handle {
    join_handle: std::thread::JoinHandle<()>,
    sender: mpsc::Sender<Command>,
}

impl Handle {
    pub(crate) fn finish(self) {
        let _ = self.sender.send(Command::Finish);
        if self.join_handle.join().is_err() {
            eprintln!("terminal output thread panicked");
        }
    }

    pub(crate) fn get_progress_print(&self) -> ProgressPrint {
        ProgressPrint {
            sender: self.sender.clone(),
        }
    }
}

/// Sends progress and log lines to the terminal thread. Messages sent
/// after the thread finished are dropped.
#[derive(Clone)]
pub(crate) struct ProgressPrint {
    sender: mpsc::Sender<Command>,
}

impl ProgressPrint {
    pub(crate) fn set_progress(&self, progress: String) {
        let _ = self.sender.send(Command::SetProgress(progress));
    }

    pub(crate) fn freeze_progress(&self) {
        let _ = self.sender.send(Command::FreezeProgress);
    }

    pub(crate) fn print_raw_line(&self, line: Vec<u8>) {
        let _ = self.sender.send(Command::PrintRawLine(line));
    }
}
