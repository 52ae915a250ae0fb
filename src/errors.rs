use gix_hash::ObjectId;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Severity {
    Warning,
    Fatal,
}

/// Problems that leave the conversion in a consistent state.
///
/// They are logged when they happen and summarized once the run finishes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Anomaly {
    ExternalSyntax {
        rev: u32,
        dir: Vec<u8>,
        line: Vec<u8>,
    },
    ContentConflict {
        rev: u32,
        path: Vec<u8>,
        kind: ConflictKind,
    },
    PushConflict {
        commit: ObjectId,
        reason: String,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ConflictKind {
    DeleteMissing,
    ModifyMissing,
    NotADirectory,
}

impl Anomaly {
    fn label(&self) -> &'static str {
        match self {
            Self::ExternalSyntax { .. } => "invalid svn:externals",
            Self::ContentConflict { .. } => "content conflicts",
            Self::PushConflict { .. } => "push conflicts",
        }
    }
}

impl std::fmt::Display for Anomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExternalSyntax { rev, dir, line } => write!(
                f,
                "r{rev}: ignoring svn:externals on \"{}\", cannot parse \"{}\"",
                dir.escape_ascii(),
                line.escape_ascii(),
            ),
            Self::ContentConflict { rev, path, kind } => {
                let what = match kind {
                    ConflictKind::DeleteMissing => "delete of missing path",
                    ConflictKind::ModifyMissing => "modification of missing file",
                    ConflictKind::NotADirectory => "directory operation on a file",
                };
                write!(f, "r{rev}: {what} \"{}\"", path.escape_ascii())
            }
            Self::PushConflict { commit, reason } => {
                write!(f, "cannot push commit {commit}: {reason}")
            }
        }
    }
}

/// Errors that stop the run.
///
/// I/O and storage failures are logged where they happen and surface as
/// `Aborted`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ConvertError {
    SourceIntegrity { rev: u32, reason: String },
    LayoutMismatch,
    DuplicateMapping { rev: u32, commit: ObjectId },
    Aborted,
}

impl std::fmt::Display for ConvertError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SourceIntegrity { rev, reason } => {
                write!(f, "source integrity error at r{rev}: {reason}")
            }
            Self::LayoutMismatch => write!(
                f,
                "the configured layout does not map any path to a branch",
            ),
            Self::DuplicateMapping { rev, commit } => {
                write!(f, "r{rev}: commit {commit} is already mapped")
            }
            Self::Aborted => write!(f, "conversion aborted"),
        }
    }
}

/// Outcome of an operation that may fail either way.
#[derive(Debug)]
pub(crate) enum Failure {
    Recoverable(Anomaly),
    Fatal(ConvertError),
}

impl Failure {
    pub(crate) fn severity(&self) -> Severity {
        match self {
            Self::Recoverable(_) => Severity::Warning,
            Self::Fatal(_) => Severity::Fatal,
        }
    }
}

impl From<Anomaly> for Failure {
    #[inline]
    fn from(a: Anomaly) -> Self {
        Self::Recoverable(a)
    }
}

impl From<ConvertError> for Failure {
    #[inline]
    fn from(e: ConvertError) -> Self {
        Self::Fatal(e)
    }
}

#[derive(Default)]
pub(crate) struct Report {
    anomalies: Vec<Anomaly>,
}

impl Report {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn note(&mut self, anomaly: Anomaly) {
        tracing::warn!("{anomaly}");
        self.anomalies.push(anomaly);
    }

    /// Downgrades a recoverable failure to a warning.
    pub(crate) fn absorb<T>(&mut self, r: Result<T, Failure>) -> Result<Option<T>, ConvertError> {
        match r {
            Ok(v) => Ok(Some(v)),
            Err(Failure::Recoverable(anomaly)) => {
                self.note(anomaly);
                Ok(None)
            }
            Err(Failure::Fatal(e)) => Err(e),
        }
    }

    #[inline]
    pub(crate) fn anomalies(&self) -> &[Anomaly] {
        &self.anomalies
    }

    pub(crate) fn summary(&self) -> Vec<String> {
        let mut counts = Vec::<(&'static str, usize)>::new();
        for anomaly in self.anomalies.iter() {
            let label = anomaly.label();
            if let Some(entry) = counts.iter_mut().find(|(l, _)| *l == label) {
                entry.1 += 1;
            } else {
                counts.push((label, 1));
            }
        }
        counts
            .into_iter()
            .map(|(label, n)| format!("{n} warning(s): {label}"))
            .collect()
    }

    pub(crate) fn log_summary(&self) {
        if self.anomalies.is_empty() {
            return;
        }
        for line in self.summary() {
            tracing::warn!("{line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Anomaly, ConflictKind, ConvertError, Failure, Report, Severity};

    fn conflict(rev: u32) -> Anomaly {
        Anomaly::ContentConflict {
            rev,
            path: b"trunk/a".to_vec(),
            kind: ConflictKind::DeleteMissing,
        }
    }

    #[test]
    fn test_absorb() {
        let mut report = Report::new();

        assert_eq!(report.absorb::<u32>(Ok(1)), Ok(Some(1)));
        assert_eq!(report.absorb::<u32>(Err(conflict(3).into())), Ok(None));
        assert_eq!(
            report.absorb::<u32>(Err(ConvertError::LayoutMismatch.into())),
            Err(ConvertError::LayoutMismatch),
        );
        assert_eq!(report.anomalies(), [conflict(3)]);
    }

    #[test]
    fn test_severity() {
        assert_eq!(Failure::from(conflict(1)).severity(), Severity::Warning);
        assert_eq!(
            Failure::from(ConvertError::Aborted).severity(),
            Severity::Fatal,
        );
    }

    #[test]
    fn test_summary() {
        let mut report = Report::new();
        report.note(conflict(1));
        report.note(conflict(2));
        report.note(Anomaly::ExternalSyntax {
            rev: 2,
            dir: b"trunk".to_vec(),
            line: b"???".to_vec(),
        });
        assert_eq!(
            report.summary(),
            [
                "2 warning(s): content conflicts",
                "1 warning(s): invalid svn:externals",
            ],
        );
    }
}
