use gix_hash::ObjectId;

use crate::errors::{ConvertError, Report};
use crate::git::ObjectStore;
use crate::lock::RepoLock;
use crate::svn::{self, Properties, RevisionSource, SourceRevision};
use crate::term_out::ProgressPrint;

mod branches;
mod builder;
mod externals;
mod filemap;
mod layout;
mod options;
mod provenance;
mod pushback;
mod refs;
mod revmap;
mod root_tree;

pub(crate) use filemap::FileMap;
pub(crate) use layout::{Layout, LayoutError};
pub(crate) use options::Options;
pub(crate) use pushback::pushback;

use branches::{BranchDetector, BranchRegistry};
use builder::{CommitGraphBuilder, Incremental, RevisionCtx, Stupid, TreeStrategy};
use revmap::{RevMapStore, Transaction};
use root_tree::RootEditor;

pub(crate) struct GitCommitMeta {
    pub(crate) author: gix_actor::Signature,
    pub(crate) committer: gix_actor::Signature,
    pub(crate) message: String,
}

pub(crate) struct GitTagMeta {
    pub(crate) tagger: Option<gix_actor::Signature>,
    pub(crate) message: String,
}

/// Renders commit and tag metadata from revision properties.
pub(crate) trait MetaMaker {
    fn commit_meta(
        &self,
        svn_uuid: Option<&uuid::Uuid>,
        svn_rev_no: u32,
        svn_path: &[u8],
        svn_rev_props: &Properties,
    ) -> Result<GitCommitMeta, String>;

    fn tag_meta(
        &self,
        svn_uuid: Option<&uuid::Uuid>,
        svn_rev_no: u32,
        svn_path: &[u8],
        svn_rev_props: &Properties,
    ) -> Result<GitTagMeta, String>;
}

/// Conversion state of a target repository, held under its lock.
pub(crate) struct Converter<'a> {
    progress_print: &'a ProgressPrint,
    options: &'a Options,
    meta_maker: &'a dyn MetaMaker,
    store: ObjectStore,
    revmap: RevMapStore,
    registry: BranchRegistry,
    report: Report,
    _lock: RepoLock,
}

impl<'a> Converter<'a> {
    pub(crate) fn open(
        progress_print: &'a ProgressPrint,
        options: &'a Options,
        meta_maker: &'a dyn MetaMaker,
        dst_path: &std::path::Path,
    ) -> Result<Self, ConvertError> {
        progress_print.set_progress("opening git repository".into());
        let store = ObjectStore::init_or_open(dst_path, &options.head_ref(), options.obj_cache_size)
            .map_err(|e| {
                tracing::error!("{e}");
                ConvertError::Aborted
            })?;
        let own_dir = store.path().join("svnbridge");
        let lock = RepoLock::acquire(&own_dir).map_err(|e| {
            tracing::error!("failed to lock repository: {e}");
            ConvertError::Aborted
        })?;

        let (revmap, transactions) = RevMapStore::open(&own_dir.join("journal"))?;
        let mut registry = BranchRegistry::new();
        for txn in transactions.iter() {
            registry.apply(txn);
        }
        if let Some(last) = revmap.last_converted(revmap.uuid()) {
            tracing::info!(
                "loaded {} branch(es), last converted revision is r{last}",
                registry.branches().len(),
            );
        }

        Ok(Self {
            progress_print,
            options,
            meta_maker,
            store,
            revmap,
            registry,
            report: Report::new(),
            _lock: lock,
        })
    }

    /// First revision the next fetch needs.
    pub(crate) fn next_revision(&self) -> u32 {
        self.revmap
            .last_converted(self.revmap.uuid())
            .map_or(0, |last| last + 1)
    }

    /// Converts every revision `source` delivers.
    pub(crate) fn fetch_from(
        &mut self,
        source: &mut dyn RevisionSource,
        adopt: Option<(&[u8], ObjectId)>,
    ) -> Result<u32, ConvertError> {
        let uuid = source.uuid();
        let mut expected = self.revmap.last_converted(uuid).map(|last| last + 1);
        let resuming = !self.revmap.is_empty();
        let mut converted = 0;
        let mut saw_changes = false;

        loop {
            let revision = match source.next_revision() {
                Ok(Some(revision)) => revision,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("failed to read source: {e}");
                    return Err(self.stopped(expected.unwrap_or(0), ConvertError::Aborted));
                }
            };
            let rev = revision.number;

            let r = self
                .check_source(uuid, rev, expected, resuming)
                .and_then(|()| self.convert_revision(uuid, &revision, adopt));
            if let Err(e) = r {
                return Err(self.stopped(rev, e));
            }
            saw_changes |= !revision.changes.is_empty();
            expected = Some(rev + 1);
            converted += 1;
        }

        if saw_changes && self.registry.branches().is_empty() {
            let e = ConvertError::LayoutMismatch;
            tracing::error!("{e}");
            return Err(e);
        }
        Ok(converted)
    }

    fn stopped(&self, rev: u32, e: ConvertError) -> ConvertError {
        if e != ConvertError::Aborted {
            tracing::error!("{e}");
        }
        match self.revmap.last_converted(self.revmap.uuid()) {
            Some(last) => tracing::error!(
                "conversion stopped at revision {rev}; rerun to resume after revision {last}",
            ),
            None => tracing::error!("conversion stopped at revision {rev}; no revision was recorded"),
        }
        e
    }

    fn check_source(
        &self,
        uuid: Option<uuid::Uuid>,
        rev: u32,
        expected: Option<u32>,
        resuming: bool,
    ) -> Result<(), ConvertError> {
        if resuming && (uuid.is_none() || uuid != self.revmap.uuid()) {
            return Err(ConvertError::SourceIntegrity {
                rev,
                reason: "the source repository UUID does not match the converted one".into(),
            });
        }
        match expected {
            None if rev > 1 => Err(ConvertError::SourceIntegrity {
                rev,
                reason: "history must start at revision 0 or 1".into(),
            }),
            Some(expected) if rev != expected => Err(ConvertError::SourceIntegrity {
                rev,
                reason: format!("expected revision {expected}"),
            }),
            _ => Ok(()),
        }
    }

    fn convert_revision(
        &mut self,
        uuid: Option<uuid::Uuid>,
        revision: &SourceRevision,
        adopt: Option<(&[u8], ObjectId)>,
    ) -> Result<(), ConvertError> {
        let rev = revision.number;
        tracing::debug!("converting r{rev} ({} change(s))", revision.changes.len());
        self.progress_print.set_progress(format!("converting r{rev}"));

        let base = rev
            .checked_sub(1)
            .and_then(|prev| self.revmap.root_trees(uuid, prev));
        let mut editor = RootEditor::new(
            &self.options.layout,
            &self.options.filemap,
            rev,
            base,
            &mut self.store,
        )?;
        for change in revision.changes.iter() {
            editor.apply(change, &self.revmap, uuid, &mut self.store, &mut self.report)?;
        }
        let (trees, ops) = editor.finish(&mut self.store)?;

        let plans = BranchDetector::new(
            &self.options.layout,
            &self.registry,
            &self.revmap,
            uuid,
            rev,
            self.options.warn_unmapped,
        )
        .detect(&ops, trees.meta, &self.store)?;

        let strategy: &dyn TreeStrategy = if self.options.stupid {
            &Stupid
        } else {
            &Incremental
        };
        let ctx = RevisionCtx {
            uuid,
            rev,
            properties: &revision.properties,
            trees,
        };
        let events = CommitGraphBuilder::new(self.options, self.meta_maker, strategy).build(
            &ctx,
            &plans,
            &self.registry,
            adopt,
            &mut self.store,
            &mut self.report,
        )?;

        self.store.sync().map_err(|e| {
            tracing::error!("{e}");
            ConvertError::Aborted
        })?;
        let txn = Transaction {
            uuid,
            rev,
            trees,
            events,
        };
        self.revmap.commit(&txn)?;
        self.registry.apply(&txn);
        Ok(())
    }

    pub(crate) fn update_refs(&mut self) -> Result<(), ConvertError> {
        self.progress_print.set_progress("updating refs".into());
        refs::update_refs(&mut self.store, &self.registry, self.options)
    }

    pub(crate) fn finish(self) -> Report {
        self.progress_print.freeze_progress();
        self.report.log_summary();
        self.report
    }
}

fn open_reader(
    src_path: &std::path::Path,
    since: u32,
) -> Result<svn::DumpRevisionReader<svn::DumpSource>, ConvertError> {
    let source = svn::DumpSource::open(src_path, since).map_err(|e| {
        tracing::error!("{e}");
        ConvertError::Aborted
    })?;
    svn::DumpRevisionReader::new(source, since).map_err(|e| {
        tracing::error!("failed to read {src_path:?}: {e}");
        ConvertError::Aborted
    })
}

fn close_reader(reader: svn::DumpRevisionReader<svn::DumpSource>) -> Result<(), ConvertError> {
    reader.into_inner().close().map_err(|e| {
        tracing::error!("failed to close source: {e}");
        ConvertError::Aborted
    })
}

/// Converts the revisions of `src_path` not converted yet into the
/// repository at `dst_path`.
pub(crate) fn fetch(
    progress_print: &ProgressPrint,
    options: &Options,
    meta_maker: &dyn MetaMaker,
    src_path: &std::path::Path,
    dst_path: &std::path::Path,
) -> Result<Report, ConvertError> {
    let mut converter = Converter::open(progress_print, options, meta_maker, dst_path)?;
    let since = converter.next_revision();
    tracing::info!("fetching from r{since}");

    let mut reader = open_reader(src_path, since)?;
    let converted = converter.fetch_from(&mut reader, None)?;
    close_reader(reader)?;
    tracing::info!("converted {converted} revision(s)");

    converter.update_refs()?;
    Ok(converter.finish())
}

/// Renders the provenance of the first-parent history of a branch.
pub(crate) fn log(
    repo_path: &std::path::Path,
    branch: Option<&str>,
    template: &str,
) -> Result<String, ConvertError> {
    if !repo_path.is_dir() {
        tracing::error!("{repo_path:?} is not a directory");
        return Err(ConvertError::Aborted);
    }
    let store = ObjectStore::open(repo_path, 1 << 24).map_err(|e| {
        tracing::error!("{e}");
        ConvertError::Aborted
    })?;
    let revmap = RevMapStore::open_read_only(&store.path().join("svnbridge").join("journal"))?;
    provenance::log(&store, &revmap, branch, template)
}
