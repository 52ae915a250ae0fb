mod diff;
mod dump;
mod editor;
mod props;
mod reader;
mod source;

pub(crate) use diff::apply as apply_delta;
pub(crate) use dump::{DumpWriter, NodeAction, NodeOut};
pub(crate) use editor::{CommitInfo, DumpFileEditor, EditOp, EditorError, SourceEditor, sort_ops};
pub(crate) use props::{PropChange, Properties};
pub(crate) use reader::{
    ChangeKind, CopyFrom, DumpRevisionReader, NodeKind, PathChange, RevisionSource,
    SourceError, SourceRevision, Text,
};
pub(crate) use source::DumpSource;

pub(crate) mod prop_list {
    pub(crate) use super::props::{deserialize, serialize};
}
