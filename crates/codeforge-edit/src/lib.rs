//! Structured-edit envelope parsing and application: the Edit Parser and
//! Edit Applier of the edit pipeline, wired to the Snapshot Store and Event
//! Sink so a caller can drive the whole "apply" path in one call.

pub mod applier;
pub mod parser;

pub use applier::{ApplyOutcome, ApplyReport, ApplyStatus, EditApplier};
pub use parser::{locate_envelope, parse, parse_envelope};

use chrono::Utc;
use codeforge_core::EventSink;
use codeforge_observe::Observer;
use codeforge_snapshot::SnapshotStore;
use std::path::Path;

/// Runs the full "apply" path described in §4.7/§4.8: parse the model's
/// envelope out of `model_output`, apply every edit it contains, and — if
/// at least one edit actually changed the workspace — force a snapshot and
/// report it. A parse failure is fatal: it is reported through `sink` and
/// no file is touched.
pub fn apply_model_output(
    model_output: &str,
    workspace: &Path,
    snapshot_store: &SnapshotStore<'_>,
    observer: Option<&Observer>,
    sink: &EventSink,
) -> ApplyReport {
    let edits = match parser::parse(model_output) {
        Ok(edits) => edits,
        Err(err) => {
            if let Some(observer) = observer {
                observer.error(&format!("envelope parse failed: {err}"));
            }
            sink.error(err.to_string());
            return ApplyReport::default();
        }
    };

    let applier = EditApplier::new(workspace.to_path_buf(), observer);
    let report = applier.apply(&edits);

    if report.any_succeeded() {
        let label = format!("{}_ai_change", Utc::now().to_rfc3339());
        match snapshot_store.create(&label, true) {
            Ok(result) => sink.snapshot_created(result.label, None),
            Err(err) => {
                if let Some(observer) = observer {
                    observer.error(&format!("post-apply snapshot failed: {err}"));
                }
            }
        }
    }

    report
}
