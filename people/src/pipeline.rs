//! The batch "cluster people" job.

use std::collections::HashSet;

use serde::Serialize;
use thiserror::Error;

use crate::engine::Engine;
use crate::error::PeopleError;
use crate::progress::{CancelToken, Milestones, Progress};
use crate::types::MergeSuggestion;

/// Per-run overrides. Unset thresholds come from the engine configuration.
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Plan auto-merges without executing them.
    pub dry_run: bool,
    pub match_threshold: Option<f32>,
    pub cluster_eps: Option<f32>,
    pub cluster_min_samples: Option<usize>,
    pub suggest_threshold: Option<f32>,
}

/// What one pipeline run did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PassReport {
    pub faces_matched: usize,
    pub faces_clustered: usize,
    pub photos_synced: usize,
    pub suggestions: usize,
    pub persons_merged: usize,
    /// Auto-merges that failed per item (stale or conflicting).
    pub merges_skipped: usize,
    /// `(source, target)` pairs chosen for auto-merge, executed or not.
    pub planned: Vec<(String, String)>,
    pub cancelled: bool,
}

impl PassReport {
    pub fn faces_labeled(&self) -> usize {
        self.faces_matched + self.faces_clustered
    }
}

/// A pipeline run that stopped early. Work committed before the failure is
/// kept and counted in `report`.
#[derive(Debug, Error)]
#[error(
    "{} faces labeled, {} persons merged before failure: {source}",
    .report.faces_labeled(),
    .report.persons_merged
)]
pub struct PipelineError {
    pub report: PassReport,
    pub source: PeopleError,
}

/// Split cancellation off a phase result: `Ok((count, cancelled))`.
fn settle(result: Result<usize, PeopleError>) -> Result<(usize, bool), PeopleError> {
    match result {
        Ok(n) => Ok((n, false)),
        Err(PeopleError::Cancelled { completed }) => Ok((completed, true)),
        Err(e) => Err(e),
    }
}

impl Engine {
    /// Pick `(source, target)` for an auto-merge, or `None` when the
    /// suggestion is below the confidence policy.
    ///
    /// Merge when confidence exceeds `auto_merge_confidence`, or when either
    /// side is a placeholder and confidence exceeds
    /// `placeholder_auto_merge_confidence`. A placeholder folds into a named
    /// person; otherwise the side with fewer faces folds into the other,
    /// and ties keep `person_a`.
    pub fn plan_merge(&self, s: &MergeSuggestion) -> Option<(String, String)> {
        let eligible = s.confidence > self.cfg.auto_merge_confidence
            || (s.has_placeholder() && s.confidence > self.cfg.placeholder_auto_merge_confidence);
        if !eligible {
            return None;
        }
        let a_folds = match (s.placeholder_a, s.placeholder_b) {
            (true, false) => true,
            (false, true) => false,
            _ => s.faces_a < s.faces_b,
        };
        Some(if a_folds {
            (s.person_a.clone(), s.person_b.clone())
        } else {
            (s.person_b.clone(), s.person_a.clone())
        })
    }

    /// Run matching, discovery, association sync, suggestion and auto-merge
    /// in order.
    ///
    /// Faces are matched against persons that existed when the run started;
    /// persons discovered in this run are only considered for merging.
    /// Cancellation is not an error: the report comes back with
    /// `cancelled` set.
    pub fn run_pipeline(
        &self,
        opts: &PipelineOptions,
        progress: &dyn Progress,
        cancel: &CancelToken,
    ) -> Result<PassReport, PipelineError> {
        let top = Milestones::new(progress);
        top.report(0);
        let mut report = PassReport::default();
        match self.run_phases(opts, &top, cancel, &mut report) {
            Ok(()) => {
                if !report.cancelled {
                    top.report(100);
                }
                tracing::info!(
                    matched = report.faces_matched,
                    clustered = report.faces_clustered,
                    merged = report.persons_merged,
                    cancelled = report.cancelled,
                    "people: pipeline finished"
                );
                Ok(report)
            }
            Err(source) => {
                tracing::error!(error = %source, "people: pipeline failed");
                Err(PipelineError { report, source })
            }
        }
    }

    fn run_phases(
        &self,
        opts: &PipelineOptions,
        top: &Milestones<'_>,
        cancel: &CancelToken,
        report: &mut PassReport,
    ) -> Result<(), PeopleError> {
        let cfg = &self.cfg;

        let phase = Milestones::span(top, 0, 30);
        let threshold = opts.match_threshold.unwrap_or(cfg.match_threshold);
        let (n, cancelled) = settle(self.match_unlabeled_faces(threshold, &phase, cancel))?;
        report.faces_matched = n;
        if cancelled {
            report.cancelled = true;
            return Ok(());
        }

        let phase = Milestones::span(top, 30, 60);
        let eps = opts.cluster_eps.unwrap_or(cfg.cluster_eps);
        let min_samples = opts.cluster_min_samples.unwrap_or(cfg.cluster_min_samples);
        let (n, cancelled) = settle(self.discover_clusters(eps, min_samples, &phase, cancel))?;
        report.faces_clustered = n;
        if cancelled {
            report.cancelled = true;
            return Ok(());
        }

        let phase = Milestones::span(top, 60, 70);
        let (n, cancelled) = settle(self.sync_all_photos(&phase, cancel))?;
        report.photos_synced = n;
        if cancelled {
            report.cancelled = true;
            return Ok(());
        }

        let threshold = opts.suggest_threshold.unwrap_or(cfg.suggest_threshold);
        let suggestions = self.suggest_merges(threshold)?;
        report.suggestions = suggestions.len();
        top.report(80);

        let phase = Milestones::span(top, 80, 100);
        let mut merged_away: HashSet<String> = HashSet::new();
        for (i, s) in suggestions.iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                return Ok(());
            }
            phase.report_fraction(0, 100, i, suggestions.len());
            if merged_away.contains(&s.person_a) || merged_away.contains(&s.person_b) {
                continue;
            }
            let Some((source, target)) = self.plan_merge(s) else {
                continue;
            };
            report.planned.push((source.clone(), target.clone()));
            if opts.dry_run {
                merged_away.insert(source);
                continue;
            }
            match self.merge(&source, &target) {
                Ok(_) => {
                    report.persons_merged += 1;
                    merged_away.insert(source);
                }
                Err(e) if e.is_per_item() => {
                    tracing::warn!(source = %source, target = %target, error = %e, "people: auto-merge skipped");
                    report.merges_skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        phase.report(100);
        Ok(())
    }
}
