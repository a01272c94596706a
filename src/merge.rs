//! Merge/diff engine: partitions incoming articles against the stored
//! snapshot and computes typed field-level deltas so the store persists only
//! what actually changed.
//!
//! Everything here is pure; the store owns all I/O.

use std::collections::{HashMap, HashSet};

use crate::storage::{Article, ArticleId};

// ============================================================================
// Field-Level Diff
// ============================================================================

/// One changed article column and its new value.
///
/// Authors are not represented here: they live in a separate relation and are
/// saved as a related-object delta, independent of the scalar columns.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldChange {
    Title(Option<String>),
    ContentHtml(Option<String>),
    ContentText(Option<String>),
    Summary(Option<String>),
    DatePublished(Option<i64>),
    DateModified(Option<i64>),
}

impl FieldChange {
    /// The column this change writes to.
    pub fn column(&self) -> &'static str {
        match self {
            FieldChange::Title(_) => "title",
            FieldChange::ContentHtml(_) => "content_html",
            FieldChange::ContentText(_) => "content_text",
            FieldChange::Summary(_) => "summary",
            FieldChange::DatePublished(_) => "date_published",
            FieldChange::DateModified(_) => "date_modified",
        }
    }
}

/// Compute the scalar columns whose values differ between the stored article
/// and its incoming replacement.
pub fn diff_fields(stored: &Article, incoming: &Article) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    if stored.title != incoming.title {
        changes.push(FieldChange::Title(incoming.title.clone()));
    }
    if stored.content_html != incoming.content_html {
        changes.push(FieldChange::ContentHtml(incoming.content_html.clone()));
    }
    if stored.content_text != incoming.content_text {
        changes.push(FieldChange::ContentText(incoming.content_text.clone()));
    }
    if stored.summary != incoming.summary {
        changes.push(FieldChange::Summary(incoming.summary.clone()));
    }
    if stored.date_published != incoming.date_published {
        changes.push(FieldChange::DatePublished(incoming.date_published));
    }
    if stored.date_modified != incoming.date_modified {
        changes.push(FieldChange::DateModified(incoming.date_modified));
    }
    changes
}

/// True when the two articles relate to different author sets.
pub fn authors_changed(stored: &Article, incoming: &Article) -> bool {
    stored.authors != incoming.authors
}

// ============================================================================
// Partition
// ============================================================================

/// Split incoming articles into (new, updated) against the stored snapshot.
///
/// New: id not in the snapshot. Updated: id present, deep value inequality
/// over every field including the authors set. Ties cannot occur because
/// identity is by id; "changed" is deep equality, never a timestamp race,
/// so whichever update ran last wins unconditionally.
pub fn partition(
    incoming: &[Article],
    stored: &HashMap<ArticleId, Article>,
) -> (Vec<Article>, Vec<Article>) {
    let mut new = Vec::new();
    let mut updated = Vec::new();
    for article in incoming {
        match stored.get(&article.article_id) {
            None => new.push(article.clone()),
            Some(existing) if existing != article => updated.push(article.clone()),
            Some(_) => {}
        }
    }
    (new, updated)
}

/// Stored articles eligible for deletion after a feed-scoped update: absent
/// from the incoming set, read, unstarred, and arrived before the cutoff.
pub fn deletable(
    stored: &HashMap<ArticleId, Article>,
    incoming_ids: &HashSet<ArticleId>,
    arrival_cutoff: i64,
) -> Vec<Article> {
    stored
        .values()
        .filter(|a| {
            !incoming_ids.contains(&a.article_id)
                && a.status.read
                && !a.status.starred
                && a.date_arrived < arrival_cutoff
        })
        .cloned()
        .collect()
}
