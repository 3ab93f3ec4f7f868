//! Duplicate detection over open issues.
//!
//! Scoring weights (configurable):
//! - Title token overlap (Jaccard): 40%
//! - Acceptance-criteria overlap (Jaccard): 40%
//! - Changed-file overlap from linked PRs (Jaccard): 20%
//!
//! A pair only qualifies when the acceptance criteria overlap, and, if
//! either issue has linked files, when those overlap too. Title similarity
//! alone never groups two issues. Files empty on both sides carry no
//! evidence; that component is dropped and the remaining weights are
//! renormalised before the threshold is applied.

use crate::issue::{Issue, IssueId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "for", "to", "of", "in", "on", "with", "is", "be", "when",
];

/// Relative weight of each similarity component.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DuplicateWeights {
    #[serde(default = "default_title_weight")]
    pub title: f64,
    #[serde(default = "default_criteria_weight")]
    pub criteria: f64,
    #[serde(default = "default_files_weight")]
    pub files: f64,
}

fn default_title_weight() -> f64 {
    0.4
}

fn default_criteria_weight() -> f64 {
    0.4
}

fn default_files_weight() -> f64 {
    0.2
}

impl Default for DuplicateWeights {
    fn default() -> Self {
        Self {
            title: default_title_weight(),
            criteria: default_criteria_weight(),
            files: default_files_weight(),
        }
    }
}

impl DuplicateWeights {
    pub fn sum(&self) -> f64 {
        self.title + self.criteria + self.files
    }
}

/// Issues judged equivalent. `canonical` is the oldest (minimum) id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateGroup {
    pub canonical: IssueId,
    /// All members, canonical included
    pub members: BTreeSet<IssueId>,
}

impl DuplicateGroup {
    /// Members to close in favour of the canonical issue.
    pub fn duplicates(&self) -> impl Iterator<Item = IssueId> + '_ {
        self.members.iter().copied().filter(move |id| *id != self.canonical)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: IssueId) -> bool {
        self.members.contains(&id)
    }
}

/// Breakdown of the similarity between two issues.
#[derive(Debug, Clone, PartialEq)]
pub struct Similarity {
    pub score: f64,
    pub title: Option<f64>,
    pub criteria: Option<f64>,
    pub files: Option<f64>,
}

impl Similarity {
    /// Criteria must overlap; files must overlap whenever either side has any.
    pub fn overlaps(&self) -> bool {
        let criteria = self.criteria.is_some_and(|c| c > 0.0);
        let files = self.files.is_none_or(|f| f > 0.0);
        criteria && files
    }
}

/// `None` when both sets are empty, otherwise |A ∩ B| / |A ∪ B|.
fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> Option<f64> {
    if a.is_empty() && b.is_empty() {
        return None;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    Some(intersection as f64 / union as f64)
}

fn title_tokens(title: &str) -> BTreeSet<String> {
    title
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty() && !STOP_WORDS.contains(t))
        .map(String::from)
        .collect()
}

fn normalise_line(line: &str) -> String {
    line.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(['.', ';', ':'])
        .to_string()
}

fn criteria_set(issue: &Issue) -> BTreeSet<String> {
    issue
        .acceptance_criteria
        .iter()
        .map(|c| normalise_line(c))
        .filter(|c| !c.is_empty())
        .collect()
}

fn file_set(issue: &Issue) -> BTreeSet<String> {
    issue
        .linked_files
        .iter()
        .map(|f| f.trim().trim_start_matches("./").to_string())
        .filter(|f| !f.is_empty())
        .collect()
}

/// Pairwise duplicate detector.
#[derive(Debug, Clone)]
pub struct DuplicateDetector {
    weights: DuplicateWeights,
    threshold: f64,
}

impl Default for DuplicateDetector {
    fn default() -> Self {
        Self::new(DuplicateWeights::default(), 0.75)
    }
}

impl DuplicateDetector {
    pub fn new(weights: DuplicateWeights, threshold: f64) -> Self {
        Self { weights, threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Weighted similarity of two issues.
    pub fn similarity(&self, a: &Issue, b: &Issue) -> Similarity {
        let title = jaccard(&title_tokens(&a.title), &title_tokens(&b.title));
        let criteria = jaccard(&criteria_set(a), &criteria_set(b));
        let files = jaccard(&file_set(a), &file_set(b));

        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        for (component, weight) in [
            (title, self.weights.title),
            (criteria, self.weights.criteria),
            (files, self.weights.files),
        ] {
            if let Some(value) = component {
                weighted += value * weight;
                total_weight += weight;
            }
        }

        let score = if total_weight > 0.0 {
            weighted / total_weight
        } else {
            0.0
        };

        Similarity {
            score,
            title,
            criteria,
            files,
        }
    }

    pub fn is_duplicate(&self, a: &Issue, b: &Issue) -> bool {
        self.qualifies(&self.similarity(a, b))
    }

    fn qualifies(&self, similarity: &Similarity) -> bool {
        similarity.overlaps() && similarity.score >= self.threshold
    }

    /// Group open issues into duplicate sets.
    ///
    /// Qualifying pairs are joined transitively. Only groups
    /// with two or more members are returned, ordered by canonical id.
    pub fn detect<'a>(&self, issues: impl IntoIterator<Item = &'a Issue>) -> Vec<DuplicateGroup> {
        let mut open: Vec<&Issue> = issues.into_iter().filter(|i| i.is_open()).collect();
        open.sort_by_key(|i| i.id);

        let mut parent: BTreeMap<IssueId, IssueId> = open.iter().map(|i| (i.id, i.id)).collect();

        for (i, a) in open.iter().enumerate() {
            for b in &open[i + 1..] {
                let similarity = self.similarity(a, b);
                if self.qualifies(&similarity) {
                    tracing::debug!(
                        a = %a.id,
                        b = %b.id,
                        score = similarity.score,
                        "Issues look like duplicates"
                    );
                    union(&mut parent, a.id, b.id);
                }
            }
        }

        let mut groups: BTreeMap<IssueId, BTreeSet<IssueId>> = BTreeMap::new();
        for issue in &open {
            let root = find(&mut parent, issue.id);
            groups.entry(root).or_default().insert(issue.id);
        }

        groups
            .into_values()
            .filter(|members| members.len() > 1)
            .filter_map(|members| {
                let canonical = *members.iter().next()?;
                Some(DuplicateGroup { canonical, members })
            })
            .collect()
    }
}

fn find(parent: &mut BTreeMap<IssueId, IssueId>, id: IssueId) -> IssueId {
    let mut root = id;
    while let Some(&p) = parent.get(&root) {
        if p == root {
            break;
        }
        root = p;
    }
    // Path compression
    let mut current = id;
    while current != root {
        let next = parent.get(&current).copied().unwrap_or(root);
        parent.insert(current, root);
        current = next;
    }
    root
}

/// Join two sets, keeping the smaller id as root.
fn union(parent: &mut BTreeMap<IssueId, IssueId>, a: IssueId, b: IssueId) {
    let ra = find(parent, a);
    let rb = find(parent, b);
    if ra == rb {
        return;
    }
    let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
    parent.insert(child, root);
}
