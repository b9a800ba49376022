//! Filter engine: user rules that derive synthetic `<tag>:tag` keywords.
//!
//! Each rule either matches every message (`terms: None`, the `*` rule)
//! or is itself a boolean query, evaluated against a one-message virtual
//! posting-list backend built from the candidate's own keyword set. This
//! reuses the query evaluator rather than re-implementing term
//! rewriting and set reduction.

use std::collections::BTreeSet;

use crate::collab::{FilterRule, TagOp, Ui};
use crate::error::Result;
use crate::query::{self, HitSource};

/// A one-message posting-list view: a term "hits" iff it's in this
/// message's own keyword set, and the hit is always this message's IID.
struct VirtualSource<'a> {
    keywords: &'a BTreeSet<String>,
    iid: u64,
}

impl HitSource for VirtualSource<'_> {
    fn hits_for_term(&self, term: &str) -> Result<BTreeSet<u64>> {
        Ok(if self.keywords.contains(term) {
            BTreeSet::from([self.iid])
        } else {
            BTreeSet::new()
        })
    }
}

/// Apply every rule in filter-id order to `keywords`, evaluating later
/// rules against the keyword set as mutated by earlier ones.
pub fn apply(rules: &[FilterRule], mut keywords: BTreeSet<String>, iid: u64, ui: &dyn Ui) -> Result<BTreeSet<String>> {
    let mut ordered: Vec<&FilterRule> = rules.iter().collect();
    ordered.sort_by(|a, b| a.id.cmp(&b.id));

    for rule in ordered {
        let matches = match &rule.terms {
            None => true,
            Some(query_text) => {
                let source = VirtualSource {
                    keywords: &keywords,
                    iid,
                };
                let tokens: Vec<String> = query_text.split_whitespace().map(str::to_string).collect();
                !query::search(&source, &tokens, u64::MAX, ui)?.is_empty()
            }
        };

        if matches {
            for op in &rule.tag_ops {
                match op {
                    TagOp::Add(tag) => {
                        keywords.insert(format!("{tag}:tag"));
                    }
                    TagOp::Remove(tag) => {
                        keywords.remove(&format!("{tag}:tag"));
                    }
                }
            }
        }
    }

    Ok(keywords)
}
