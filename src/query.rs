//! Boolean query evaluation, sorting, and conversation collapsing.
//!
//! A query is an ordered list of terms. Each term carries an optional
//! sign (`+` union, `-` difference, default intersection) and is
//! rewritten to a posting-store lookup key before its hits are folded
//! into a running result set.

use std::collections::BTreeSet;

use crate::collab::Ui;
use crate::tokenizer::is_stopword;

/// Anything that can answer "which IIDs are posted under this exact
/// term". Implemented by the real posting store and by the filter
/// engine's virtual, single-message backend.
pub trait HitSource {
    fn hits_for_term(&self, term: &str) -> crate::error::Result<BTreeSet<u64>>;
}

/// Per-message fields the sorter needs, without depending on the whole
/// metadata index type.
pub trait SortKeys {
    fn date(&self, iid: u64) -> i64;
    fn from(&self, iid: u64) -> String;
    fn subject(&self, iid: u64) -> String;
    fn conv(&self, iid: u64) -> u64;
}

#[derive(Clone, Copy)]
enum Sign {
    Union,
    Difference,
    Intersection,
}

/// Split a raw term into its sign and the remaining body.
fn split_sign(token: &str) -> (Sign, &str) {
    if let Some(rest) = token.strip_prefix('+') {
        (Sign::Union, rest)
    } else if let Some(rest) = token.strip_prefix('-') {
        (Sign::Difference, rest)
    } else {
        (Sign::Intersection, token)
    }
}

/// Rewrite a term body to a posting-store lookup key, or `None` if it's
/// a stopword that should be skipped (with a warning).
///
/// - `body:X` -> `X` (no suffix)
/// - `FIELD:X` for any other field -> `X:FIELD`
/// - bare `X` -> `X`
fn rewrite(body: &str) -> Option<String> {
    let (word, lookup) = match body.split_once(':') {
        Some(("body", word)) => (word, word.to_string()),
        Some((field, word)) => (word, format!("{word}:{field}")),
        None => (body, body.to_string()),
    };
    if is_stopword(word) {
        None
    } else {
        Some(lookup)
    }
}

/// Evaluate `terms` against `source`, returning the reduced IID set with
/// the sentinel IID (`index_len`, guarding against aborted mid-scan
/// state) stripped out.
pub fn search(
    source: &dyn HitSource,
    terms: &[String],
    index_len: u64,
    ui: &dyn Ui,
) -> crate::error::Result<BTreeSet<u64>> {
    let mut result: Option<BTreeSet<u64>> = None;

    for token in terms {
        let (sign, body) = split_sign(token);
        let Some(lookup) = rewrite(body) else {
            ui.warning(&format!("skipping stopword term {token:?}"));
            continue;
        };
        let hits = source.hits_for_term(&lookup)?;

        result = Some(match result {
            None => hits,
            Some(current) => match sign {
                Sign::Union => current.union(&hits).copied().collect(),
                Sign::Difference => current.difference(&hits).copied().collect(),
                Sign::Intersection => current.intersection(&hits).copied().collect(),
            },
        });
    }

    let mut result = result.unwrap_or_default();
    result.remove(&index_len);
    Ok(result)
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum SortKey {
    Unsorted,
    Index,
    Random,
    Date,
    From,
    Subject,
}

fn parse_sort_name(name: &str) -> (SortKey, bool, bool) {
    let reverse = name.starts_with("rev-") || name.contains("reverse");
    let flat = name.contains("flat");
    let key = if name.contains("date") {
        SortKey::Date
    } else if name.contains("from") {
        SortKey::From
    } else if name.contains("subject") {
        SortKey::Subject
    } else if name.contains("random") {
        SortKey::Random
    } else if name.contains("index") {
        SortKey::Index
    } else {
        SortKey::Unsorted
    };
    (key, reverse, flat)
}

/// Opaque, stable-within-this-call permutation hash, seeded by wall
/// clock time so repeated "random" sorts of the same set differ call
/// to call but are reproducible within one.
fn random_key(seed: u64, iid: u64) -> u64 {
    let mut h = seed ^ iid.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}

/// Sort `ids` by the named key, apply the `sort_max` bounded-work
/// fallback, and collapse to one representative IID per conversation
/// unless the sort name contains `flat`.
pub fn sort_and_collapse(
    ids: BTreeSet<u64>,
    sort_name: &str,
    sort_max: u64,
    ui: &dyn Ui,
    keys: &dyn SortKeys,
) -> Vec<u64> {
    let all: Vec<u64> = ids.into_iter().collect();
    let (key, reverse, flat) = parse_sort_name(sort_name);

    let (mut to_sort, leftover) = if all.len() as u64 > sort_max {
        ui.warning(&format!(
            "result set of {} items exceeds sort_max {sort_max}; sorting only the first {sort_max} by index",
            all.len()
        ));
        let cut = sort_max as usize;
        (all[..cut].to_vec(), all[cut..].to_vec())
    } else {
        (all, Vec::new())
    };

    if leftover.is_empty() {
        match key {
            SortKey::Unsorted | SortKey::Index => {}
            SortKey::Random => {
                let seed = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                to_sort.sort_by_key(|&iid| random_key(seed, iid));
            }
            SortKey::Date => to_sort.sort_by_key(|&iid| keys.date(iid)),
            SortKey::From => to_sort.sort_by(|&a, &b| keys.from(a).cmp(&keys.from(b))),
            SortKey::Subject => to_sort.sort_by(|&a, &b| keys.subject(a).cmp(&keys.subject(b))),
        }
        if reverse {
            to_sort.reverse();
        }
    }

    let collapsed = if flat {
        to_sort
    } else {
        let mut seen_convs = std::collections::HashSet::new();
        to_sort
            .into_iter()
            .map(|iid| keys.conv(iid))
            .filter(|&conv| seen_convs.insert(conv))
            .collect()
    };

    collapsed.into_iter().chain(leftover).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeSource(HashMap<&'static str, BTreeSet<u64>>);

    impl HitSource for FakeSource {
        fn hits_for_term(&self, term: &str) -> crate::error::Result<BTreeSet<u64>> {
            Ok(self.0.get(term).cloned().unwrap_or_default())
        }
    }

    struct FakeKeys {
        date: HashMap<u64, i64>,
        conv: HashMap<u64, u64>,
    }

    impl SortKeys for FakeKeys {
        fn date(&self, iid: u64) -> i64 {
            *self.date.get(&iid).unwrap_or(&0)
        }
        fn from(&self, _iid: u64) -> String {
            String::new()
        }
        fn subject(&self, _iid: u64) -> String {
            String::new()
        }
        fn conv(&self, iid: u64) -> u64 {
            *self.conv.get(&iid).unwrap_or(&iid)
        }
    }

    fn ui() -> crate::collab::RecordingUi {
        crate::collab::RecordingUi::new()
    }

    #[test]
    fn bare_term_looks_up_unsuffixed() {
        let mut map = HashMap::new();
        map.insert("ping", BTreeSet::from([1, 2]));
        let source = FakeSource(map);
        let ui = ui();
        let result = search(&source, &["ping".to_string()], 100, &ui).unwrap();
        assert_eq!(result, BTreeSet::from([1, 2]));
    }

    #[test]
    fn field_scoped_term_rewrites_with_suffix() {
        let mut map = HashMap::new();
        map.insert("alice:from", BTreeSet::from([2]));
        let source = FakeSource(map);
        let ui = ui();
        let result = search(&source, &["from:alice".to_string()], 100, &ui).unwrap();
        assert_eq!(result, BTreeSet::from([2]));
    }

    #[test]
    fn body_prefix_looks_up_unsuffixed() {
        let mut map = HashMap::new();
        map.insert("report", BTreeSet::from([2]));
        let source = FakeSource(map);
        let ui = ui();
        let result = search(&source, &["body:report".to_string()], 100, &ui).unwrap();
        assert_eq!(result, BTreeSet::from([2]));
    }

    #[test]
    fn union_and_difference_signs() {
        let mut map = HashMap::new();
        map.insert("report", BTreeSet::from([2]));
        map.insert("alice:from", BTreeSet::from([2]));
        map.insert("bob:from", BTreeSet::from([3]));
        let source = FakeSource(map);
        let ui = ui();

        let result = search(
            &source,
            &["report".to_string(), "-from:bob".to_string()],
            100,
            &ui,
        )
        .unwrap();
        assert_eq!(result, BTreeSet::from([2]));
    }

    #[test]
    fn stopword_alone_yields_empty_set_with_warning() {
        let source = FakeSource(HashMap::new());
        let ui = ui();
        let result = search(&source, &["the".to_string()], 100, &ui).unwrap();
        assert!(result.is_empty());
        assert!(ui.calls().iter().any(|c| c.starts_with("warning")));
    }

    #[test]
    fn stopword_plus_term_equals_term_alone() {
        let mut map = HashMap::new();
        map.insert("report", BTreeSet::from([2]));
        let source = FakeSource(map);
        let ui = ui();

        let with_stopword = search(&source, &["the".to_string(), "report".to_string()], 100, &ui).unwrap();
        let alone = search(&source, &["report".to_string()], 100, &ui).unwrap();
        assert_eq!(with_stopword, alone);
    }

    #[test]
    fn sentinel_iid_is_stripped() {
        let mut map = HashMap::new();
        map.insert("ping", BTreeSet::from([1, 2, 100]));
        let source = FakeSource(map);
        let ui = ui();
        let result = search(&source, &["ping".to_string()], 100, &ui).unwrap();
        assert_eq!(result, BTreeSet::from([1, 2]));
    }

    #[test]
    fn sort_cap_falls_back_to_index_order_and_warns() {
        let ids: BTreeSet<u64> = (0..10).collect();
        let keys = FakeKeys {
            date: HashMap::new(),
            conv: HashMap::new(),
        };
        let ui = ui();
        let sorted = sort_and_collapse(ids, "date", 5, &ui, &keys);
        assert_eq!(sorted, vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert!(ui.calls().iter().any(|c| c.contains("sort_max")));
    }

    #[test]
    fn conversation_collapse_keeps_first_occurrence() {
        let ids = BTreeSet::from([0, 1, 2]);
        let mut conv = HashMap::new();
        conv.insert(0, 0);
        conv.insert(1, 0);
        conv.insert(2, 2);
        let keys = FakeKeys {
            date: HashMap::new(),
            conv,
        };
        let ui = ui();
        let result = sort_and_collapse(ids, "index", 5000, &ui, &keys);
        assert_eq!(result, vec![0, 2]);
    }

    #[test]
    fn conversation_collapse_emits_conv_id_not_surviving_iid() {
        // Two messages, both replies filed under conversation root 0.
        // Sorting by reverse-date puts IID 1 ahead of IID 0, but the
        // collapsed result must still be the conversation id, 0 — not 1.
        let ids = BTreeSet::from([0, 1]);
        let mut date = HashMap::new();
        date.insert(0, 100);
        date.insert(1, 200);
        let mut conv = HashMap::new();
        conv.insert(0, 0);
        conv.insert(1, 0);
        let keys = FakeKeys { date, conv };
        let ui = ui();
        let result = sort_and_collapse(ids, "rev-date", 5000, &ui, &keys);
        assert_eq!(result, vec![0]);
    }

    #[test]
    fn flat_sort_name_skips_collapse() {
        let ids = BTreeSet::from([0, 1, 2]);
        let mut conv = HashMap::new();
        conv.insert(0, 0);
        conv.insert(1, 0);
        conv.insert(2, 2);
        let keys = FakeKeys {
            date: HashMap::new(),
            conv,
        };
        let ui = ui();
        let result = sort_and_collapse(ids, "index-flat", 5000, &ui, &keys);
        assert_eq!(result, vec![0, 1, 2]);
    }
}
