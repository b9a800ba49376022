//! Drives ingest: mbox -> parse -> tokenize -> filter -> post -> record.

use std::path::Path;

use crate::collab::{Config, Ui};
use crate::error::Result;
use crate::hashing::msg_id_hash;
use crate::metadata::MailIndex;
use crate::postinglist::PostingStore;
use crate::{filters, tokenizer};

/// Progress and cooperative-cancellation granularity, in messages.
const PROGRESS_GRANULARITY: usize = 317;

/// The first three characters of a PTR are the mailbox id it points into.
fn mailbox_id_of(ptr: &str) -> &str {
    &ptr[..3.min(ptr.len())]
}

/// Scan every configured mailbox, in order, cooperatively cancelling at
/// [`PROGRESS_GRANULARITY`]-message boundaries. Saves the metadata index
/// only if at least one message was added.
pub fn scan_all(
    cfg: &dyn Config,
    index: &mut MailIndex,
    postings: &PostingStore,
    ui: &dyn Ui,
    cancel: &dyn Fn() -> bool,
) -> Result<usize> {
    let mut total_added = 0;
    for (mailbox_id, path) in cfg.get_mailboxes() {
        if cancel() {
            break;
        }
        total_added += scan_mailbox(cfg, &mailbox_id, &path, index, postings, ui, cancel)?;
    }
    if total_added > 0 {
        index.save(postings)?;
    }
    Ok(total_added)
}

/// Scan one mailbox, incrementally: open (or resume) its reader, catch
/// up on appended bytes, then turn every unseen message into an MR.
pub fn scan_mailbox(
    cfg: &dyn Config,
    mailbox_id: &str,
    path: &Path,
    index: &mut MailIndex,
    postings: &PostingStore,
    ui: &dyn Ui,
    cancel: &dyn Fn() -> bool,
) -> Result<usize> {
    let mut reader = cfg.open_mailbox(mailbox_id, path)?;
    reader.update()?;

    if reader.last_parsed() + 1 == reader.len() as i64 {
        return Ok(0);
    }

    if index.ptr_map_is_empty() {
        index.update_secondary()?;
    }

    let mut added = 0usize;
    let mut last_used_date: u64 = 0;
    let start = (reader.last_parsed() + 1) as usize;

    for key in start..reader.len() {
        if key % PROGRESS_GRANULARITY == 0 && cancel() {
            break;
        }

        let ptr = reader
            .pointer(key)
            .expect("key is within reader bounds by loop range");

        if index.iid_for_ptr(&ptr).is_some() {
            reader.set_last_parsed(key);
            continue;
        }

        let raw = reader.read_message(key)?;
        let parsed = tokenizer::parse(&raw)?;
        let mid = parsed
            .message_id
            .as_deref()
            .map(msg_id_hash)
            .unwrap_or_else(|| msg_id_hash(&ptr));

        if let Some(existing_iid) = index.iid_for_mid(&mid) {
            let existing_ptr = index.get(existing_iid)?.ptr.clone();
            if mailbox_id_of(&existing_ptr) == mailbox_id {
                index.update_ptr_and_size(existing_iid, ptr, raw.len() as u64)?;
            }
        } else {
            let date = parsed
                .date_header
                .as_deref()
                .and_then(tokenizer::parse_date_header)
                .map(|d| d.max(0) as u64)
                .unwrap_or(last_used_date + 1);
            last_used_date = date;

            let referenced_iid = parsed
                .references
                .iter()
                .find_map(|reference| index.iid_for_mid(&msg_id_hash(reference)));
            let conv_root = referenced_iid.map(|ref_iid| index.get(ref_iid)).transpose()?.map(|mr| mr.conv);

            let predicted_iid = index.len();
            let conv = conv_root.unwrap_or(predicted_iid);

            let keywords = tokenizer::extract_keywords(&parsed, date as i64);
            let filtered = filters::apply(&cfg.get_filters(), keywords, predicted_iid, ui)?;

            let tags: Vec<String> = filtered
                .iter()
                .filter_map(|kw| kw.strip_suffix(":tag").map(str::to_string))
                .collect();

            for keyword in &filtered {
                postings.append(keyword, predicted_iid)?;
            }

            let iid = index.add_message(
                ptr,
                raw.len() as u64,
                mid,
                date,
                parsed.from.clone(),
                parsed.subject.clone(),
                tags,
                conv,
            )?;
            debug_assert_eq!(iid, predicted_iid);

            if let Some(root) = conv_root {
                index.add_reply(root, iid)?;
            }

            added += 1;
        }

        reader.set_last_parsed(key);

        if (key + 1) % PROGRESS_GRANULARITY == 0 {
            ui.mark(&format!("scanned {} messages in mailbox {mailbox_id}", key + 1));
        }
    }

    reader.save()?;
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{InMemoryConfig, NullUi};
    use crate::fdcache::AppendFdCache;
    use std::sync::Arc;

    fn write_mbox(path: &Path, messages: &[&str]) {
        std::fs::write(path, messages.concat()).unwrap();
    }

    fn setup(dir: &Path) -> (MailIndex, PostingStore) {
        let index = MailIndex::new(dir.join("mailindex"));
        let postings = PostingStore::new(dir.join("search"), 60, Arc::new(AppendFdCache::new(32))).unwrap();
        (index, postings)
    }

    #[test]
    fn scan_indexes_two_message_thread_and_builds_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let mbox_path = dir.path().join("mail");
        write_mbox(
            &mbox_path,
            &[
                "From a@x Mon Jan 1\r\nMessage-ID: <a@x>\r\nSubject: Hello\r\nDate: Wed, 1 Jan 2025 00:00:00 +0000\r\n\r\nping pong\r\n",
                "From b@x Mon Jan 1\r\nMessage-ID: <b@x>\r\nIn-Reply-To: <a@x>\r\nSubject: Re: Hello\r\nDate: Wed, 1 Jan 2025 00:01:00 +0000\r\n\r\nreply\r\n",
            ],
        );

        let (mut index, postings) = setup(dir.path());
        let cfg = InMemoryConfig::new(dir.path()).with_mailbox("000", &mbox_path);
        let ui = NullUi;

        let added = scan_mailbox(&cfg, "000", &mbox_path, &mut index, &postings, &ui, &|| false).unwrap();
        assert_eq!(added, 2);
        assert_eq!(index.len(), 2);
        assert_eq!(index.get(0).unwrap().conv, 0);
        assert_eq!(index.get(1).unwrap().conv, 0);
        assert_eq!(index.get_replies(0).unwrap(), vec![1]);

        assert_eq!(postings.hits("ping").unwrap(), std::collections::BTreeSet::from([0]));
        assert_eq!(postings.hits("reply").unwrap(), std::collections::BTreeSet::from([1]));
    }

    #[test]
    fn reply_to_a_reply_joins_the_thread_root_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let mbox_path = dir.path().join("mail");
        write_mbox(
            &mbox_path,
            &[
                "From a@x Mon Jan 1\r\nMessage-ID: <a@x>\r\nSubject: Hello\r\nDate: Wed, 1 Jan 2025 00:00:00 +0000\r\n\r\nroot\r\n",
                "From b@x Mon Jan 1\r\nMessage-ID: <b@x>\r\nIn-Reply-To: <a@x>\r\nSubject: Re: Hello\r\nDate: Wed, 1 Jan 2025 00:01:00 +0000\r\n\r\nmiddle\r\n",
                "From c@x Mon Jan 1\r\nMessage-ID: <c@x>\r\nIn-Reply-To: <b@x>\r\nSubject: Re: Hello\r\nDate: Wed, 1 Jan 2025 00:02:00 +0000\r\n\r\nleaf\r\n",
            ],
        );

        let (mut index, postings) = setup(dir.path());
        let cfg = InMemoryConfig::new(dir.path()).with_mailbox("000", &mbox_path);
        let ui = NullUi;

        let added = scan_mailbox(&cfg, "000", &mbox_path, &mut index, &postings, &ui, &|| false).unwrap();
        assert_eq!(added, 3);
        // The third message replies to the second, but its CONV must be
        // the thread root (0), not the second message's own IID (1).
        assert_eq!(index.get(2).unwrap().conv, 0);
        assert_eq!(index.get_replies(0).unwrap(), vec![1, 2]);
        assert!(index.get_replies(1).unwrap().is_empty());
    }

    #[test]
    fn rescan_with_no_new_messages_adds_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mbox_path = dir.path().join("mail");
        write_mbox(
            &mbox_path,
            &["From a@x Mon Jan 1\r\nMessage-ID: <a@x>\r\nSubject: Hi\r\n\r\nbody\r\n"],
        );

        let (mut index, postings) = setup(dir.path());
        let cfg = InMemoryConfig::new(dir.path()).with_mailbox("000", &mbox_path);
        let ui = NullUi;

        scan_mailbox(&cfg, "000", &mbox_path, &mut index, &postings, &ui, &|| false).unwrap();
        let added_again = scan_mailbox(&cfg, "000", &mbox_path, &mut index, &postings, &ui, &|| false).unwrap();
        assert_eq!(added_again, 0);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn moved_message_within_mailbox_updates_ptr_and_size_only() {
        let dir = tempfile::tempdir().unwrap();
        let mbox_path = dir.path().join("mail");
        write_mbox(
            &mbox_path,
            &[
                "From a@x Mon Jan 1\r\nMessage-ID: <a@x>\r\nSubject: Hi\r\n\r\nbody one\r\n",
                "From b@x Mon Jan 1\r\nMessage-ID: <b@x>\r\nSubject: Hi2\r\n\r\nbody two\r\n",
            ],
        );

        let (mut index, postings) = setup(dir.path());
        let cfg = InMemoryConfig::new(dir.path()).with_mailbox("000", &mbox_path);
        let ui = NullUi;
        scan_mailbox(&cfg, "000", &mbox_path, &mut index, &postings, &ui, &|| false).unwrap();
        assert_eq!(index.len(), 2);

        // Rewrite so the second message moves earlier (simulate deletion of padding).
        write_mbox(
            &mbox_path,
            &["From b@x Mon Jan 1\r\nMessage-ID: <b@x>\r\nSubject: Hi2\r\n\r\nbody two\r\n"],
        );

        let snapshot_path = cfg.mbox_snapshot_path("000");
        std::fs::remove_file(&snapshot_path).ok();
        // A from-scratch reload observes only the moved message's new position;
        // since its MID is already known, it is treated as a move in place
        // (same mailbox id), updating PTR/SIZE without growing the index.
        scan_mailbox(&cfg, "000", &mbox_path, &mut index, &postings, &ui, &|| false).unwrap();
        assert_eq!(index.len(), 2);
    }
}
