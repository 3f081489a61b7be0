use time::OffsetDateTime;
use tracing::debug;

use crate::registry::TrackedFile;
use crate::repository::RemoteObject;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullDecision<'a> {
    NoRemote,
    UpToDate(&'a RemoteObject),
    Download(&'a RemoteObject),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushDecision<'a> {
    Create,
    Replace(&'a RemoteObject),
    /// The remote already holds the local content.
    Unchanged(&'a RemoteObject),
}

/// Decides whether `file` needs a download. Candidates are the listing entries
/// named `file.remote_name`, in listing order; the first one modified after
/// the last pull or our own last push wins. Entries with unparsable timestamps never count as newer.
/// A missing local copy is restored from the first candidate.
pub fn plan_pull<'a>(
    listing: &'a [RemoteObject],
    file: &TrackedFile,
    local_exists: bool,
) -> PullDecision<'a> {
    let mut first_match = None;
    for remote in listing.iter().filter(|r| r.name == file.remote_name) {
        first_match.get_or_insert(remote);
        match remote.modified_at() {
            Some(modified) if modified > file.synced_through() => {
                return PullDecision::Download(remote);
            }
            Some(_) => {}
            None => debug!(
                remote_name = %remote.name,
                modified_time = %remote.modified_time,
                "skipping remote with malformed modification time"
            ),
        }
    }
    match first_match {
        None => PullDecision::NoRemote,
        Some(remote) if !local_exists => PullDecision::Download(remote),
        Some(remote) => PullDecision::UpToDate(remote),
    }
}

/// Decides how to send local content with digest `local_md5`. The first
/// listing entry named `file.remote_name` is the target. It is left alone when
/// the local content has not changed since the last transfer, or when the
/// remote reports the same digest.
pub fn plan_push<'a>(
    listing: &'a [RemoteObject],
    file: &TrackedFile,
    local_md5: &str,
) -> PushDecision<'a> {
    let Some(remote) = listing.iter().find(|r| r.name == file.remote_name) else {
        return PushDecision::Create;
    };
    let unchanged_locally = file.local_md5.as_deref() == Some(local_md5);
    let same_remotely = remote
        .md5
        .as_deref()
        .is_some_and(|md5| md5.eq_ignore_ascii_case(local_md5));
    if unchanged_locally || same_remotely {
        PushDecision::Unchanged(remote)
    } else {
        PushDecision::Replace(remote)
    }
}

/// Marker recorded after transferring `remote` at `now`: never earlier than
/// the remote modification time, so the transferred version is not fetched
/// again when clocks disagree.
pub fn synced_at(now: OffsetDateTime, remote: &RemoteObject) -> OffsetDateTime {
    match remote.modified_at() {
        Some(modified) if modified > now => modified,
        _ => now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Status, Vendor, never_pulled_at};
    use std::path::PathBuf;
    use time::macros::datetime;

    fn remote(id: &str, name: &str, modified: &str) -> RemoteObject {
        RemoteObject {
            id: id.into(),
            name: name.into(),
            modified_time: modified.into(),
            size: None,
            md5: None,
        }
    }

    fn tracked(name: &str, last_pulled: OffsetDateTime) -> TrackedFile {
        TrackedFile {
            id: 1,
            remote_id: String::new(),
            remote_name: name.into(),
            local_path: PathBuf::from("/tmp").join(name),
            vendor: Vendor::GoogleDrive,
            status: Status::Error,
            last_pulled,
            last_pushed: never_pulled_at(),
            local_md5: None,
        }
    }

    #[test]
    fn no_matching_name_means_no_remote() {
        let listing = vec![remote("1", "other.txt", "2024-01-01T00:00:00Z")];
        let file = tracked("report.csv", never_pulled_at());
        assert_eq!(plan_pull(&listing, &file, true), PullDecision::NoRemote);
        assert_eq!(plan_push(&listing, &file, "abc"), PushDecision::Create);
    }

    #[test]
    fn newer_remote_is_downloaded() {
        let listing = vec![remote("1", "report.csv", "2024-01-02T00:00:00Z")];
        let file = tracked("report.csv", datetime!(2024-01-01 00:00:00 UTC));
        assert_eq!(
            plan_pull(&listing, &file, true),
            PullDecision::Download(&listing[0])
        );
    }

    #[test]
    fn remote_not_newer_than_last_pull_is_up_to_date() {
        let listing = vec![remote("1", "report.csv", "2024-01-01T00:00:00Z")];
        let same = tracked("report.csv", datetime!(2024-01-01 00:00:00 UTC));
        let later = tracked("report.csv", datetime!(2024-05-01 00:00:00 UTC));
        assert_eq!(
            plan_pull(&listing, &same, true),
            PullDecision::UpToDate(&listing[0])
        );
        assert_eq!(
            plan_pull(&listing, &later, true),
            PullDecision::UpToDate(&listing[0])
        );
    }

    #[test]
    fn missing_local_copy_is_restored() {
        let listing = vec![remote("1", "report.csv", "2024-01-01T00:00:00Z")];
        let file = tracked("report.csv", datetime!(2024-05-01 00:00:00 UTC));
        assert_eq!(
            plan_pull(&listing, &file, false),
            PullDecision::Download(&listing[0])
        );
    }

    #[test]
    fn malformed_timestamps_are_skipped() {
        let listing = vec![
            remote("1", "report.csv", "not-a-date"),
            remote("2", "report.csv", "2024-03-01T00:00:00Z"),
        ];
        let file = tracked("report.csv", datetime!(2024-01-01 00:00:00 UTC));
        assert_eq!(
            plan_pull(&listing, &file, true),
            PullDecision::Download(&listing[1])
        );

        let only_bad = vec![remote("1", "report.csv", "")];
        assert_eq!(
            plan_pull(&only_bad, &file, true),
            PullDecision::UpToDate(&only_bad[0])
        );
    }

    #[test]
    fn duplicate_names_resolve_to_first_newer_in_listing_order() {
        let listing = vec![
            remote("old", "dup.txt", "2023-01-01T00:00:00Z"),
            remote("a", "dup.txt", "2024-02-01T00:00:00Z"),
            remote("b", "dup.txt", "2024-03-01T00:00:00Z"),
        ];
        let file = tracked("dup.txt", datetime!(2024-01-01 00:00:00 UTC));
        assert_eq!(
            plan_pull(&listing, &file, true),
            PullDecision::Download(&listing[1])
        );
        assert_eq!(
            plan_push(&listing, &file, "abc"),
            PushDecision::Replace(&listing[0])
        );
    }

    #[test]
    fn own_push_is_not_downloaded_again() {
        let listing = vec![remote("1", "vault.kdbx", "2024-03-01T08:00:05Z")];
        let mut file = tracked("vault.kdbx", datetime!(2024-01-01 00:00:00 UTC));
        assert_eq!(
            plan_pull(&listing, &file, true),
            PullDecision::Download(&listing[0])
        );

        file.last_pushed = datetime!(2024-03-01 08:00:05 UTC);
        assert_eq!(
            plan_pull(&listing, &file, true),
            PullDecision::UpToDate(&listing[0])
        );
    }

    #[test]
    fn remote_edit_after_own_push_is_downloaded() {
        let listing = vec![remote("1", "vault.kdbx", "2024-03-02T00:00:00Z")];
        let mut file = tracked("vault.kdbx", datetime!(2024-01-01 00:00:00 UTC));
        file.last_pushed = datetime!(2024-03-01 08:00:05 UTC);
        assert_eq!(
            plan_pull(&listing, &file, true),
            PullDecision::Download(&listing[0])
        );
    }

    #[test]
    fn unchanged_local_content_is_not_pushed() {
        let listing = vec![remote("1", "vault.kdbx", "2024-01-01T00:00:00Z")];
        let mut file = tracked("vault.kdbx", datetime!(2024-01-01 00:00:00 UTC));
        file.local_md5 = Some("aaa".into());

        assert_eq!(
            plan_push(&listing, &file, "aaa"),
            PushDecision::Unchanged(&listing[0])
        );
        assert_eq!(
            plan_push(&listing, &file, "bbb"),
            PushDecision::Replace(&listing[0])
        );
    }

    #[test]
    fn matching_remote_digest_is_not_pushed() {
        let mut listing = vec![remote("1", "vault.kdbx", "2024-01-01T00:00:00Z")];
        listing[0].md5 = Some("5D41402ABC4B2A76B9719D911017C592".into());
        let file = tracked("vault.kdbx", never_pulled_at());

        assert_eq!(
            plan_push(&listing, &file, "5d41402abc4b2a76b9719d911017c592"),
            PushDecision::Unchanged(&listing[0])
        );
    }

    #[test]
    fn missing_remote_is_created_even_when_content_is_known() {
        let mut file = tracked("vault.kdbx", never_pulled_at());
        file.local_md5 = Some("aaa".into());
        assert_eq!(plan_push(&[], &file, "aaa"), PushDecision::Create);
    }

    #[test]
    fn synced_at_is_never_before_remote_modification() {
        let future = remote("1", "a", "2030-01-01T00:00:00Z");
        let past = remote("2", "a", "2024-01-01T00:00:00Z");
        let now = datetime!(2025-06-01 12:00:00 UTC);
        assert_eq!(synced_at(now, &future), datetime!(2030-01-01 00:00:00 UTC));
        assert_eq!(synced_at(now, &past), now);
    }
}
