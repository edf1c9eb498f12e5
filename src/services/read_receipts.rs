//! Read/unread estimates derived from participant read marks.
//!
//! These are client-side estimates. When the server supplies an "all read"
//! flag, that flag is the answer and the local computation is not consulted.

use chrono::{DateTime, Utc};

use super::chat_types::{ConversationKind, Participant};

/// True iff the single non-self participant has read up to `message_at`.
/// Equal timestamps count as read.
pub fn is_direct_read(
    participants: Option<&[Participant]>,
    my_id: Option<&str>,
    message_at: Option<DateTime<Utc>>,
) -> bool {
    let (Some(participants), Some(my_id), Some(message_at)) = (participants, my_id, message_at)
    else {
        return false;
    };

    participants
        .iter()
        .find(|p| p.user_id != my_id)
        .and_then(|p| p.last_read_at)
        .is_some_and(|read_at| read_at >= message_at)
}

/// True iff every non-self participant has read up to `message_at`.
/// One participant without a read mark makes the answer false.
pub fn is_group_all_read(
    participants: Option<&[Participant]>,
    my_id: Option<&str>,
    message_at: Option<DateTime<Utc>>,
) -> bool {
    let (Some(participants), Some(my_id), Some(message_at)) = (participants, my_id, message_at)
    else {
        return false;
    };

    let mut others = participants.iter().filter(|p| p.user_id != my_id).peekable();
    if others.peek().is_none() {
        return false;
    }
    others.all(|p| p.last_read_at.is_some_and(|read_at| read_at >= message_at))
}

/// Server flag when present, local estimate otherwise.
pub fn resolve_read(server_all_read: Option<bool>, computed: impl FnOnce() -> bool) -> bool {
    server_all_read.unwrap_or_else(computed)
}

/// Read state of a message in a conversation of the given kind.
pub fn message_read_state(
    kind: ConversationKind,
    participants: Option<&[Participant]>,
    my_id: Option<&str>,
    message_at: Option<DateTime<Utc>>,
    server_all_read: Option<bool>,
) -> bool {
    resolve_read(server_all_read, || match kind {
        ConversationKind::Direct => is_direct_read(participants, my_id, message_at),
        _ => is_group_all_read(participants, my_id, message_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, minute, 0).unwrap()
    }

    fn participant(id: &str, read: Option<u32>) -> Participant {
        Participant {
            user_id: id.to_string(),
            display_name: id.to_string(),
            avatar_ref: None,
            last_read_at: read.map(at),
        }
    }

    #[rstest]
    #[case::read_before_mark(1, true)]
    #[case::boundary_counts_as_read(2, true)]
    #[case::after_mark(3, false)]
    fn test_direct_read(#[case] message_minute: u32, #[case] expected: bool) {
        let members = vec![participant("me", None), participant("u1", Some(2))];
        assert_eq!(
            is_direct_read(Some(&members), Some("me"), Some(at(message_minute))),
            expected
        );
    }

    #[test]
    fn test_direct_read_missing_inputs() {
        let members = vec![participant("me", None), participant("u1", Some(2))];
        assert!(!is_direct_read(None, Some("me"), Some(at(1))));
        assert!(!is_direct_read(Some(&members), None, Some(at(1))));
        assert!(!is_direct_read(Some(&members), Some("me"), None));

        let unread = vec![participant("me", Some(9)), participant("u1", None)];
        assert!(!is_direct_read(Some(&unread), Some("me"), Some(at(1))));
    }

    #[rstest]
    #[case::everyone_read(vec![Some(5), Some(6)], 5, true)]
    #[case::one_behind(vec![Some(5), Some(3)], 4, false)]
    #[case::one_missing_fails_closed(vec![Some(9), None], 1, false)]
    fn test_group_all_read(
        #[case] reads: Vec<Option<u32>>,
        #[case] message_minute: u32,
        #[case] expected: bool,
    ) {
        let mut members = vec![participant("me", None)];
        for (i, read) in reads.into_iter().enumerate() {
            members.push(participant(&format!("u{}", i), read));
        }
        assert_eq!(
            is_group_all_read(Some(&members), Some("me"), Some(at(message_minute))),
            expected
        );
    }

    #[test]
    fn test_group_without_others_is_unread() {
        let members = vec![participant("me", Some(9))];
        assert!(!is_group_all_read(Some(&members), Some("me"), Some(at(1))));
    }

    #[test]
    fn test_group_read_is_monotonic_in_message_time() {
        let members = vec![
            participant("me", None),
            participant("u1", Some(10)),
            participant("u2", Some(12)),
        ];
        let first_true = (0..30)
            .rev()
            .find(|m| is_group_all_read(Some(&members), Some("me"), Some(at(*m))))
            .unwrap();
        for earlier in 0..=first_true {
            assert!(is_group_all_read(Some(&members), Some("me"), Some(at(earlier))));
        }
    }

    #[test]
    fn test_server_flag_wins() {
        let members = vec![participant("me", None), participant("u1", Some(2))];
        assert!(!message_read_state(
            ConversationKind::Direct,
            Some(&members),
            Some("me"),
            Some(at(1)),
            Some(false)
        ));
        assert!(message_read_state(
            ConversationKind::Group,
            None,
            Some("me"),
            Some(at(1)),
            Some(true)
        ));
        assert!(message_read_state(
            ConversationKind::Direct,
            Some(&members),
            Some("me"),
            Some(at(1)),
            None
        ));
    }
}
