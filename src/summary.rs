use regex::Regex;

use crate::types::{ChatMessage, PartyRole, SenderType};

pub struct ConversationSummary {
    pub summary: String,
    pub topics: Vec<String>,
}

fn canon(text: &str) -> String {
    text.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Drops a leading greeting ("hi", "hello,", "good morning!") so the first
/// substantive utterance leads the summary.
pub fn strip_greeting(text: &str) -> String {
    Regex::new(r"(?i)^\s*(hi+|hello+|hey+|good (morning|afternoon|evening))[\s,!.:-]*")
        .map(|re| re.replace(text, "").trim().to_string())
        .unwrap_or_else(|_| text.trim().to_string())
}

/// Whole minutes between two RFC3339 timestamps, rounded to the nearest
/// minute with a floor of 1 when the span is positive.
pub fn minutes_between(started_at: &str, ended_at: &str) -> Option<i64> {
    let start = chrono::DateTime::parse_from_rfc3339(started_at).ok()?;
    let end = chrono::DateTime::parse_from_rfc3339(ended_at).ok()?;
    let ms = end.signed_duration_since(start).num_milliseconds();
    if ms > 0 {
        Some(((ms as f64 / 60_000.0).round() as i64).max(1))
    } else {
        None
    }
}

pub fn summarize_conversation(
    messages: &[ChatMessage],
    user_name: &str,
    agent_name: Option<&str>,
    ended_by: PartyRole,
    end_requested_by: Option<PartyRole>,
    started_at: &str,
    ended_at: &str,
) -> ConversationSummary {
    let user_texts = messages
        .iter()
        .filter(|m| m.sender_type == SenderType::User)
        .map(|m| m.text.as_str())
        .collect::<Vec<_>>();
    let agent_texts = messages
        .iter()
        .filter(|m| m.sender_type == SenderType::Agent)
        .map(|m| m.text.as_str())
        .collect::<Vec<_>>();

    let first_user_raw = user_texts.first().copied().unwrap_or("").trim();
    let stripped = strip_greeting(first_user_raw);
    let first_user = if !stripped.is_empty() {
        stripped
    } else if !first_user_raw.is_empty() {
        first_user_raw.to_string()
    } else {
        "asked for help".to_string()
    };
    let truncated = first_user.chars().take(120).collect::<String>();
    let first_quoted = if first_user.chars().count() > 120 {
        format!("\"{truncated}\"…")
    } else {
        format!("\"{truncated}\"")
    };

    let message_count = messages.len();
    let minutes = minutes_between(started_at, ended_at);
    let agent_label = agent_name.unwrap_or("the agent");

    let timing = match minutes {
        Some(minutes) => format!(
            "After {message_count} messages over ~{minutes} minute{},",
            if minutes == 1 { "" } else { "s" }
        ),
        None => format!("After {message_count} messages,"),
    };
    let requested = end_requested_by
        .map(|role| format!(" (requested by {})", role.as_str()))
        .unwrap_or_default();
    let summary = format!(
        "{user_name} started the chat saying {first_quoted}. {agent_label} responded. \
         {user_name} asked for assistance. {agent_label} acknowledged the request. \
         {timing} the chat was ended by {}{requested}.",
        ended_by.as_str()
    );
    let summary = summary.split_whitespace().collect::<Vec<_>>().join(" ");

    let corpus = canon(&format!("{} {}", user_texts.join(" "), agent_texts.join(" ")));
    let mut topics = Vec::new();
    for word in corpus.split_whitespace() {
        if word.chars().count() > 3 && !topics.iter().any(|t| t == word) {
            topics.push(word.to_string());
            if topics.len() == 8 {
                break;
            }
        }
    }

    ConversationSummary { summary, topics }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::now_iso;

    fn message(sender_type: SenderType, text: &str) -> ChatMessage {
        ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: "s1".to_string(),
            sender_type,
            text: text.to_string(),
            created_at: now_iso(),
        }
    }

    #[test]
    fn strips_common_greetings() {
        assert_eq!(
            strip_greeting("hi, I need help resetting my password"),
            "I need help resetting my password"
        );
        assert_eq!(strip_greeting("Hello! my order is late"), "my order is late");
        assert_eq!(strip_greeting("good morning, refund please"), "refund please");
        assert_eq!(strip_greeting("where is my parcel"), "where is my parcel");
    }

    #[test]
    fn minutes_round_to_nearest_with_floor_of_one() {
        assert_eq!(
            minutes_between("2026-01-01T10:00:00Z", "2026-01-01T10:07:10Z"),
            Some(7)
        );
        assert_eq!(
            minutes_between("2026-01-01T10:00:00Z", "2026-01-01T10:00:05Z"),
            Some(1)
        );
        assert_eq!(
            minutes_between("2026-01-01T10:00:00Z", "2026-01-01T10:00:00Z"),
            None
        );
        assert_eq!(minutes_between("bogus", "2026-01-01T10:00:00Z"), None);
    }

    #[test]
    fn summary_mentions_first_utterance_duration_and_count() {
        let mut messages = vec![message(
            SenderType::User,
            "hi, I need help resetting my password",
        )];
        for i in 0..9 {
            let sender = if i % 2 == 0 { SenderType::Agent } else { SenderType::User };
            messages.push(message(sender, &format!("turn {i}")));
        }
        let result = summarize_conversation(
            &messages,
            "Ada",
            Some("Sam"),
            PartyRole::Agent,
            Some(PartyRole::User),
            "2026-01-01T10:00:00Z",
            "2026-01-01T10:07:00Z",
        );
        assert!(result.summary.contains("help resetting my password"));
        assert!(result.summary.contains("10 messages"));
        assert!(result.summary.contains("7 minute"));
        assert!(result.summary.contains("ended by agent"));
        assert!(result.summary.contains("requested by user"));
    }

    #[test]
    fn topics_are_deduplicated_first_seen_and_capped() {
        let messages = vec![
            message(SenderType::User, "password password reset reset billing"),
            message(
                SenderType::User,
                "invoice shipping refund account login support overflowed extra words",
            ),
        ];
        let result = summarize_conversation(
            &messages,
            "Ada",
            None,
            PartyRole::User,
            None,
            "2026-01-01T10:00:00Z",
            "2026-01-01T10:01:00Z",
        );
        assert_eq!(result.topics.len(), 8);
        assert_eq!(result.topics[0], "password");
        assert_eq!(result.topics[1], "reset");
        let unique = result
            .topics
            .iter()
            .collect::<std::collections::HashSet<_>>();
        assert_eq!(unique.len(), result.topics.len());
    }

    #[test]
    fn empty_conversation_still_produces_text() {
        let result = summarize_conversation(
            &[],
            "Guest",
            None,
            PartyRole::Agent,
            None,
            "2026-01-01T10:00:00Z",
            "2026-01-01T10:00:00Z",
        );
        assert!(result.summary.contains("asked for help"));
        assert!(result.summary.contains("0 messages"));
        assert!(result.topics.is_empty());
    }
}
