//! Session key formats and negotiation.
//!
//! Gateways have accepted several addressing-key shapes over time. Starting
//! work tries the preferred format first and falls back through the known
//! ones, moving on only when the gateway says the key itself was wrong.

use std::future::Future;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

/// Lower-cased fragments that mark a reply as a session key mismatch.
///
/// Heuristic: gateways report this only as free text.
pub const KEY_MISMATCH_PATTERNS: &[&str] = &[
    "session key mismatch",
    "sessionkey mismatch",
    "session_key mismatch",
    "invalid session key",
    "invalid sessionkey",
    "session key does not match",
    "unknown session key format",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyFormat {
    /// `agent:<agentId>:task:<workItemId>`
    AgentTask,
    /// `task:<workItemId>:agent:<agentId>`
    TaskAgent,
    /// `<agentId>-task-<workItemId>`
    Flat,
    /// Template with `{agent}` and `{task}` placeholders.
    Custom(String),
}

impl KeyFormat {
    pub const FALLBACKS: [KeyFormat; 3] =
        [KeyFormat::AgentTask, KeyFormat::TaskAgent, KeyFormat::Flat];

    /// Parse a configured format: a known label or a template.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "" => None,
            "agent_task" => Some(KeyFormat::AgentTask),
            "task_agent" => Some(KeyFormat::TaskAgent),
            "flat" => Some(KeyFormat::Flat),
            template if template.contains("{agent}") || template.contains("{task}") => {
                Some(KeyFormat::Custom(template.to_string()))
            }
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            KeyFormat::AgentTask => "agent_task",
            KeyFormat::TaskAgent => "task_agent",
            KeyFormat::Flat => "flat",
            KeyFormat::Custom(_) => "custom",
        }
    }

    pub fn render(&self, agent_id: &str, work_item_id: &str) -> String {
        match self {
            KeyFormat::AgentTask => format!("agent:{agent_id}:task:{work_item_id}"),
            KeyFormat::TaskAgent => format!("task:{work_item_id}:agent:{agent_id}"),
            KeyFormat::Flat => format!("{agent_id}-task-{work_item_id}"),
            KeyFormat::Custom(template) => template
                .replace("{agent}", agent_id)
                .replace("{task}", work_item_id),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyCandidate {
    pub format: &'static str,
    pub key: String,
}

/// Ordered, de-duplicated, never empty list of keys to try.
#[derive(Clone, Debug)]
pub struct KeyCandidates {
    first: KeyCandidate,
    rest: Vec<KeyCandidate>,
}

impl KeyCandidates {
    pub fn new(preferred: Option<&str>, agent_id: &str, work_item_id: &str) -> Self {
        let parsed = preferred.and_then(KeyFormat::parse);
        if let (Some(raw), None) = (preferred, &parsed) {
            if !raw.trim().is_empty() {
                debug!(format = raw, "ignoring unrecognised key format");
            }
        }

        let mut formats = parsed.into_iter().chain(KeyFormat::FALLBACKS);
        let first_format = formats.next().unwrap_or(KeyFormat::AgentTask);
        let first = KeyCandidate {
            format: first_format.label(),
            key: first_format.render(agent_id, work_item_id),
        };

        let mut rest: Vec<KeyCandidate> = Vec::new();
        for format in formats {
            let key = format.render(agent_id, work_item_id);
            if key == first.key || rest.iter().any(|c| c.key == key) {
                continue;
            }
            rest.push(KeyCandidate {
                format: format.label(),
                key,
            });
        }

        Self { first, rest }
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyCandidate> {
        std::iter::once(&self.first).chain(self.rest.iter())
    }

    pub fn len(&self) -> usize {
        1 + self.rest.len()
    }
}

pub fn is_key_mismatch(message: &str) -> bool {
    let message = message.to_lowercase();
    KEY_MISMATCH_PATTERNS
        .iter()
        .any(|pattern| message.contains(pattern))
}

/// Try each candidate in order until one succeeds.
///
/// Only errors for which `is_mismatch` holds move on to the next candidate;
/// anything else aborts. When every candidate mismatches, the last error is
/// returned.
pub async fn negotiate<T, E, F, Fut>(
    candidates: &KeyCandidates,
    mut attempt: F,
    is_mismatch: impl Fn(&E) -> bool,
) -> Result<(KeyCandidate, T), E>
where
    F: FnMut(KeyCandidate) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut remaining = candidates.rest.iter();
    let mut candidate = &candidates.first;
    loop {
        match attempt(candidate.clone()).await {
            Ok(value) => return Ok((candidate.clone(), value)),
            Err(err) if is_mismatch(&err) => match remaining.next() {
                Some(next) => {
                    debug!(
                        rejected = candidate.format,
                        next = next.format,
                        "session key mismatch, trying next format"
                    );
                    candidate = next;
                }
                None => return Err(err),
            },
            Err(err) => return Err(err),
        }
    }
}

static WORK_ITEM_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"^agent:[^:]+:task:(?P<task>.+)$",
        r"^task:(?P<task>[^:]+):agent:.+$",
        r"^.+?-task-(?P<task>.+)$",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

/// Work item id embedded in a session key built by one of the fixed formats.
pub fn work_item_from_session_key(session_key: &str) -> Option<String> {
    WORK_ITEM_PATTERNS.iter().find_map(|pattern| {
        pattern
            .captures(session_key)
            .and_then(|caps| caps.name("task"))
            .map(|m| m.as_str().to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn candidates_start_with_preferred_and_drop_duplicates() {
        let candidates = KeyCandidates::new(Some("task_agent"), "a1", "w1");
        let keys: Vec<_> = candidates.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, vec!["task:w1:agent:a1", "agent:a1:task:w1", "a1-task-w1"]);

        let custom = KeyCandidates::new(Some("desk/{agent}/{task}"), "a1", "w1");
        let first = custom.iter().next().unwrap();
        assert_eq!(first.format, "custom");
        assert_eq!(first.key, "desk/a1/w1");
        assert_eq!(custom.len(), 4);

        let duplicate = KeyCandidates::new(Some("agent:{agent}:task:{task}"), "a1", "w1");
        assert_eq!(duplicate.len(), 3);

        let unset = KeyCandidates::new(None, "a1", "w1");
        assert_eq!(unset.iter().next().unwrap().format, "agent_task");
        assert_eq!(KeyCandidates::new(Some("bogus"), "a1", "w1").len(), 3);
    }

    #[test]
    fn mismatch_classifier_is_case_insensitive() {
        assert!(is_key_mismatch("Session Key Mismatch for agent"));
        assert!(is_key_mismatch("INVALID sessionKey supplied"));
        assert!(is_key_mismatch("unknown session key format: flat"));
        assert!(!is_key_mismatch("rate limited"));
        assert!(!is_key_mismatch("session expired"));
    }

    #[tokio::test]
    async fn negotiator_stops_at_first_success() {
        let candidates = KeyCandidates::new(None, "a1", "w1");
        let tried = RefCell::new(Vec::new());

        let result = negotiate(
            &candidates,
            |candidate| {
                tried.borrow_mut().push(candidate.key.clone());
                let attempt = tried.borrow().len();
                async move {
                    if attempt < 3 {
                        Err("session key mismatch".to_string())
                    } else {
                        Ok(attempt)
                    }
                }
            },
            |err: &String| is_key_mismatch(err),
        )
        .await;

        let (chosen, attempt) = result.unwrap();
        assert_eq!(attempt, 3);
        assert_eq!(chosen.format, "flat");
        assert_eq!(tried.borrow().len(), 3);
    }

    #[tokio::test]
    async fn negotiator_aborts_on_other_errors_and_reports_last_mismatch() {
        let candidates = KeyCandidates::new(None, "a1", "w1");
        let calls = RefCell::new(0);
        let aborted = negotiate(
            &candidates,
            |_| {
                *calls.borrow_mut() += 1;
                async { Err::<(), _>("gateway overloaded".to_string()) }
            },
            |err: &String| is_key_mismatch(err),
        )
        .await;
        assert_eq!(aborted.unwrap_err(), "gateway overloaded");
        assert_eq!(*calls.borrow(), 1);

        let exhausted = negotiate(
            &candidates,
            |candidate| async move {
                Err::<(), _>(format!("session key mismatch: {}", candidate.format))
            },
            |err: &String| is_key_mismatch(err),
        )
        .await;
        assert_eq!(exhausted.unwrap_err(), "session key mismatch: flat");
    }

    #[test]
    fn work_item_is_recovered_from_every_fixed_format() {
        for format in KeyFormat::FALLBACKS {
            let key = format.render("agent-7", "4f1c-22");
            assert_eq!(
                work_item_from_session_key(&key).as_deref(),
                Some("4f1c-22"),
                "{key}"
            );
        }
        assert_eq!(work_item_from_session_key("main"), None);
    }
}
