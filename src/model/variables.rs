//! Session state and the variable substitution model (spec §3, §6).
//!
//! `SessionState` is the single process-wide mutable record the dispatcher,
//! interpreter, and external input all read and write — the direct analog
//! of the teacher's `Envelope` with its dynamic `outputs: HashMap<String,
//! HashMap<String, Value>>` bag, collapsed here to one flat flow-variable map
//! since flow variables are process-global, not per-flow (spec §9).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// The 11-element pain label scale (spec §6).
pub const PAIN_LABELS: [&str; 11] = [
    "None",
    "Minimal",
    "Mild",
    "Uncomfortable",
    "Moderate",
    "Distracting",
    "Distressing",
    "Intense",
    "Severe",
    "Agonizing",
    "Excruciating",
];

pub fn pain_label(pain: u8) -> &'static str {
    PAIN_LABELS[pain.min(10) as usize]
}

/// Per-device execution history entry.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeviceExecutionState {
    pub on: bool,
    pub cycling: bool,
}

/// Process-wide session state (spec §3's `SessionState`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub capacity: u8,
    pub pain: u8,
    pub emotion: String,
    pub player_name: String,
    pub character_name: String,
    pub active_character_id: Option<String>,
    pub chat_history_tail: Vec<ChatMessage>,
    pub device_execution_history: HashMap<String, DeviceExecutionState>,
    pub flow_variables: HashMap<String, Value>,
    pub message_count: u64,
    pub last_activity: DateTime<Utc>,
    /// Snapshot synchronized on `emergency_stop` so no phantom
    /// `player_state_change` triggers fire against stale deltas (spec §5).
    pub previous_capacity: u8,
    pub previous_pain: u8,
    pub previous_emotion: String,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            capacity: 0,
            pain: 0,
            emotion: String::new(),
            player_name: String::new(),
            character_name: String::new(),
            active_character_id: None,
            chat_history_tail: Vec::new(),
            device_execution_history: HashMap::new(),
            flow_variables: HashMap::new(),
            message_count: 0,
            last_activity: chrono_now(),
            previous_capacity: 0,
            previous_pain: 0,
            previous_emotion: String::new(),
        }
    }
}

/// `chrono::Utc::now()` isolated behind one call site for testability.
fn chrono_now() -> DateTime<Utc> {
    Utc::now()
}

impl SessionState {
    /// Clamp and store a capacity mutation (spec Invariant "variable bounds").
    pub fn set_capacity(&mut self, value: f64) {
        self.capacity = value.round().clamp(0.0, 100.0) as u8;
    }

    /// Clamp and store a pain mutation.
    pub fn set_pain(&mut self, value: f64) {
        self.pain = value.round().clamp(0.0, 10.0) as u8;
    }

    pub fn set_emotion(&mut self, value: impl Into<String>) {
        self.emotion = value.into();
    }

    /// Sync the previous-state snapshot to current values (used by
    /// `emergency_stop`, spec §5, so resumed monitoring doesn't see a
    /// phantom delta).
    pub fn sync_previous_state(&mut self) {
        self.previous_capacity = self.capacity;
        self.previous_pain = self.pain;
        self.previous_emotion = self.emotion.clone();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub content: String,
    pub sender: MessageSender,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageSender {
    Player,
    Ai,
    System,
}

/// Extra context available only while resolving a specific node's text
/// (challenge outcome variables, the selected choice label).
#[derive(Debug, Clone, Default)]
pub struct SubstitutionExtras<'a> {
    pub segment: Option<&'a str>,
    pub segments: Option<&'a str>,
    pub roll: Option<&'a str>,
    pub slots: Option<&'a str>,
    pub choice: Option<&'a str>,
    pub choices_list: Option<&'a [String]>,
}

/// Case-insensitive-tag variable substitution (spec §6 table).
///
/// Unknown/unresolvable placeholders are left intact rather than erased, so
/// author typos are visible downstream instead of silently vanishing.
pub fn substitute(text: &str, session: &SessionState, extras: &SubstitutionExtras<'_>) -> String {
    let mut out = String::with_capacity(text.len());
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '[' => {
                if let Some(end) = find_close(&chars, i, '[', ']') {
                    let inner: String = chars[i + 1..end].iter().collect();
                    out.push_str(&resolve_bracket(&inner, session, extras));
                    i = end + 1;
                    continue;
                }
                out.push(chars[i]);
                i += 1;
            }
            '{' => {
                if let Some(end) = find_close(&chars, i, '{', '}') {
                    let name: String = chars[i + 1..end].iter().collect();
                    match session.flow_variables.get(&name) {
                        Some(v) => out.push_str(&value_to_text(v)),
                        None => {
                            out.push('{');
                            out.push_str(&name);
                            out.push('}');
                        }
                    }
                    i = end + 1;
                    continue;
                }
                out.push(chars[i]);
                i += 1;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

fn find_close(chars: &[char], open_idx: usize, open: char, close: char) -> Option<usize> {
    debug_assert_eq!(chars[open_idx], open);
    chars[open_idx + 1..]
        .iter()
        .position(|&c| c == close)
        .map(|p| open_idx + 1 + p)
}

fn resolve_bracket(
    inner: &str,
    session: &SessionState,
    extras: &SubstitutionExtras<'_>,
) -> String {
    let upper = inner.to_ascii_uppercase();
    match upper.as_str() {
        "PLAYER" => return session.player_name.clone(),
        "CHAR" => return session.character_name.clone(),
        "CAPACITY" => return session.capacity.to_string(),
        "PAIN" | "FEELING" => return pain_label(session.pain).to_string(),
        "EMOTION" => return session.emotion.clone(),
        "SEGMENT" => {
            if let Some(v) = extras.segment {
                return v.to_string();
            }
            if let Some(v) = session.flow_variables.get("lastSegment") {
                return value_to_text(v);
            }
        }
        "SEGMENTS" => {
            if let Some(v) = extras.segments {
                return v.to_string();
            }
            if let Some(v) = session.flow_variables.get("lastSegments") {
                return value_to_text(v);
            }
        }
        "ROLL" => {
            if let Some(v) = extras.roll {
                return v.to_string();
            }
            if let Some(v) = session.flow_variables.get("lastRoll") {
                return value_to_text(v);
            }
        }
        "SLOTS" => {
            if let Some(v) = extras.slots {
                return v.to_string();
            }
            if let Some(v) = session.flow_variables.get("lastSlots") {
                return value_to_text(v);
            }
        }
        "CHOICE" => {
            if let Some(v) = extras.choice {
                return v.to_string();
            }
        }
        "CHOICES" => {
            if let Some(list) = extras.choices_list {
                return list
                    .iter()
                    .enumerate()
                    .map(|(i, label)| format!("{}. {}", i + 1, label))
                    .collect::<Vec<_>>()
                    .join("\n");
            }
        }
        other if other.starts_with("FLOW:") => {
            let name = &inner[5..];
            if let Some(v) = session.flow_variables.get(name) {
                return value_to_text(v);
            }
        }
        _ => {}
    }
    format!("[{inner}]")
}

fn value_to_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SessionState {
        let mut s = SessionState::default();
        s.player_name = "Alex".into();
        s.character_name = "Nova".into();
        s.capacity = 42;
        s.pain = 3;
        s.emotion = "curious".into();
        s.flow_variables
            .insert("quest".into(), Value::String("dragons".into()));
        s
    }

    #[test]
    fn substitutes_known_placeholders() {
        let s = session();
        let extras = SubstitutionExtras::default();
        assert_eq!(substitute("Hi [Player]", &s, &extras), "Hi Alex");
        assert_eq!(substitute("I am [Char]", &s, &extras), "I am Nova");
        assert_eq!(substitute("cap=[Capacity]", &s, &extras), "cap=42");
        assert_eq!(substitute("pain=[Pain]", &s, &extras), "pain=Uncomfortable");
        assert_eq!(substitute("pain=[feeling]", &s, &extras), "pain=Uncomfortable");
        assert_eq!(substitute("mood=[EMOTION]", &s, &extras), "mood=curious");
    }

    #[test]
    fn substitutes_flow_variable() {
        let s = session();
        let extras = SubstitutionExtras::default();
        assert_eq!(substitute("seek [Flow:quest]", &s, &extras), "seek dragons");
        assert_eq!(substitute("seek {quest}", &s, &extras), "seek dragons");
    }

    #[test]
    fn leaves_unknown_placeholder_intact() {
        let s = session();
        let extras = SubstitutionExtras::default();
        assert_eq!(substitute("[Unknown]", &s, &extras), "[Unknown]");
        assert_eq!(substitute("{missing}", &s, &extras), "{missing}");
        assert_eq!(substitute("[Flow:nope]", &s, &extras), "[Flow:nope]");
    }

    #[test]
    fn substitutes_choice_and_choices() {
        let s = session();
        let mut extras = SubstitutionExtras::default();
        extras.choice = Some("yes");
        assert_eq!(substitute("I say [Choice]", &s, &extras), "I say yes");

        let list = vec!["Fight".to_string(), "Flee".to_string()];
        let mut extras2 = SubstitutionExtras::default();
        extras2.choices_list = Some(&list);
        assert_eq!(
            substitute("Pick one: [Choices]", &s, &extras2),
            "Pick one: 1. Fight\n2. Flee"
        );
    }

    #[test]
    fn challenge_outcome_variables_survive_past_the_result_message() {
        // `resolve_challenge_result` stores these under the session's flow
        // variables once the per-call `SubstitutionExtras` that carried them
        // is gone; any later node's substitution must still resolve them.
        let mut s = session();
        s.flow_variables
            .insert("lastSegment".into(), Value::String("jackpot".into()));
        s.flow_variables
            .insert("lastRoll".into(), Value::String("7".into()));
        let extras = SubstitutionExtras::default();
        assert_eq!(
            substitute("you got [Segment]", &s, &extras),
            "you got jackpot"
        );
        assert_eq!(substitute("rolled [Roll]", &s, &extras), "rolled 7");
    }
}
