use std::{collections::HashMap, fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{
    error::{GraphRagError, Result},
    llm::base::{ChatMessage, ChatRole},
};

use super::context_table::{records_to_dataframe, render_rows, ContextRecords};

pub type ConversationRole = ChatRole;

/// Turns kept by a new history before the oldest ones are dropped.
pub const DEFAULT_MAX_HISTORY_TURNS: usize = 50;

pub type SharedConversationHistory = Arc<RwLock<ConversationHistory>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: ConversationRole,
    pub content: String,
}

impl fmt::Display for ConversationTurn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.role, self.content)
    }
}

/// A user question and the assistant turns that answered it.
#[derive(Debug, Clone, PartialEq)]
pub struct QATurn {
    pub user_query: ConversationTurn,
    pub assistant_answers: Option<Vec<ConversationTurn>>,
}

impl QATurn {
    pub fn answer_text(&self) -> Option<String> {
        self.assistant_answers.as_ref().map(|answers| {
            answers
                .iter()
                .map(|answer| answer.content.as_str())
                .collect::<Vec<_>>()
                .join("\n")
        })
    }
}

impl fmt::Display for QATurn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.answer_text() {
            Some(answer) => write!(f, "Question: {}\nAnswer: {}", self.user_query.content, answer),
            None => write!(f, "Question: {}", self.user_query.content),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationHistoryContextParams {
    pub include_user_turns_only: bool,
    pub max_qa_turns: Option<usize>,
    pub max_tokens: usize,
    /// Most recent turns first, applied before `max_qa_turns` truncation.
    pub recency_bias: bool,
    pub column_delimiter: String,
    pub context_name: String,
}

impl Default for ConversationHistoryContextParams {
    fn default() -> Self {
        ConversationHistoryContextParams {
            include_user_turns_only: true,
            max_qa_turns: Some(5),
            max_tokens: 8000,
            recency_bias: true,
            column_delimiter: "|".to_string(),
            context_name: "Conversation History".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationHistory {
    pub turns: Vec<ConversationTurn>,
    /// `None` keeps every turn.
    #[serde(default = "default_max_turns")]
    pub max_turns: Option<usize>,
}

fn default_max_turns() -> Option<usize> {
    Some(DEFAULT_MAX_HISTORY_TURNS)
}

impl Default for ConversationHistory {
    fn default() -> Self {
        ConversationHistory {
            turns: Vec::new(),
            max_turns: default_max_turns(),
        }
    }
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_turns(mut self, max_turns: Option<usize>) -> Self {
        self.max_turns = max_turns;
        self.trim_to_max_turns();
        self
    }

    /// Builds a history from `{"role": ..., "content": ...}` maps. A missing role means `user`.
    pub fn from_list(turns: &[HashMap<String, String>]) -> Result<Self> {
        let mut history = ConversationHistory::new();
        for turn in turns {
            let role = match turn.get("role") {
                Some(role) => role.parse::<ConversationRole>().map_err(GraphRagError::InvalidData)?,
                None => ConversationRole::User,
            };
            let content = turn.get("content").cloned().unwrap_or_default();
            history.add_turn(role, content);
        }
        Ok(history)
    }

    pub fn shared(self) -> SharedConversationHistory {
        Arc::new(RwLock::new(self))
    }

    /// Appends a turn, dropping the oldest turns once `max_turns` is exceeded.
    pub fn add_turn(&mut self, role: ConversationRole, content: impl Into<String>) {
        self.turns.push(ConversationTurn {
            role,
            content: content.into(),
        });
        self.trim_to_max_turns();
    }

    fn trim_to_max_turns(&mut self) {
        if let Some(max_turns) = self.max_turns {
            if self.turns.len() > max_turns {
                let excess = self.turns.len() - max_turns;
                self.turns.drain(..excess);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Groups turns into question/answer pairs. Assistant turns before the first question are dropped.
    pub fn to_qa_turns(&self) -> Vec<QATurn> {
        let mut qa_turns: Vec<QATurn> = Vec::new();
        for turn in &self.turns {
            match turn.role {
                ConversationRole::User => qa_turns.push(QATurn {
                    user_query: turn.clone(),
                    assistant_answers: None,
                }),
                ConversationRole::Assistant => {
                    if let Some(current) = qa_turns.last_mut() {
                        current.assistant_answers.get_or_insert_with(Vec::new).push(turn.clone());
                    }
                }
                ConversationRole::System => {}
            }
        }
        qa_turns
    }

    /// Content of the last `max_user_turns` user turns, most recent first.
    pub fn get_user_turns(&self, max_user_turns: Option<usize>) -> Vec<String> {
        let mut user_turns = Vec::new();
        for turn in self.turns.iter().rev() {
            if turn.role != ConversationRole::User {
                continue;
            }
            if let Some(max_user_turns) = max_user_turns {
                if user_turns.len() >= max_user_turns {
                    break;
                }
            }
            user_turns.push(turn.content.clone());
        }
        user_turns
    }

    /// Messages of the last `max_qa_turns` question/answer pairs, oldest first.
    pub fn to_recent_messages(&self, max_qa_turns: Option<usize>) -> Vec<ChatMessage> {
        let qa_turns = self.to_qa_turns();
        let skip = match max_qa_turns {
            Some(max_qa_turns) => qa_turns.len().saturating_sub(max_qa_turns),
            None => 0,
        };

        let mut messages = Vec::new();
        for qa_turn in qa_turns.into_iter().skip(skip) {
            messages.push(ChatMessage::new(qa_turn.user_query.role, qa_turn.user_query.content));
            for answer in qa_turn.assistant_answers.into_iter().flatten() {
                messages.push(ChatMessage::new(answer.role, answer.content));
            }
        }
        messages
    }

    /// Renders the history as a `turn|content` table, keeping as many turns as fit in `max_tokens`.
    pub fn build_context(
        &self,
        num_tokens_fn: fn(&str) -> usize,
        params: &ConversationHistoryContextParams,
    ) -> Result<(String, ContextRecords)> {
        let context_key = params.context_name.to_lowercase();
        let mut qa_turns = self.to_qa_turns();

        if params.include_user_turns_only {
            for qa_turn in qa_turns.iter_mut() {
                qa_turn.assistant_answers = None;
            }
        }

        if params.recency_bias {
            qa_turns.reverse();
        }

        if let Some(max_qa_turns) = params.max_qa_turns {
            qa_turns.truncate(max_qa_turns);
        }

        if qa_turns.is_empty() {
            return Ok((String::new(), ContextRecords::new()));
        }

        let header = format!("-----{}-----\n", params.context_name);
        let columns = vec!["turn".to_string(), "content".to_string()];
        let mut candidate_rows: Vec<Vec<String>> = Vec::new();
        let mut current_len = 0;
        let mut current_text = String::new();

        for qa_turn in &qa_turns {
            candidate_rows.push(vec![
                ConversationRole::User.to_string(),
                qa_turn.user_query.content.clone(),
            ]);
            if let Some(answer) = qa_turn.answer_text() {
                candidate_rows.push(vec![ConversationRole::Assistant.to_string(), answer]);
            }

            let context_text = format!(
                "{}{}",
                header,
                render_rows(&columns, &candidate_rows, &params.column_delimiter, true)?
            );
            if num_tokens_fn(&context_text) > params.max_tokens {
                break;
            }
            current_len = candidate_rows.len();
            current_text = context_text;
        }

        if current_len == 0 {
            return Ok((String::new(), ContextRecords::new()));
        }

        let record_df = records_to_dataframe(&columns, &candidate_rows[..current_len])?;
        Ok((current_text, ContextRecords::from([(context_key, record_df)])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context_builder::context_table::column_values;

    fn word_count(text: &str) -> usize {
        text.split_whitespace().count()
    }

    fn history_with_user_turns(count: usize) -> ConversationHistory {
        let mut history = ConversationHistory::new();
        for index in 1..=count {
            history.add_turn(ConversationRole::User, format!("question {}", index));
            history.add_turn(ConversationRole::Assistant, format!("answer {}", index));
        }
        history
    }

    #[test]
    fn recency_bias_keeps_most_recent_turns_first() {
        let history = history_with_user_turns(6);
        let params = ConversationHistoryContextParams {
            max_qa_turns: Some(5),
            recency_bias: true,
            ..Default::default()
        };

        let (context_text, records) = history.build_context(word_count, &params).unwrap();

        let table = &records["conversation history"];
        assert_eq!(
            column_values(table, "content").unwrap(),
            vec!["question 6", "question 5", "question 4", "question 3", "question 2"]
        );
        assert!(context_text.starts_with("-----Conversation History-----\nturn|content\nuser|question 6\n"));
        assert!(!context_text.contains("question 1"));
        assert!(!context_text.contains("answer"));
    }

    #[test]
    fn assistant_answers_are_rendered_when_requested() {
        let history = history_with_user_turns(2);
        let params = ConversationHistoryContextParams {
            include_user_turns_only: false,
            recency_bias: false,
            ..Default::default()
        };

        let (_, records) = history.build_context(word_count, &params).unwrap();
        let table = &records["conversation history"];
        assert_eq!(column_values(table, "turn").unwrap(), vec!["user", "assistant", "user", "assistant"]);
        assert_eq!(column_values(table, "content").unwrap()[1], "answer 1");
    }

    #[test]
    fn token_budget_limits_rendered_turns() {
        let history = history_with_user_turns(4);
        // section name (2 words) + column row (1 word) + two rows of two words each
        let params = ConversationHistoryContextParams {
            max_tokens: 7,
            ..Default::default()
        };

        let (_, records) = history.build_context(word_count, &params).unwrap();
        assert_eq!(records["conversation history"].height(), 2);
    }

    #[test]
    fn empty_history_renders_nothing() {
        let (context_text, records) =
            ConversationHistory::new().build_context(word_count, &ConversationHistoryContextParams::default()).unwrap();
        assert!(context_text.is_empty());
        assert!(records.is_empty());
    }

    #[test]
    fn qa_turns_group_answers_under_questions() {
        let mut history = ConversationHistory::new();
        history.add_turn(ConversationRole::Assistant, "orphan");
        history.add_turn(ConversationRole::User, "q1");
        history.add_turn(ConversationRole::Assistant, "a1");
        history.add_turn(ConversationRole::Assistant, "a1 continued");
        history.add_turn(ConversationRole::User, "q2");

        let qa_turns = history.to_qa_turns();
        assert_eq!(qa_turns.len(), 2);
        assert_eq!(qa_turns[0].answer_text().as_deref(), Some("a1\na1 continued"));
        assert_eq!(qa_turns[1].answer_text(), None);
    }

    #[test]
    fn oldest_turns_are_dropped_past_the_bound() {
        let mut history = ConversationHistory::new().with_max_turns(Some(3));
        for index in 1..=5 {
            history.add_turn(ConversationRole::User, format!("question {}", index));
        }

        assert_eq!(history.len(), 3);
        assert_eq!(history.turns[0].content, "question 3");
        assert_eq!(history.turns[2].content, "question 5");

        let history = history_with_user_turns(40);
        assert_eq!(history.len(), DEFAULT_MAX_HISTORY_TURNS);
        assert_eq!(history.turns[0].content, "question 16");

        let mut unbounded = ConversationHistory::new().with_max_turns(None);
        for index in 1..=60 {
            unbounded.add_turn(ConversationRole::User, format!("question {}", index));
        }
        assert_eq!(unbounded.len(), 60);
    }

    #[test]
    fn recent_messages_replay_the_last_pairs() {
        let history = history_with_user_turns(4);

        let messages = history.to_recent_messages(Some(2));
        let contents: Vec<&str> = messages.iter().map(|message| message.content.as_str()).collect();
        assert_eq!(contents, vec!["question 3", "answer 3", "question 4", "answer 4"]);
        assert_eq!(messages[0].role, ChatRole::User);
        assert_eq!(messages[1].role, ChatRole::Assistant);

        assert_eq!(history.to_recent_messages(None).len(), 8);
        assert!(history.to_recent_messages(Some(0)).is_empty());
    }

    #[test]
    fn user_turns_are_most_recent_first() {
        let history = history_with_user_turns(3);
        assert_eq!(history.get_user_turns(Some(2)), vec!["question 3", "question 2"]);
        assert_eq!(history.get_user_turns(None).len(), 3);
    }

    #[test]
    fn from_list_parses_roles() {
        let turns = vec![
            HashMap::from([("role".to_string(), "user".to_string()), ("content".to_string(), "hi".to_string())]),
            HashMap::from([("content".to_string(), "implicit user".to_string())]),
            HashMap::from([("role".to_string(), "Assistant".to_string()), ("content".to_string(), "hello".to_string())]),
        ];
        let history = ConversationHistory::from_list(&turns).unwrap();
        assert_eq!(history.turns[1].role, ConversationRole::User);
        assert_eq!(history.turns[2].role, ConversationRole::Assistant);

        let bad = vec![HashMap::from([("role".to_string(), "robot".to_string())])];
        assert!(matches!(ConversationHistory::from_list(&bad), Err(GraphRagError::InvalidData(_))));
    }
}
