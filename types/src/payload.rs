//! Outbound controller content. Serialised to a JSON string and carried in
//! `data.content` of `/service/controller` packets.

use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ControllerContent {
    Quiz {
        choice: u32,
        question_index: u32,
    },
    MultipleSelectQuiz {
        choice: Vec<u32>,
        question_index: u32,
    },
    Slider {
        choice: f64,
        question_index: u32,
    },
    OpenEnded {
        text: String,
        question_index: u32,
    },
    Jumble {
        choice: Vec<u32>,
        question_index: u32,
    },
    TeamAccept {
        team_name: String,
    },
    TeamLeave,
    Reaction {
        reaction: String,
    },
}

impl ControllerContent {
    /// Controller message id answers and team/reaction traffic are sent under.
    pub const MESSAGE_ID: u32 = 45;
}

/// Name negotiation content, sent once as "client ready" and again on nickname changes.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NameratorContent {
    pub using_namerator: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_name: Option<String>,
}

impl NameratorContent {
    pub const MESSAGE_ID: u32 = 16;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn encode(content: &impl Serialize) -> Value {
        serde_json::to_value(content).unwrap()
    }

    #[test]
    fn test_answer_shapes() {
        assert_eq!(
            encode(&ControllerContent::Quiz {
                choice: 2,
                question_index: 0
            }),
            json!({"type": "quiz", "choice": 2, "questionIndex": 0})
        );
        assert_eq!(
            encode(&ControllerContent::OpenEnded {
                text: "Paris".to_string(),
                question_index: 3
            }),
            json!({"type": "open_ended", "text": "Paris", "questionIndex": 3})
        );
        assert_eq!(
            encode(&ControllerContent::Jumble {
                choice: vec![2, 0, 1],
                question_index: 1
            }),
            json!({"type": "jumble", "choice": [2, 0, 1], "questionIndex": 1})
        );
    }

    #[test]
    fn test_team_and_reaction_shapes() {
        assert_eq!(
            encode(&ControllerContent::TeamAccept {
                team_name: "Blue".to_string()
            }),
            json!({"type": "team_accept", "teamName": "Blue"})
        );
        assert_eq!(
            encode(&ControllerContent::TeamLeave),
            json!({"type": "team_leave"})
        );
    }

    #[test]
    fn test_namerator_shapes() {
        assert_eq!(
            encode(&NameratorContent {
                using_namerator: false,
                new_name: None
            }),
            json!({"usingNamerator": false})
        );
        assert_eq!(
            encode(&NameratorContent {
                using_namerator: true,
                new_name: Some("Ada".to_string())
            }),
            json!({"usingNamerator": true, "newName": "Ada"})
        );
    }
}
