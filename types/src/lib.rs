pub mod packet;
pub use packet::{channel, Ack, Ext, Packet, TimeSync};
pub mod payload;
pub use payload::{ControllerContent, NameratorContent};
pub mod question;
pub use question::{ChoiceQuestion, QuestionContent, QuestionType, SliderQuestion, TextQuestion};

/// Host reported in controller packets when none is configured.
pub const DEFAULT_HOST: &str = "kahoot.it";
