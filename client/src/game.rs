//! Question lifecycle tracking and answer submission.
//!
//! [`GameSession`] consumes `/service/player` packets and keeps one [`QuestionBlock`] per
//! block index. Each block moves `unknown -> awaiting -> started -> ended` and never moves
//! backwards. After every lifecycle packet a [`BlockContext`] snapshot is handed to the
//! registered handler on its own task, so a slow handler never stalls the receive loop.
//! Handlers start in packet order: each one is polled once before the next is spawned.
//!
//! Whether a block has been answered is recorded on the block itself and claimed under the
//! block-map lock. Two contexts for the same block can therefore never both send.

use crate::messages::MessageFactory;
use crate::session::SessionContext;
use crate::transport::Transport;
use futures::future::{BoxFuture, FutureExt};
use quizwire_types::{Packet, QuestionContent, QuestionType};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Inner `data.id` values on the player channel.
mod event {
    pub const PREFETCH: i64 = 1;
    pub const START: i64 = 2;
    pub const GAME_OVER: i64 = 3;
    pub const REVEAL: i64 = 8;
    pub const LEADERBOARD: i64 = 13;
}

const NOT_AVAILABLE: &str = "N/A";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BlockStatus {
    Unknown,
    Awaiting,
    Started,
    Ended,
}

impl fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BlockStatus::Unknown => "unknown",
            BlockStatus::Awaiting => "awaiting",
            BlockStatus::Started => "started",
            BlockStatus::Ended => "ended",
        })
    }
}

/// Outcome of a question, filled in when it ends.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockResults {
    pub points: Option<i64>,
    pub is_correct: Option<bool>,
    pub skip: Option<bool>,
    pub has_answer: Option<bool>,
    pub points_data: Option<Value>,
    /// `correctChoices` for choice questions, `correctTexts` for open-ended ones, `"N/A"`
    /// otherwise.
    pub correct_answers: Value,
    /// What this player submitted, when the question type reports it.
    pub answers: Option<Value>,
    pub raw: Value,
}

impl BlockResults {
    fn from_reveal(question_type: QuestionType, content: Value) -> Self {
        let field = |key: &str| content.get(key).cloned();
        let (correct_answers, answers) = match question_type {
            QuestionType::Quiz | QuestionType::MultipleSelectQuiz | QuestionType::Jumble => (
                field("correctChoices").unwrap_or_else(|| json!([])),
                Some(field("choice").unwrap_or_else(|| json!([]))),
            ),
            QuestionType::OpenEnded => (
                field("correctTexts").unwrap_or_else(|| json!(NOT_AVAILABLE)),
                Some(field("text").unwrap_or_else(|| json!([]))),
            ),
            QuestionType::Slider | QuestionType::Unknown => (json!(NOT_AVAILABLE), None),
        };
        Self {
            points: content.get("points").and_then(Value::as_i64),
            is_correct: content.get("isCorrect").and_then(Value::as_bool),
            skip: content.get("skip").and_then(Value::as_bool),
            has_answer: content.get("hasAnswer").and_then(Value::as_bool),
            points_data: field("pointsData"),
            correct_answers,
            answers,
            raw: content,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct QuestionBlock {
    pub index: u32,
    pub status: BlockStatus,
    pub content: Option<QuestionContent>,
    pub results: Option<BlockResults>,
    /// Server `timetrack` of the prefetch.
    pub start_time: Option<i64>,
    pub answered: bool,
}

impl QuestionBlock {
    fn new(index: u32) -> Self {
        Self {
            index,
            status: BlockStatus::Unknown,
            content: None,
            results: None,
            start_time: None,
            answered: false,
        }
    }

    pub fn question_type(&self) -> QuestionType {
        self.content
            .as_ref()
            .map(QuestionContent::question_type)
            .unwrap_or(QuestionType::Unknown)
    }

    fn advance(&mut self, status: BlockStatus) {
        self.status = self.status.max(status);
    }
}

/// Rank and score pushed with leaderboard and game-over events.
#[derive(Clone, Debug, PartialEq)]
pub struct Standing {
    pub rank: Option<i64>,
    pub total_score: Option<i64>,
    pub content: Value,
}

impl Standing {
    fn from_content(content: Value) -> Self {
        Self {
            rank: content.get("rank").and_then(Value::as_i64),
            total_score: content.get("totalScore").and_then(Value::as_i64),
            content,
        }
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("player packet has no data")]
    MissingData,
    #[error("player packet has no inner type")]
    MissingType,
    #[error("content is not valid JSON: {0}")]
    Content(#[from] serde_json::Error),
    #[error("content is not a JSON object")]
    NotAnObject,
}

/// A caller's answer. Which variant fits depends on the question type.
#[derive(Clone, Debug, PartialEq)]
pub enum Answer {
    /// Quiz.
    Choice(u32),
    /// Multiple select, or jumble order.
    Choices(Vec<u32>),
    /// Open ended.
    Text(String),
    /// Slider.
    Value(f64),
}

impl Answer {
    fn kind(&self) -> &'static str {
        match self {
            Answer::Choice(_) => "choice",
            Answer::Choices(_) => "choices",
            Answer::Text(_) => "text",
            Answer::Value(_) => "value",
        }
    }
}

/// Why an answer was not sent.
#[derive(Debug, Error)]
pub enum Rejection {
    #[error("question already answered")]
    AlreadyAnswered,
    #[error("question {0} not found in game blocks")]
    UnknownBlock(u32),
    #[error("question is not active (status {0})")]
    NotActive(BlockStatus),
    #[error("{answer} answer does not fit a {question} question")]
    Mismatch {
        question: QuestionType,
        answer: &'static str,
    },
    #[error("unsupported question type")]
    Unsupported,
    #[error("slider range is unknown")]
    MissingRange,
    #[error("slider value {value} out of range ({min}-{max})")]
    OutOfRange { value: f64, min: f64, max: f64 },
    #[error("answer must contain exactly {expected} items, got {got}")]
    WrongLength { expected: u32, got: usize },
    #[error("choice {choice} outside 0..{count}")]
    InvalidChoice { choice: u32, count: u32 },
    #[error("answer must contain unique numbers")]
    Duplicate,
    #[error("failed to send answer: {0}")]
    Send(#[source] crate::Error),
}

/// A validated answer, ready to encode.
enum Submission {
    Quiz(u32),
    MultipleSelect(Vec<u32>),
    Slider(f64),
    OpenEnded(String),
    Jumble(Vec<u32>),
}

fn check_choices(choices: &[u32], count: Option<u32>) -> Result<(), Rejection> {
    if let Some(count) = count {
        if let Some(&choice) = choices.iter().find(|&&c| c >= count) {
            return Err(Rejection::InvalidChoice { choice, count });
        }
    }
    let mut seen = HashSet::with_capacity(choices.len());
    if !choices.iter().all(|c| seen.insert(*c)) {
        return Err(Rejection::Duplicate);
    }
    Ok(())
}

fn validate(content: Option<&QuestionContent>, answer: Answer) -> Result<Submission, Rejection> {
    let Some(content) = content else {
        return Err(Rejection::Unsupported);
    };
    let question = content.question_type();
    let mismatch = |answer: &Answer| Rejection::Mismatch {
        question,
        answer: answer.kind(),
    };

    match (content, answer) {
        (QuestionContent::Quiz(q), Answer::Choice(choice)) => {
            if let Some(count) = q.number_of_choices {
                if choice >= count {
                    return Err(Rejection::InvalidChoice { choice, count });
                }
            }
            Ok(Submission::Quiz(choice))
        }
        (QuestionContent::MultipleSelectQuiz(q), Answer::Choices(choices)) => {
            check_choices(&choices, q.number_of_choices)?;
            Ok(Submission::MultipleSelect(choices))
        }
        (QuestionContent::Slider(q), Answer::Value(value)) => {
            let (Some(min), Some(max)) = (q.min_range, q.max_range) else {
                return Err(Rejection::MissingRange);
            };
            if !value.is_finite() || value < min || value > max {
                return Err(Rejection::OutOfRange { value, min, max });
            }
            Ok(Submission::Slider(value))
        }
        (QuestionContent::OpenEnded(_), Answer::Text(text)) => Ok(Submission::OpenEnded(text)),
        (QuestionContent::Jumble(q), Answer::Choices(order)) => {
            // The order must be a permutation of every choice index.
            let expected = q.number_of_choices.unwrap_or(0);
            if order.len() != expected as usize {
                return Err(Rejection::WrongLength {
                    expected,
                    got: order.len(),
                });
            }
            check_choices(&order, Some(expected))?;
            Ok(Submission::Jumble(order))
        }
        (QuestionContent::Unknown { .. }, _) => Err(Rejection::Unsupported),
        (_, answer) => Err(mismatch(&answer)),
    }
}

#[derive(Default)]
struct BlockMap {
    blocks: BTreeMap<u32, QuestionBlock>,
    last_index: u32,
}

type Blocks = Arc<Mutex<BlockMap>>;

fn lock(blocks: &Mutex<BlockMap>) -> MutexGuard<'_, BlockMap> {
    blocks.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-dispatch view of one block.
///
/// The fields are a snapshot taken when the event arrived. [`BlockContext::answer`] and
/// [`BlockContext::is_active`] consult the live block instead.
pub struct BlockContext {
    block: QuestionBlock,
    answered: AtomicBool,
    blocks: Blocks,
    transport: Arc<Transport>,
}

impl fmt::Debug for BlockContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockContext")
            .field("block", &self.block)
            .field("answered", &self.answered.load(Ordering::SeqCst))
            .finish()
    }
}

impl BlockContext {
    pub fn index(&self) -> u32 {
        self.block.index
    }

    pub fn status(&self) -> BlockStatus {
        self.block.status
    }

    pub fn question_type(&self) -> QuestionType {
        self.block.question_type()
    }

    pub fn content(&self) -> Option<&QuestionContent> {
        self.block.content.as_ref()
    }

    pub fn results(&self) -> Option<&BlockResults> {
        self.block.results.as_ref()
    }

    pub fn start_time(&self) -> Option<i64> {
        self.block.start_time
    }

    pub fn block(&self) -> &QuestionBlock {
        &self.block
    }

    /// True while the live block is started and nobody has answered it.
    pub fn is_active(&self) -> bool {
        if self.answered.load(Ordering::SeqCst) {
            return false;
        }
        lock(&self.blocks)
            .blocks
            .get(&self.block.index)
            .is_some_and(|block| block.status == BlockStatus::Started && !block.answered)
    }

    /// Validate against the live block and send. At most one answer per block succeeds.
    pub async fn answer(&self, answer: Answer) -> Result<(), Rejection> {
        let index = self.block.index;
        if self.answered.load(Ordering::SeqCst) {
            warn!(index, "question already answered");
            return Err(Rejection::AlreadyAnswered);
        }

        let (question_type, submission) = {
            let mut map = lock(&self.blocks);
            let block = map
                .blocks
                .get_mut(&index)
                .ok_or(Rejection::UnknownBlock(index))?;
            if block.answered {
                return Err(Rejection::AlreadyAnswered);
            }
            if block.status != BlockStatus::Started {
                return Err(Rejection::NotActive(block.status));
            }
            let submission = validate(block.content.as_ref(), answer).inspect_err(|err| {
                warn!(index, %err, "invalid answer");
            })?;
            block.answered = true;
            (block.question_type(), submission)
        };

        let factory = MessageFactory::new(self.transport.session());
        let packet = match submission {
            Submission::Quiz(choice) => factory.classic_answer(index, choice),
            Submission::MultipleSelect(choices) => factory.multiple_select_answer(index, choices),
            Submission::Slider(value) => factory.slider_answer(index, value),
            Submission::OpenEnded(text) => factory.open_ended_answer(index, text),
            Submission::Jumble(order) => factory.jumble_answer(index, order),
        };
        let sent = match packet {
            Ok(packet) => self.transport.send(packet).await,
            Err(err) => Err(err),
        };
        if let Err(err) = sent {
            if let Some(block) = lock(&self.blocks).blocks.get_mut(&index) {
                block.answered = false;
            }
            warn!(index, ?err, "failed to send answer");
            return Err(Rejection::Send(err));
        }

        self.answered.store(true, Ordering::SeqCst);
        info!(index, question_type = %question_type, "answer sent");
        Ok(())
    }
}

type Handler<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct Handlers {
    block_update: Option<Handler<BlockContext>>,
    leaderboard: Option<Handler<Standing>>,
    game_over: Option<Handler<Standing>>,
}

fn boxed<T, F, Fut>(handler: F) -> Handler<T>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |value| handler(value).boxed())
}

type Job = BoxFuture<'static, ()>;

/// Spawn queued handler futures one at a time. Each gets its own task, and the next is not
/// spawned until the previous one has been polled once. A panicking handler only takes down
/// its own task.
async fn run_dispatcher(mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(mut job) = jobs.recv().await {
        let (started_tx, started_rx) = oneshot::channel();
        tokio::spawn(async move {
            let first = futures::poll!(&mut job);
            let _ = started_tx.send(());
            if first.is_pending() {
                job.await;
            }
        });
        let _ = started_rx.await;
    }
    debug!("event dispatcher stopped");
}

pub struct GameSession {
    session: Arc<SessionContext>,
    transport: Arc<Transport>,
    blocks: Blocks,
    handlers: RwLock<Handlers>,
    dispatcher: OnceLock<mpsc::UnboundedSender<Job>>,
}

impl GameSession {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self {
            session: transport.session().clone(),
            transport,
            blocks: Arc::new(Mutex::new(BlockMap::default())),
            handlers: RwLock::new(Handlers::default()),
            dispatcher: OnceLock::new(),
        }
    }

    /// Queue the handler's future behind every earlier event. The dispatcher task is
    /// started on first use and stops when the session is dropped.
    fn dispatch<T>(&self, event: &'static str, handler: Option<Handler<T>>, value: T) {
        let Some(handler) = handler else {
            debug!(event, "no handler registered");
            return;
        };
        debug!(event, "dispatching event");
        let jobs = self.dispatcher.get_or_init(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_dispatcher(rx));
            tx
        });
        if jobs.send(handler(value)).is_err() {
            warn!(event, "event dispatcher is gone, dropping event");
        }
    }

    fn handlers(&self) -> std::sync::RwLockReadGuard<'_, Handlers> {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn handlers_mut(&self) -> std::sync::RwLockWriteGuard<'_, Handlers> {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn on_block_update<F, Fut>(&self, handler: F)
    where
        F: Fn(BlockContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers_mut().block_update = Some(boxed(handler));
    }

    pub fn on_leaderboard<F, Fut>(&self, handler: F)
    where
        F: Fn(Standing) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers_mut().leaderboard = Some(boxed(handler));
    }

    pub fn on_game_over<F, Fut>(&self, handler: F)
    where
        F: Fn(Standing) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers_mut().game_over = Some(boxed(handler));
    }

    pub fn block(&self, index: u32) -> Option<QuestionBlock> {
        lock(&self.blocks).blocks.get(&index).cloned()
    }

    /// A fresh context for a known block, independent of any dispatched one.
    pub fn context(&self, index: u32) -> Option<BlockContext> {
        let block = self.block(index)?;
        Some(self.snapshot(block))
    }

    fn snapshot(&self, block: QuestionBlock) -> BlockContext {
        BlockContext {
            block,
            answered: AtomicBool::new(false),
            blocks: self.blocks.clone(),
            transport: self.transport.clone(),
        }
    }

    /// Apply one `/service/player` packet. Malformed packets are logged and ignored.
    pub fn handle_packet(&self, packet: &Packet) {
        if let Err(err) = self.apply(packet) {
            warn!(%err, id = %packet.id, "ignoring player packet");
        }
    }

    fn apply(&self, packet: &Packet) -> Result<(), ParseError> {
        if packet.data.is_none() {
            return Err(ParseError::MissingData);
        }
        let inner = packet.inner_type().ok_or(ParseError::MissingType)?;
        let content: Value = serde_json::from_str(packet.content().unwrap_or("{}"))?;
        if !content.is_object() {
            return Err(ParseError::NotAnObject);
        }

        match inner {
            event::PREFETCH | event::START | event::REVEAL => {
                let block = self.update_block(inner, packet, content);
                let handler = self.handlers().block_update.clone();
                self.dispatch("block_update", handler, self.snapshot(block));
            }
            event::GAME_OVER => {
                let standing = self.record_standing(content);
                info!(rank = ?standing.rank, score = ?standing.total_score, "game over");
                let handler = self.handlers().game_over.clone();
                self.dispatch("game_over", handler, standing);
            }
            event::LEADERBOARD => {
                let standing = self.record_standing(content);
                debug!(rank = ?standing.rank, score = ?standing.total_score, "leaderboard");
                let handler = self.handlers().leaderboard.clone();
                self.dispatch("leaderboard", handler, standing);
            }
            other => debug!(inner_type = other, "ignoring player event"),
        }
        Ok(())
    }

    fn record_standing(&self, content: Value) -> Standing {
        let standing = Standing::from_content(content);
        self.session
            .record_standing(standing.total_score, standing.rank);
        standing
    }

    /// Apply a lifecycle event and return a snapshot of the updated block.
    fn update_block(&self, inner: i64, packet: &Packet, content: Value) -> QuestionBlock {
        let mut map = lock(&self.blocks);
        let index = match content
            .get("gameBlockIndex")
            .and_then(Value::as_u64)
            .and_then(|index| u32::try_from(index).ok())
        {
            Some(index) => {
                map.last_index = index;
                index
            }
            None => {
                debug!(last = map.last_index, "event without gameBlockIndex");
                map.last_index
            }
        };
        let block = map
            .blocks
            .entry(index)
            .or_insert_with(|| QuestionBlock::new(index));

        let mut standing = None;
        match inner {
            event::PREFETCH => {
                block.advance(BlockStatus::Awaiting);
                if block.content.is_none() {
                    block.content = Some(QuestionContent::from_value(content));
                }
                if block.start_time.is_none() {
                    block.start_time = packet.timetrack();
                }
                let question = block.content.as_ref();
                info!(
                    index,
                    question_type = %block.question_type(),
                    title = ?question.and_then(QuestionContent::title),
                    "question prefetched"
                );
            }
            event::START => {
                block.advance(BlockStatus::Started);
                info!(index, "question started");
            }
            _ => {
                block.status = BlockStatus::Ended;
                let question_type = block.question_type();
                if question_type == QuestionType::Unknown {
                    warn!(index, "results for a question of unknown type");
                }
                standing = Some(Standing::from_content(content.clone()));
                let results = BlockResults::from_reveal(question_type, content);
                debug!(index, correct = ?results.correct_answers, "question results");
                block.results = Some(results);
            }
        }
        let snapshot = block.clone();
        drop(map);

        if let Some(standing) = standing {
            self.session
                .record_standing(standing.total_score, standing.rank);
            info!(
                index,
                score = self.session.score(),
                rank = self.session.rank(),
                "question ended"
            );
        }
        snapshot
    }
}
