//! Join a live game from the terminal and answer questions as they arrive.
//!
//! Usage:
//!   play --pin 482913 --name alice
//!   QUIZWIRE_PACKET_LOG=packets.jsonl play --pin 482913 --name alice --verbose

use anyhow::{Context, Result};
use clap::Parser;
use quizwire_client::{Answer, BlockContext, BlockStatus, Client, ClientConfig, Standing};
use quizwire_types::{QuestionContent, QuestionType};
use std::io::{self, BufRead, Write};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Play a quiz game from the terminal")]
struct Args {
    /// Game PIN shown on the host screen.
    #[arg(short, long)]
    pin: String,

    /// Nickname to join with.
    #[arg(short, long)]
    name: String,

    /// Log protocol traffic at debug level.
    #[arg(short, long)]
    verbose: bool,
}

/// Read one trimmed line from stdin without blocking the runtime.
async fn prompt(message: String) -> Option<String> {
    tokio::task::spawn_blocking(move || {
        print!("{message}");
        io::stdout().flush().ok()?;
        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim().to_string()),
        }
    })
    .await
    .ok()
    .flatten()
}

fn parse_choices(input: &str) -> Option<Vec<u32>> {
    input
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| part.trim().parse().ok())
        .collect()
}

fn describe(ctx: &BlockContext) {
    println!("\n{}", "=".repeat(50));
    println!("Question {} ({})", ctx.index(), ctx.question_type());
    let Some(content) = ctx.content() else {
        return;
    };
    if let Some(title) = content.title() {
        println!("{title}");
    }
    if let Some(ms) = content.time_available() {
        println!("Time: {}s", ms as f64 / 1000.0);
    }
    match content {
        QuestionContent::Quiz(question) if question.layout.as_deref() == Some("TRUE_FALSE") => {
            println!("0: True\n1: False");
        }
        QuestionContent::Slider(question) => {
            if let (Some(min), Some(max)) = (question.min_range, question.max_range) {
                println!("Range: {min} to {max}");
            }
        }
        _ => {
            if let Some(count) = content.number_of_choices() {
                for i in 0..count {
                    println!("{i}: Option {}", i + 1);
                }
            }
        }
    }
}

/// Ask until the input parses into an answer of the right shape, or stdin closes.
async fn read_answer(question_type: QuestionType) -> Option<Answer> {
    let message = match question_type {
        QuestionType::Quiz => "Your choice: ",
        QuestionType::MultipleSelectQuiz => "Your choices (e.g. 0,2,3): ",
        QuestionType::Jumble => "Your order (e.g. 2,0,3,1): ",
        QuestionType::Slider => "Your value: ",
        QuestionType::OpenEnded => "Your answer: ",
        QuestionType::Unknown => return None,
    };
    loop {
        let input = prompt(message.to_string()).await?;
        let answer = match question_type {
            QuestionType::Quiz => input.parse().ok().map(Answer::Choice),
            QuestionType::MultipleSelectQuiz | QuestionType::Jumble => {
                parse_choices(&input).map(Answer::Choices)
            }
            QuestionType::Slider => input.parse().ok().map(Answer::Value),
            QuestionType::OpenEnded if !input.is_empty() => Some(Answer::Text(input)),
            _ => None,
        };
        match answer {
            Some(answer) => return Some(answer),
            None => println!("Could not read that, try again"),
        }
    }
}

async fn on_block(ctx: BlockContext) {
    match ctx.status() {
        BlockStatus::Started if ctx.is_active() => {
            describe(&ctx);
            let Some(answer) = read_answer(ctx.question_type()).await else {
                println!("Waiting for the next question...");
                return;
            };
            match ctx.answer(answer).await {
                Ok(()) => println!("Answer sent"),
                Err(rejection) => println!("Answer not sent: {rejection}"),
            }
        }
        BlockStatus::Ended => {
            let Some(results) = ctx.results() else {
                return;
            };
            println!("\nQuestion {} ended", ctx.index());
            match results.is_correct {
                Some(true) => println!("Correct"),
                Some(false) => println!("Incorrect"),
                None => {}
            }
            if let Some(answers) = &results.answers {
                println!("Your answer: {answers}");
            }
            println!("Correct answer: {}", results.correct_answers);
            println!("Points: {}", results.points.unwrap_or(0));
        }
        status => println!("Question {} is {status}", ctx.index()),
    }
}

fn print_standing(label: &str, standing: &Standing) {
    let rank = standing.rank.map_or("?".to_string(), |r| r.to_string());
    let score = standing.total_score.unwrap_or(0);
    println!("\n{label}: rank {rank}, score {score}");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let client = Client::new(ClientConfig::from_env(), &args.pin, &args.name);
    client.on_block_update(on_block);
    client.on_leaderboard(|standing| async move {
        print_standing("Leaderboard", &standing);
    });
    client.on_game_over(|standing| async move {
        print_standing("Game over", &standing);
    });

    let handshake = client
        .connect()
        .await
        .with_context(|| format!("failed to join game {}", args.pin))?;
    info!(client_id = %handshake.client_id, cid = %handshake.cid, "joined game");

    tokio::select! {
        _ = client.listen() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!(?err, "failed to wait for ctrl-c");
            }
        }
    }

    client.disconnect().await;
    println!("Final score {} (rank {})", client.score(), client.rank());
    Ok(())
}
