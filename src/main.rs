//! Quiz Arena Server
//!
//! Authoritative server for real-time trivia battles. Binds the
//! WebSocket listener and runs until interrupted.

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use quiz_arena::network::{ArenaServer, ServerConfig};
use quiz_arena::{MemoryLedger, MemoryQuestionSource, Question, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env();
    info!("Quiz Arena Server v{}", VERSION);
    info!("Bind address: {}", config.bind_addr);
    info!(
        "Rules: {} questions, {}s match, {}s confirm window",
        config.rules.question_count, config.rules.match_duration_secs, config.rules.confirm_window_secs
    );
    if !config.auth.is_configured() {
        info!("Warning: no AUTH_SECRET or AUTH_PUBLIC_KEY_PEM set, all logins will fail");
    }

    // Single-node backing stores. A deployment wires real collaborators
    // behind the same traits.
    let ledger = MemoryLedger::new();
    let questions = MemoryQuestionSource::new(demo_question_bank());
    info!("Question bank loaded: {} questions", questions.len());

    let server = ArenaServer::new(config, ledger, questions);
    server.run().await.context("server terminated")?;
    Ok(())
}

/// Built-in question bank for standalone runs.
fn demo_question_bank() -> Vec<Question> {
    let raw: &[(&str, [&str; 4], u8)] = &[
        ("Which planet is closest to the sun?", ["Venus", "Mercury", "Mars", "Earth"], 1),
        ("What is the chemical symbol for gold?", ["Au", "Ag", "Gd", "Go"], 0),
        ("How many continents are there?", ["five", "six", "seven", "eight"], 2),
        ("Which ocean is the largest?", ["Atlantic", "Indian", "Arctic", "Pacific"], 3),
        ("What gas do plants absorb?", ["Oxygen", "Nitrogen", "Carbon dioxide", "Helium"], 2),
        ("How many sides does a hexagon have?", ["five", "six", "seven", "eight"], 1),
        ("Which metal is liquid at room temperature?", ["Mercury", "Iron", "Sodium", "Zinc"], 0),
        ("What is the square root of 144?", ["10", "11", "12", "14"], 2),
        ("Which language has the most native speakers?", ["English", "Hindi", "Spanish", "Mandarin"], 3),
        ("What is the capital of Australia?", ["Sydney", "Canberra", "Melbourne", "Perth"], 1),
        ("How many minutes are in a full day?", ["1440", "1340", "1540", "1240"], 0),
        ("Which organ pumps blood?", ["Liver", "Lung", "Heart", "Kidney"], 2),
        ("What is the freezing point of water in Celsius?", ["-1", "0", "1", "32"], 1),
        ("Which is the smallest prime number?", ["0", "1", "2", "3"], 2),
        ("What is the largest mammal?", ["Elephant", "Blue whale", "Giraffe", "Orca"], 1),
        ("How many colors are in a rainbow?", ["five", "six", "seven", "eight"], 2),
        ("Which country invented paper?", ["Egypt", "Greece", "India", "China"], 3),
        ("What is the currency of Japan?", ["Yuan", "Won", "Yen", "Ringgit"], 2),
        ("How many strings does a violin have?", ["four", "five", "six", "seven"], 0),
        ("Which planet has the most moons?", ["Jupiter", "Saturn", "Uranus", "Neptune"], 1),
        ("What is the tallest mountain on Earth?", ["K2", "Kilimanjaro", "Everest", "Denali"], 2),
        ("How many bones are in the adult human body?", ["196", "206", "216", "226"], 1),
        ("Which element has atomic number 1?", ["Helium", "Oxygen", "Hydrogen", "Carbon"], 2),
        ("What is the longest river in the world?", ["Nile", "Amazon", "Yangtze", "Mississippi"], 0),
        ("How many players are on a soccer team?", ["nine", "ten", "eleven", "twelve"], 2),
        ("Which blood type is the universal donor?", ["A", "B", "AB", "O negative"], 3),
        ("What is the speed of light, roughly?", ["300 km/s", "3,000 km/s", "30,000 km/s", "300,000 km/s"], 3),
        ("Which instrument measures air pressure?", ["Barometer", "Thermometer", "Hygrometer", "Altimeter"], 0),
        ("How many hearts does an octopus have?", ["one", "two", "three", "four"], 2),
        ("Which desert is the largest hot desert?", ["Gobi", "Sahara", "Kalahari", "Mojave"], 1),
    ];

    raw.iter()
        .enumerate()
        .map(|(i, (prompt, options, correct))| Question {
            id: format!("demo-{}", i),
            prompt: (*prompt).to_string(),
            options: options.map(|o| o.to_string()),
            correct_option: *correct,
        })
        .collect()
}
