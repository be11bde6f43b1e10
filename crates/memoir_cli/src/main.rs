use anyhow::Result;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use memoir_backend::AnthropicBackend;
use memoir_core::{
    BiographyRecord, MemoirConfig, MemoryRecord, ProfileStore, RegenerationReason,
};
use memoir_engine::NarrativeEngine;
use memoir_store::MemoirDb;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(author, version, about = "Memoir: persistent life-narrative engine", long_about = None)]
struct Args {
    /// Path to the memoir database
    #[arg(short, long, default_value = "memoir.db")]
    db: String,

    /// Path to the TOML config file
    #[arg(short, long, default_value = "memoir.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the user's biography, generating it first if none exists
    Show {
        #[arg(long)]
        user: Uuid,
    },
    /// Rebuild the whole biography on the user's request
    Regenerate {
        #[arg(long)]
        user: Uuid,
        /// Optional steering prompt folded into the focus themes
        #[arg(long)]
        prompt: Option<String>,
    },
    /// Save a new memory and weave it into the narrative
    AddMemory {
        #[arg(long)]
        user: Uuid,
        #[arg(long)]
        title: String,
        #[arg(long)]
        text: String,
        /// Date the memory happened (YYYY-MM-DD)
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        location: Option<String>,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
    },
    /// Set the profile fields used for narrative framing
    SetProfile {
        #[arg(long)]
        user: Uuid,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        birth_date: Option<NaiveDate>,
        #[arg(long)]
        birth_place: Option<String>,
        #[arg(long)]
        location: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let config = MemoirConfig::load_or_default(&args.config);

    info!("Opening memoir database at {}...", args.db);
    let db = Arc::new(MemoirDb::new(&args.db).await?);
    let backend = Arc::new(AnthropicBackend::new(&config.llm)?);
    let engine = NarrativeEngine::new(db.clone(), db.clone(), db.clone(), backend, config);

    match args.command {
        Command::Show { user } => {
            let record = engine.get_or_create_biography(user).await?;
            print_biography(&record);
        }
        Command::Regenerate { user, prompt } => {
            let record = engine
                .regenerate_biography(user, RegenerationReason::UserRequested, prompt)
                .await?;
            print_biography(&record);
        }
        Command::AddMemory {
            user,
            title,
            text,
            date,
            location,
            tags,
        } => {
            let memory = MemoryRecord {
                id: Uuid::new_v4(),
                title,
                text,
                memory_date: date,
                memory_location: location,
                tags,
                created_at: Utc::now(),
            };
            db.add_memory(user, &memory).await?;
            let report = engine.insert_memory_into_narrative(user, memory).await?;
            if let Some(chapter) = report.updated_chapter {
                println!(
                    "Memory woven into chapter {} \u{201c}{}\u{201d}.",
                    chapter.sequence, chapter.title
                );
            } else if let Some(chapter) = report.new_chapter {
                println!(
                    "New chapter {} \u{201c}{}\u{201d} added to your story.",
                    chapter.sequence, chapter.title
                );
            }
        }
        Command::SetProfile {
            user,
            name,
            birth_date,
            birth_place,
            location,
        } => {
            let mut profile = db.get_profile(user).await?;
            if name.is_some() {
                profile.name = name;
            }
            if birth_date.is_some() {
                profile.birth_date = birth_date;
            }
            if birth_place.is_some() {
                profile.birth_place = birth_place;
            }
            if location.is_some() {
                profile.current_location = location;
            }
            db.upsert_profile(user, &profile).await?;
            println!("Profile updated.");
        }
    }

    Ok(())
}

fn print_biography(record: &BiographyRecord) {
    println!("{}\n", record.biography.introduction);
    for chapter in &record.chapters {
        let range = match (chapter.age_range_start, chapter.age_range_end) {
            (Some(start), Some(end)) => format!(" (ages {}\u{2013}{})", start, end),
            _ => String::new(),
        };
        println!("Chapter {}: {}{}", chapter.sequence, chapter.title, range);
        println!("{}\n", chapter.content);
    }
    println!("{}", record.biography.conclusion);
}
