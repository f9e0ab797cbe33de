//! postflow-queue - Manage scheduled posts
//!
//! Command-line front end to the scheduler: add posts to the queue, inspect
//! and edit them, and resubmit failed ones.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use libpostflow::logging::{LogFormat, LoggingConfig};
use libpostflow::scheduling::parse_schedule_time;
use libpostflow::types::{PostStatusLog, PostUpdate};
use libpostflow::{
    Config, NewScheduledPost, Platform, PlatformError, PostStatus, PostflowError,
    PostflowService, Result, ScheduledPost,
};
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "postflow-queue")]
#[command(version)]
#[command(about = "Manage scheduled posts")]
#[command(long_about = "\
postflow-queue - Manage scheduled posts

DESCRIPTION:
    postflow-queue adds posts to the Postflow queue and manages them until
    postflow-send publishes them.

COMMANDS:
    schedule    Queue a post for a platform
    list        List a user's posts
    reschedule  Move a pending post to a different time
    cancel      Remove a post from the queue
    retry       Resubmit failed posts
    history     Show the status history of a post

USAGE EXAMPLES:
    # Queue a post two hours from now
    postflow-queue schedule --user alice --platform bluesky --at 2h \"Hello!\"

    # Queue a video for tomorrow afternoon
    postflow-queue schedule --user alice --platform youtube \\
        --at \"tomorrow 3pm\" --media https://cdn.example/clip.mp4 \"Launch day\"

    # List pending posts as JSON
    postflow-queue list --user alice --format json

    # Reschedule a post
    postflow-queue reschedule <POST_ID> 2026-11-20T15:00:00Z

TIME FORMATS:
    Durations (30m, 2h, 1d), natural language (tomorrow 3pm,
    next monday 10am) or RFC 3339 timestamps.

CONFIGURATION:
    Configuration file: $POSTFLOW_CONFIG or ~/.config/postflow/config.toml

EXIT CODES:
    0 - Success
    1 - Operation failed
    2 - Authentication error
    3 - Invalid input (bad post ID, time format, etc.)
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (overrides the default location)
    #[arg(long, global = true, value_name = "PATH", env = "POSTFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Queue a post
    Schedule {
        /// Owner of the post
        #[arg(short, long)]
        user: String,

        /// Destination platform
        #[arg(short, long)]
        platform: String,

        /// When to publish (e.g. "2h", "tomorrow 3pm", RFC 3339)
        #[arg(long)]
        at: String,

        /// Media URL or uploaded media id, repeat for several
        #[arg(long = "media", value_name = "URL")]
        media: Vec<String>,

        /// Post text
        content: String,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// List a user's posts
    List {
        #[arg(short, long)]
        user: String,

        /// Include published and failed posts
        #[arg(long)]
        all: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Move a pending post to a new time
    Reschedule {
        post_id: String,

        /// New schedule time (e.g. "tomorrow 3pm", "2h")
        time: String,
    },

    /// Remove a post from the queue
    Cancel { post_id: String },

    /// Resubmit failed posts
    Retry {
        #[arg(required = true)]
        post_ids: Vec<String>,

        /// Give up on posts that already failed this many times
        #[arg(long)]
        max_retries: Option<u32>,
    },

    /// Show the status history of a post
    History {
        post_id: String,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "error" };
    LoggingConfig::new(LogFormat::Text, level.to_string(), cli.verbose).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    let service = PostflowService::from_config(config).await?;

    match cli.command {
        Commands::Schedule {
            user,
            platform,
            at,
            media,
            content,
            format,
        } => cmd_schedule(&service, user, &platform, &at, media, content, format).await,
        Commands::List { user, all, format } => cmd_list(&service, &user, all, format).await,
        Commands::Reschedule { post_id, time } => cmd_reschedule(&service, &post_id, &time).await,
        Commands::Cancel { post_id } => cmd_cancel(&service, &post_id).await,
        Commands::Retry {
            post_ids,
            max_retries,
        } => {
            let max_retries = max_retries.unwrap_or(service.config().scheduling.max_retries);
            cmd_retry(&service, &post_ids, max_retries).await
        }
        Commands::History { post_id, format } => cmd_history(&service, &post_id, format).await,
    }
}

/// Reject ids that cannot name a post before touching the database
fn validate_post_id(post_id: &str) -> Result<()> {
    uuid::Uuid::parse_str(post_id)
        .map(|_| ())
        .map_err(|_| PostflowError::InvalidInput(format!("Invalid post ID: {}", post_id)))
}

async fn find_post(service: &PostflowService, post_id: &str) -> Result<ScheduledPost> {
    validate_post_id(post_id)?;
    service
        .scheduler()
        .get_post(post_id)
        .await?
        .ok_or_else(|| PostflowError::InvalidInput(format!("Post not found: {}", post_id)))
}

async fn cmd_schedule(
    service: &PostflowService,
    user_id: String,
    platform: &str,
    at: &str,
    media_urls: Vec<String>,
    content: String,
    format: OutputFormat,
) -> Result<()> {
    let platform: Platform = platform.parse()?;
    let scheduled_time = parse_schedule_time(at, Utc::now())?;
    debug!(scheduled_time = %scheduled_time.to_rfc3339(), "Parsed schedule time");

    let post = service
        .scheduler()
        .schedule_post(NewScheduledPost {
            user_id,
            platform,
            content,
            scheduled_time,
            media_urls,
        })
        .await?;

    match format {
        OutputFormat::Json => print_json(&post)?,
        OutputFormat::Text => println!("{}", post.id),
    }
    Ok(())
}

async fn cmd_list(
    service: &PostflowService,
    user_id: &str,
    all: bool,
    format: OutputFormat,
) -> Result<()> {
    let posts = if all {
        service.scheduler().get_user_posts(user_id).await?
    } else {
        service.scheduler().get_user_schedule(user_id).await?
    };

    match format {
        OutputFormat::Json => print_json(&posts)?,
        OutputFormat::Text => {
            let now = Utc::now();
            for post in &posts {
                println!(
                    "{} | {} | {} | {} | {}",
                    post.id,
                    post.platform,
                    post.status,
                    format_time_until(now, post.scheduled_time),
                    truncate_content(&post.content, 50)
                );
            }
        }
    }
    Ok(())
}

async fn cmd_reschedule(service: &PostflowService, post_id: &str, time: &str) -> Result<()> {
    validate_post_id(post_id)?;
    let scheduled_time = parse_schedule_time(time, Utc::now())?;
    let post = service
        .scheduler()
        .update_scheduled_post(
            post_id,
            PostUpdate {
                scheduled_time: Some(scheduled_time),
                ..Default::default()
            },
        )
        .await?;

    println!(
        "Rescheduled {} to {}",
        post.id,
        post.scheduled_time.to_rfc3339()
    );
    Ok(())
}

async fn cmd_cancel(service: &PostflowService, post_id: &str) -> Result<()> {
    let post = find_post(service, post_id).await?;
    if post.status == PostStatus::Processing {
        return Err(PostflowError::InvalidInput(format!(
            "Post {} is being published and cannot be cancelled",
            post_id
        )));
    }

    service.scheduler().delete_scheduled_post(post_id).await?;
    println!("Cancelled {}", post_id);
    Ok(())
}

async fn cmd_retry(service: &PostflowService, post_ids: &[String], max_retries: u32) -> Result<()> {
    for post_id in post_ids {
        validate_post_id(post_id)?;
    }

    let result = service
        .monitor()
        .retry_failed_posts(post_ids, max_retries)
        .await;

    for post_id in &result.success {
        println!("Resubmitted {}", post_id);
    }
    for post_id in &result.permanent_failures {
        eprintln!("Giving up on {}: no retries left", post_id);
    }
    for failure in &result.failed {
        eprintln!("Retry of {} failed: {}", failure.post_id, failure.error);
    }

    let unsuccessful = result.permanent_failures.len() + result.failed.len();
    if unsuccessful > 0 {
        return Err(PlatformError::api(format!(
            "{} post(s) could not be resubmitted",
            unsuccessful
        ))
        .into());
    }
    Ok(())
}

async fn cmd_history(service: &PostflowService, post_id: &str, format: OutputFormat) -> Result<()> {
    let post = find_post(service, post_id).await?;
    let history = service.scheduler().post_history(&post.id).await?;

    match format {
        OutputFormat::Json => print_json(&history)?,
        OutputFormat::Text => {
            println!("{} | {} | {}", post.id, post.platform, post.status);
            for entry in &history {
                println!("  {}", format_log_entry(entry));
            }
        }
    }
    Ok(())
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| PostflowError::InvalidInput(format!("Failed to encode output: {}", e)))?;
    println!("{}", json);
    Ok(())
}

fn format_log_entry(entry: &PostStatusLog) -> String {
    let mut line = format!("{} {}", entry.created_at.to_rfc3339(), entry.status);
    if let Some(platform_id) = &entry.platform_id {
        line.push_str(&format!(" [{}]", platform_id));
    }
    if let Some(error) = &entry.error_message {
        line.push_str(&format!(": {}", error));
    }
    line
}

/// Truncate content to `max_chars` characters with an ellipsis
fn truncate_content(content: &str, max_chars: usize) -> String {
    let first_line = content.lines().next().unwrap_or_default();
    if first_line.chars().count() <= max_chars && first_line.len() == content.len() {
        first_line.to_string()
    } else {
        let truncated: String = first_line.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

/// Human-readable distance from `now` to `scheduled_time`
fn format_time_until(now: DateTime<Utc>, scheduled_time: DateTime<Utc>) -> String {
    let diff = (scheduled_time - now).num_seconds();
    if diff < 0 {
        return "overdue".to_string();
    }

    let minutes = diff / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    if days > 0 {
        format!("in {} day{}", days, if days == 1 { "" } else { "s" })
    } else if hours > 0 {
        format!("in {} hour{}", hours, if hours == 1 { "" } else { "s" })
    } else if minutes > 0 {
        format!("in {} minute{}", minutes, if minutes == 1 { "" } else { "s" })
    } else {
        "in <1 minute".to_string()
    }
}
